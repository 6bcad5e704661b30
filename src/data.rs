//! Market Data Provider
//!
//! Consumed, not owned: the scheduler assembles one snapshot per tick through
//! this trait — the latest bar per symbol plus each symbol's trailing history
//! — and shares it across all tenant invocations. Acquisition and columnar
//! storage live in an external collaborator; the flat-file provider here is
//! enough for local runs and demos.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::domain::MinuteBar;
use crate::error::{ArenaError, Result};

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Latest bar per requested symbol.
    async fn latest_bars(&self, symbols: &[String]) -> Result<Vec<MinuteBar>>;

    /// Up to `limit` most recent bars for one symbol, oldest first.
    async fn history(&self, symbol: &str, limit: usize) -> Result<Vec<MinuteBar>>;
}

/// Reads minute bars from a JSONL file (one [`MinuteBar`] per line).
pub struct FlatFileProvider {
    path: PathBuf,
}

impl FlatFileProvider {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn read_all(&self) -> Result<Vec<MinuteBar>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| ArenaError::MarketData(format!("{}: {e}", self.path.display())))?;
        let mut bars = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<MinuteBar>(line) {
                Ok(bar) => bars.push(bar),
                Err(e) => {
                    tracing::warn!("Skipping malformed bar line: {e}");
                }
            }
        }
        Ok(bars)
    }
}

#[async_trait]
impl MarketDataProvider for FlatFileProvider {
    async fn latest_bars(&self, symbols: &[String]) -> Result<Vec<MinuteBar>> {
        let mut bars = self.read_all().await?;
        bars.sort_by_key(|b| b.timestamp);
        let mut latest: std::collections::HashMap<String, MinuteBar> = std::collections::HashMap::new();
        for bar in bars {
            if symbols.is_empty() || symbols.contains(&bar.symbol) {
                latest.insert(bar.symbol.clone(), bar);
            }
        }
        Ok(latest.into_values().collect())
    }

    async fn history(&self, symbol: &str, limit: usize) -> Result<Vec<MinuteBar>> {
        let mut bars: Vec<MinuteBar> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|b| b.symbol == symbol)
            .collect();
        bars.sort_by_key(|b| b.timestamp);
        let start = bars.len().saturating_sub(limit);
        Ok(bars.split_off(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;
    use std::io::Write;

    fn write_bars(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("bars.jsonl");
        let mut file = std::fs::File::create(&path).expect("create bars file");
        let base = Utc::now();
        for (offset, close) in [(0i64, dec!(150)), (1, dec!(151)), (2, dec!(152))] {
            let bar = MinuteBar {
                symbol: "AAPL".to_string(),
                timestamp: base + Duration::minutes(offset),
                open: close,
                high: close,
                low: close,
                close,
                volume: 10,
            };
            writeln!(file, "{}", serde_json::to_string(&bar).unwrap()).unwrap();
        }
        path
    }

    #[tokio::test]
    async fn latest_bars_returns_newest_per_symbol() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = FlatFileProvider::new(write_bars(&dir));

        let bars = provider
            .latest_bars(&["AAPL".to_string()])
            .await
            .expect("bars should load");
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, dec!(152));
    }

    #[tokio::test]
    async fn history_is_oldest_first_and_bounded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = FlatFileProvider::new(write_bars(&dir));

        let history = provider.history("AAPL", 2).await.expect("history loads");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].close, dec!(151));
        assert_eq!(history[1].close, dec!(152));
    }
}
