use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One minute of OHLCV data for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinuteBar {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
}

/// Market data captured once per tick and shared across every tenant
/// invocation in that tick, so all strategies see the same prices.
#[derive(Debug, Clone, Default)]
pub struct MarketSnapshot {
    pub as_of: DateTime<Utc>,
    pub bars: HashMap<String, Vec<MinuteBar>>,
    pub prices: HashMap<String, Decimal>,
}

impl MarketSnapshot {
    pub fn empty(as_of: DateTime<Utc>) -> Self {
        Self {
            as_of,
            bars: HashMap::new(),
            prices: HashMap::new(),
        }
    }

    /// Group bars by symbol and take each symbol's latest close as its
    /// current price. Bars sharing a timestamp collapse to one — the
    /// latest-bar and trailing-history fetches overlap on the newest bar.
    pub fn from_bars(as_of: DateTime<Utc>, bars: Vec<MinuteBar>) -> Self {
        let mut grouped: HashMap<String, Vec<MinuteBar>> = HashMap::new();
        for bar in bars {
            grouped.entry(bar.symbol.clone()).or_default().push(bar);
        }
        let mut prices = HashMap::new();
        for (symbol, series) in grouped.iter_mut() {
            series.sort_by_key(|b| b.timestamp);
            series.dedup_by_key(|b| b.timestamp);
            if let Some(last) = series.last() {
                prices.insert(symbol.clone(), last.close);
            }
        }
        Self {
            as_of,
            bars: grouped,
            prices,
        }
    }

    pub fn price(&self, symbol: &str) -> Option<Decimal> {
        self.prices.get(symbol).copied()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.prices.keys().cloned().collect()
    }
}
