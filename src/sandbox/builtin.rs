//! Built-in registry strategies
//!
//! Reference implementations available to every tenant out of the box. They
//! double as the strategies exercised by the integration tests.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::domain::{Side, StrategySignal};
use crate::error::{ArenaError, Result};

use super::{StrategyContext, TradingStrategy};

fn parse_params<T: for<'de> Deserialize<'de> + Default>(params: &serde_json::Value) -> Result<T> {
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params.clone())
        .map_err(|e| ArenaError::StrategyLoad(format!("invalid strategy params: {e}")))
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct HoldParams {
    symbol: String,
    quantity: Decimal,
}

impl Default for HoldParams {
    fn default() -> Self {
        Self {
            symbol: "AAPL".to_string(),
            quantity: Decimal::ONE,
        }
    }
}

/// Buys its symbol once and then sits on the position.
pub struct HoldStrategy {
    symbol: String,
    quantity: Decimal,
}

impl TradingStrategy for HoldStrategy {
    fn generate_signal(&self, ctx: &StrategyContext) -> Result<Option<StrategySignal>> {
        if ctx.tenant.positions.contains_key(&self.symbol) {
            return Ok(None);
        }
        let Some(price) = ctx.price(&self.symbol) else {
            return Ok(None);
        };
        if ctx.tenant.cash < self.quantity * price {
            return Ok(None);
        }
        Ok(Some(StrategySignal::market(
            self.symbol.clone(),
            Side::Buy,
            self.quantity,
            price,
        )))
    }
}

pub fn hold_factory(params: &serde_json::Value) -> Result<Arc<dyn TradingStrategy>> {
    let params: HoldParams = parse_params(params)?;
    Ok(Arc::new(HoldStrategy {
        symbol: params.symbol,
        quantity: params.quantity,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct MomentumParams {
    symbol: String,
    quantity: Decimal,
    lookback: usize,
    /// Fractional move over the lookback window that triggers a trade
    threshold_pct: Decimal,
}

impl Default for MomentumParams {
    fn default() -> Self {
        Self {
            symbol: "AAPL".to_string(),
            quantity: Decimal::ONE,
            lookback: 5,
            threshold_pct: Decimal::new(1, 2), // 1%
        }
    }
}

/// Trend follower: buys when the close has risen more than `threshold_pct`
/// over the lookback window, exits the position when it has fallen as much.
pub struct MomentumStrategy {
    symbol: String,
    quantity: Decimal,
    lookback: usize,
    threshold_pct: Decimal,
}

impl TradingStrategy for MomentumStrategy {
    fn generate_signal(&self, ctx: &StrategyContext) -> Result<Option<StrategySignal>> {
        let closes = ctx.closes(&self.symbol);
        if closes.len() < self.lookback {
            return Ok(None);
        }
        let window = &closes[closes.len() - self.lookback..];
        let first = window[0];
        let last = *window.last().expect("window is non-empty");
        if first.is_zero() {
            return Ok(None);
        }
        let change = (last - first) / first;

        let held = ctx
            .tenant
            .positions
            .get(&self.symbol)
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO);

        if change >= self.threshold_pct && held.is_zero() {
            if ctx.tenant.cash < self.quantity * last {
                return Ok(None);
            }
            return Ok(Some(StrategySignal::market(
                self.symbol.clone(),
                Side::Buy,
                self.quantity,
                last,
            )));
        }
        if change <= -self.threshold_pct && held > Decimal::ZERO {
            return Ok(Some(StrategySignal::market(
                self.symbol.clone(),
                Side::Sell,
                held,
                last,
            )));
        }
        Ok(None)
    }
}

pub fn momentum_factory(params: &serde_json::Value) -> Result<Arc<dyn TradingStrategy>> {
    let params: MomentumParams = parse_params(params)?;
    if params.lookback < 2 {
        return Err(ArenaError::StrategyLoad(
            "momentum lookback must be at least 2".to_string(),
        ));
    }
    Ok(Arc::new(MomentumStrategy {
        symbol: params.symbol,
        quantity: params.quantity,
        lookback: params.lookback,
        threshold_pct: params.threshold_pct,
    }))
}
