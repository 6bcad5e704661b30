use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::{OrderType, Side, TimeInForce};

/// A strategy's proposed trade for one tick.
///
/// Produced at most once per tenant per tick, consumed immediately by the
/// validator and executor, never persisted raw.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySignal {
    pub symbol: String,
    pub action: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    #[serde(default = "default_order_type")]
    pub order_type: OrderType,
    #[serde(default)]
    pub time_in_force: TimeInForce,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn default_order_type() -> OrderType {
    OrderType::Market
}

impl StrategySignal {
    pub fn market(symbol: impl Into<String>, action: Side, quantity: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            action,
            quantity,
            price,
            order_type: OrderType::Market,
            time_in_force: TimeInForce::Day,
            confidence: None,
            reason: None,
        }
    }

    pub fn limit(
        symbol: impl Into<String>,
        action: Side,
        quantity: Decimal,
        price: Decimal,
        time_in_force: TimeInForce,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            action,
            quantity,
            price,
            order_type: OrderType::Limit,
            time_in_force,
            confidence: None,
            reason: None,
        }
    }
}
