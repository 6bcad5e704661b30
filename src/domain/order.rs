use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::signal::StrategySignal;
use super::tenant::TenantId;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "market"),
            OrderType::Limit => write!(f, "limit"),
        }
    }
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeInForce {
    /// Good for the trading day
    #[default]
    Day,
    /// Good Till Cancelled
    Gtc,
    /// Immediate Or Cancel
    Ioc,
    /// Fill Or Kill
    Fok,
}

impl std::fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeInForce::Day => write!(f, "day"),
            TimeInForce::Gtc => write!(f, "gtc"),
            TimeInForce::Ioc => write!(f, "ioc"),
            TimeInForce::Fok => write!(f, "fok"),
        }
    }
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Accepted by the venue, nothing filled yet
    New,
    /// Some quantity filled, remainder still working
    PartiallyFilled,
    /// Fully filled
    Filled,
    /// Cancelled (by us or by the venue)
    Cancelled,
    /// Rejected by the venue
    Rejected,
    /// Expired per its time in force
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }

    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::PartiallyFilled)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::New => "new",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

/// Validated signal bound to a tenant and a client order id.
///
/// The client order id is `{tenant_id}-{timestamp_millis}`, which keeps ids
/// globally unique and traceable back to the owning tenant independent of any
/// venue-reissued id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRequest {
    pub tenant_id: TenantId,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
}

impl TradeRequest {
    pub fn from_signal(tenant_id: &TenantId, signal: &StrategySignal, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id: tenant_id.clone(),
            client_order_id: format!("{}-{}", tenant_id, now.timestamp_millis()),
            symbol: signal.symbol.clone(),
            side: signal.action,
            quantity: signal.quantity,
            price: signal.price,
            order_type: signal.order_type,
            time_in_force: signal.time_in_force,
        }
    }

    /// Dollar value of the request at the requested price.
    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }
}

/// Permanent record of a settled fill. Created exactly once per fill,
/// append-only thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub tenant_id: TenantId,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub requested_price: Decimal,
    pub execution_price: Decimal,
    pub order_type: OrderType,
    pub broker_order_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// The execution price could not be read back from the venue and the
    /// requested price was used instead.
    #[serde(default)]
    pub locally_priced: bool,
    /// Submission to the venue failed; the portfolio was updated locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_error: Option<String>,
}

/// Mutable shadow of an unsettled order, owned by the order tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOrder {
    /// Client order id (also the tracker key)
    pub order_id: String,
    pub broker_order_id: String,
    pub tenant_id: TenantId,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub requested_price: Decimal,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub filled_avg_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingOrder {
    pub fn from_request(request: &TradeRequest, broker_order_id: String) -> Self {
        let now = Utc::now();
        Self {
            order_id: request.client_order_id.clone(),
            broker_order_id,
            tenant_id: request.tenant_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            order_type: request.order_type,
            limit_price: matches!(request.order_type, OrderType::Limit).then_some(request.price),
            requested_price: request.price,
            status: OrderStatus::New,
            filled_qty: Decimal::ZERO,
            filled_avg_price: None,
            time_in_force: request.time_in_force,
            created_at: now,
            updated_at: now,
        }
    }

    /// Price a buy reservation is held at (limit price when present).
    pub fn reserve_price(&self) -> Decimal {
        self.limit_price.unwrap_or(self.requested_price)
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }
}
