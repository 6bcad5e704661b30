//! Broker Adapter
//!
//! Interface to an execution venue: submit market/limit orders, query an
//! order by id, list open orders, cancel. Two implementations: a real venue
//! REST client and a local instant-fill simulator for environments without
//! credentials. All calls carry network timeouts and surface typed errors.

pub mod alpaca;
pub mod sim;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{BrokerConfig, BrokerMode};
use crate::domain::{OrderStatus, Side, TradeRequest};
use crate::error::Result;

pub use alpaca::AlpacaBroker;
pub use sim::SimBroker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    Alpaca,
    Sim,
}

impl BrokerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alpaca => "alpaca",
            Self::Sim => "sim",
        }
    }
}

impl std::fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An order as the venue reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrder {
    /// Venue-assigned order id
    pub id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub filled_qty: Decimal,
    pub filled_avg_price: Option<Decimal>,
    pub status: OrderStatus,
    pub limit_price: Option<Decimal>,
    pub submitted_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

/// Capability set of an execution venue.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    fn kind(&self) -> BrokerKind;

    async fn submit_market_order(&self, request: &TradeRequest) -> Result<BrokerOrder>;

    async fn submit_limit_order(&self, request: &TradeRequest) -> Result<BrokerOrder>;

    async fn get_order(&self, broker_order_id: &str) -> Result<BrokerOrder>;

    async fn list_open_orders(&self) -> Result<Vec<BrokerOrder>>;

    /// Returns true when the venue accepted the cancel, false when the order
    /// was already done.
    async fn cancel_order(&self, broker_order_id: &str) -> Result<bool>;
}

/// Pick a broker implementation from configuration and environment.
///
/// `Auto` uses the real venue when `ALPACA_API_KEY`/`ALPACA_API_SECRET` are
/// set and falls back to the simulator otherwise. `None` leaves the
/// orchestrator in local-only mode.
pub fn from_config(config: &BrokerConfig) -> Result<Option<Arc<dyn BrokerClient>>> {
    match config.mode {
        BrokerMode::None => {
            info!("Broker disabled; running local-only");
            Ok(None)
        }
        BrokerMode::Sim => {
            info!("Using local simulator broker");
            Ok(Some(Arc::new(SimBroker::new())))
        }
        BrokerMode::Auto => match AlpacaBroker::from_env(config)? {
            Some(broker) => {
                info!("Using Alpaca broker at {}", broker.base_url());
                Ok(Some(Arc::new(broker)))
            }
            None => {
                info!("No broker credentials found; using local simulator");
                Ok(Some(Arc::new(SimBroker::new())))
            }
        },
    }
}
