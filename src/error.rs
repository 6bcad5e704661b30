use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum ArenaError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Tenant registry error: {0}")]
    Registry(String),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Strategy lifecycle errors
    #[error("Strategy load failed: {0}")]
    StrategyLoad(String),

    #[error("Strategy timed out for tenant {tenant} after {elapsed_ms}ms")]
    StrategyTimeout { tenant: String, elapsed_ms: u64 },

    #[error("Strategy runtime error: {0}")]
    StrategyRuntime(String),

    // Signal gating
    #[error("Signal rejected: {0}")]
    SignalRejected(#[from] ValidationError),

    // Broker errors
    #[error("Broker submission failed: {0}")]
    BrokerSubmission(String),

    #[error("Broker query failed: {0}")]
    BrokerQuery(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Reconciliation conflict: {0}")]
    ReconciliationConflict(String),

    // Market data errors
    #[error("Market data unavailable: {0}")]
    MarketData(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for ArenaError
pub type Result<T> = std::result::Result<T, ArenaError>;

/// Typed rejection reasons raised by the signal validator.
///
/// Each variant names the rule that failed so callers (and tenant error logs)
/// can report exactly which gate a signal hit.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("symbol {0} is not in the tradable universe")]
    UnknownSymbol(String),

    #[error("quantity must be positive, got {0}")]
    NonPositiveQuantity(Decimal),

    #[error("price must be positive, got {0}")]
    NonPositivePrice(Decimal),

    #[error("price {price} for {symbol} is more than {band_pct}% away from last known price {last}")]
    PriceOutOfBand {
        symbol: String,
        price: Decimal,
        last: Decimal,
        band_pct: Decimal,
    },

    #[error("insufficient cash: need {needed}, available {available}")]
    InsufficientCash { needed: Decimal, available: Decimal },

    #[error("insufficient position in {symbol}: requested {requested}, sellable {sellable}")]
    InsufficientPosition {
        symbol: String,
        requested: Decimal,
        sellable: Decimal,
    },

    #[error("short selling is disabled; cannot sell {symbol} without holding it")]
    ShortingDisabled { symbol: String },
}

impl ValidationError {
    /// Short machine-readable name of the failed rule.
    pub fn rule(&self) -> &'static str {
        match self {
            ValidationError::UnknownSymbol(_) => "symbol_universe",
            ValidationError::NonPositiveQuantity(_) => "quantity_positive",
            ValidationError::NonPositivePrice(_) => "price_positive",
            ValidationError::PriceOutOfBand { .. } => "price_band",
            ValidationError::InsufficientCash { .. } => "buying_power",
            ValidationError::InsufficientPosition { .. } => "position_cap",
            ValidationError::ShortingDisabled { .. } => "no_shorting",
        }
    }
}
