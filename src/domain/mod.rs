pub mod market;
pub mod order;
pub mod signal;
pub mod tenant;

pub use market::{MarketSnapshot, MinuteBar};
pub use order::{
    OrderStatus, OrderType, PendingOrder, Side, TimeInForce, TradeRecord, TradeRequest,
};
pub use signal::StrategySignal;
pub use tenant::{
    Portfolio, PortfolioSnapshot, Position, PositionView, StrategyDescriptor, Tenant, TenantId,
};
