use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

use super::order::Side;

/// Identifier of a tenant (an independent strategy owner with its own
/// portfolio). Slug-style, stable across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TenantId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for TenantId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Where a tenant's uploaded strategy lives and how to instantiate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDescriptor {
    /// Directory holding the upload (manifest + source files)
    pub dir: PathBuf,
    /// Registered strategy name named by the upload manifest
    pub entry: String,
    /// Free-form parameters handed to the strategy factory
    #[serde(default)]
    pub params: serde_json::Value,
}

/// An independent strategy owner. Created at tenant-add time, never deleted
/// mid-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub strategy: StrategyDescriptor,
}

/// A holding in one symbol. Quantity and average cost always update together
/// on a fill; `reserved_qty` is quantity committed to open sell orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: Decimal,
    #[serde(default)]
    pub reserved_qty: Decimal,
    pub avg_cost: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    fn from_fill(symbol: &str, quantity: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            quantity,
            reserved_qty: Decimal::ZERO,
            avg_cost: price,
            opened_at: Utc::now(),
        }
    }

    /// Quantity not committed to open sell orders.
    pub fn sellable(&self) -> Decimal {
        self.quantity - self.reserved_qty
    }

    pub fn cost_basis(&self) -> Decimal {
        self.quantity * self.avg_cost
    }
}

/// Per-tenant cash/position ledger.
///
/// `reserved_cash` is the notional committed to open buy limit orders; it is
/// counted against buying power so concurrent pending orders cannot overspend,
/// and released when an order reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub base: String,
    pub cash: Decimal,
    #[serde(default)]
    pub reserved_cash: Decimal,
    pub positions: HashMap<String, Position>,
}

impl Portfolio {
    pub fn new(initial_cash: Decimal) -> Self {
        Self {
            base: "USD".to_string(),
            cash: initial_cash,
            reserved_cash: Decimal::ZERO,
            positions: HashMap::new(),
        }
    }

    /// Cash available for new buys (committed cash minus reservations).
    pub fn available_cash(&self) -> Decimal {
        self.cash - self.reserved_cash
    }

    /// Quantity of `symbol` available for new sells.
    pub fn sellable(&self, symbol: &str) -> Decimal {
        self.positions
            .get(symbol)
            .map(|p| p.sellable())
            .unwrap_or(Decimal::ZERO)
    }

    /// Apply a settled fill to the ledger.
    ///
    /// Buys merge into the existing position with a weighted average cost and
    /// deduct cash; sells reduce (or close) the position and credit cash.
    /// The committed-cash-never-negative and sell-cap invariants are enforced
    /// here as the last line of defence, after validation and reservation.
    pub fn apply_fill(
        &mut self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        allow_short: bool,
    ) -> Result<(), ValidationError> {
        let cost = quantity * price;
        match side {
            Side::Buy => {
                if self.cash < cost {
                    return Err(ValidationError::InsufficientCash {
                        needed: cost,
                        available: self.cash,
                    });
                }
                match self.positions.get_mut(symbol) {
                    Some(pos) => {
                        let total_cost = pos.quantity * pos.avg_cost + cost;
                        let total_qty = pos.quantity + quantity;
                        if total_qty.is_zero() {
                            self.positions.remove(symbol);
                        } else {
                            pos.avg_cost = total_cost / total_qty;
                            pos.quantity = total_qty;
                        }
                    }
                    None => {
                        self.positions
                            .insert(symbol.to_string(), Position::from_fill(symbol, quantity, price));
                    }
                }
                self.cash -= cost;
            }
            Side::Sell => {
                let held = self
                    .positions
                    .get(symbol)
                    .map(|p| p.quantity)
                    .unwrap_or(Decimal::ZERO);
                if quantity > held && !allow_short {
                    return Err(ValidationError::InsufficientPosition {
                        symbol: symbol.to_string(),
                        requested: quantity,
                        sellable: held,
                    });
                }
                match self.positions.get_mut(symbol) {
                    Some(pos) => {
                        let remaining = pos.quantity - quantity;
                        if remaining.is_zero() {
                            self.positions.remove(symbol);
                        } else {
                            // avg_cost carries over; a short flip keeps the
                            // sale price as its basis
                            if remaining < Decimal::ZERO && pos.quantity >= Decimal::ZERO {
                                pos.avg_cost = price;
                            }
                            pos.quantity = remaining;
                        }
                    }
                    None => {
                        // Naked short (only reachable with allow_short)
                        self.positions
                            .insert(symbol.to_string(), Position::from_fill(symbol, -quantity, price));
                    }
                }
                self.cash += cost;
            }
        }
        Ok(())
    }

    /// Reserve buying power or holdings for a submitted limit order.
    pub fn reserve(
        &mut self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<(), ValidationError> {
        match side {
            Side::Buy => {
                let notional = quantity * price;
                if notional > self.available_cash() {
                    return Err(ValidationError::InsufficientCash {
                        needed: notional,
                        available: self.available_cash(),
                    });
                }
                self.reserved_cash += notional;
            }
            Side::Sell => {
                let sellable = self.sellable(symbol);
                if quantity > sellable {
                    return Err(ValidationError::InsufficientPosition {
                        symbol: symbol.to_string(),
                        requested: quantity,
                        sellable,
                    });
                }
                if let Some(pos) = self.positions.get_mut(symbol) {
                    pos.reserved_qty += quantity;
                }
            }
        }
        Ok(())
    }

    /// Release a reservation made by [`Portfolio::reserve`], saturating at
    /// zero so a double release cannot corrupt the ledger.
    pub fn release_reservation(&mut self, symbol: &str, side: Side, quantity: Decimal, price: Decimal) {
        match side {
            Side::Buy => {
                let notional = quantity * price;
                self.reserved_cash = (self.reserved_cash - notional).max(Decimal::ZERO);
            }
            Side::Sell => {
                if let Some(pos) = self.positions.get_mut(symbol) {
                    pos.reserved_qty = (pos.reserved_qty - quantity).max(Decimal::ZERO);
                }
            }
        }
    }

    /// Total value at the given prices (positions without a quote fall back to
    /// their average cost).
    pub fn market_value(&self, prices: &HashMap<String, Decimal>) -> Decimal {
        let positions: Decimal = self
            .positions
            .values()
            .map(|p| p.quantity * prices.get(&p.symbol).copied().unwrap_or(p.avg_cost))
            .sum();
        self.cash + positions
    }
}

/// Read-only view of one position inside a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionView {
    pub symbol: String,
    pub quantity: Decimal,
    pub avg_cost: Decimal,
    pub value: Decimal,
    pub pnl_unrealized: Decimal,
}

/// One portfolio snapshot per tenant per tick, consumed by the analytics
/// collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub tenant_id: TenantId,
    pub timestamp: DateTime<Utc>,
    pub cash: Decimal,
    pub positions: HashMap<String, PositionView>,
    pub market_value: Decimal,
}

impl PortfolioSnapshot {
    pub fn build(
        tenant_id: &TenantId,
        portfolio: &Portfolio,
        prices: &HashMap<String, Decimal>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut views = HashMap::new();
        for (symbol, pos) in &portfolio.positions {
            let price = prices.get(symbol).copied().unwrap_or(pos.avg_cost);
            let value = pos.quantity * price;
            views.insert(
                symbol.clone(),
                PositionView {
                    symbol: symbol.clone(),
                    quantity: pos.quantity,
                    avg_cost: pos.avg_cost,
                    value,
                    pnl_unrealized: value - pos.cost_basis(),
                },
            );
        }
        let market_value = portfolio.cash + views.values().map(|v| v.value).sum::<Decimal>();
        Self {
            tenant_id: tenant_id.clone(),
            timestamp,
            cash: portfolio.cash,
            positions: views,
            market_value,
        }
    }
}
