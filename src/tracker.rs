//! Order Tracker & Reconciliation
//!
//! Owns every not-yet-settled order and converges local state with the venue.
//! A background loop, independent of the minute scheduler, polls the broker
//! for each open order and diffs status/filled-quantity/filled-price against
//! the stored record:
//!
//! - newly fully filled: exactly one trade record at the venue's average fill
//!   price, one portfolio mutation, order leaves the open set;
//! - partially filled: fill fields updated in place, order stays open;
//! - cancelled/rejected/expired: order leaves the open set; the filled
//!   portion (if any) gets its record, the remainder never does.
//!
//! Terminal handling is claimed under the tracker lock, so racing
//! reconciliation passes settle an order at most once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerClient, BrokerOrder};
use crate::config::ReconciliationConfig;
use crate::domain::{OrderStatus, PendingOrder, TenantId, TradeRecord};
use crate::error::{ArenaError, Result};
use crate::portfolio::PortfolioStore;
use crate::store::DataStore;

/// Outcome of one reconciliation cycle.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub checked: usize,
    pub updated: usize,
    pub settled: usize,
    pub errors: usize,
}

struct TrackerInner {
    /// All tracked orders, open and recently terminal
    orders: HashMap<String, PendingOrder>,
    /// Order ids whose terminal handling has run (the at-most-once guard)
    settled: HashSet<String>,
}

/// Claim produced under the lock when an order crosses into a terminal state.
struct SettlementClaim {
    order: PendingOrder,
    fill_qty: Decimal,
    fill_price: Option<Decimal>,
}

pub struct OrderTracker {
    broker: Option<Arc<dyn BrokerClient>>,
    portfolios: Arc<PortfolioStore>,
    store: Arc<DataStore>,
    config: ReconciliationConfig,
    allow_short: bool,
    inner: Mutex<TrackerInner>,
}

impl OrderTracker {
    pub fn new(
        broker: Option<Arc<dyn BrokerClient>>,
        portfolios: Arc<PortfolioStore>,
        store: Arc<DataStore>,
        config: ReconciliationConfig,
        allow_short: bool,
    ) -> Self {
        Self {
            broker,
            portfolios,
            store,
            config,
            allow_short,
            inner: Mutex::new(TrackerInner {
                orders: HashMap::new(),
                settled: HashSet::new(),
            }),
        }
    }

    /// Resume tracking from the persisted snapshots after a restart.
    pub async fn load_from_disk(&self) -> Result<usize> {
        let orders = self.store.load_pending_orders()?;
        let mut inner = self.inner.lock().await;
        let mut loaded = 0;
        for order in orders {
            if order.is_open() {
                inner.orders.insert(order.order_id.clone(), order);
                loaded += 1;
            }
        }
        if loaded > 0 {
            info!("Resumed tracking {loaded} open order(s)");
        }
        Ok(loaded)
    }

    /// Start tracking a freshly submitted order and persist the tenant's
    /// open-order snapshot.
    pub async fn track(&self, order: PendingOrder) -> Result<()> {
        let tenant = order.tenant_id.clone();
        let open;
        {
            let mut inner = self.inner.lock().await;
            inner.orders.insert(order.order_id.clone(), order);
            open = open_for_tenant(&inner, &tenant);
        }
        self.store.write_pending_snapshot(&tenant, &open)
    }

    /// Open orders, optionally filtered to one tenant.
    pub async fn open_orders(&self, tenant: Option<&TenantId>) -> Vec<PendingOrder> {
        let inner = self.inner.lock().await;
        inner
            .orders
            .values()
            .filter(|o| o.is_open())
            .filter(|o| tenant.map_or(true, |t| &o.tenant_id == t))
            .cloned()
            .collect()
    }

    /// Fetch one tracked order's current state.
    pub async fn get(&self, order_id: &str) -> Option<PendingOrder> {
        self.inner.lock().await.orders.get(order_id).cloned()
    }

    /// Caller-initiated cancellation: invoke the venue's cancel, then apply
    /// the same terminal-state handling as an observed cancellation.
    pub async fn cancel(&self, order_id: &str) -> Result<PendingOrder> {
        let stored = self
            .get(order_id)
            .await
            .ok_or_else(|| ArenaError::OrderNotFound(order_id.to_string()))?;
        if !stored.is_open() {
            return Ok(stored);
        }

        let mut terminal = match &self.broker {
            Some(broker) => {
                broker.cancel_order(&stored.broker_order_id).await?;
                // Capture any fill that landed before the cancel
                match broker.get_order(&stored.broker_order_id).await {
                    Ok(latest) => latest,
                    Err(e) => {
                        warn!("Could not re-query cancelled order {order_id}: {e}");
                        synthetic_terminal(&stored)
                    }
                }
            }
            None => synthetic_terminal(&stored),
        };
        if !terminal.status.is_terminal() {
            terminal.status = OrderStatus::Cancelled;
        }
        self.apply_broker_state(order_id, &terminal).await?;
        self.get(order_id)
            .await
            .ok_or_else(|| ArenaError::OrderNotFound(order_id.to_string()))
    }

    /// One reconciliation pass over the open set, batched under the venue's
    /// request-rate ceiling. Query failures leave state untouched and retry
    /// next cycle.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let Some(broker) = &self.broker else {
            return Ok(report);
        };

        let mut open: Vec<(String, String)> = {
            let inner = self.inner.lock().await;
            inner
                .orders
                .values()
                .filter(|o| o.is_open())
                .map(|o| (o.order_id.clone(), o.broker_order_id.clone()))
                .collect()
        };
        if open.is_empty() {
            return Ok(report);
        }
        if open.len() > self.config.max_queries_per_cycle {
            debug!(
                "Deferring {} open order(s) past the per-cycle query cap",
                open.len() - self.config.max_queries_per_cycle
            );
            open.truncate(self.config.max_queries_per_cycle);
        }

        for (order_id, broker_order_id) in open {
            report.checked += 1;
            match broker.get_order(&broker_order_id).await {
                Ok(latest) => match self.apply_broker_state(&order_id, &latest).await {
                    Ok(changed) => {
                        if changed {
                            report.updated += 1;
                            if latest.status.is_terminal() {
                                report.settled += 1;
                            }
                        }
                    }
                    Err(e) => {
                        report.errors += 1;
                        error!("Failed to apply venue state for {order_id}: {e}");
                    }
                },
                Err(e) => {
                    report.errors += 1;
                    warn!("Venue query failed for {order_id}: {e}; retrying next cycle");
                }
            }
            if self.config.query_pause_ms > 0 {
                sleep(Duration::from_millis(self.config.query_pause_ms)).await;
            }
        }
        Ok(report)
    }

    /// Diff the venue's view of an order against the stored record and apply
    /// the transition. Returns whether anything changed.
    pub async fn apply_broker_state(&self, order_id: &str, latest: &BrokerOrder) -> Result<bool> {
        let tenant;
        let claim;
        {
            let mut inner = self.inner.lock().await;
            let Some(order) = inner.orders.get_mut(order_id) else {
                if inner.settled.contains(order_id) {
                    // A racing pass already settled and purged this order
                    warn!(
                        "{}",
                        ArenaError::ReconciliationConflict(format!(
                            "order {order_id} reported again after settlement; keeping existing state"
                        ))
                    );
                    return Ok(false);
                }
                return Err(ArenaError::OrderNotFound(order_id.to_string()));
            };

            if order.status.is_terminal() {
                if latest.status != order.status || latest.filled_qty != order.filled_qty {
                    warn!(
                        "{}",
                        ArenaError::ReconciliationConflict(format!(
                            "order {order_id} is already {} with fill {}; ignoring venue state {} / {}",
                            order.status, order.filled_qty, latest.status, latest.filled_qty
                        ))
                    );
                }
                return Ok(false);
            }

            let unchanged = latest.status == order.status
                && latest.filled_qty == order.filled_qty
                && latest.filled_avg_price == order.filled_avg_price;
            if unchanged {
                // Replaying identical venue state is a no-op
                return Ok(false);
            }

            order.status = latest.status;
            order.filled_qty = latest.filled_qty;
            order.filled_avg_price = latest.filled_avg_price;
            order.updated_at = Utc::now();
            tenant = order.tenant_id.clone();

            if latest.status.is_terminal() {
                // Claim the settlement while still holding the lock; the
                // portfolio mutation and trade emission run exactly once.
                inner.settled.insert(order_id.to_string());
                claim = Some(SettlementClaim {
                    order: order.clone(),
                    fill_qty: latest.filled_qty,
                    fill_price: latest.filled_avg_price,
                });
            } else {
                claim = None;
            }
        }

        if let Some(claim) = claim {
            self.settle(claim).await?;
        }

        let open = {
            let inner = self.inner.lock().await;
            open_for_tenant(&inner, &tenant)
        };
        self.store.write_pending_snapshot(&tenant, &open)?;
        Ok(true)
    }

    /// Apply a claimed terminal transition to the owning portfolio and emit
    /// the trade record for the filled portion.
    async fn settle(&self, claim: SettlementClaim) -> Result<()> {
        let order = &claim.order;
        let book = self.portfolios.book(&order.tenant_id)?;
        let mut book = book.lock().await;

        book.portfolio.release_reservation(
            &order.symbol,
            order.side,
            order.quantity,
            order.reserve_price(),
        );

        if claim.fill_qty > Decimal::ZERO {
            let (execution_price, locally_priced) = match claim.fill_price {
                Some(price) => (price, false),
                None => (order.requested_price, true),
            };
            book.portfolio.apply_fill(
                &order.symbol,
                order.side,
                claim.fill_qty,
                execution_price,
                self.allow_short,
            )?;

            let record = TradeRecord {
                tenant_id: order.tenant_id.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                quantity: claim.fill_qty,
                requested_price: order.requested_price,
                execution_price,
                order_type: order.order_type,
                broker_order_id: Some(order.broker_order_id.clone()),
                timestamp: Utc::now(),
                locally_priced,
                broker_error: None,
            };
            self.store.append_trade(&record)?;
            info!(
                "Order {} settled {}: {} {} {} @ {}",
                order.order_id,
                order.status,
                order.side,
                claim.fill_qty,
                order.symbol,
                execution_price
            );
        } else {
            info!("Order {} closed {} with no fill", order.order_id, order.status);
        }
        Ok(())
    }

    /// Drop terminal orders older than the retention window from the tracker.
    /// Trade history is untouched.
    pub async fn purge_terminal(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days);
        let mut inner = self.inner.lock().await;
        let before = inner.orders.len();
        let stale: Vec<String> = inner
            .orders
            .values()
            .filter(|o| o.status.is_terminal() && o.updated_at < cutoff)
            .map(|o| o.order_id.clone())
            .collect();
        for order_id in &stale {
            inner.orders.remove(order_id);
            inner.settled.remove(order_id);
        }
        let removed = before - inner.orders.len();
        if removed > 0 {
            info!("Purged {removed} terminal order(s) past retention");
        }
        removed
    }

    /// Run the reconciliation loop until shutdown is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.config.interval_secs));
        let mut last_purge = Instant::now();
        info!(
            "Starting reconciliation loop ({}s interval)",
            self.config.interval_secs
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.reconcile_once().await {
                        Ok(report) if report.checked > 0 => info!(
                            "Reconciliation: {} checked, {} updated, {} settled, {} errors",
                            report.checked, report.updated, report.settled, report.errors
                        ),
                        Ok(_) => {}
                        Err(e) => error!("Reconciliation cycle failed: {e}"),
                    }
                    if last_purge.elapsed() > Duration::from_secs(3600) {
                        self.purge_terminal().await;
                        last_purge = Instant::now();
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Reconciliation loop stopped");
    }
}

fn open_for_tenant(inner: &TrackerInner, tenant: &TenantId) -> Vec<PendingOrder> {
    inner
        .orders
        .values()
        .filter(|o| o.is_open() && &o.tenant_id == tenant)
        .cloned()
        .collect()
}

/// Terminal state assembled from what we already know, for when the venue
/// cannot be re-queried.
fn synthetic_terminal(order: &PendingOrder) -> BrokerOrder {
    BrokerOrder {
        id: order.broker_order_id.clone(),
        client_order_id: Some(order.order_id.clone()),
        symbol: order.symbol.clone(),
        side: order.side,
        qty: order.quantity,
        filled_qty: order.filled_qty,
        filled_avg_price: order.filled_avg_price,
        status: OrderStatus::Cancelled,
        limit_price: order.limit_price,
        submitted_at: order.created_at,
        filled_at: None,
    }
}
