//! Trade Executor
//!
//! Turns a validated signal into either an immediate local+broker market
//! trade or a deferred pending limit order.
//!
//! Dual-write rule: broker submission failure never blocks trading — the
//! local portfolio is still updated optimistically from the validated request
//! and the trade record carries the broker error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::broker::BrokerClient;
use crate::config::ExecutionConfig;
use crate::domain::{OrderStatus, OrderType, PendingOrder, PortfolioSnapshot, TradeRecord, TradeRequest};
use crate::error::Result;
use crate::portfolio::PortfolioStore;
use crate::store::DataStore;
use crate::tracker::OrderTracker;

/// What happened to an accepted request within the tick.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// Settled now; record written, portfolio mutated
    Filled(TradeRecord),
    /// Parked as a pending order; settlement owned by the order tracker
    Pending { order_id: String },
}

pub struct TradeExecutor {
    broker: Option<Arc<dyn BrokerClient>>,
    portfolios: Arc<PortfolioStore>,
    tracker: Arc<OrderTracker>,
    store: Arc<DataStore>,
    config: ExecutionConfig,
    allow_short: bool,
}

impl TradeExecutor {
    pub fn new(
        broker: Option<Arc<dyn BrokerClient>>,
        portfolios: Arc<PortfolioStore>,
        tracker: Arc<OrderTracker>,
        store: Arc<DataStore>,
        config: ExecutionConfig,
        allow_short: bool,
    ) -> Self {
        Self {
            broker,
            portfolios,
            tracker,
            store,
            config,
            allow_short,
        }
    }

    /// Execute a validated trade request.
    pub async fn execute(
        &self,
        request: TradeRequest,
        prices: &HashMap<String, Decimal>,
    ) -> Result<ExecutionOutcome> {
        match request.order_type {
            OrderType::Market => self.execute_market(request, prices).await,
            OrderType::Limit => self.execute_limit(request, prices).await,
        }
    }

    /// Market path: submit, read the fill price back once after a brief
    /// settle delay, then write record + portfolio mutation in this tick.
    async fn execute_market(
        &self,
        request: TradeRequest,
        prices: &HashMap<String, Decimal>,
    ) -> Result<ExecutionOutcome> {
        let mut execution_price = request.price;
        let mut locally_priced = true;
        let mut broker_order_id = None;
        let mut broker_error = None;

        if let Some(broker) = &self.broker {
            match broker.submit_market_order(&request).await {
                Ok(submitted) => {
                    broker_order_id = Some(submitted.id.clone());
                    info!(
                        "Market order {} submitted: {} {} {} @ {}",
                        submitted.id, request.side, request.quantity, request.symbol, request.price
                    );
                    sleep(Duration::from_millis(self.config.settle_delay_ms)).await;
                    match broker.get_order(&submitted.id).await {
                        Ok(latest) => match latest.filled_avg_price {
                            Some(fill_price) => {
                                execution_price = fill_price;
                                locally_priced = false;
                            }
                            None => warn!(
                                "No fill price yet for order {}; using requested price",
                                submitted.id
                            ),
                        },
                        Err(e) => warn!(
                            "Could not read execution price for order {}: {e}; using requested price",
                            submitted.id
                        ),
                    }
                }
                Err(e) => {
                    error!("Broker submission failed for {}: {e}; executing locally", request.client_order_id);
                    broker_error = Some(e.to_string());
                }
            }
        }

        let record = self
            .commit_fill(&request, execution_price, locally_priced, broker_order_id, broker_error, prices)
            .await?;
        Ok(ExecutionOutcome::Filled(record))
    }

    /// Limit path: submit, reserve buying power, park a pending order for the
    /// tracker. The portfolio itself is untouched until settlement.
    async fn execute_limit(
        &self,
        request: TradeRequest,
        prices: &HashMap<String, Decimal>,
    ) -> Result<ExecutionOutcome> {
        let Some(broker) = &self.broker else {
            // Local-only mode has no venue to wait on; accept at the
            // requested price immediately.
            let record = self
                .commit_fill(&request, request.price, true, None, None, prices)
                .await?;
            return Ok(ExecutionOutcome::Filled(record));
        };

        let submitted = match broker.submit_limit_order(&request).await {
            Ok(submitted) => submitted,
            Err(e) => {
                error!(
                    "Broker submission failed for {}: {e}; executing locally",
                    request.client_order_id
                );
                let record = self
                    .commit_fill(&request, request.price, true, None, Some(e.to_string()), prices)
                    .await?;
                return Ok(ExecutionOutcome::Filled(record));
            }
        };

        {
            let book = self.portfolios.book(&request.tenant_id)?;
            let mut book = book.lock().await;
            if let Err(rejection) = book.portfolio.reserve(
                &request.symbol,
                request.side,
                request.quantity,
                request.price,
            ) {
                drop(book);
                warn!(
                    "Reservation failed after submit; cancelling {}: {rejection}",
                    submitted.id
                );
                if let Err(cancel_err) = broker.cancel_order(&submitted.id).await {
                    error!("Cancel of unreserved order {} failed: {cancel_err}", submitted.id);
                }
                return Err(rejection.into());
            }
        }

        let order = PendingOrder::from_request(&request, submitted.id.clone());
        let order_id = order.order_id.clone();
        self.tracker.track(order).await?;
        info!(
            "Limit order {} parked for reconciliation (venue id {})",
            order_id, submitted.id
        );

        // Venues can settle immediately (IOC/FOK, or the simulator); route
        // that through the tracker so settlement stays exactly-once.
        if submitted.status == OrderStatus::Filled || submitted.status.is_terminal() {
            self.tracker.apply_broker_state(&order_id, &submitted).await?;
        }

        Ok(ExecutionOutcome::Pending { order_id })
    }

    /// Apply a fill locally: portfolio mutation, trade record, post-trade
    /// snapshot — exactly once, synchronously.
    async fn commit_fill(
        &self,
        request: &TradeRequest,
        execution_price: Decimal,
        locally_priced: bool,
        broker_order_id: Option<String>,
        broker_error: Option<String>,
        prices: &HashMap<String, Decimal>,
    ) -> Result<TradeRecord> {
        let book = self.portfolios.book(&request.tenant_id)?;
        let mut book = book.lock().await;
        book.portfolio.apply_fill(
            &request.symbol,
            request.side,
            request.quantity,
            execution_price,
            self.allow_short,
        )?;

        let record = TradeRecord {
            tenant_id: request.tenant_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            requested_price: request.price,
            execution_price,
            order_type: request.order_type,
            broker_order_id,
            timestamp: Utc::now(),
            locally_priced,
            broker_error,
        };
        self.store.append_trade(&record)?;

        let mut snapshot_prices = prices.clone();
        snapshot_prices.insert(request.symbol.clone(), execution_price);
        let snapshot = PortfolioSnapshot::build(
            &request.tenant_id,
            &book.portfolio,
            &snapshot_prices,
            record.timestamp,
        );
        self.store.append_snapshot(&snapshot)?;

        if let Some(err) = &record.broker_error {
            info!(
                "Trade executed locally for {} ({} {} {} @ {}); broker error: {err}",
                request.tenant_id, request.side, request.quantity, request.symbol, execution_price
            );
        } else {
            info!(
                "Trade executed for {}: {} {} {} @ {}",
                request.tenant_id, request.side, request.quantity, request.symbol, execution_price
            );
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerKind, BrokerOrder, SimBroker};
    use crate::config::ReconciliationConfig;
    use crate::domain::{Side, StrategyDescriptor, StrategySignal, Tenant, TenantId, TimeInForce};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    /// Broker whose market orders fill at a scripted price, for exercising
    /// the settle-delay price lookup.
    struct ScriptedBroker {
        fill_price: Decimal,
        inner: SimBroker,
    }

    #[async_trait]
    impl BrokerClient for ScriptedBroker {
        fn kind(&self) -> BrokerKind {
            BrokerKind::Sim
        }

        async fn submit_market_order(&self, request: &TradeRequest) -> crate::error::Result<BrokerOrder> {
            let order = self.inner.submit_market_order(request).await?;
            self.inner.set_fill(&order.id, request.quantity, self.fill_price);
            Ok(order)
        }

        async fn submit_limit_order(&self, request: &TradeRequest) -> crate::error::Result<BrokerOrder> {
            self.inner.submit_limit_order(request).await
        }

        async fn get_order(&self, broker_order_id: &str) -> crate::error::Result<BrokerOrder> {
            self.inner.get_order(broker_order_id).await
        }

        async fn list_open_orders(&self) -> crate::error::Result<Vec<BrokerOrder>> {
            self.inner.list_open_orders().await
        }

        async fn cancel_order(&self, broker_order_id: &str) -> crate::error::Result<bool> {
            self.inner.cancel_order(broker_order_id).await
        }
    }

    /// Broker that refuses every submission.
    struct DownBroker;

    #[async_trait]
    impl BrokerClient for DownBroker {
        fn kind(&self) -> BrokerKind {
            BrokerKind::Sim
        }

        async fn submit_market_order(&self, _r: &TradeRequest) -> crate::error::Result<BrokerOrder> {
            Err(crate::error::ArenaError::BrokerSubmission("venue unreachable".to_string()))
        }

        async fn submit_limit_order(&self, _r: &TradeRequest) -> crate::error::Result<BrokerOrder> {
            Err(crate::error::ArenaError::BrokerSubmission("venue unreachable".to_string()))
        }

        async fn get_order(&self, id: &str) -> crate::error::Result<BrokerOrder> {
            Err(crate::error::ArenaError::OrderNotFound(id.to_string()))
        }

        async fn list_open_orders(&self) -> crate::error::Result<Vec<BrokerOrder>> {
            Ok(Vec::new())
        }

        async fn cancel_order(&self, id: &str) -> crate::error::Result<bool> {
            Err(crate::error::ArenaError::OrderNotFound(id.to_string()))
        }
    }

    fn tenant(id: &str) -> Tenant {
        Tenant {
            id: TenantId::from(id),
            name: id.to_string(),
            strategy: StrategyDescriptor {
                dir: "strategies/test".into(),
                entry: "hold".to_string(),
                params: serde_json::Value::Null,
            },
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        portfolios: Arc<PortfolioStore>,
        store: Arc<DataStore>,
        tracker: Arc<OrderTracker>,
    }

    fn harness(broker: Option<Arc<dyn BrokerClient>>) -> (Harness, TradeExecutor) {
        let dir = tempfile::tempdir().expect("tempdir");
        let portfolios = Arc::new(PortfolioStore::new());
        portfolios.insert_tenant(tenant("t1"), dec!(10000));
        let store = Arc::new(DataStore::new(dir.path()));
        let tracker = Arc::new(OrderTracker::new(
            broker.clone(),
            portfolios.clone(),
            store.clone(),
            ReconciliationConfig::default(),
            false,
        ));
        let executor = TradeExecutor::new(
            broker,
            portfolios.clone(),
            tracker.clone(),
            store.clone(),
            ExecutionConfig { settle_delay_ms: 0 },
            false,
        );
        (
            Harness {
                _dir: dir,
                portfolios,
                store,
                tracker,
            },
            executor,
        )
    }

    fn market_request(quantity: Decimal, price: Decimal) -> TradeRequest {
        let signal = StrategySignal::market("AAPL", Side::Buy, quantity, price);
        TradeRequest::from_signal(&TenantId::from("t1"), &signal, Utc::now())
    }

    #[tokio::test]
    async fn market_order_uses_broker_fill_price() {
        let broker: Arc<dyn BrokerClient> = Arc::new(ScriptedBroker {
            fill_price: dec!(150.05),
            inner: SimBroker::resting(),
        });
        let (harness, executor) = harness(Some(broker));

        let outcome = executor
            .execute(market_request(dec!(10), dec!(150)), &HashMap::new())
            .await
            .expect("execution succeeds");

        let ExecutionOutcome::Filled(record) = outcome else {
            panic!("market order must settle in the tick");
        };
        assert_eq!(record.execution_price, dec!(150.05));
        assert!(!record.locally_priced);
        assert!(record.broker_error.is_none());

        let book = harness.portfolios.book(&TenantId::from("t1")).expect("book");
        let book = book.lock().await;
        assert_eq!(book.portfolio.cash, dec!(8499.50));
        assert_eq!(book.portfolio.positions["AAPL"].quantity, dec!(10));

        let trades = harness.store.read_trades(&TenantId::from("t1")).expect("log");
        assert_eq!(trades.len(), 1);
    }

    #[tokio::test]
    async fn broker_failure_still_updates_portfolio_optimistically() {
        let (harness, executor) = harness(Some(Arc::new(DownBroker)));

        let outcome = executor
            .execute(market_request(dec!(10), dec!(150)), &HashMap::new())
            .await
            .expect("local execution succeeds");

        let ExecutionOutcome::Filled(record) = outcome else {
            panic!("dual-write failure must still settle locally");
        };
        assert!(record.locally_priced);
        assert!(record.broker_error.as_deref().unwrap_or_default().contains("unreachable"));
        assert!(record.broker_order_id.is_none());

        let book = harness.portfolios.book(&TenantId::from("t1")).expect("book");
        assert_eq!(book.lock().await.portfolio.cash, dec!(8500));
    }

    #[tokio::test]
    async fn limit_order_parks_pending_and_reserves_cash() {
        let broker: Arc<dyn BrokerClient> = Arc::new(SimBroker::resting());
        let (harness, executor) = harness(Some(broker));

        let signal = StrategySignal::limit("AAPL", Side::Buy, dec!(10), dec!(145), TimeInForce::Gtc);
        let request = TradeRequest::from_signal(&TenantId::from("t1"), &signal, Utc::now());

        let outcome = executor
            .execute(request, &HashMap::new())
            .await
            .expect("limit submit succeeds");
        let ExecutionOutcome::Pending { order_id } = outcome else {
            panic!("resting limit order must stay pending");
        };

        // Portfolio untouched, but notional reserved
        let book = harness.portfolios.book(&TenantId::from("t1")).expect("book");
        {
            let book = book.lock().await;
            assert_eq!(book.portfolio.cash, dec!(10000));
            assert_eq!(book.portfolio.available_cash(), dec!(8550));
            assert!(book.portfolio.positions.is_empty());
        }

        let open = harness.tracker.open_orders(Some(&TenantId::from("t1"))).await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].order_id, order_id);
        assert!(harness
            .store
            .read_trades(&TenantId::from("t1"))
            .expect("log")
            .is_empty());
    }

    #[tokio::test]
    async fn local_only_mode_accepts_limit_immediately() {
        let (harness, executor) = harness(None);

        let signal = StrategySignal::limit("AAPL", Side::Buy, dec!(10), dec!(145), TimeInForce::Gtc);
        let request = TradeRequest::from_signal(&TenantId::from("t1"), &signal, Utc::now());

        let outcome = executor
            .execute(request, &HashMap::new())
            .await
            .expect("local acceptance succeeds");
        let ExecutionOutcome::Filled(record) = outcome else {
            panic!("broker-less limit order must degrade to a fill");
        };
        assert_eq!(record.execution_price, dec!(145));
        assert!(record.locally_priced);

        let book = harness.portfolios.book(&TenantId::from("t1")).expect("book");
        assert_eq!(book.lock().await.portfolio.cash, dec!(8550));
    }
}
