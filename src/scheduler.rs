//! Scheduler
//!
//! Fires once per wall-clock minute boundary while the session is open and
//! drives one execution pass per tenant: Sandbox -> Validator -> Executor.
//! Boundaries are recomputed from the wall clock every iteration, so the loop
//! does not drift like a fixed-interval timer. Per-tenant work fans out under
//! a bounded semaphore; one tenant's failure or timeout never blocks others.
//! An overrunning tick logs a warning and the loop resumes at the next whole
//! minute — boundaries are never double-fired.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Semaphore};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::data::MarketDataProvider;
use crate::domain::{MarketSnapshot, TenantId, TradeRequest};
use crate::error::Result;
use crate::executor::{ExecutionOutcome, TradeExecutor};
use crate::portfolio::PortfolioStore;
use crate::sandbox::{PositionBrief, StrategyContext, StrategyOutcome, StrategySandbox, TenantView};
use crate::store::{DataStore, StrategyErrorEntry};
use crate::validator::SignalValidator;

/// Idle <-> TickInProgress, visible to health surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    TickInProgress,
}

/// What one tenant did during one tick.
#[derive(Debug, Clone)]
pub struct TenantTick {
    pub tenant_id: TenantId,
    pub outcome: String,
    pub duration_ms: u64,
}

/// Summary of one full execution pass.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub as_of: DateTime<Utc>,
    pub outcomes: Vec<TenantTick>,
}

/// Next wall-clock minute boundary strictly after `now`.
pub fn next_minute_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    let next = (now.timestamp().div_euclid(60) + 1) * 60;
    DateTime::from_timestamp(next, 0).unwrap_or(now + chrono::Duration::seconds(60))
}

pub struct Scheduler {
    config: SchedulerConfig,
    portfolios: Arc<PortfolioStore>,
    sandbox: Arc<StrategySandbox>,
    validator: Arc<SignalValidator>,
    executor: Arc<TradeExecutor>,
    data: Arc<dyn MarketDataProvider>,
    store: Arc<DataStore>,
    symbols: Vec<String>,
    tick_in_progress: AtomicBool,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulerConfig,
        portfolios: Arc<PortfolioStore>,
        sandbox: Arc<StrategySandbox>,
        validator: Arc<SignalValidator>,
        executor: Arc<TradeExecutor>,
        data: Arc<dyn MarketDataProvider>,
        store: Arc<DataStore>,
        symbols: Vec<String>,
    ) -> Self {
        Self {
            config,
            portfolios,
            sandbox,
            validator,
            executor,
            data,
            store,
            symbols,
            tick_in_progress: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SchedulerState {
        if self.tick_in_progress.load(Ordering::SeqCst) {
            SchedulerState::TickInProgress
        } else {
            SchedulerState::Idle
        }
    }

    /// Minute loop. On shutdown, an in-flight tick finishes (each tenant call
    /// bounded by its own timeout) before this returns.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Scheduler started ({} tenant(s))", self.portfolios.len());
        loop {
            let now = Utc::now();
            let target = next_minute_boundary(now);
            let wait = (target - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = sleep(wait) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let started = Instant::now();
            self.tick_in_progress.store(true, Ordering::SeqCst);
            match self.run_tick(target).await {
                Ok(report) => {
                    let signals = report
                        .outcomes
                        .iter()
                        .filter(|t| t.outcome == "filled" || t.outcome == "pending")
                        .count();
                    info!(
                        "Tick {} complete: {} tenant(s), {} trade action(s), {}ms",
                        target.format("%H:%M"),
                        report.outcomes.len(),
                        signals,
                        started.elapsed().as_millis()
                    );
                }
                Err(e) => error!("Tick at {target} failed: {e}"),
            }
            self.tick_in_progress.store(false, Ordering::SeqCst);

            if started.elapsed() > Duration::from_secs(60) {
                warn!(
                    "Tick at {} overran the minute boundary ({}ms)",
                    target,
                    started.elapsed().as_millis()
                );
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("Scheduler stopped");
    }

    /// Latest bar per symbol plus each symbol's trailing history, so lookback
    /// strategies see a full series. A failed history fetch degrades that
    /// symbol to its latest bar alone.
    async fn fetch_snapshot(&self, as_of: DateTime<Utc>) -> MarketSnapshot {
        let mut bars = match self.data.latest_bars(&self.symbols).await {
            Ok(bars) => bars,
            Err(e) => {
                warn!("Market data fetch failed: {e}; ticking with empty snapshot");
                return MarketSnapshot::empty(as_of);
            }
        };

        let mut symbols = self.symbols.clone();
        if symbols.is_empty() {
            symbols = bars.iter().map(|b| b.symbol.clone()).collect();
            symbols.sort();
            symbols.dedup();
        }
        for symbol in &symbols {
            match self.data.history(symbol, self.config.history_bars).await {
                Ok(series) => bars.extend(series),
                Err(e) => {
                    warn!("History fetch failed for {symbol}: {e}; using the latest bar only")
                }
            }
        }
        MarketSnapshot::from_bars(as_of, bars)
    }

    /// One execution pass: snapshot the market once, write each tenant's
    /// pre-trade portfolio line, then fan out sandboxed strategy calls.
    pub async fn run_tick(&self, as_of: DateTime<Utc>) -> Result<TickReport> {
        let snapshot = Arc::new(self.fetch_snapshot(as_of).await);

        // Every minute gets one snapshot line per tenant, signal or not
        for tenant_id in self.portfolios.tenant_ids() {
            match self.portfolios.snapshot(&tenant_id, &snapshot.prices, as_of).await {
                Ok(snap) => {
                    if let Err(e) = self.store.append_snapshot(&snap) {
                        warn!("Failed to write snapshot for {tenant_id}: {e}");
                    }
                }
                Err(e) => warn!("Failed to build snapshot for {tenant_id}: {e}"),
            }
        }

        let in_session = self.config.run_24_7
            || self
                .config
                .session
                .map_or(false, |session| session.contains(as_of));
        if !in_session {
            debug!("Session closed at {as_of}; skipping strategy execution");
            return Ok(TickReport {
                as_of,
                outcomes: Vec::new(),
            });
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_strategies));
        let mut tasks = Vec::new();
        for tenant_id in self.portfolios.tenant_ids() {
            let semaphore = semaphore.clone();
            let snapshot = snapshot.clone();
            let portfolios = self.portfolios.clone();
            let sandbox = self.sandbox.clone();
            let validator = self.validator.clone();
            let executor = self.executor.clone();
            let store = self.store.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return TenantTick {
                            tenant_id,
                            outcome: "error".to_string(),
                            duration_ms: 0,
                        }
                    }
                };
                run_tenant(tenant_id, snapshot, portfolios, sandbox, validator, executor, store)
                    .await
            }));
        }

        let mut outcomes = Vec::new();
        for task in tasks {
            match task.await {
                Ok(tick) => outcomes.push(tick),
                // A panicked tenant task is isolated; the tick goes on
                Err(join_err) => error!("Tenant task panicked: {join_err}"),
            }
        }

        Ok(TickReport { as_of, outcomes })
    }
}

/// One tenant's pass: sandboxed signal, validation gate, execution. Every
/// failure is caught here at the tenant boundary.
async fn run_tenant(
    tenant_id: TenantId,
    snapshot: Arc<MarketSnapshot>,
    portfolios: Arc<PortfolioStore>,
    sandbox: Arc<StrategySandbox>,
    validator: Arc<SignalValidator>,
    executor: Arc<TradeExecutor>,
    store: Arc<DataStore>,
) -> TenantTick {
    let started = Instant::now();
    let fail = |outcome: &str, started: Instant| TenantTick {
        tenant_id: tenant_id.clone(),
        outcome: outcome.to_string(),
        duration_ms: started.elapsed().as_millis() as u64,
    };

    let book = match portfolios.book(&tenant_id) {
        Ok(book) => book,
        Err(e) => {
            error!("No book for tenant {tenant_id}: {e}");
            return fail("error", started);
        }
    };

    let (tenant, view) = {
        let book = book.lock().await;
        let positions = book
            .portfolio
            .positions
            .iter()
            .map(|(symbol, pos)| {
                (
                    symbol.clone(),
                    PositionBrief {
                        quantity: pos.quantity,
                        avg_cost: pos.avg_cost,
                    },
                )
            })
            .collect();
        (
            book.tenant.clone(),
            TenantView {
                id: tenant_id.to_string(),
                name: book.tenant.name.clone(),
                cash: book.portfolio.available_cash(),
                positions,
                params: book.tenant.strategy.params.clone(),
            },
        )
    };

    let ctx = StrategyContext {
        tenant: view,
        market: snapshot.clone(),
    };
    let (outcome, duration) = sandbox.invoke(&tenant, ctx).await;

    let log_error = |phase: &str, message: &str| {
        let entry = StrategyErrorEntry {
            timestamp: Utc::now(),
            phase: phase.to_string(),
            message: message.to_string(),
        };
        if let Err(e) = store.append_strategy_error(&tenant_id, &entry) {
            warn!("Could not write error log for {tenant_id}: {e}");
        }
    };

    let label = match outcome {
        StrategyOutcome::Signal(signal) => {
            let validation = {
                let book = book.lock().await;
                validator.validate(&signal, &book.portfolio, &snapshot)
            };
            match validation {
                Ok(()) => {
                    let request = TradeRequest::from_signal(&tenant_id, &signal, Utc::now());
                    match executor.execute(request, &snapshot.prices).await {
                        Ok(ExecutionOutcome::Filled(_)) => "filled",
                        Ok(ExecutionOutcome::Pending { .. }) => "pending",
                        Err(e) => {
                            error!("Execution failed for {tenant_id}: {e}");
                            log_error("execution", &e.to_string());
                            "error"
                        }
                    }
                }
                Err(rejection) => {
                    warn!(
                        "Signal rejected for {tenant_id} (rule {}): {rejection}",
                        rejection.rule()
                    );
                    log_error("validation", &rejection.to_string());
                    "rejected"
                }
            }
        }
        StrategyOutcome::NoSignal => "no_signal",
        StrategyOutcome::Timeout { elapsed_ms } => {
            log_error("signal_generation", &format!("timed out after {elapsed_ms}ms"));
            "timeout"
        }
        StrategyOutcome::Failed { message } => {
            warn!("Strategy failed for {tenant_id}: {message}");
            log_error("signal_generation", &message);
            "error"
        }
        StrategyOutcome::Disabled { .. } => "disabled",
    };

    TenantTick {
        tenant_id,
        outcome: label.to_string(),
        duration_ms: duration.as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SimBroker;
    use crate::config::{
        ExecutionConfig, ReconciliationConfig, ValidationConfig,
    };
    use crate::domain::{MinuteBar, StrategyDescriptor, Tenant};
    use crate::sandbox::StrategyRegistry;
    use crate::tracker::OrderTracker;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct FixedProvider {
        bars: Vec<MinuteBar>,
    }

    #[async_trait]
    impl MarketDataProvider for FixedProvider {
        async fn latest_bars(&self, _symbols: &[String]) -> Result<Vec<MinuteBar>> {
            Ok(self.bars.clone())
        }

        async fn history(&self, symbol: &str, _limit: usize) -> Result<Vec<MinuteBar>> {
            Ok(self
                .bars
                .iter()
                .filter(|b| b.symbol == symbol)
                .cloned()
                .collect())
        }
    }

    fn bar(symbol: &str, close: Decimal) -> MinuteBar {
        MinuteBar {
            symbol: symbol.to_string(),
            timestamp: Utc::now(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 100,
        }
    }

    #[test]
    fn boundary_is_the_next_whole_minute() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 17).unwrap();
        assert_eq!(
            next_minute_boundary(now),
            Utc.with_ymd_and_hms(2026, 3, 2, 14, 31, 0).unwrap()
        );

        // Exactly on a boundary still advances to the next one
        let on_boundary = Utc.with_ymd_and_hms(2026, 3, 2, 14, 31, 0).unwrap();
        assert_eq!(
            next_minute_boundary(on_boundary),
            Utc.with_ymd_and_hms(2026, 3, 2, 14, 32, 0).unwrap()
        );
    }

    fn upload_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("strategy.rs"), "pub fn ok() {}\n").expect("write");
        dir
    }

    fn tenant(id: &str, dir: &std::path::Path, entry: &str) -> Tenant {
        Tenant {
            id: TenantId::from(id),
            name: id.to_string(),
            strategy: StrategyDescriptor {
                dir: dir.to_path_buf(),
                entry: entry.to_string(),
                params: serde_json::json!({"symbol": "AAPL", "quantity": "2"}),
            },
        }
    }

    #[tokio::test]
    async fn tick_isolates_tenants_and_executes_good_signals() {
        let data_dir = tempfile::tempdir().expect("tempdir");
        let upload = upload_dir();

        let portfolios = Arc::new(PortfolioStore::new());
        portfolios.insert_tenant(tenant("good", upload.path(), "hold"), dec!(10000));
        portfolios.insert_tenant(tenant("broken", upload.path(), "no-such-entry"), dec!(10000));

        let store = Arc::new(DataStore::new(data_dir.path()));
        let broker: Arc<dyn crate::broker::BrokerClient> = Arc::new(SimBroker::new());
        let tracker = Arc::new(OrderTracker::new(
            Some(broker.clone()),
            portfolios.clone(),
            store.clone(),
            ReconciliationConfig::default(),
            false,
        ));
        let executor = Arc::new(TradeExecutor::new(
            Some(broker),
            portfolios.clone(),
            tracker,
            store.clone(),
            ExecutionConfig { settle_delay_ms: 0 },
            false,
        ));
        let scheduler = Scheduler::new(
            SchedulerConfig::default(),
            portfolios.clone(),
            Arc::new(StrategySandbox::new(
                StrategyRegistry::with_builtins(),
                Duration::from_secs(5),
            )),
            Arc::new(SignalValidator::new(ValidationConfig::default())),
            executor,
            Arc::new(FixedProvider {
                bars: vec![bar("AAPL", dec!(150))],
            }),
            store.clone(),
            vec!["AAPL".to_string()],
        );

        let report = scheduler.run_tick(Utc::now()).await.expect("tick runs");
        assert_eq!(report.outcomes.len(), 2);

        let by_id: std::collections::HashMap<_, _> = report
            .outcomes
            .iter()
            .map(|t| (t.tenant_id.to_string(), t.outcome.clone()))
            .collect();
        assert_eq!(by_id["good"], "filled");
        assert_eq!(by_id["broken"], "disabled");

        // The good tenant actually traded
        let book = portfolios.book(&TenantId::from("good")).expect("book");
        assert_eq!(book.lock().await.portfolio.positions["AAPL"].quantity, dec!(2));

        // Both tenants got their pre-trade snapshot line
        let good_trades = store.read_trades(&TenantId::from("good")).expect("log");
        assert_eq!(good_trades.len(), 1);
    }

    #[tokio::test]
    async fn closed_session_still_snapshots_but_skips_strategies() {
        let data_dir = tempfile::tempdir().expect("tempdir");
        let upload = upload_dir();

        let portfolios = Arc::new(PortfolioStore::new());
        portfolios.insert_tenant(tenant("t1", upload.path(), "hold"), dec!(10000));
        let store = Arc::new(DataStore::new(data_dir.path()));
        let tracker = Arc::new(OrderTracker::new(
            None,
            portfolios.clone(),
            store.clone(),
            ReconciliationConfig::default(),
            false,
        ));
        let executor = Arc::new(TradeExecutor::new(
            None,
            portfolios.clone(),
            tracker,
            store.clone(),
            ExecutionConfig::default(),
            false,
        ));

        let mut config = SchedulerConfig::default();
        config.run_24_7 = false;
        config.session = Some(crate::config::SessionWindow {
            open_hour: 14,
            close_hour: 21,
        });

        let scheduler = Scheduler::new(
            config,
            portfolios.clone(),
            Arc::new(StrategySandbox::new(
                StrategyRegistry::with_builtins(),
                Duration::from_secs(5),
            )),
            Arc::new(SignalValidator::new(ValidationConfig::default())),
            executor,
            Arc::new(FixedProvider {
                bars: vec![bar("AAPL", dec!(150))],
            }),
            store,
            vec!["AAPL".to_string()],
        );

        let after_hours = Utc.with_ymd_and_hms(2026, 3, 2, 23, 0, 0).unwrap();
        let report = scheduler.run_tick(after_hours).await.expect("tick runs");
        assert!(report.outcomes.is_empty());

        let book = portfolios.book(&TenantId::from("t1")).expect("book");
        assert!(book.lock().await.portfolio.positions.is_empty());
    }
}
