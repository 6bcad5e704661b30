use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use arena::config::LoggingConfig;
use arena::data::{FlatFileProvider, MarketDataProvider};
use arena::domain::TenantId;
use arena::registry::load_registry;
use arena::sandbox::source_check;
use arena::{
    AppConfig, DataStore, OrderTracker, PortfolioStore, Scheduler, SignalValidator,
    StrategyRegistry, StrategySandbox, TradeExecutor,
};

#[derive(Parser)]
#[command(name = "arena", version, about = "Multi-tenant trading competition orchestrator")]
struct Cli {
    /// Configuration directory
    #[arg(long, default_value = "config", env = "ARENA_CONFIG_DIR")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator
    Run {
        /// Tenant registry file (overrides the configured path)
        #[arg(long)]
        registry: Option<PathBuf>,
    },
    /// Scan a strategy upload for denied capabilities
    Check {
        /// Upload directory to scan
        dir: PathBuf,
    },
    /// Show a tenant's persisted open orders
    Orders {
        #[arg(long)]
        tenant: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config_dir).context("loading configuration")?;
    if let Err(errors) = config.validate() {
        bail!("invalid configuration:\n  {}", errors.join("\n  "));
    }
    let _log_guard = init_tracing(&config.logging);

    match cli.command.unwrap_or(Commands::Run { registry: None }) {
        Commands::Run { registry } => run(config, registry).await,
        Commands::Check { dir } => check(&dir),
        Commands::Orders { tenant } => orders(&config, &tenant),
    }
}

fn init_tracing(config: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,arena={}", config.level)));

    if let Some(dir) = &config.dir {
        let appender = tracing_appender::rolling::daily(dir, "arena.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        if config.json {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(writer)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
        }
        Some(guard)
    } else {
        if config.json {
            tracing_subscriber::fmt().json().with_env_filter(filter).init();
        } else {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        None
    }
}

async fn run(config: AppConfig, registry_override: Option<PathBuf>) -> anyhow::Result<()> {
    let registry_path = registry_override.unwrap_or_else(|| config.registry_path.clone());
    let specs = load_registry(&registry_path)
        .with_context(|| format!("loading tenant registry {}", registry_path.display()))?;
    if specs.is_empty() {
        warn!("Registry {} lists no tenants", registry_path.display());
    }

    let store = Arc::new(DataStore::new(&config.data.dir));
    let portfolios = Arc::new(PortfolioStore::new());
    for spec in specs {
        let (tenant, cash) = spec.into_tenant()?;
        info!(
            "Tenant {} ({}) starting with ${cash}, strategy '{}'",
            tenant.id, tenant.name, tenant.strategy.entry
        );
        portfolios.insert_tenant(tenant, cash);
    }

    let broker = arena::broker::from_config(&config.broker)?;
    let tracker = Arc::new(OrderTracker::new(
        broker.clone(),
        portfolios.clone(),
        store.clone(),
        config.reconciliation.clone(),
        config.validation.allow_short,
    ));

    restore_portfolios(&portfolios, &store).await;
    tracker.load_from_disk().await?;
    reserve_open_orders(&tracker, &portfolios).await;

    let executor = Arc::new(TradeExecutor::new(
        broker,
        portfolios.clone(),
        tracker.clone(),
        store.clone(),
        config.execution.clone(),
        config.validation.allow_short,
    ));
    let sandbox = Arc::new(StrategySandbox::new(
        StrategyRegistry::with_builtins(),
        Duration::from_millis(config.scheduler.strategy_timeout_ms),
    ));
    let validator = Arc::new(SignalValidator::new(config.validation.clone()));

    let bars_file = config
        .data
        .bars_file
        .clone()
        .unwrap_or_else(|| config.data.dir.join("bars.jsonl"));
    let data: Arc<dyn MarketDataProvider> = Arc::new(FlatFileProvider::new(bars_file));
    let symbols = if config.data.symbols.is_empty() {
        config.validation.universe.clone()
    } else {
        config.data.symbols.clone()
    };

    let scheduler = Arc::new(Scheduler::new(
        config.scheduler.clone(),
        portfolios,
        sandbox,
        validator,
        executor,
        data,
        store,
        symbols,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
        });
    }

    let reconciliation = tokio::spawn(tracker.clone().run(shutdown_rx.clone()));
    scheduler.run(shutdown_rx).await;

    // The scheduler has drained; stop the reconciliation loop too
    let _ = shutdown_tx.send(true);
    let _ = reconciliation.await;
    info!("Shutdown complete");
    Ok(())
}

/// Rebuild each tenant's ledger by replaying its append-only trade log.
async fn restore_portfolios(portfolios: &Arc<PortfolioStore>, store: &Arc<DataStore>) {
    for tenant_id in portfolios.tenant_ids() {
        let trades = match store.read_trades(&tenant_id) {
            Ok(trades) => trades,
            Err(e) => {
                warn!("Could not read trade log for {tenant_id}: {e}");
                continue;
            }
        };
        if trades.is_empty() {
            continue;
        }
        let book = match portfolios.book(&tenant_id) {
            Ok(book) => book,
            Err(_) => continue,
        };
        let mut book = book.lock().await;
        let count = trades.len();
        for trade in trades {
            // Historical fills always apply; the invariants held when they
            // were written
            if let Err(e) = book.portfolio.apply_fill(
                &trade.symbol,
                trade.side,
                trade.quantity,
                trade.execution_price,
                true,
            ) {
                warn!("Replay skipped a trade for {tenant_id}: {e}");
            }
        }
        info!("Replayed {count} trade(s) for {tenant_id}");
    }
}

/// Re-establish buying-power reservations for orders that were open when the
/// previous process stopped.
async fn reserve_open_orders(tracker: &Arc<OrderTracker>, portfolios: &Arc<PortfolioStore>) {
    for order in tracker.open_orders(None).await {
        let book = match portfolios.book(&order.tenant_id) {
            Ok(book) => book,
            Err(e) => {
                warn!("Open order {} has no tenant book: {e}", order.order_id);
                continue;
            }
        };
        let mut book = book.lock().await;
        if let Err(e) = book.portfolio.reserve(
            &order.symbol,
            order.side,
            order.quantity,
            order.reserve_price(),
        ) {
            warn!("Could not re-reserve for order {}: {e}", order.order_id);
        }
    }
}

fn check(dir: &PathBuf) -> anyhow::Result<()> {
    let violations = source_check::scan_upload(dir)?;
    if violations.is_empty() {
        println!("OK: no denied capabilities in {}", dir.display());
        return Ok(());
    }
    for violation in &violations {
        println!("{violation}");
    }
    bail!("{} violation(s) found", violations.len());
}

fn orders(config: &AppConfig, tenant: &str) -> anyhow::Result<()> {
    let store = DataStore::new(&config.data.dir);
    let orders = store.read_pending_snapshot(&TenantId::from(tenant))?;
    if orders.is_empty() {
        println!("No open orders for {tenant}");
        return Ok(());
    }
    for order in orders {
        println!(
            "{}  {}  {} {} {} @ {}  filled {}{}  [{}]",
            order.order_id,
            order.status,
            order.side,
            order.quantity,
            order.symbol,
            order.limit_price.unwrap_or(order.requested_price),
            order.filled_qty,
            order
                .filled_avg_price
                .map(|p| format!(" @ {p}"))
                .unwrap_or_default(),
            order.time_in_force,
        );
    }
    Ok(())
}
