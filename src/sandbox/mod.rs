//! Strategy Sandbox
//!
//! Loads one untrusted strategy per tenant, restricts its capability surface,
//! and invokes it under a hard deadline. The capability ceiling has two
//! layers: the static deny-list scan over the upload's sources
//! ([`source_check`]) and the single-method [`TradingStrategy`] contract —
//! only the return value is trusted.
//!
//! Each invocation runs on its own blocking execution unit so a
//! non-cooperative strategy can be abandoned at the deadline without touching
//! the scheduler. An abandoned unit is not guaranteed to terminate; its result
//! is discarded and never applied.

pub mod builtin;
pub mod source_check;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::domain::{MarketSnapshot, MinuteBar, StrategyDescriptor, StrategySignal, Tenant, TenantId};
use crate::error::{ArenaError, Result};

/// What a strategy is allowed to see about its own tenant.
#[derive(Debug, Clone)]
pub struct TenantView {
    pub id: String,
    pub name: String,
    pub cash: Decimal,
    pub positions: HashMap<String, PositionBrief>,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct PositionBrief {
    pub quantity: Decimal,
    pub avg_cost: Decimal,
}

/// Input to one strategy invocation. Owned so it can cross onto the blocking
/// execution unit; the market snapshot is shared across all tenants in a tick.
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub tenant: TenantView,
    pub market: Arc<MarketSnapshot>,
}

impl StrategyContext {
    pub fn price(&self, symbol: &str) -> Option<Decimal> {
        self.market.price(symbol)
    }

    /// Close series for a symbol, oldest first.
    pub fn closes(&self, symbol: &str) -> Vec<Decimal> {
        self.market
            .bars
            .get(symbol)
            .map(|bars| bars.iter().map(|b| b.close).collect())
            .unwrap_or_default()
    }

    /// Dummy context used for the load-time probe invocation.
    fn probe() -> Self {
        let bar = MinuteBar {
            symbol: "AAPL".to_string(),
            timestamp: chrono::Utc::now(),
            open: Decimal::from(150),
            high: Decimal::from(150),
            low: Decimal::from(150),
            close: Decimal::from(150),
            volume: 1_000,
        };
        Self {
            tenant: TenantView {
                id: "probe".to_string(),
                name: "probe".to_string(),
                cash: Decimal::from(10_000),
                positions: HashMap::new(),
                params: serde_json::Value::Null,
            },
            market: Arc::new(MarketSnapshot::from_bars(chrono::Utc::now(), vec![bar])),
        }
    }
}

/// The single capability handed to tenant code: produce at most one signal
/// per tick. Implementations must be stateless or use interior mutability;
/// the same instance is reused across ticks so internal state survives.
pub trait TradingStrategy: Send + Sync {
    fn generate_signal(&self, ctx: &StrategyContext) -> Result<Option<StrategySignal>>;
}

type StrategyFactory = fn(&serde_json::Value) -> Result<Arc<dyn TradingStrategy>>;

/// Explicit plugin registration: entry-point name to factory.
pub struct StrategyRegistry {
    factories: HashMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry preloaded with the built-in strategies.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("hold", builtin::hold_factory);
        registry.register("momentum", builtin::momentum_factory);
        registry
    }

    pub fn register(&mut self, name: &str, factory: StrategyFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn create(&self, entry: &str, params: &serde_json::Value) -> Result<Arc<dyn TradingStrategy>> {
        let factory = self.factories.get(entry).ok_or_else(|| {
            ArenaError::StrategyLoad(format!("entry point '{entry}' is not registered"))
        })?;
        factory(params)
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Result of one sandboxed invocation.
#[derive(Debug, Clone)]
pub enum StrategyOutcome {
    Signal(StrategySignal),
    NoSignal,
    /// Deadline hit; the execution unit was abandoned
    Timeout { elapsed_ms: u64 },
    /// Runtime error or panic; tick skipped, tenant unaffected
    Failed { message: String },
    /// Load failed; tenant produces nothing until re-upload
    Disabled { reason: String },
}

impl StrategyOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StrategyOutcome::Signal(_) => "signal",
            StrategyOutcome::NoSignal => "no_signal",
            StrategyOutcome::Timeout { .. } => "timeout",
            StrategyOutcome::Failed { .. } => "error",
            StrategyOutcome::Disabled { .. } => "disabled",
        }
    }
}

struct LoadEntry {
    fingerprint: String,
    state: std::result::Result<Arc<dyn TradingStrategy>, String>,
}

pub struct StrategySandbox {
    registry: Arc<StrategyRegistry>,
    timeout: Duration,
    loaded: Arc<DashMap<TenantId, LoadEntry>>,
}

impl StrategySandbox {
    pub fn new(registry: StrategyRegistry, timeout: Duration) -> Self {
        Self {
            registry: Arc::new(registry),
            timeout,
            loaded: Arc::new(DashMap::new()),
        }
    }

    /// Invoke a tenant's strategy under the configured deadline.
    ///
    /// Loading (scan + instantiate + probe) happens lazily on the same
    /// execution unit as the invocation, so a hostile upload cannot stall the
    /// scheduler either way.
    pub async fn invoke(&self, tenant: &Tenant, ctx: StrategyContext) -> (StrategyOutcome, Duration) {
        let started = Instant::now();
        let registry = self.registry.clone();
        let loaded = self.loaded.clone();
        let tenant_id = tenant.id.clone();
        let tenant = tenant.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let strategy = match ensure_loaded(&registry, &loaded, &tenant) {
                Ok(strategy) => strategy,
                Err(reason) => return StrategyOutcome::Disabled { reason },
            };
            match std::panic::catch_unwind(AssertUnwindSafe(|| strategy.generate_signal(&ctx))) {
                Ok(Ok(Some(signal))) => StrategyOutcome::Signal(signal),
                Ok(Ok(None)) => StrategyOutcome::NoSignal,
                Ok(Err(e)) => StrategyOutcome::Failed {
                    message: e.to_string(),
                },
                Err(panic) => StrategyOutcome::Failed {
                    message: panic_message(&panic),
                },
            }
        });

        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(outcome)) => (outcome, started.elapsed()),
            Ok(Err(join_err)) => (
                StrategyOutcome::Failed {
                    message: format!("execution unit failed: {join_err}"),
                },
                started.elapsed(),
            ),
            Err(_) => {
                warn!(
                    "Strategy for tenant {} exceeded {}ms deadline; abandoning execution unit",
                    tenant_id,
                    self.timeout.as_millis()
                );
                (
                    StrategyOutcome::Timeout {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    },
                    started.elapsed(),
                )
            }
        }
    }

    /// Drop a tenant's cached strategy so the next tick reloads it.
    pub fn evict(&self, tenant: &TenantId) {
        self.loaded.remove(tenant);
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic in strategy code".to_string()
    }
}

/// Load (or fetch the cached) strategy for a tenant. A failed load is cached
/// against the upload fingerprint, so the tenant stays disabled until the
/// upload actually changes.
fn ensure_loaded(
    registry: &StrategyRegistry,
    cache: &DashMap<TenantId, LoadEntry>,
    tenant: &Tenant,
) -> std::result::Result<Arc<dyn TradingStrategy>, String> {
    let fingerprint = match fingerprint(&tenant.strategy) {
        Ok(fp) => fp,
        Err(e) => return Err(format!("cannot fingerprint upload: {e}")),
    };

    if let Some(entry) = cache.get(&tenant.id) {
        if entry.fingerprint == fingerprint {
            return entry.state.clone();
        }
        info!("Upload changed for tenant {}; reloading strategy", tenant.id);
    }

    let state = load(registry, &tenant.strategy);
    match &state {
        Ok(_) => info!(
            "Loaded strategy '{}' for tenant {}",
            tenant.strategy.entry, tenant.id
        ),
        Err(reason) => error!("Strategy load failed for tenant {}: {reason}", tenant.id),
    }
    cache.insert(
        tenant.id.clone(),
        LoadEntry {
            fingerprint,
            state: state.clone(),
        },
    );
    state
}

fn load(
    registry: &StrategyRegistry,
    descriptor: &StrategyDescriptor,
) -> std::result::Result<Arc<dyn TradingStrategy>, String> {
    let violations = source_check::scan_upload(&descriptor.dir).map_err(|e| e.to_string())?;
    if !violations.is_empty() {
        let listed: Vec<String> = violations.iter().take(5).map(|v| v.to_string()).collect();
        return Err(format!(
            "capability scan found {} violation(s): {}",
            violations.len(),
            listed.join("; ")
        ));
    }

    let strategy = registry
        .create(&descriptor.entry, &descriptor.params)
        .map_err(|e| e.to_string())?;

    // Probe once with dummy data; a strategy that cannot survive this would
    // fail every tick anyway.
    match std::panic::catch_unwind(AssertUnwindSafe(|| {
        strategy.generate_signal(&StrategyContext::probe())
    })) {
        Ok(Ok(_)) => Ok(strategy),
        Ok(Err(e)) => Err(format!("probe invocation failed: {e}")),
        Err(panic) => Err(format!("probe invocation panicked: {}", panic_message(&panic))),
    }
}

/// Content hash of an upload: entry point, params, and every source file.
fn fingerprint(descriptor: &StrategyDescriptor) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(descriptor.entry.as_bytes());
    hasher.update(descriptor.params.to_string().as_bytes());

    let mut files = Vec::new();
    collect_files(&descriptor.dir, &mut files)?;
    files.sort();
    for file in files {
        hasher.update(file.to_string_lossy().as_bytes());
        hasher.update(std::fs::read(&file)?);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn collect_files(dir: &std::path::Path, files: &mut Vec<std::path::PathBuf>) -> Result<()> {
    if !dir.is_dir() {
        return Err(ArenaError::StrategyLoad(format!(
            "strategy directory {} not found",
            dir.display()
        )));
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}
