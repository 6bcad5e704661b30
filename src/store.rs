//! Persisted state
//!
//! Log-and-snapshot layout rooted at the configured data directory:
//!
//! - `tenants/<id>/trades.jsonl` — append-only trade log, never rewritten
//! - `tenants/<id>/pending_orders.json` — open-order snapshot, rewritten whole
//!   (atomic tmp+rename) on every mutation so its size stays bounded
//! - `tenants/<id>/portfolio/<date>.jsonl` — one snapshot per tenant per tick
//! - `tenants/<id>/errors.jsonl` — strategy failures for the tenant's owner

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{PendingOrder, PortfolioSnapshot, TenantId, TradeRecord};
use crate::error::Result;

/// One line in a tenant's strategy error log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyErrorEntry {
    pub timestamp: DateTime<Utc>,
    /// Which stage failed: load, signal_generation, validation, execution
    pub phase: String,
    pub message: String,
}

pub struct DataStore {
    root: PathBuf,
}

impl DataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tenant_dir(&self, tenant: &TenantId) -> PathBuf {
        self.root.join("tenants").join(tenant.as_str())
    }

    fn append_line<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        let line = serde_json::to_string(value)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Append one settled fill to the tenant's trade log.
    pub fn append_trade(&self, record: &TradeRecord) -> Result<()> {
        let path = self.tenant_dir(&record.tenant_id).join("trades.jsonl");
        self.append_line(&path, record)?;
        debug!(
            "Trade appended for {}: {} {} {} @ {}",
            record.tenant_id, record.side, record.quantity, record.symbol, record.execution_price
        );
        Ok(())
    }

    /// Rewrite the tenant's open-order snapshot from the authoritative
    /// in-memory set.
    pub fn write_pending_snapshot(&self, tenant: &TenantId, orders: &[PendingOrder]) -> Result<()> {
        let dir = self.tenant_dir(tenant);
        fs::create_dir_all(&dir)?;
        let path = dir.join("pending_orders.json");
        let tmp = dir.join("pending_orders.json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(orders)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Read one tenant's persisted open-order snapshot.
    pub fn read_pending_snapshot(&self, tenant: &TenantId) -> Result<Vec<PendingOrder>> {
        let path = self.tenant_dir(tenant).join("pending_orders.json");
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    /// Load every tenant's open orders, e.g. to resume tracking after a
    /// restart. Unreadable snapshots are skipped with a warning rather than
    /// blocking startup.
    pub fn load_pending_orders(&self) -> Result<Vec<PendingOrder>> {
        let tenants_root = self.root.join("tenants");
        let mut orders = Vec::new();
        if !tenants_root.exists() {
            return Ok(orders);
        }
        for entry in fs::read_dir(&tenants_root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path().join("pending_orders.json");
            if !path.exists() {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(crate::error::ArenaError::from)
                .and_then(|raw| Ok(serde_json::from_str::<Vec<PendingOrder>>(&raw)?))
            {
                Ok(mut tenant_orders) => orders.append(&mut tenant_orders),
                Err(e) => warn!("Skipping unreadable pending snapshot {}: {e}", path.display()),
            }
        }
        Ok(orders)
    }

    /// Append one portfolio snapshot line into the tenant's daily file.
    pub fn append_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<()> {
        let day = snapshot.timestamp.date_naive();
        let path = self
            .tenant_dir(&snapshot.tenant_id)
            .join("portfolio")
            .join(format!("{day}.jsonl"));
        self.append_line(&path, snapshot)
    }

    /// Append a strategy failure to the tenant's error log.
    pub fn append_strategy_error(&self, tenant: &TenantId, entry: &StrategyErrorEntry) -> Result<()> {
        let path = self.tenant_dir(tenant).join("errors.jsonl");
        self.append_line(&path, entry)
    }

    /// Read a tenant's full trade log, oldest first.
    pub fn read_trades(&self, tenant: &TenantId) -> Result<Vec<TradeRecord>> {
        let path = self.tenant_dir(tenant).join("trades.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(path)?;
        let mut records = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            records.push(serde_json::from_str(line)?);
        }
        Ok(records)
    }
}
