//! Portfolio Store
//!
//! Owns every tenant's cash/position ledger. Each tenant sits behind its own
//! async mutex so the minute scheduler and the reconciliation loop serialize
//! their mutations per tenant while unrelated tenants proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::domain::{Portfolio, PortfolioSnapshot, Tenant, TenantId};
use crate::error::{ArenaError, Result};

/// One tenant's mutable state: identity plus ledger.
#[derive(Debug)]
pub struct TenantBook {
    pub tenant: Tenant,
    pub portfolio: Portfolio,
}

pub struct PortfolioStore {
    books: DashMap<TenantId, Arc<Mutex<TenantBook>>>,
}

impl PortfolioStore {
    pub fn new() -> Self {
        Self {
            books: DashMap::new(),
        }
    }

    /// Register a tenant at add time with its initial capital.
    pub fn insert_tenant(&self, tenant: Tenant, initial_cash: Decimal) {
        let id = tenant.id.clone();
        let book = TenantBook {
            tenant,
            portfolio: Portfolio::new(initial_cash),
        };
        self.books.insert(id, Arc::new(Mutex::new(book)));
    }

    pub fn book(&self, id: &TenantId) -> Result<Arc<Mutex<TenantBook>>> {
        self.books
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ArenaError::Internal(format!("unknown tenant {id}")))
    }

    pub fn tenant_ids(&self) -> Vec<TenantId> {
        self.books.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }

    /// Snapshot one tenant's portfolio at the given prices.
    pub async fn snapshot(
        &self,
        id: &TenantId,
        prices: &HashMap<String, Decimal>,
        timestamp: DateTime<Utc>,
    ) -> Result<PortfolioSnapshot> {
        let book = self.book(id)?;
        let book = book.lock().await;
        Ok(PortfolioSnapshot::build(id, &book.portfolio, prices, timestamp))
    }
}

impl Default for PortfolioStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Side, StrategyDescriptor};
    use rust_decimal_macros::dec;

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

    #[tokio::test]
    async fn books_are_independent() {
        let store = PortfolioStore::new();
        store.insert_tenant(tenant("a"), dec!(1000));
        store.insert_tenant(tenant("b"), dec!(2000));

        {
            let book = store.book(&TenantId::from("a")).expect("book exists");
            let mut book = book.lock().await;
            book.portfolio
                .apply_fill("AAPL", Side::Buy, dec!(2), dec!(100), false)
                .expect("fill applies");
        }

        let a = store
            .snapshot(&TenantId::from("a"), &HashMap::new(), Utc::now())
            .await
            .expect("snapshot a");
        let b = store
            .snapshot(&TenantId::from("b"), &HashMap::new(), Utc::now())
            .await
            .expect("snapshot b");
        assert_eq!(a.cash, dec!(800));
        assert_eq!(b.cash, dec!(2000));
    }

    #[test]
    fn unknown_tenant_is_an_error() {
        let store = PortfolioStore::new();
        assert!(store.book(&TenantId::from("missing")).is_err());
    }
}
