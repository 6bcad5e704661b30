//! Tenant registry
//!
//! TOML file listing the competition's tenants: id, display name, initial
//! capital, and the strategy upload to run. Loaded once at startup; tenants
//! are created at add time and never deleted mid-run.
//!
//! ```toml
//! [[tenants]]
//! id = "team-alpha"
//! name = "Team Alpha"
//! cash = 10000
//! strategy_dir = "strategies/team-alpha"
//! entry = "momentum"
//! [tenants.params]
//! symbol = "AAPL"
//! quantity = 5
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::domain::{StrategyDescriptor, Tenant, TenantId};
use crate::error::{ArenaError, Result};

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    tenants: Vec<TenantSpec>,
}

/// One registry entry as written by the operator.
#[derive(Debug, Clone, Deserialize)]
pub struct TenantSpec {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_cash")]
    pub cash: Decimal,
    pub strategy_dir: PathBuf,
    pub entry: String,
    #[serde(default)]
    pub params: Option<toml::Value>,
}

fn default_cash() -> Decimal {
    Decimal::from(10_000)
}

/// Stable slug used as the runtime tenant key.
pub fn slugify(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len());
    let mut last_dash = true;
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

impl TenantSpec {
    /// Materialize the spec into a runtime tenant plus its initial capital.
    pub fn into_tenant(self) -> Result<(Tenant, Decimal)> {
        let slug = slugify(&self.id);
        if slug.is_empty() {
            return Err(ArenaError::Registry(format!(
                "tenant id '{}' slugifies to nothing",
                self.id
            )));
        }
        if self.cash <= Decimal::ZERO {
            return Err(ArenaError::Registry(format!(
                "tenant '{slug}' must start with positive cash"
            )));
        }
        let params = match &self.params {
            Some(value) => serde_json::to_value(value)?,
            None => serde_json::Value::Null,
        };
        let tenant = Tenant {
            id: TenantId::from(slug.clone()),
            name: self.name.unwrap_or(self.id),
            strategy: StrategyDescriptor {
                dir: self.strategy_dir,
                entry: self.entry,
                params,
            },
        };
        Ok((tenant, self.cash))
    }
}

/// Parse the registry file and reject duplicate tenant ids.
pub fn load_registry(path: &Path) -> Result<Vec<TenantSpec>> {
    let raw = fs::read_to_string(path)
        .map_err(|e| ArenaError::Registry(format!("{}: {e}", path.display())))?;
    let file: RegistryFile =
        toml::from_str(&raw).map_err(|e| ArenaError::Registry(e.to_string()))?;

    let mut seen = HashSet::new();
    for spec in &file.tenants {
        let slug = slugify(&spec.id);
        if !seen.insert(slug.clone()) {
            return Err(ArenaError::Registry(format!("duplicate tenant id '{slug}'")));
        }
    }
    Ok(file.tenants)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    fn write_registry(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tenants.toml");
        let mut file = fs::File::create(&path).expect("create registry");
        write!(file, "{content}").expect("write registry");
        (dir, path)
    }

    #[test]
    fn parses_tenants_with_params() {
        let (_dir, path) = write_registry(
            r#"
            [[tenants]]
            id = "Team Alpha"
            cash = 25000
            strategy_dir = "strategies/alpha"
            entry = "momentum"
            [tenants.params]
            symbol = "MSFT"
            quantity = 5
            "#,
        );

        let specs = load_registry(&path).expect("registry parses");
        assert_eq!(specs.len(), 1);
        let (tenant, cash) = specs[0].clone().into_tenant().expect("spec converts");
        assert_eq!(tenant.id.as_str(), "team-alpha");
        assert_eq!(cash, dec!(25000));
        assert_eq!(tenant.strategy.entry, "momentum");
        assert_eq!(tenant.strategy.params["symbol"], "MSFT");
    }

    #[test]
    fn rejects_duplicate_ids() {
        let (_dir, path) = write_registry(
            r#"
            [[tenants]]
            id = "alpha"
            strategy_dir = "a"
            entry = "hold"
            [[tenants]]
            id = "Alpha"
            strategy_dir = "b"
            entry = "hold"
            "#,
        );
        assert!(load_registry(&path).is_err());
    }

    #[test]
    fn slugify_normalizes() {
        assert_eq!(slugify("Team Alpha!"), "team-alpha");
        assert_eq!(slugify("  QTC  Alpha  "), "qtc-alpha");
        assert_eq!(slugify("abc-123"), "abc-123");
    }

    #[test]
    fn default_cash_applies() {
        let (_dir, path) = write_registry(
            r#"
            [[tenants]]
            id = "alpha"
            strategy_dir = "a"
            entry = "hold"
            "#,
        );
        let specs = load_registry(&path).expect("registry parses");
        let (_, cash) = specs[0].clone().into_tenant().expect("spec converts");
        assert_eq!(cash, dec!(10000));
    }
}
