use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Hard deadline for one strategy invocation (ms)
    #[serde(default = "default_strategy_timeout_ms")]
    pub strategy_timeout_ms: u64,
    /// Bound on concurrent strategy invocations within a tick
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_strategies: usize,
    /// Trailing bars fetched per symbol for each tick's snapshot
    #[serde(default = "default_history_bars")]
    pub history_bars: usize,
    /// Run ticks around the clock instead of only inside the session window
    #[serde(default = "default_true")]
    pub run_24_7: bool,
    /// UTC session window (hours) used when `run_24_7` is false
    #[serde(default)]
    pub session: Option<SessionWindow>,
}

/// Inclusive-open UTC hour window, e.g. 14..21 for US equities.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SessionWindow {
    pub open_hour: u32,
    pub close_hour: u32,
}

impl SessionWindow {
    pub fn contains(&self, ts: chrono::DateTime<chrono::Utc>) -> bool {
        use chrono::Timelike;
        let hour = ts.hour();
        hour >= self.open_hour && hour < self.close_hour
    }
}

fn default_strategy_timeout_ms() -> u64 {
    5_000
}

fn default_max_concurrent() -> usize {
    8
}

fn default_history_bars() -> usize {
    30
}

fn default_true() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy_timeout_ms: default_strategy_timeout_ms(),
            max_concurrent_strategies: default_max_concurrent(),
            history_bars: default_history_bars(),
            run_24_7: true,
            session: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// How long to wait before reading a market order's fill price back (ms)
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

fn default_settle_delay_ms() -> u64 {
    500
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    /// Maximum fractional deviation from the last known price (0.10 = 10%)
    #[serde(default = "default_price_band")]
    pub price_band_pct: Decimal,
    /// Allow sells beyond held quantity
    #[serde(default)]
    pub allow_short: bool,
    /// Tradable universe; empty means "whatever the snapshot carries"
    #[serde(default)]
    pub universe: Vec<String>,
}

fn default_price_band() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            price_band_pct: default_price_band(),
            allow_short: false,
            universe: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    /// Interval between reconciliation cycles (seconds)
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
    /// Cap on broker queries per cycle (venue rate ceiling)
    #[serde(default = "default_max_queries")]
    pub max_queries_per_cycle: usize,
    /// Pause between consecutive broker queries (ms)
    #[serde(default = "default_query_pause_ms")]
    pub query_pause_ms: u64,
    /// Terminal orders older than this are purged from the tracker
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_max_queries() -> usize {
    50
}

fn default_query_pause_ms() -> u64 {
    100
}

fn default_retention_days() -> i64 {
    7
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval(),
            max_queries_per_cycle: default_max_queries(),
            query_pause_ms: default_query_pause_ms(),
            retention_days: default_retention_days(),
        }
    }
}

/// Which broker implementation to wire in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerMode {
    /// Real venue when credentials are present, simulator otherwise
    #[default]
    Auto,
    /// Always the local instant-fill simulator
    Sim,
    /// No venue at all; limit orders degrade to local acceptance
    None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub mode: BrokerMode,
    /// Override the venue base URL (defaults to the paper endpoint)
    #[serde(default)]
    pub base_url: Option<String>,
    /// Per-request network timeout (ms)
    #[serde(default = "default_broker_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_broker_timeout_ms() -> u64 {
    5_000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mode: BrokerMode::default(),
            base_url: None,
            request_timeout_ms: default_broker_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    /// Root of all persisted state (trade logs, snapshots, pending orders)
    #[serde(default = "default_data_dir")]
    pub dir: PathBuf,
    /// JSONL file of minute bars for the flat-file market data provider
    #[serde(default)]
    pub bars_file: Option<PathBuf>,
    /// Symbols to request each tick
    #[serde(default)]
    pub symbols: Vec<String>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("tenants.toml")
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: default_data_dir(),
            bars_file: None,
            symbols: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Also write daily-rotated log files into this directory
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("ARENA_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (ARENA_BROKER__MODE, etc.)
            .add_source(
                Environment::with_prefix("ARENA")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.scheduler.strategy_timeout_ms == 0 {
            errors.push("scheduler.strategy_timeout_ms must be positive".to_string());
        }
        if self.scheduler.max_concurrent_strategies == 0 {
            errors.push("scheduler.max_concurrent_strategies must be positive".to_string());
        }
        if self.scheduler.history_bars == 0 {
            errors.push("scheduler.history_bars must be positive".to_string());
        }
        if !self.scheduler.run_24_7 && self.scheduler.session.is_none() {
            errors.push("scheduler.session is required when run_24_7 is false".to_string());
        }
        if let Some(session) = &self.scheduler.session {
            if session.open_hour >= session.close_hour || session.close_hour > 24 {
                errors.push("scheduler.session hours must satisfy open < close <= 24".to_string());
            }
        }

        if self.validation.price_band_pct <= Decimal::ZERO {
            errors.push("validation.price_band_pct must be positive".to_string());
        }

        if self.reconciliation.interval_secs == 0 {
            errors.push("reconciliation.interval_secs must be positive".to_string());
        }
        if self.reconciliation.max_queries_per_cycle == 0 {
            errors.push("reconciliation.max_queries_per_cycle must be positive".to_string());
        }
        if self.reconciliation.retention_days <= 0 {
            errors.push("reconciliation.retention_days must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            execution: ExecutionConfig::default(),
            validation: ValidationConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            broker: BrokerConfig::default(),
            data: DataConfig::default(),
            registry_path: default_registry_path(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn defaults_pass_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.validation.price_band_pct, dec!(0.10));
        assert_eq!(config.scheduler.strategy_timeout_ms, 5_000);
        assert_eq!(config.scheduler.history_bars, 30);
        assert_eq!(config.reconciliation.interval_secs, 30);
    }

    #[test]
    fn session_required_when_not_24_7() {
        let mut config = AppConfig::default();
        config.scheduler.run_24_7 = false;
        let errors = config.validate().expect_err("missing session must fail");
        assert!(errors.iter().any(|e| e.contains("session")));
    }

    #[test]
    fn session_window_contains_hours() {
        let window = SessionWindow {
            open_hour: 14,
            close_hour: 21,
        };
        let inside = chrono::Utc.with_ymd_and_hms(2026, 3, 2, 15, 30, 0).unwrap();
        let outside = chrono::Utc.with_ymd_and_hms(2026, 3, 2, 22, 0, 0).unwrap();
        assert!(window.contains(inside));
        assert!(!window.contains(outside));
    }
}
