//! TOML configuration loading and validation.

use std::path::Path;

use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub exchange: ExchangeConfig,
    pub trading: TradingConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub filters: FiltersConfig,
    #[serde(default)]
    pub snapshots: SnapshotConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which world the engine is pointed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// No real exchange behind the adapter; trading and polling stay off.
    Simulated,
    Testnet,
    Live,
}

impl Environment {
    /// True when orders placed here reach an actual exchange (testnet or live).
    pub fn is_real(&self) -> bool {
        !matches!(self, Environment::Simulated)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    pub environment: Environment,
    /// Environment variable names holding the credentials; secrets never
    /// live in the TOML file itself.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_secret_key_env")]
    pub secret_key_env: String,
}

fn default_api_key_env() -> String {
    "BINANCE_API_KEY".into()
}
fn default_secret_key_env() -> String {
    "BINANCE_SECRET_KEY".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    #[serde(default)]
    pub auto_trade_enabled: bool,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Global per-tick budget across cancels and placements combined.
    #[serde(default = "default_operation_budget")]
    pub operation_budget: usize,
    /// Skip plan actions whose delta is below this % of target value.
    #[serde(default = "default_min_delta_pct")]
    pub min_delta_pct: f64,
    /// Wall-clock drift guard: no new placements after this many seconds
    /// into a tick (cancels still proceed).
    #[serde(default = "default_max_tick_runtime")]
    pub max_tick_runtime_secs: i64,
    /// Valuation older than this is unusable for trading decisions.
    #[serde(default = "default_state_max_age")]
    pub state_max_age_secs: i64,
}

fn default_tick_interval() -> u64 {
    30
}
fn default_operation_budget() -> usize {
    5
}
fn default_min_delta_pct() -> f64 {
    5.0
}
fn default_max_tick_runtime() -> i64 {
    60
}
fn default_state_max_age() -> i64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct PricingConfig {
    #[serde(default = "default_ttl")]
    pub ttl_secs: i64,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_delay")]
    pub batch_delay_ms: u64,
    /// Per-connector cooldown on strategy-scoped valuation recomputation.
    #[serde(default = "default_cooldown")]
    pub valuation_cooldown_secs: i64,
    /// Balances below this many units are ignored as dust.
    #[serde(default = "default_dust")]
    pub dust_threshold: f64,
}

fn default_ttl() -> i64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_batch_size() -> usize {
    10
}
fn default_batch_delay() -> u64 {
    200
}
fn default_cooldown() -> i64 {
    5
}
fn default_dust() -> f64 {
    0.0001
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl(),
            cache_enabled: true,
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay(),
            valuation_cooldown_secs: default_cooldown(),
            dust_threshold: default_dust(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_circuit_timeout")]
    pub circuit_timeout_secs: i64,
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_circuit_timeout() -> i64 {
    600
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            circuit_timeout_secs: default_circuit_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_soft_timeout")]
    pub soft_timeout_secs: i64,
    #[serde(default = "default_hard_timeout")]
    pub hard_timeout_secs: i64,
}

fn default_poll_interval() -> u64 {
    10
}
fn default_soft_timeout() -> i64 {
    15
}
fn default_hard_timeout() -> i64 {
    20
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_poll_interval(),
            soft_timeout_secs: default_soft_timeout(),
            hard_timeout_secs: default_hard_timeout(),
        }
    }
}

/// Exchange trading filters applied to every placement: tick-aligned price,
/// lot-aligned quantity, minimum notional. One set of defaults plus
/// per-symbol overrides keyed by trading pair.
#[derive(Debug, Clone, Deserialize)]
pub struct FiltersConfig {
    #[serde(default = "default_tick_size")]
    pub tick_size: f64,
    #[serde(default = "default_lot_size")]
    pub lot_size: f64,
    #[serde(default = "default_min_notional")]
    pub min_notional: f64,
    #[serde(default)]
    pub symbols: FxHashMap<String, SymbolFilters>,
}

/// Per-symbol overrides; unset fields fall back to the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SymbolFilters {
    #[serde(default)]
    pub tick_size: Option<f64>,
    #[serde(default)]
    pub lot_size: Option<f64>,
    #[serde(default)]
    pub min_notional: Option<f64>,
}

/// Filters resolved for one trading pair.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedFilters {
    pub tick_size: f64,
    pub lot_size: f64,
    pub min_notional: f64,
}

fn default_tick_size() -> f64 {
    0.01
}
fn default_lot_size() -> f64 {
    0.00001
}
fn default_min_notional() -> f64 {
    10.0
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            tick_size: default_tick_size(),
            lot_size: default_lot_size(),
            min_notional: default_min_notional(),
            symbols: FxHashMap::default(),
        }
    }
}

impl FiltersConfig {
    pub fn for_symbol(&self, symbol: &str) -> ResolvedFilters {
        let o = self.symbols.get(symbol);
        ResolvedFilters {
            tick_size: o.and_then(|o| o.tick_size).unwrap_or(self.tick_size),
            lot_size: o.and_then(|o| o.lot_size).unwrap_or(self.lot_size),
            min_notional: o.and_then(|o| o.min_notional).unwrap_or(self.min_notional),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

fn default_retention_days() -> i64 {
    90
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub dir: String,
    #[serde(default = "default_audit_file")]
    pub audit_file: String,
    #[serde(default = "default_snapshot_file")]
    pub snapshot_file: String,
}

fn default_log_dir() -> String {
    "./logs".into()
}
fn default_audit_file() -> String {
    "audit.jsonl".into()
}
fn default_snapshot_file() -> String {
    "snapshots.jsonl".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            audit_file: default_audit_file(),
            snapshot_file: default_snapshot_file(),
        }
    }
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate config invariants.
    pub fn validate(&self) -> Result<()> {
        if self.trading.operation_budget == 0 {
            return Err(Error::Config("operation_budget must be > 0".into()));
        }
        if self.trading.state_max_age_secs <= 0 {
            return Err(Error::Config("state_max_age_secs must be > 0".into()));
        }
        if self.pricing.ttl_secs <= 0 {
            return Err(Error::Config("pricing ttl_secs must be > 0".into()));
        }
        if self.pricing.batch_size == 0 {
            return Err(Error::Config("pricing batch_size must be > 0".into()));
        }
        if !(0.0..=100.0).contains(&self.trading.min_delta_pct) {
            return Err(Error::Config("min_delta_pct must be in [0, 100]".into()));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(Error::Config("failure_threshold must be > 0".into()));
        }
        if self.polling.hard_timeout_secs < self.polling.soft_timeout_secs {
            return Err(Error::Config(
                "hard_timeout_secs must be >= soft_timeout_secs".into(),
            ));
        }
        if !(self.filters.tick_size > 0.0) || !(self.filters.lot_size > 0.0) {
            return Err(Error::Config(
                "filter tick_size and lot_size must be > 0".into(),
            ));
        }
        if self.filters.min_notional < 0.0 {
            return Err(Error::Config("min_notional must be >= 0".into()));
        }
        for symbol in self.filters.symbols.keys() {
            let resolved = self.filters.for_symbol(symbol);
            if !(resolved.tick_size > 0.0)
                || !(resolved.lot_size > 0.0)
                || resolved.min_notional < 0.0
            {
                return Err(Error::Config(format!("invalid filters for {symbol}")));
            }
        }
        Ok(())
    }

    /// Whether the auto-trade tick is allowed to run at all.
    pub fn trading_allowed(&self) -> bool {
        self.trading.auto_trade_enabled && self.exchange.environment.is_real()
    }

    /// Whether the order-polling reconciler is allowed to run.
    pub fn polling_allowed(&self) -> bool {
        self.polling.enabled && self.exchange.environment.is_real()
    }

    /// Cache staleness threshold: 2× TTL with a 60 s floor.
    pub fn stale_threshold_secs(&self) -> i64 {
        (self.pricing.ttl_secs * 2).max(60)
    }

    /// Full path to the audit log file.
    pub fn audit_path(&self) -> std::path::PathBuf {
        Path::new(&self.logging.dir).join(&self.logging.audit_file)
    }

    /// Full path to the snapshot history file.
    pub fn snapshot_path(&self) -> std::path::PathBuf {
        Path::new(&self.logging.dir).join(&self.logging.snapshot_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_toml() -> &'static str {
        r#"
[exchange]
environment = "testnet"
api_key_env = "BINANCE_API_KEY"
secret_key_env = "BINANCE_SECRET_KEY"

[trading]
auto_trade_enabled = true
tick_interval_secs = 30
operation_budget = 5
min_delta_pct = 5.0

[pricing]
ttl_secs = 30
cache_enabled = true
batch_size = 10
batch_delay_ms = 200

[polling]
enabled = true
interval_secs = 10

[logging]
dir = "./logs"
audit_file = "audit.jsonl"
"#
    }

    #[test]
    fn parse_example_config() {
        let config: Config = toml::from_str(example_toml()).unwrap();
        assert_eq!(config.exchange.environment, Environment::Testnet);
        assert_eq!(config.trading.operation_budget, 5);
        assert_eq!(config.pricing.ttl_secs, 30);
        assert!(config.trading_allowed());
        assert!(config.polling_allowed());
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let toml = r#"
[exchange]
environment = "simulated"

[trading]
auto_trade_enabled = true
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.circuit_timeout_secs, 600);
        assert_eq!(config.pricing.dust_threshold, 0.0001);
        assert_eq!(config.snapshots.retention_days, 90);
    }

    #[test]
    fn simulated_environment_blocks_trading_and_polling() {
        let toml = example_toml().replace("\"testnet\"", "\"simulated\"");
        let config: Config = toml::from_str(&toml).unwrap();
        assert!(!config.trading_allowed());
        assert!(!config.polling_allowed());
    }

    #[test]
    fn stale_threshold_floor() {
        let mut config: Config = toml::from_str(example_toml()).unwrap();
        assert_eq!(config.stale_threshold_secs(), 60); // 2×30 hits the floor
        config.pricing.ttl_secs = 120;
        assert_eq!(config.stale_threshold_secs(), 240);
    }

    #[test]
    fn filter_overrides_fall_back_to_defaults() {
        let toml = r#"
[exchange]
environment = "testnet"

[trading]
auto_trade_enabled = true

[filters]
tick_size = 0.01
min_notional = 5.0

[filters.symbols.ETHUSDT]
tick_size = 0.001
"#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        let eth = config.filters.for_symbol("ETHUSDT");
        assert_eq!(eth.tick_size, 0.001); // override
        assert_eq!(eth.lot_size, 0.00001); // default
        assert_eq!(eth.min_notional, 5.0);

        let btc = config.filters.for_symbol("BTCUSDT");
        assert_eq!(btc.tick_size, 0.01);
    }

    #[test]
    fn validate_catches_bad_filter_override() {
        let mut config: Config = toml::from_str(example_toml()).unwrap();
        config.filters.symbols.insert(
            "BTCUSDT".into(),
            SymbolFilters {
                tick_size: Some(0.0),
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_catches_zero_budget() {
        let mut config: Config = toml::from_str(example_toml()).unwrap();
        config.trading.operation_budget = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_catches_timeout_inversion() {
        let mut config: Config = toml::from_str(example_toml()).unwrap();
        config.polling.soft_timeout_secs = 30;
        config.polling.hard_timeout_secs = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn audit_path() {
        let config: Config = toml::from_str(example_toml()).unwrap();
        assert_eq!(
            config.audit_path(),
            std::path::PathBuf::from("./logs/audit.jsonl")
        );
    }
}
