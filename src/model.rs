//! Core data model: connectors, strategies, portfolio state, orders.
//!
//! Assets are bare base symbols ("BTC") everywhere in the engine; trading
//! pairs ("BTCUSDT") exist only at the adapter boundary.

use std::path::Path;

use balancebot_exchange::{AccountType, OrderSide};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tolerance for the allocation-sum invariant.
const ALLOCATION_SUM_TOLERANCE: f64 = 0.01;

/// An exchange connection: identity plus credentials. Credentials are opaque
/// to the engine and only handed to the adapter.
#[derive(Debug, Clone)]
pub struct Connector {
    pub id: u64,
    pub exchange: String,
    pub account_type: AccountType,
    pub testnet: bool,
    pub active: bool,
}

impl Connector {
    /// Circuit-breaker scope key: one breaker per exchange connection flavor.
    pub fn breaker_key(&self) -> String {
        format!("{}:{}:{}", self.exchange, self.testnet, self.account_type)
    }

    /// Trading pair for a base asset under this connector's strategy quote.
    pub fn pair(base: &str, quote: &str) -> String {
        format!("{base}{quote}")
    }
}

/// One target allocation: base asset + target percentage of NAV.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub asset: String,
    pub target_percentage: f64,
}

/// Rebalancing strategy for one connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub connector_id: u64,
    pub quote_asset: String,
    /// Max single-order size as % of NAV.
    #[serde(default = "default_order_size_pct")]
    pub order_size_pct: f64,
    /// Limit-price offset from market, in %.
    #[serde(default = "default_order_step_pct")]
    pub order_step_pct: f64,
    /// Minimum quote-denominated delta to act on.
    #[serde(default = "default_min_delta_quote")]
    pub min_delta_quote: f64,
    /// Price-drift threshold (%) required to flip an order's side.
    #[serde(default = "default_switch_cancel_buffer_pct")]
    pub switch_cancel_buffer_pct: f64,
    #[serde(default)]
    pub auto_trade_enabled: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub allocations: Vec<Allocation>,
}

fn default_order_size_pct() -> f64 {
    25.0
}
fn default_order_step_pct() -> f64 {
    0.1
}
fn default_min_delta_quote() -> f64 {
    10.0
}
fn default_switch_cancel_buffer_pct() -> f64 {
    0.15
}
fn default_true() -> bool {
    true
}

impl Strategy {
    /// Load and validate a strategy.json file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::StrategyRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json(&contents)
    }

    /// Parse from a JSON string (useful for testing).
    pub fn from_json(json: &str) -> Result<Self> {
        let strategy: Strategy = serde_json::from_str(json)?;
        strategy.validate()?;
        Ok(strategy)
    }

    /// Validate write-time invariants.
    pub fn validate(&self) -> Result<()> {
        if self.quote_asset.is_empty() {
            return Err(Error::Strategy("quote asset must not be empty".into()));
        }
        if self.allocations.is_empty() {
            return Err(Error::Strategy("allocations list is empty".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for a in &self.allocations {
            if a.asset.is_empty() {
                return Err(Error::Strategy("empty allocation asset".into()));
            }
            if !seen.insert(&a.asset) {
                return Err(Error::Strategy(format!("duplicate asset: {}", a.asset)));
            }
            if !(0.01..=100.0).contains(&a.target_percentage) {
                return Err(Error::Strategy(format!(
                    "target percentage for {} ({}) outside 0.01–100.00",
                    a.asset, a.target_percentage
                )));
            }
        }

        let sum: f64 = self.allocations.iter().map(|a| a.target_percentage).sum();
        if (sum - 100.0).abs() > ALLOCATION_SUM_TOLERANCE {
            return Err(Error::Strategy(format!(
                "allocations sum to {sum:.4}%, expected 100%"
            )));
        }

        if !(0.0..=100.0).contains(&self.order_size_pct) || self.order_size_pct == 0.0 {
            return Err(Error::Strategy("order_size_pct must be in (0, 100]".into()));
        }
        if self.order_step_pct < 0.0 {
            return Err(Error::Strategy("order_step_pct must be >= 0".into()));
        }
        if self.min_delta_quote < 0.0 {
            return Err(Error::Strategy("min_delta_quote must be >= 0".into()));
        }
        if self.switch_cancel_buffer_pct < 0.0 {
            return Err(Error::Strategy(
                "switch_cancel_buffer_pct must be >= 0".into(),
            ));
        }
        Ok(())
    }

    /// Base assets in the target universe, quote asset excluded.
    pub fn universe(&self) -> Vec<String> {
        self.allocations
            .iter()
            .map(|a| a.asset.clone())
            .filter(|a| *a != self.quote_asset)
            .collect()
    }

    /// Target percentage for one asset (0 when absent).
    pub fn target_pct(&self, asset: &str) -> f64 {
        self.allocations
            .iter()
            .find(|a| a.asset == asset)
            .map(|a| a.target_percentage)
            .unwrap_or(0.0)
    }
}

/// Fixed-shape per-asset position record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub asset: String,
    pub amount: f64,
    pub quote_value: f64,
    pub price: f64,
}

/// Strategy-scoped valuation, one per connector, overwritten each tick.
/// Staleness (age over 60 s) invalidates it for trading decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioState {
    pub connector_id: u64,
    pub strategy_id: u64,
    pub timestamp: DateTime<Utc>,
    pub quote_asset: String,
    pub nav: f64,
    pub positions: Vec<PositionRecord>,
    pub source: String,
    pub universe: Vec<String>,
}

impl PortfolioState {
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_seconds()
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_age_secs: i64) -> bool {
        self.age_secs(now) > max_age_secs
    }

    pub fn position(&self, asset: &str) -> Option<&PositionRecord> {
        self.positions.iter().find(|p| p.asset == asset)
    }

    pub fn price(&self, asset: &str) -> Option<f64> {
        self.position(asset).map(|p| p.price)
    }
}

/// What triggered a snapshot append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTrigger {
    Manual,
    OrderFill,
    Scheduled,
    Backfill,
}

/// Append-only valuation history entry. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub connector_id: u64,
    pub timestamp: DateTime<Utc>,
    pub quote_asset: String,
    pub nav: f64,
    pub positions: Vec<PositionRecord>,
    pub trigger: SnapshotTrigger,
}

/// Local order lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Submitted,
    Open,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Orders the engine and reconciler still care about.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Submitted | OrderStatus::Open
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Legal transitions of the order state machine. Terminal states accept
    /// nothing; active states only move forward.
    pub fn can_transition(&self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        match (*self, to) {
            (Pending, Submitted) => true,
            (Pending | Submitted | Open, Filled | Cancelled | Rejected) => true,
            (Submitted, Open) => true,
            (Open, Open) | (Submitted, Submitted) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Submitted => "submitted",
            OrderStatus::Open => "open",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// A persisted order record. The lifecycle is driven by either the tick
/// engine or the reconciler, never both at once for the same record — the
/// state machine enforces it, not row locking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub strategy_id: u64,
    pub connector_id: u64,
    pub base_asset: String,
    pub quote_asset: String,
    pub side: OrderSide,
    /// Client-assigned idempotency key; unique in the store.
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub limit_price: f64,
    /// Order value in quote units.
    pub quote_amount: f64,
    /// Base quantity sent to the exchange.
    pub quantity: f64,
    /// Cumulative filled value in quote units. Monotonically non-decreasing
    /// except for explicit reconciler safety overrides.
    pub filled_amount: f64,
    pub status: OrderStatus,
    pub reject_reason: Option<String>,
    /// Manual-batch link; auto-trade orders are standalone.
    pub execution_id: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last raw exchange response, kept for diagnostics.
    pub last_exchange_response: Option<serde_json::Value>,
}

impl Order {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn symbol(&self) -> String {
        Connector::pair(&self.base_asset, &self.quote_asset)
    }

    /// Apply a status transition, rejecting anything the state machine
    /// forbids. Validation is explicit and called before every transition.
    pub fn transition(&mut self, to: OrderStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition(to) {
            return Err(Error::InvalidTransition(format!(
                "order {}: {} -> {}",
                self.client_order_id, self.status, to
            )));
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }
}

/// Aggregate status of a manual rebalance batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// Groups the orders created by one manual rebalance invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceExecution {
    pub id: u64,
    pub strategy_id: u64,
    pub status: ExecutionStatus,
    pub order_ids: Vec<u64>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_json() -> &'static str {
        r#"{
            "quote_asset": "USDT",
            "order_size_pct": 25.0,
            "order_step_pct": 0.1,
            "min_delta_quote": 10.0,
            "switch_cancel_buffer_pct": 0.15,
            "auto_trade_enabled": true,
            "allocations": [
                { "asset": "BTC",  "target_percentage": 50.0 },
                { "asset": "ETH",  "target_percentage": 30.0 },
                { "asset": "USDT", "target_percentage": 20.0 }
            ]
        }"#
    }

    #[test]
    fn parse_valid_strategy() {
        let s = Strategy::from_json(valid_json()).unwrap();
        assert_eq!(s.quote_asset, "USDT");
        assert_eq!(s.allocations.len(), 3);
        assert_eq!(s.target_pct("BTC"), 50.0);
        assert_eq!(s.target_pct("DOGE"), 0.0);
    }

    #[test]
    fn universe_excludes_quote() {
        let s = Strategy::from_json(valid_json()).unwrap();
        let u = s.universe();
        assert_eq!(u, vec!["BTC".to_string(), "ETH".to_string()]);
    }

    #[test]
    fn reject_bad_sum() {
        let json = valid_json().replace("50.0", "55.0");
        assert!(Strategy::from_json(&json).is_err());
    }

    #[test]
    fn accept_sum_within_tolerance() {
        let json = r#"{
            "quote_asset": "USDT",
            "allocations": [
                { "asset": "BTC",  "target_percentage": 49.996 },
                { "asset": "USDT", "target_percentage": 50.0 }
            ]
        }"#;
        assert!(Strategy::from_json(json).is_ok());
    }

    #[test]
    fn reject_duplicate_assets() {
        let json = r#"{
            "quote_asset": "USDT",
            "allocations": [
                { "asset": "BTC", "target_percentage": 50.0 },
                { "asset": "BTC", "target_percentage": 50.0 }
            ]
        }"#;
        assert!(Strategy::from_json(json).is_err());
    }

    #[test]
    fn reject_out_of_range_percentage() {
        let json = r#"{
            "quote_asset": "USDT",
            "allocations": [
                { "asset": "BTC",  "target_percentage": 100.005 }
            ]
        }"#;
        assert!(Strategy::from_json(json).is_err());
    }

    #[test]
    fn reject_empty_allocations() {
        let json = r#"{ "quote_asset": "USDT", "allocations": [] }"#;
        assert!(Strategy::from_json(json).is_err());
    }

    #[test]
    fn state_machine_forward_only() {
        use OrderStatus::*;
        assert!(Pending.can_transition(Submitted));
        assert!(Submitted.can_transition(Open));
        assert!(Open.can_transition(Filled));
        assert!(Open.can_transition(Cancelled));
        assert!(!Filled.can_transition(Open));
        assert!(!Cancelled.can_transition(Filled));
        assert!(!Open.can_transition(Submitted));
    }

    #[test]
    fn transition_updates_timestamp() {
        let now = Utc::now();
        let mut order = Order {
            id: 1,
            strategy_id: 1,
            connector_id: 1,
            base_asset: "BTC".into(),
            quote_asset: "USDT".into(),
            side: OrderSide::Buy,
            client_order_id: "bb-1".into(),
            exchange_order_id: None,
            limit_price: 64_000.0,
            quote_amount: 640.0,
            quantity: 0.01,
            filled_amount: 0.0,
            status: OrderStatus::Pending,
            reject_reason: None,
            execution_id: None,
            created_at: now,
            updated_at: now,
            last_exchange_response: None,
        };

        let later = now + chrono::Duration::seconds(5);
        order.transition(OrderStatus::Submitted, later).unwrap();
        assert_eq!(order.status, OrderStatus::Submitted);
        assert_eq!(order.updated_at, later);

        assert!(order.transition(OrderStatus::Pending, later).is_err());
    }

    #[test]
    fn staleness_guard() {
        let now = Utc::now();
        let state = PortfolioState {
            connector_id: 1,
            strategy_id: 1,
            timestamp: now - chrono::Duration::seconds(61),
            quote_asset: "USDT".into(),
            nav: 1000.0,
            positions: vec![],
            source: "test".into(),
            universe: vec![],
        };
        assert!(state.is_stale(now, 60));
        assert!(!state.is_stale(now, 120));
    }
}
