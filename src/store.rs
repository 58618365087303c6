//! Persistence and cache/lock seams consumed by the engine.
//!
//! The engine is written against traits so the backing store is swappable;
//! the in-memory implementations here are the reference backend and what
//! the test suite runs on.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;

use crate::model::{Order, PortfolioSnapshot, PortfolioState, RebalanceExecution};

/// Repository interface for the engine's persistent records.
pub trait Store: Send + Sync {
    /// Atomically create an order. Returns `false` (and stores nothing) if
    /// an order with the same client id already exists — the duplicate
    /// suppression the idempotency keys rely on.
    fn insert_order(&self, order: Order) -> bool;

    /// Replace an order record by id.
    fn update_order(&self, order: &Order);

    fn order_by_client_id(&self, client_order_id: &str) -> Option<Order>;

    /// Orders in `pending|submitted|open` for a strategy.
    fn active_orders(&self, strategy_id: u64) -> Vec<Order>;

    /// Active orders across a connector (reconciler scope).
    fn active_orders_for_connector(&self, connector_id: u64) -> Vec<Order>;

    fn next_order_id(&self) -> u64;

    /// Overwrite the single per-connector valuation row.
    fn upsert_portfolio_state(&self, state: PortfolioState);

    fn portfolio_state(&self, connector_id: u64) -> Option<PortfolioState>;

    fn append_snapshot(&self, snapshot: PortfolioSnapshot);

    fn snapshots_between(
        &self,
        connector_id: u64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<PortfolioSnapshot>;

    /// Rolling retention: drop snapshots older than the cutoff. Returns the
    /// number deleted.
    fn delete_snapshots_before(&self, cutoff: DateTime<Utc>) -> usize;

    fn insert_execution(&self, execution: RebalanceExecution);
    fn update_execution(&self, execution: &RebalanceExecution);
    fn execution(&self, id: u64) -> Option<RebalanceExecution>;
    fn next_execution_id(&self) -> u64;
}

/// Key-value store with TTL and atomic set-if-absent. Backs the
/// per-connector cooldown locks.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str, ttl_secs: Option<i64>);
    /// Atomically set the key only when absent (or expired). Returns whether
    /// the write happened — the lock-acquisition primitive.
    fn set_if_absent(&self, key: &str, value: &str, ttl_secs: Option<i64>) -> bool;
    fn delete(&self, key: &str);
}

#[derive(Default)]
struct StoreInner {
    orders: Vec<Order>,
    states: FxHashMap<u64, PortfolioState>,
    snapshots: Vec<PortfolioSnapshot>,
    executions: Vec<RebalanceExecution>,
    next_order_id: u64,
    next_execution_id: u64,
}

/// In-memory reference store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All orders regardless of status (test assertions).
    pub fn all_orders(&self) -> Vec<Order> {
        self.inner.lock().unwrap().orders.clone()
    }
}

impl Store for MemoryStore {
    fn insert_order(&self, order: Order) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .orders
            .iter()
            .any(|o| o.client_order_id == order.client_order_id)
        {
            return false;
        }
        inner.orders.push(order);
        true
    }

    fn update_order(&self, order: &Order) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.orders.iter_mut().find(|o| o.id == order.id) {
            *existing = order.clone();
        }
    }

    fn order_by_client_id(&self, client_order_id: &str) -> Option<Order> {
        self.inner
            .lock()
            .unwrap()
            .orders
            .iter()
            .find(|o| o.client_order_id == client_order_id)
            .cloned()
    }

    fn active_orders(&self, strategy_id: u64) -> Vec<Order> {
        self.inner
            .lock()
            .unwrap()
            .orders
            .iter()
            .filter(|o| o.strategy_id == strategy_id && o.is_active())
            .cloned()
            .collect()
    }

    fn active_orders_for_connector(&self, connector_id: u64) -> Vec<Order> {
        self.inner
            .lock()
            .unwrap()
            .orders
            .iter()
            .filter(|o| o.connector_id == connector_id && o.is_active())
            .cloned()
            .collect()
    }

    fn next_order_id(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_order_id += 1;
        inner.next_order_id
    }

    fn upsert_portfolio_state(&self, state: PortfolioState) {
        self.inner
            .lock()
            .unwrap()
            .states
            .insert(state.connector_id, state);
    }

    fn portfolio_state(&self, connector_id: u64) -> Option<PortfolioState> {
        self.inner.lock().unwrap().states.get(&connector_id).cloned()
    }

    fn append_snapshot(&self, snapshot: PortfolioSnapshot) {
        self.inner.lock().unwrap().snapshots.push(snapshot);
    }

    fn snapshots_between(
        &self,
        connector_id: u64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<PortfolioSnapshot> {
        self.inner
            .lock()
            .unwrap()
            .snapshots
            .iter()
            .filter(|s| s.connector_id == connector_id && s.timestamp >= from && s.timestamp <= to)
            .cloned()
            .collect()
    }

    fn delete_snapshots_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.snapshots.len();
        inner.snapshots.retain(|s| s.timestamp >= cutoff);
        before - inner.snapshots.len()
    }

    fn insert_execution(&self, execution: RebalanceExecution) {
        self.inner.lock().unwrap().executions.push(execution);
    }

    fn update_execution(&self, execution: &RebalanceExecution) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.executions.iter_mut().find(|e| e.id == execution.id) {
            *existing = execution.clone();
        }
    }

    fn execution(&self, id: u64) -> Option<RebalanceExecution> {
        self.inner
            .lock()
            .unwrap()
            .executions
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    fn next_execution_id(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_execution_id += 1;
        inner.next_execution_id
    }
}

struct KvEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

/// In-memory TTL key-value store.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<FxHashMap<String, KvEntry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(entry: &KvEntry, now: DateTime<Utc>) -> bool {
        entry.expires_at.is_none_or(|t| t > now)
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Option<String> {
        let now = Utc::now();
        let entries = self.entries.lock().unwrap();
        entries
            .get(key)
            .filter(|e| Self::live(e, now))
            .map(|e| e.value.clone())
    }

    fn set(&self, key: &str, value: &str, ttl_secs: Option<i64>) {
        let now = Utc::now();
        self.entries.lock().unwrap().insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: ttl_secs.map(|s| now + chrono::Duration::seconds(s)),
            },
        );
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl_secs: Option<i64>) -> bool {
        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap();
        if entries.get(key).is_some_and(|e| Self::live(e, now)) {
            return false;
        }
        entries.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: ttl_secs.map(|s| now + chrono::Duration::seconds(s)),
            },
        );
        true
    }

    fn delete(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OrderStatus, PositionRecord, SnapshotTrigger};
    use balancebot_exchange::OrderSide;

    fn order(id: u64, client_order_id: &str, status: OrderStatus) -> Order {
        let now = Utc::now();
        Order {
            id,
            strategy_id: 1,
            connector_id: 1,
            base_asset: "BTC".into(),
            quote_asset: "USDT".into(),
            side: OrderSide::Buy,
            client_order_id: client_order_id.into(),
            exchange_order_id: None,
            limit_price: 64_000.0,
            quote_amount: 640.0,
            quantity: 0.01,
            filled_amount: 0.0,
            status,
            reject_reason: None,
            execution_id: None,
            created_at: now,
            updated_at: now,
            last_exchange_response: None,
        }
    }

    #[test]
    fn insert_order_rejects_duplicate_client_id() {
        let store = MemoryStore::new();
        assert!(store.insert_order(order(1, "bb-1", OrderStatus::Pending)));
        assert!(!store.insert_order(order(2, "bb-1", OrderStatus::Pending)));
        assert_eq!(store.all_orders().len(), 1);
    }

    #[test]
    fn active_order_filters() {
        let store = MemoryStore::new();
        store.insert_order(order(1, "bb-1", OrderStatus::Open));
        store.insert_order(order(2, "bb-2", OrderStatus::Filled));
        store.insert_order(order(3, "bb-3", OrderStatus::Submitted));

        assert_eq!(store.active_orders(1).len(), 2);
        assert_eq!(store.active_orders_for_connector(1).len(), 2);
        assert_eq!(store.active_orders(99).len(), 0);
    }

    #[test]
    fn portfolio_state_upsert_overwrites() {
        let store = MemoryStore::new();
        let mut state = PortfolioState {
            connector_id: 1,
            strategy_id: 1,
            timestamp: Utc::now(),
            quote_asset: "USDT".into(),
            nav: 1000.0,
            positions: vec![],
            source: "test".into(),
            universe: vec![],
        };
        store.upsert_portfolio_state(state.clone());
        state.nav = 2000.0;
        store.upsert_portfolio_state(state);

        assert_eq!(store.portfolio_state(1).unwrap().nav, 2000.0);
    }

    #[test]
    fn snapshot_retention() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for days_ago in [1, 10, 100] {
            store.append_snapshot(PortfolioSnapshot {
                connector_id: 1,
                timestamp: now - chrono::Duration::days(days_ago),
                quote_asset: "USDT".into(),
                nav: 1000.0,
                positions: vec![PositionRecord {
                    asset: "BTC".into(),
                    amount: 0.01,
                    quote_value: 640.0,
                    price: 64_000.0,
                }],
                trigger: SnapshotTrigger::Scheduled,
            });
        }

        let deleted = store.delete_snapshots_before(now - chrono::Duration::days(90));
        assert_eq!(deleted, 1);
        let remaining = store.snapshots_between(1, now - chrono::Duration::days(365), now);
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn kv_set_if_absent_is_atomic_lock() {
        let kv = MemoryKv::new();
        assert!(kv.set_if_absent("cooldown:1", "1", Some(5)));
        assert!(!kv.set_if_absent("cooldown:1", "1", Some(5)));
        kv.delete("cooldown:1");
        assert!(kv.set_if_absent("cooldown:1", "1", Some(5)));
    }

    #[test]
    fn kv_expired_entry_is_absent() {
        let kv = MemoryKv::new();
        kv.set("k", "v", Some(-1)); // already expired
        assert_eq!(kv.get("k"), None);
        assert!(kv.set_if_absent("k", "v2", None));
        assert_eq!(kv.get("k"), Some("v2".to_string()));
    }
}
