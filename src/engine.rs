//! Auto-trade tick engine and manual rebalance execution.
//!
//! One tick: refresh valuation, build a plan, reconcile against
//! locally-open orders, then cancel and place within a global operation
//! budget. Every per-asset failure is caught, logged and counted; a single
//! bad asset or connector never aborts the batch.

use std::time::Instant;

use balancebot_exchange::{ExchangeAdapter, OrderLookup, OrderSide};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};

use crate::audit::{self, AuditLog};
use crate::breaker::CircuitBreaker;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{
    Connector, ExecutionStatus, Order, OrderStatus, RebalanceExecution, Strategy,
};
use crate::normalize::{normalize_price, normalize_quantity, validate_min_notional};
use crate::planner::{ActionKind, RebalanceAction, build_plan};
use crate::pricing::PriceCache;
use crate::store::{KvStore, Store};
use crate::valuation::Valuator;

/// A connector wired to its strategy and live adapter for one invocation.
pub struct ConnectorRuntime<'a> {
    pub connector: Connector,
    pub strategy: Strategy,
    pub exchange: &'a dyn ExchangeAdapter,
}

/// Structured result of one tick. Expected per-item failures are counted
/// here, never raised.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub connectors_processed: usize,
    pub orders_placed: usize,
    pub orders_cancelled: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl std::fmt::Display for TickSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "processed {} connector(s): {} placed, {} cancelled, {} skipped, {} errors",
            self.connectors_processed,
            self.orders_placed,
            self.orders_cancelled,
            self.skipped,
            self.errors
        )
    }
}

/// Deterministic client order id for duplicate suppression.
///
/// Two placement attempts with the same strategy, connector, asset, side,
/// normalized price and amount within the same 30-second bucket derive the
/// same id, so the unique-id store constraint collapses them into one order.
pub fn idempotency_key(
    strategy_id: u64,
    connector_id: u64,
    base_asset: &str,
    side: OrderSide,
    price: f64,
    quantity: f64,
    now: DateTime<Utc>,
) -> String {
    let bucket = now.timestamp() - now.timestamp().rem_euclid(30);
    let input = format!(
        "{strategy_id}:{connector_id}:{base_asset}:{}:{price:.8}:{quantity:.8}:{bucket}",
        side.as_str()
    );
    let digest = Sha256::digest(input.as_bytes());
    format!("bb{}", hex::encode(&digest[..12]))
}

/// The rebalancing engine. Stateless across invocations except for what the
/// injected store, cache and breaker carry.
pub struct Engine<'a> {
    config: &'a Config,
    store: &'a dyn Store,
    kv: &'a dyn KvStore,
    breaker: &'a CircuitBreaker,
    prices: &'a PriceCache,
    audit: Option<AuditLog>,
}

impl<'a> Engine<'a> {
    pub fn new(
        config: &'a Config,
        store: &'a dyn Store,
        kv: &'a dyn KvStore,
        breaker: &'a CircuitBreaker,
        prices: &'a PriceCache,
    ) -> Self {
        Self {
            config,
            store,
            kv,
            breaker,
            prices,
            audit: None,
        }
    }

    /// Attach a JSONL audit trail.
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn valuator(&self) -> Valuator<'_> {
        Valuator::new(
            self.breaker,
            self.prices,
            self.kv,
            self.config.pricing.dust_threshold,
            self.config.pricing.valuation_cooldown_secs,
        )
    }

    /// One auto-trade tick over all connectors. Idempotent: calling it twice
    /// in a row within the same placement bucket changes nothing the second
    /// time. Never returns an error for expected per-item failures.
    pub fn run_auto_trade_tick(&mut self, runtimes: &[ConnectorRuntime]) -> TickSummary {
        let mut summary = TickSummary::default();
        if !self.config.trading_allowed() {
            debug!("auto-trade disabled or simulated environment; tick is a no-op");
            return summary;
        }

        let started = Instant::now();
        let mut budget = self.config.trading.operation_budget;

        for rt in runtimes {
            if budget == 0 {
                info!("operation budget exhausted; remaining connectors deferred");
                break;
            }
            if !rt.connector.active || !rt.strategy.is_active || !rt.strategy.auto_trade_enabled {
                summary.skipped += 1;
                continue;
            }
            summary.connectors_processed += 1;
            self.log_audit(|a| {
                audit::log_tick_started(a, rt.connector.id, rt.strategy.id)
            });
            if let Err(e) = self.tick_connector(rt, started, &mut budget, &mut summary) {
                warn!(
                    "tick failed for connector {} ({}): {e}",
                    rt.connector.id, rt.connector.exchange
                );
                summary.errors += 1;
            }
        }

        self.log_audit(|a| {
            audit::log_tick_completed(
                a,
                summary.orders_placed,
                summary.orders_cancelled,
                summary.skipped,
                summary.errors,
            )
        });
        info!("tick complete: {summary}");
        summary
    }

    fn tick_connector(
        &mut self,
        rt: &ConnectorRuntime,
        started: Instant,
        budget: &mut usize,
        summary: &mut TickSummary,
    ) -> Result<()> {
        let now = Utc::now();

        // Fresh valuation, forced refresh. Stale output means the clock or
        // the feed is off; trading on it is worse than skipping the tick.
        let state = self.valuator().refresh_strategy_state_at(
            &rt.connector,
            &rt.strategy,
            rt.exchange,
            true,
            now,
        )?;
        self.store.upsert_portfolio_state(state.clone());
        self.log_audit(|a| audit::log_valuation(a, &state));
        let age = state.age_secs(Utc::now());
        if age > self.config.trading.state_max_age_secs {
            return Err(Error::StaleState { age_secs: age });
        }

        let plan = build_plan(&rt.strategy, &state);
        debug!("{plan}");
        self.log_audit(|a| audit::log_plan_computed(a, &plan));

        let open = self.store.active_orders(rt.strategy.id);

        // Duplicate open orders per base asset: a prior tick's crash can
        // leave two concurrent orders for one asset. Keep the newest.
        let mut newest: FxHashMap<String, Order> = FxHashMap::default();
        let mut duplicates: Vec<Order> = Vec::new();
        for order in open {
            match newest.get(&order.base_asset) {
                Some(existing) if existing.created_at >= order.created_at => {
                    duplicates.push(order);
                }
                Some(_) => {
                    if let Some(displaced) = newest.insert(order.base_asset.clone(), order) {
                        duplicates.push(displaced);
                    }
                }
                None => {
                    newest.insert(order.base_asset.clone(), order);
                }
            }
        }

        let mut cancelled_bases: Vec<String> = Vec::new();
        for dup in duplicates {
            if *budget == 0 {
                break;
            }
            match self.cancel_order(rt, &dup, "duplicate", now) {
                Ok(()) => {
                    *budget -= 1;
                    summary.orders_cancelled += 1;
                    if !cancelled_bases.contains(&dup.base_asset) {
                        cancelled_bases.push(dup.base_asset.clone());
                    }
                }
                Err(e) => {
                    warn!("duplicate cancel failed for {}: {e}", dup.client_order_id);
                    summary.errors += 1;
                }
            }
        }

        for action in &plan.actions {
            if *budget == 0 {
                break;
            }
            if action.asset == rt.strategy.quote_asset {
                continue;
            }
            if cancelled_bases.contains(&action.asset) {
                // A cancel happened for this base this tick; replacement
                // waits until the reconciler confirms it.
                continue;
            }
            if action.kind == ActionKind::Hold || action.volume <= 0.0 {
                continue;
            }
            if action.delta.abs()
                < self.config.trading.min_delta_pct / 100.0 * action.target_value
            {
                summary.skipped += 1;
                continue;
            }

            if let Some(existing) = newest.get(&action.asset).cloned() {
                match self.switch_cancel(rt, &existing, action, now) {
                    Ok(true) => {
                        *budget -= 1;
                        summary.orders_cancelled += 1;
                        cancelled_bases.push(action.asset.clone());
                    }
                    Ok(false) => summary.skipped += 1,
                    Err(e) => {
                        warn!("switch-cancel failed for {}: {e}", action.asset);
                        summary.errors += 1;
                    }
                }
                continue;
            }

            // Drift guard: a tick that has run long is working with prices
            // that no longer reflect the market. Cancels above stay safe;
            // new placements do not.
            let elapsed = started.elapsed().as_secs() as i64;
            if elapsed > self.config.trading.max_tick_runtime_secs {
                warn!(
                    "tick runtime {elapsed}s over limit; skipping placement for {}",
                    action.asset
                );
                summary.skipped += 1;
                continue;
            }

            // Defensive re-check against overlapping invocations.
            if self
                .store
                .active_orders(rt.strategy.id)
                .iter()
                .any(|o| o.base_asset == action.asset)
            {
                debug!("live order appeared for {}; skipping placement", action.asset);
                summary.skipped += 1;
                continue;
            }

            match self.place_action(rt, action, None, now) {
                Ok(Some(_)) => {
                    *budget -= 1;
                    summary.orders_placed += 1;
                }
                Ok(None) => summary.skipped += 1,
                Err(e) => {
                    warn!("placement failed for {}: {e}", action.asset);
                    summary.errors += 1;
                }
            }
        }

        // Orphans: a local live order for an asset that is neither held nor
        // targeted anymore has nothing in the plan keeping it honest.
        for (base, order) in &newest {
            if *budget == 0 {
                break;
            }
            if cancelled_bases.contains(base) || plan.action(base).is_some() {
                continue;
            }
            match self.cancel_order(rt, order, "orphaned", now) {
                Ok(()) => {
                    *budget -= 1;
                    summary.orders_cancelled += 1;
                }
                Err(e) => {
                    warn!("orphan cancel failed for {}: {e}", order.client_order_id);
                    summary.errors += 1;
                }
            }
        }

        Ok(())
    }

    /// Decide and apply switch-cancel for an existing order against a new
    /// plan action. Returns whether a cancel happened.
    ///
    /// Required only when the side flips AND the limit price has drifted by
    /// at least `switch_cancel_buffer_pct` of the existing price. The
    /// replacement is deferred to a later tick so a cancel and a new order
    /// never coexist, even transiently.
    fn switch_cancel(
        &mut self,
        rt: &ConnectorRuntime,
        existing: &Order,
        action: &RebalanceAction,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if existing.filled_amount > 0.0 {
            debug!(
                "{} is partially filled; leaving it to run",
                existing.client_order_id
            );
            return Ok(false);
        }
        let Some(planned_side) = action.kind.side() else {
            return Ok(false);
        };
        if existing.side == planned_side {
            return Ok(false);
        }
        let drift_pct =
            (existing.limit_price - action.limit_price).abs() / existing.limit_price * 100.0;
        if drift_pct < rt.strategy.switch_cancel_buffer_pct {
            debug!(
                "side flip for {} but drift {drift_pct:.4}% under buffer; holding",
                action.asset
            );
            return Ok(false);
        }
        self.cancel_order(rt, existing, "switch", now)?;
        Ok(true)
    }

    /// Place one plan action as a limit order. Returns the local order id,
    /// or `None` when a filter or the idempotency key suppressed it.
    ///
    /// Price and quantity are normalized to the symbol's tick/lot grid here,
    /// before the client id is derived, so the id is a function of what the
    /// exchange will actually see.
    fn place_action(
        &mut self,
        rt: &ConnectorRuntime,
        action: &RebalanceAction,
        execution_id: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>> {
        let side = match action.kind.side() {
            Some(side) => side,
            None => return Ok(None),
        };
        let symbol = Connector::pair(&action.asset, &rt.strategy.quote_asset);
        let filters = self.config.filters.for_symbol(&symbol);
        let price = normalize_price(action.limit_price, filters.tick_size)?;
        let quantity = normalize_quantity(action.volume, filters.lot_size)?;
        if quantity <= 0.0 {
            debug!("{symbol}: {} rounds to zero lots; skipping", action.volume);
            return Ok(None);
        }
        if !validate_min_notional(price, quantity, filters.min_notional) {
            debug!(
                "{symbol}: notional {:.2} under minimum {:.2}; skipping",
                price * quantity,
                filters.min_notional
            );
            return Ok(None);
        }
        let client_order_id = idempotency_key(
            rt.strategy.id,
            rt.connector.id,
            &action.asset,
            side,
            price,
            quantity,
            now,
        );

        if self.store.order_by_client_id(&client_order_id).is_some() {
            debug!("duplicate placement suppressed for {client_order_id}");
            return Ok(None);
        }

        let mut order = Order {
            id: self.store.next_order_id(),
            strategy_id: rt.strategy.id,
            connector_id: rt.connector.id,
            base_asset: action.asset.clone(),
            quote_asset: rt.strategy.quote_asset.clone(),
            side,
            client_order_id: client_order_id.clone(),
            exchange_order_id: None,
            limit_price: price,
            quote_amount: action.order_amount,
            quantity,
            filled_amount: 0.0,
            status: OrderStatus::Pending,
            reject_reason: None,
            execution_id,
            created_at: now,
            updated_at: now,
            last_exchange_response: None,
        };
        // Atomic create doubles as the idempotency backstop under races.
        if !self.store.insert_order(order.clone()) {
            debug!("duplicate placement suppressed at insert for {client_order_id}");
            return Ok(None);
        }

        match rt.exchange.place_limit_order(
            rt.connector.account_type,
            &symbol,
            side,
            price,
            quantity,
            &client_order_id,
        ) {
            Ok(placed) => {
                order.exchange_order_id = Some(placed.exchange_order_id.clone());
                order.last_exchange_response = Some(placed.raw.clone());
                order.transition(OrderStatus::Submitted, now)?;
                self.store.update_order(&order);
                info!(
                    "placed {} {symbol} {:.8} @ {:.8} ({client_order_id})",
                    side, quantity, price
                );
                self.log_audit(|a| audit::log_order_placed(a, &order));
                Ok(Some(order.id))
            }
            Err(e) if e.is_transient() => {
                // Leave the record pending; the reconciler resolves whether
                // the order reached the exchange.
                self.store.update_order(&order);
                Err(e.into())
            }
            Err(e) => {
                order.reject_reason = Some(e.to_string());
                order.transition(OrderStatus::Rejected, now)?;
                self.store.update_order(&order);
                Err(e.into())
            }
        }
    }

    fn cancel_order(
        &mut self,
        rt: &ConnectorRuntime,
        order: &Order,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let lookup = match &order.exchange_order_id {
            Some(id) => OrderLookup::ExchangeId(id.clone()),
            None => OrderLookup::ClientId(order.client_order_id.clone()),
        };
        match rt.exchange.cancel_order(&order.symbol(), &lookup) {
            Ok(_) => {}
            Err(e) if e.means_already_closed() => {
                debug!("{} already closed on the exchange", order.client_order_id);
            }
            Err(e) => return Err(e.into()),
        }

        let mut cancelled = order.clone();
        cancelled.transition(OrderStatus::Cancelled, now)?;
        self.store.update_order(&cancelled);
        info!("cancelled {} ({reason})", cancelled.client_order_id);
        self.log_audit(|a| audit::log_order_cancelled(a, &cancelled, reason));
        Ok(())
    }

    /// Manual rebalance: place every actionable order of the current plan in
    /// one batch, grouped under a [`RebalanceExecution`]. No operation
    /// budget — the caller asked for the whole plan.
    pub fn execute_rebalance(&mut self, rt: &ConnectorRuntime) -> Result<RebalanceExecution> {
        let now = Utc::now();
        let state = self.valuator().refresh_strategy_state_at(
            &rt.connector,
            &rt.strategy,
            rt.exchange,
            true,
            now,
        )?;
        self.store.upsert_portfolio_state(state.clone());
        self.log_audit(|a| audit::log_valuation(a, &state));
        let plan = build_plan(&rt.strategy, &state);
        self.log_audit(|a| audit::log_plan_computed(a, &plan));

        let mut execution = RebalanceExecution {
            id: self.store.next_execution_id(),
            strategy_id: rt.strategy.id,
            status: ExecutionStatus::InProgress,
            order_ids: Vec::new(),
            created_at: now,
        };
        self.store.insert_execution(execution.clone());

        let mut attempted = 0usize;
        let mut failed = 0usize;
        for action in &plan.actions {
            if action.asset == rt.strategy.quote_asset
                || action.kind == ActionKind::Hold
                || action.volume <= 0.0
            {
                continue;
            }
            attempted += 1;
            match self.place_action(rt, action, Some(execution.id), now) {
                Ok(Some(order_id)) => execution.order_ids.push(order_id),
                Ok(None) => {}
                Err(e) => {
                    warn!("rebalance placement failed for {}: {e}", action.asset);
                    failed += 1;
                }
            }
        }

        execution.status = if attempted > 0 && failed == attempted {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };
        self.store.update_execution(&execution);
        Ok(execution)
    }

    fn log_audit(&mut self, f: impl FnOnce(&mut AuditLog) -> Result<()>) {
        if let Some(audit) = self.audit.as_mut() {
            if let Err(e) = f(audit) {
                warn!("audit write failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn idempotency_key_stable_within_bucket() {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 1).unwrap();
        let t1 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 29).unwrap();
        let a = idempotency_key(1, 2, "BTC", OrderSide::Buy, 64_000.0, 0.01, t0);
        let b = idempotency_key(1, 2, "BTC", OrderSide::Buy, 64_000.0, 0.01, t1);
        assert_eq!(a, b);
    }

    #[test]
    fn idempotency_key_changes_across_buckets() {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 1).unwrap();
        let t1 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 31).unwrap();
        let a = idempotency_key(1, 2, "BTC", OrderSide::Buy, 64_000.0, 0.01, t0);
        let b = idempotency_key(1, 2, "BTC", OrderSide::Buy, 64_000.0, 0.01, t1);
        assert_ne!(a, b);
    }

    #[test]
    fn idempotency_key_sensitive_to_inputs() {
        let t = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let base = idempotency_key(1, 2, "BTC", OrderSide::Buy, 64_000.0, 0.01, t);
        assert_ne!(
            base,
            idempotency_key(1, 2, "BTC", OrderSide::Sell, 64_000.0, 0.01, t)
        );
        assert_ne!(
            base,
            idempotency_key(1, 2, "ETH", OrderSide::Buy, 64_000.0, 0.01, t)
        );
        assert_ne!(
            base,
            idempotency_key(1, 2, "BTC", OrderSide::Buy, 64_000.5, 0.01, t)
        );
        assert_ne!(
            base,
            idempotency_key(3, 2, "BTC", OrderSide::Buy, 64_000.0, 0.01, t)
        );
    }

    #[test]
    fn idempotency_key_fits_exchange_limits() {
        let t = Utc::now();
        let key = idempotency_key(1, 2, "BTC", OrderSide::Buy, 64_000.0, 0.01, t);
        assert!(key.len() <= 36);
        assert!(key.starts_with("bb"));
    }
}
