//! Order reconciliation against the exchange.
//!
//! Observes and updates: fetches open orders once per connector, resolves
//! every locally-active order against the exchange's view, and applies the
//! status transitions. Never places anything — placement is the tick
//! engine's job, and that division is what makes the two safe to overlap.

use balancebot_exchange::{ExchangeError, ExchangeOrder, ExchangeOrderStatus, OrderLookup};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rustc_hash::FxHashMap;

use crate::audit::{self, AuditLog};
use crate::config::Config;
use crate::engine::ConnectorRuntime;
use crate::error::Result;
use crate::model::{Order, OrderStatus};
use crate::store::Store;

/// Structured result of one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub orders_checked: usize,
    pub orders_updated: usize,
    /// Orders that reached a terminal fill this pass; callers use this to
    /// trigger a fresh portfolio snapshot.
    pub orders_filled: usize,
    pub errors: usize,
}

impl std::fmt::Display for ReconcileSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} checked, {} updated, {} filled, {} errors",
            self.orders_checked, self.orders_updated, self.orders_filled, self.errors
        )
    }
}

/// The reconciler: polls exchange order state into the local store.
pub struct Reconciler<'a> {
    config: &'a Config,
    store: &'a dyn Store,
    audit: Option<AuditLog>,
}

impl<'a> Reconciler<'a> {
    pub fn new(config: &'a Config, store: &'a dyn Store) -> Self {
        Self {
            config,
            store,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// One reconciliation pass over all connectors. Per-order failures are
    /// counted, never raised.
    pub fn run_order_reconciliation(&mut self, runtimes: &[ConnectorRuntime]) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        if !self.config.polling_allowed() {
            debug!("polling disabled or simulated environment; reconcile is a no-op");
            return summary;
        }

        for rt in runtimes {
            if !rt.connector.active {
                continue;
            }
            let local = self.store.active_orders_for_connector(rt.connector.id);
            if local.is_empty() {
                continue;
            }

            // One open-orders call per connector, then local lookups.
            let open = match rt.exchange.open_orders(rt.connector.account_type, None) {
                Ok(open) => open,
                Err(e) => {
                    warn!(
                        "open-orders fetch failed for connector {}: {e}",
                        rt.connector.id
                    );
                    summary.errors += local.len();
                    continue;
                }
            };
            let mut by_exchange_id: FxHashMap<&str, &ExchangeOrder> = FxHashMap::default();
            let mut by_client_id: FxHashMap<&str, &ExchangeOrder> = FxHashMap::default();
            for o in &open {
                if !o.exchange_order_id.is_empty() {
                    by_exchange_id.insert(o.exchange_order_id.as_str(), o);
                }
                if !o.client_order_id.is_empty() {
                    by_client_id.insert(o.client_order_id.as_str(), o);
                }
            }

            for order in local {
                summary.orders_checked += 1;
                let found = order
                    .exchange_order_id
                    .as_deref()
                    .and_then(|id| by_exchange_id.get(id).copied())
                    .or_else(|| by_client_id.get(order.client_order_id.as_str()).copied());

                let resolved = match found {
                    Some(exchange_order) => Some(exchange_order.clone()),
                    None => match self.query_missing(rt, &order) {
                        Ok(resolved) => resolved,
                        Err(e) => {
                            warn!("status query failed for {}: {e}", order.client_order_id);
                            summary.errors += 1;
                            continue;
                        }
                    },
                };
                let Some(exchange_order) = resolved else {
                    continue; // retry next cycle
                };

                match self.apply(order, &exchange_order, Utc::now()) {
                    Ok(true) => {
                        summary.orders_updated += 1;
                        if exchange_order.status == ExchangeOrderStatus::Filled {
                            summary.orders_filled += 1;
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!("reconcile failed for an order: {e}");
                        summary.errors += 1;
                    }
                }
            }
        }

        info!("reconcile complete: {summary}");
        summary
    }

    /// Direct status query for an order absent from the open set.
    ///
    /// "Already closed" means cancelled before we saw it. "Not found" means
    /// the exchange has not indexed it yet (or never got it): retry next
    /// cycle, except that a still-pending order unconfirmed past the hard
    /// polling timeout is abandoned rather than retried forever.
    fn query_missing(
        &mut self,
        rt: &ConnectorRuntime,
        order: &Order,
    ) -> std::result::Result<Option<ExchangeOrder>, ExchangeError> {
        let lookup = match &order.exchange_order_id {
            Some(id) => OrderLookup::ExchangeId(id.clone()),
            None => OrderLookup::ClientId(order.client_order_id.clone()),
        };
        match rt.exchange.order_status(&order.symbol(), &lookup) {
            Ok(exchange_order) => Ok(Some(exchange_order)),
            Err(e) if e.means_already_closed() => {
                let mut cancelled = order.clone();
                cancelled.transition(OrderStatus::Cancelled, Utc::now()).ok();
                self.store.update_order(&cancelled);
                info!("{} was already closed; marked cancelled", order.client_order_id);
                Ok(None)
            }
            Err(e) if e.means_not_found() => {
                let age = (Utc::now() - order.created_at).num_seconds();
                if order.status == OrderStatus::Pending
                    && age > self.config.polling.hard_timeout_secs
                {
                    warn!(
                        "{} unconfirmed after {age}s; cancelling and abandoning",
                        order.client_order_id
                    );
                    // If the placement did land and only the query endpoints
                    // lag, this keeps a live order from running untracked.
                    let cancel_lookup =
                        OrderLookup::ClientId(order.client_order_id.clone());
                    match rt.exchange.cancel_order(&order.symbol(), &cancel_lookup) {
                        Ok(_) => {}
                        Err(e) if e.means_already_closed() || e.means_not_found() => {}
                        Err(e) => warn!(
                            "late cancel for {} failed: {e}",
                            order.client_order_id
                        ),
                    }
                    let mut abandoned = order.clone();
                    abandoned.transition(OrderStatus::Cancelled, Utc::now()).ok();
                    self.store.update_order(&abandoned);
                } else if age > self.config.polling.soft_timeout_secs {
                    warn!(
                        "{} still unresolved after {age}s; retrying",
                        order.client_order_id
                    );
                } else {
                    debug!("{} not found yet; will retry", order.client_order_id);
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Apply one exchange-reported state to a local order. Returns whether
    /// anything changed. The raw response is persisted either way.
    fn apply(
        &mut self,
        mut order: Order,
        exchange_order: &ExchangeOrder,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let before_status = order.status;
        let before_filled = order.filled_amount;
        let reported_fill = exchange_order.filled_quote_amount;

        match exchange_order.status {
            ExchangeOrderStatus::New => {
                // Accepted but not yet working; it cannot have fills.
                if order.filled_amount != 0.0 {
                    warn!(
                        "{} reported NEW with local fill {}; resetting",
                        order.client_order_id, order.filled_amount
                    );
                    order.filled_amount = 0.0;
                }
                if order.status == OrderStatus::Pending {
                    order.transition(OrderStatus::Submitted, now)?;
                }
            }
            ExchangeOrderStatus::Open => {
                // Monotonic fill adoption. A freshly-reopened testnet order
                // can misreport zero fill; never let that erase a recorded
                // partial execution.
                if reported_fill > order.filled_amount {
                    order.filled_amount = reported_fill;
                } else if reported_fill == 0.0 && order.filled_amount > 0.0 {
                    debug!(
                        "{} reported zero fill over local {}; keeping local",
                        order.client_order_id, order.filled_amount
                    );
                }
                if matches!(order.status, OrderStatus::Pending | OrderStatus::Submitted) {
                    if order.status == OrderStatus::Pending {
                        order.transition(OrderStatus::Submitted, now)?;
                    }
                    order.transition(OrderStatus::Open, now)?;
                }
            }
            ExchangeOrderStatus::PartiallyFilled => {
                // Sanity bound: a partial fill is strictly inside
                // (0, quote_amount). Anything else is a feed glitch.
                if reported_fill > 0.0 && reported_fill < order.quote_amount {
                    order.filled_amount = reported_fill;
                } else {
                    warn!(
                        "{} reported implausible partial fill {reported_fill} (total {}); ignoring",
                        order.client_order_id, order.quote_amount
                    );
                }
                if matches!(order.status, OrderStatus::Pending | OrderStatus::Submitted) {
                    if order.status == OrderStatus::Pending {
                        order.transition(OrderStatus::Submitted, now)?;
                    }
                    order.transition(OrderStatus::Open, now)?;
                }
            }
            ExchangeOrderStatus::Filled => {
                order.filled_amount = order.quote_amount;
                order.transition(OrderStatus::Filled, now)?;
            }
            ExchangeOrderStatus::Canceled | ExchangeOrderStatus::Expired => {
                // Partial execution before the cancel is real money; keep it.
                order.transition(OrderStatus::Cancelled, now)?;
            }
            ExchangeOrderStatus::Rejected => {
                order.reject_reason = exchange_order
                    .reject_reason
                    .clone()
                    .or(Some("rejected by exchange".into()));
                order.transition(OrderStatus::Rejected, now)?;
            }
        }

        if order.exchange_order_id.is_none() && !exchange_order.exchange_order_id.is_empty() {
            order.exchange_order_id = Some(exchange_order.exchange_order_id.clone());
        }
        order.last_exchange_response = Some(exchange_order.raw.clone());
        let changed = order.status != before_status || order.filled_amount != before_filled;
        if changed {
            order.updated_at = now;
        }
        self.store.update_order(&order);
        if changed {
            let status = exchange_order.status;
            self.log_audit(|a| audit::log_order_reconciled(a, &order, &format!("{status:?}")));
        }
        Ok(changed)
    }

    fn log_audit(&mut self, f: impl FnOnce(&mut AuditLog) -> Result<()>) {
        if let Some(audit) = self.audit.as_mut() {
            if let Err(e) = f(audit) {
                warn!("audit write failed: {e}");
            }
        }
    }
}
