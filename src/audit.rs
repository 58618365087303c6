//! JSONL audit trail and snapshot history.
//!
//! Every tick, reconcile pass and manual rebalance appends events to an
//! audit.jsonl file, one JSON object per line. Portfolio snapshots go to a
//! separate JSONL file with a rolling retention policy.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::model::{Order, PortfolioSnapshot, PortfolioState};
use crate::planner::RebalancePlan;

/// An audit event written to the JSONL trail.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub event: &'static str,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub data: serde_json::Value,
}

/// Append-only audit logger.
pub struct AuditLog {
    writer: BufWriter<std::fs::File>,
}

impl AuditLog {
    /// Open (or create) the audit log file for appending.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    /// Log an event with arbitrary JSON data.
    pub fn log(&mut self, event: &'static str, data: serde_json::Value) -> Result<()> {
        let entry = AuditEvent {
            event,
            ts: Utc::now(),
            data,
        };
        let json = serde_json::to_string(&entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(self.writer, "{json}")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Log a simple event with no additional data.
    pub fn log_simple(&mut self, event: &'static str) -> Result<()> {
        self.log(event, serde_json::json!({}))
    }
}

fn order_json(order: &Order) -> serde_json::Value {
    serde_json::json!({
        "client_order_id": order.client_order_id,
        "exchange_order_id": order.exchange_order_id,
        "symbol": order.symbol(),
        "side": order.side.as_str(),
        "limit_price": order.limit_price,
        "quote_amount": order.quote_amount,
        "quantity": order.quantity,
        "status": format!("{}", order.status),
    })
}

/// Convenience: log a tick start.
pub fn log_tick_started(audit: &mut AuditLog, connector_id: u64, strategy_id: u64) -> Result<()> {
    audit.log(
        "tick_started",
        serde_json::json!({
            "connector": connector_id,
            "strategy": strategy_id,
        }),
    )
}

/// Convenience: log a completed valuation.
pub fn log_valuation(audit: &mut AuditLog, state: &PortfolioState) -> Result<()> {
    audit.log(
        "valuation",
        serde_json::json!({
            "connector": state.connector_id,
            "strategy": state.strategy_id,
            "nav": state.nav,
            "positions": state.positions.len(),
            "source": state.source,
        }),
    )
}

/// Convenience: log a computed rebalance plan.
pub fn log_plan_computed(audit: &mut AuditLog, plan: &RebalancePlan) -> Result<()> {
    audit.log(
        "plan_computed",
        serde_json::json!({
            "strategy": plan.strategy_id,
            "nav": plan.nav,
            "total_delta": plan.total_delta,
            "orders_needed": plan.orders_needed,
            "rebalance_needed": plan.rebalance_needed,
        }),
    )
}

/// Convenience: log a placed order.
pub fn log_order_placed(audit: &mut AuditLog, order: &Order) -> Result<()> {
    audit.log("order_placed", order_json(order))
}

/// Convenience: log a cancelled order with the reason.
pub fn log_order_cancelled(audit: &mut AuditLog, order: &Order, reason: &str) -> Result<()> {
    let mut data = order_json(order);
    data["reason"] = serde_json::json!(reason);
    audit.log("order_cancelled", data)
}

/// Convenience: log a reconciler status change.
pub fn log_order_reconciled(
    audit: &mut AuditLog,
    order: &Order,
    exchange_status: &str,
) -> Result<()> {
    let mut data = order_json(order);
    data["exchange_status"] = serde_json::json!(exchange_status);
    data["filled_amount"] = serde_json::json!(order.filled_amount);
    audit.log("order_reconciled", data)
}

/// Convenience: log tick completion with its summary counts.
pub fn log_tick_completed(
    audit: &mut AuditLog,
    placed: usize,
    cancelled: usize,
    skipped: usize,
    errors: usize,
) -> Result<()> {
    audit.log(
        "tick_completed",
        serde_json::json!({
            "placed": placed,
            "cancelled": cancelled,
            "skipped": skipped,
            "errors": errors,
        }),
    )
}

/// Append-only snapshot history with rolling retention.
pub struct SnapshotHistory {
    path: PathBuf,
}

impl SnapshotHistory {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Append one snapshot as a JSONL line.
    pub fn append(&self, snapshot: &PortfolioSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        let json = serde_json::to_string(snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(writer, "{json}")?;
        writer.flush()?;
        Ok(())
    }

    /// Rewrite the file keeping only snapshots at or after the cutoff.
    /// Returns the number of lines dropped. Unparseable lines are kept.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        let contents = fs::read_to_string(&self.path)?;
        let mut kept = String::with_capacity(contents.len());
        let mut dropped = 0;
        for line in contents.lines() {
            match serde_json::from_str::<PortfolioSnapshot>(line) {
                Ok(snap) if snap.timestamp < cutoff => dropped += 1,
                _ => {
                    kept.push_str(line);
                    kept.push('\n');
                }
            }
        }
        if dropped > 0 {
            fs::write(&self.path, kept)?;
        }
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PositionRecord, SnapshotTrigger};
    use chrono::Duration;

    #[test]
    fn audit_log_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        {
            let mut log = AuditLog::open(&path).unwrap();
            log.log_simple("tick_started").unwrap();
            log.log("test_data", serde_json::json!({"key": "value"}))
                .unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        for line in &lines {
            let _: serde_json::Value = serde_json::from_str(line).unwrap();
        }
        assert!(lines[0].contains("\"event\":\"tick_started\""));
    }

    #[test]
    fn valuation_and_plan_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        {
            let mut log = AuditLog::open(&path).unwrap();
            let state = PortfolioState {
                connector_id: 1,
                strategy_id: 1,
                timestamp: Utc::now(),
                quote_asset: "USDT".into(),
                nav: 10_000.0,
                positions: vec![],
                source: "exchange".into(),
                universe: vec![],
            };
            log_valuation(&mut log, &state).unwrap();

            let plan = RebalancePlan {
                strategy_id: 1,
                nav: 10_000.0,
                actions: vec![],
                total_delta: 4_000.0,
                orders_needed: 3,
                rebalance_needed: true,
            };
            log_plan_computed(&mut log, &plan).unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"event\":\"valuation\""));
        assert!(contents.contains("\"event\":\"plan_computed\""));
        assert!(contents.contains("\"orders_needed\":3"));
    }

    #[test]
    fn audit_log_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subdir").join("deep").join("audit.jsonl");

        let mut log = AuditLog::open(&path).unwrap();
        log.log_simple("test").unwrap();

        assert!(path.exists());
    }

    fn snapshot(age_days: i64) -> PortfolioSnapshot {
        PortfolioSnapshot {
            connector_id: 1,
            timestamp: Utc::now() - Duration::days(age_days),
            quote_asset: "USDT".into(),
            nav: 1_000.0,
            positions: vec![PositionRecord {
                asset: "BTC".into(),
                amount: 0.01,
                quote_value: 640.0,
                price: 64_000.0,
            }],
            trigger: SnapshotTrigger::Scheduled,
        }
    }

    #[test]
    fn snapshot_history_append_and_prune() {
        let dir = tempfile::tempdir().unwrap();
        let history = SnapshotHistory::new(dir.path().join("snapshots.jsonl"));

        history.append(&snapshot(100)).unwrap();
        history.append(&snapshot(10)).unwrap();
        history.append(&snapshot(1)).unwrap();

        let dropped = history
            .prune_before(Utc::now() - Duration::days(90))
            .unwrap();
        assert_eq!(dropped, 1);

        let contents = std::fs::read_to_string(dir.path().join("snapshots.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn prune_missing_file_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let history = SnapshotHistory::new(dir.path().join("absent.jsonl"));
        assert_eq!(history.prune_before(Utc::now()).unwrap(), 0);
    }
}
