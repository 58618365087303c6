//! CLI-facing orchestration: wiring config, strategy, adapter and the
//! engine components together, plus the long-running scheduler loop.

use std::path::Path;
use std::time::{Duration, Instant};

use balancebot_exchange::binance::BinanceExchange;
use balancebot_exchange::{AccountType, ExchangeAdapter};
use chrono::Utc;
use log::{info, warn};

use crate::audit::{AuditLog, SnapshotHistory};
use crate::breaker::CircuitBreaker;
use crate::config::{Config, Environment};
use crate::engine::{ConnectorRuntime, Engine, TickSummary};
use crate::error::{Error, Result};
use crate::model::{Connector, PortfolioSnapshot, SnapshotTrigger, Strategy};
use crate::planner::build_plan;
use crate::pricing::PriceCache;
use crate::reconcile::{ReconcileSummary, Reconciler};
use crate::store::{MemoryKv, MemoryStore, Store};
use crate::valuation::{DEFAULT_ALLOWLIST, Valuator};

/// One configured deployment: a single Binance connector and its strategy,
/// with in-process store, cache and breaker.
pub struct App {
    pub config: Config,
    pub connector: Connector,
    pub strategy: Strategy,
    store: MemoryStore,
    kv: MemoryKv,
    breaker: CircuitBreaker,
    prices: PriceCache,
}

impl App {
    pub fn new(config: Config, strategy_path: &Path) -> Result<Self> {
        let mut strategy = Strategy::load(strategy_path)?;
        strategy.id = 1;
        strategy.connector_id = 1;

        let testnet = config.exchange.environment != Environment::Live;
        let connector = Connector {
            id: 1,
            exchange: "binance".into(),
            account_type: AccountType::Spot,
            testnet,
            active: true,
        };

        let breaker = CircuitBreaker::new(
            config.breaker.failure_threshold,
            config.breaker.circuit_timeout_secs,
        );
        let prices = PriceCache::new(
            config.pricing.ttl_secs,
            config.pricing.cache_enabled,
            config.pricing.batch_size,
            config.pricing.batch_delay_ms,
        );

        Ok(Self {
            config,
            connector,
            strategy,
            store: MemoryStore::new(),
            kv: MemoryKv::new(),
            breaker,
            prices,
        })
    }

    /// Build the adapter from the credential environment variables named in
    /// the config. Secrets never live in the config file itself.
    fn exchange(&self) -> Result<BinanceExchange> {
        let api_key = std::env::var(&self.config.exchange.api_key_env).map_err(|_| {
            Error::Config(format!(
                "missing credential env var {}",
                self.config.exchange.api_key_env
            ))
        })?;
        let secret_key = std::env::var(&self.config.exchange.secret_key_env).map_err(|_| {
            Error::Config(format!(
                "missing credential env var {}",
                self.config.exchange.secret_key_env
            ))
        })?;
        Ok(BinanceExchange::new(
            &api_key,
            &secret_key,
            self.connector.testnet,
        ))
    }

    fn engine(&self) -> Result<Engine<'_>> {
        let audit = AuditLog::open(&self.config.audit_path())?;
        Ok(Engine::new(
            &self.config,
            &self.store,
            &self.kv,
            &self.breaker,
            &self.prices,
        )
        .with_audit(audit))
    }

    fn valuator(&self) -> Valuator<'_> {
        Valuator::new(
            &self.breaker,
            &self.prices,
            &self.kv,
            self.config.pricing.dust_threshold,
            self.config.pricing.valuation_cooldown_secs,
        )
    }

    /// One auto-trade tick.
    pub fn tick_once(&self) -> Result<TickSummary> {
        let exchange = self.exchange()?;
        let rt = ConnectorRuntime {
            connector: self.connector.clone(),
            strategy: self.strategy.clone(),
            exchange: &exchange,
        };
        let mut engine = self.engine()?;
        Ok(engine.run_auto_trade_tick(&[rt]))
    }

    /// One reconciliation pass.
    pub fn reconcile_once(&self) -> Result<ReconcileSummary> {
        let exchange = self.exchange()?;
        let rt = ConnectorRuntime {
            connector: self.connector.clone(),
            strategy: self.strategy.clone(),
            exchange: &exchange,
        };
        let audit = AuditLog::open(&self.config.audit_path())?;
        let mut reconciler = Reconciler::new(&self.config, &self.store).with_audit(audit);
        let summary = reconciler.run_order_reconciliation(&[rt]);
        if summary.orders_filled > 0 {
            if let Err(e) = self.record_snapshot(SnapshotTrigger::OrderFill) {
                warn!("fill snapshot failed: {e}");
            }
        }
        Ok(summary)
    }

    /// Scheduler loop: ticks and reconcile passes at their configured
    /// intervals, with a scheduled snapshot after each tick. Runs until the
    /// process is killed.
    pub fn run_loop(&self) -> Result<()> {
        let tick_interval = Duration::from_secs(self.config.trading.tick_interval_secs);
        let poll_interval = Duration::from_secs(self.config.polling.interval_secs);
        info!(
            "starting loop: tick every {}s, reconcile every {}s",
            tick_interval.as_secs(),
            poll_interval.as_secs()
        );

        // Backfill one snapshot so the history starts at process start
        // instead of the first scheduled tick.
        if let Err(e) = self.backfill_snapshot() {
            warn!("initial backfill failed: {e}");
        }

        let mut last_tick: Option<Instant> = None;
        let mut last_poll: Option<Instant> = None;
        loop {
            if last_tick.is_none_or(|t| t.elapsed() >= tick_interval) {
                last_tick = Some(Instant::now());
                match self.tick_once() {
                    Ok(summary) => {
                        if let Err(e) = self.record_snapshot(SnapshotTrigger::Scheduled) {
                            warn!("snapshot failed: {e}");
                        }
                        info!("tick: {summary}");
                    }
                    Err(e) => warn!("tick failed: {e}"),
                }
            }
            if last_poll.is_none_or(|t| t.elapsed() >= poll_interval) {
                last_poll = Some(Instant::now());
                match self.reconcile_once() {
                    Ok(summary) => info!("reconcile: {summary}"),
                    Err(e) => warn!("reconcile failed: {e}"),
                }
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    /// Run an initial valuation and record it as a backfill snapshot.
    fn backfill_snapshot(&self) -> Result<()> {
        let exchange = self.exchange()?;
        let state = self.valuator().refresh_strategy_state(
            &self.connector,
            &self.strategy,
            &exchange,
            true,
        )?;
        self.store.upsert_portfolio_state(state);
        self.record_snapshot(SnapshotTrigger::Backfill)
    }

    /// Append the current stored portfolio state as a snapshot and apply the
    /// retention policy.
    pub fn record_snapshot(&self, trigger: SnapshotTrigger) -> Result<()> {
        let Some(state) = self.store.portfolio_state(self.connector.id) else {
            return Ok(());
        };
        let snapshot = PortfolioSnapshot {
            connector_id: state.connector_id,
            timestamp: state.timestamp,
            quote_asset: state.quote_asset.clone(),
            nav: state.nav,
            positions: state.positions.clone(),
            trigger,
        };
        self.store.append_snapshot(snapshot.clone());
        let history = SnapshotHistory::new(self.config.snapshot_path());
        history.append(&snapshot)?;

        let cutoff = Utc::now() - chrono::Duration::days(self.config.snapshots.retention_days);
        let dropped = self.store.delete_snapshots_before(cutoff) + history.prune_before(cutoff)?;
        if dropped > 0 {
            info!("pruned {dropped} snapshot(s) past retention");
        }
        Ok(())
    }

    /// Print the account-wide portfolio summary.
    pub fn show_summary(&self) -> Result<()> {
        let exchange = self.exchange()?;
        let summary = self.valuator().portfolio_summary(
            &self.connector,
            &exchange,
            DEFAULT_ALLOWLIST,
            false,
        )?;
        print!("{summary}");
        Ok(())
    }

    /// Compute, display, confirm and execute a manual rebalance.
    pub fn manual_rebalance(&self, dry_run: bool, force: bool) -> Result<()> {
        let exchange = self.exchange()?;
        let state = self.valuator().refresh_strategy_state(
            &self.connector,
            &self.strategy,
            &exchange,
            true,
        )?;
        self.store.upsert_portfolio_state(state.clone());
        let plan = build_plan(&self.strategy, &state);
        print!("{plan}");

        if !plan.rebalance_needed {
            println!("No rebalancing needed — portfolio matches target.");
            return Ok(());
        }
        if dry_run {
            println!("\n[DRY RUN] No orders submitted.");
            return Ok(());
        }
        if self.config.exchange.environment == Environment::Simulated {
            return Err(Error::Aborted(
                "simulated environment; orders are never sent".into(),
            ));
        }

        if !force {
            let confirmed = dialoguer::Confirm::new()
                .with_prompt("Execute?")
                .default(false)
                .interact()
                .map_err(|e| Error::Aborted(format!("confirmation prompt failed: {e}")))?;
            if !confirmed {
                println!("Aborted.");
                return Ok(());
            }
        }

        let rt = ConnectorRuntime {
            connector: self.connector.clone(),
            strategy: self.strategy.clone(),
            exchange: &exchange,
        };
        let mut engine = self.engine()?;
        let execution = engine.execute_rebalance(&rt)?;
        self.record_snapshot(SnapshotTrigger::Manual)?;
        println!(
            "Execution {}: {} order(s) placed, status {:?}",
            execution.id,
            execution.order_ids.len(),
            execution.status
        );
        Ok(())
    }

    /// Connectivity and configuration check.
    pub fn show_status(&self) -> Result<()> {
        println!("environment:  {:?}", self.config.exchange.environment);
        println!("auto-trade:   {}", self.config.trading_allowed());
        println!("polling:      {}", self.config.polling_allowed());
        println!(
            "strategy:     {} allocation(s), quote {}",
            self.strategy.allocations.len(),
            self.strategy.quote_asset
        );
        let key = self.connector.breaker_key();
        println!(
            "breaker:      {} ({} failure(s))",
            if self.breaker.is_open(&key) { "open" } else { "closed" },
            self.breaker.failure_count(&key)
        );
        let exchange = self.exchange()?;
        match exchange.ping() {
            Ok(()) => println!("exchange:     reachable"),
            Err(e) => println!("exchange:     unreachable ({e})"),
        }
        Ok(())
    }
}
