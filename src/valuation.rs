//! Portfolio valuation: NAV and per-asset allocation from balances + prices.
//!
//! Two flavors: a general [`PortfolioSummary`] over every priceable asset in
//! the account (display, snapshots), and a strategy-scoped
//! [`PortfolioState`](crate::model::PortfolioState) restricted to the
//! strategy's universe (what the planner consumes). The strategy-scoped path
//! is strict: a single missing universe price fails the whole computation,
//! because a partial plan would trade against a distorted NAV.

use balancebot_exchange::ExchangeAdapter;
use chrono::{DateTime, Utc};

use crate::breaker::CircuitBreaker;
use crate::error::{Error, Result};
use crate::model::{Connector, PortfolioState, PositionRecord, Strategy};
use crate::normalize::{round1, round2};
use crate::pricing::PriceCache;
use crate::store::KvStore;

/// Assets the general summary will attempt to price. Anything else in the
/// account (earn products, delisted tokens) is skipped silently.
pub const DEFAULT_ALLOWLIST: &[&str] = &[
    "BTC", "ETH", "BNB", "SOL", "XRP", "ADA", "DOGE", "DOT", "LINK", "AVAX", "LTC", "MATIC",
    "ATOM", "UNI", "NEAR", "USDT", "USDC", "BUSD", "DAI", "TUSD", "FDUSD",
];

/// One priced line of a [`PortfolioSummary`].
#[derive(Debug, Clone, PartialEq)]
pub struct AssetValue {
    pub asset: String,
    pub amount: f64,
    pub price: f64,
    /// Quote value, rounded to 2 decimals.
    pub value: f64,
    /// Share of NAV in percent, rounded to 1 decimal.
    pub percentage: f64,
}

/// Account-wide valuation, sorted by value descending.
#[derive(Debug, Clone)]
pub struct PortfolioSummary {
    pub timestamp: DateTime<Utc>,
    pub nav: f64,
    pub assets: Vec<AssetValue>,
}

impl std::fmt::Display for PortfolioSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "NAV: {:.2}", self.nav)?;
        for a in &self.assets {
            writeln!(
                f,
                "  {:<8} {:>16.8} @ {:>12.4}  = {:>12.2}  ({:>5.1}%)",
                a.asset, a.amount, a.price, a.value, a.percentage
            )?;
        }
        Ok(())
    }
}

/// Valuation engine over one exchange adapter.
///
/// Owns no state of its own; the breaker, price cache and cooldown store are
/// shared with the rest of the engine.
pub struct Valuator<'a> {
    breaker: &'a CircuitBreaker,
    prices: &'a PriceCache,
    kv: &'a dyn KvStore,
    dust_threshold: f64,
    cooldown_secs: i64,
}

impl<'a> Valuator<'a> {
    pub fn new(
        breaker: &'a CircuitBreaker,
        prices: &'a PriceCache,
        kv: &'a dyn KvStore,
        dust_threshold: f64,
        cooldown_secs: i64,
    ) -> Self {
        Self {
            breaker,
            prices,
            kv,
            dust_threshold,
            cooldown_secs,
        }
    }

    /// Account-wide summary over the allowlist. Assets that cannot be priced
    /// are dropped; an account with nothing priceable yields a zero-NAV,
    /// empty summary rather than an error.
    pub fn portfolio_summary(
        &self,
        connector: &Connector,
        exchange: &dyn ExchangeAdapter,
        allowlist: &[&str],
        force_refresh: bool,
    ) -> Result<PortfolioSummary> {
        self.portfolio_summary_at(connector, exchange, allowlist, force_refresh, Utc::now())
    }

    /// Time-injected form of [`Self::portfolio_summary`].
    pub fn portfolio_summary_at(
        &self,
        connector: &Connector,
        exchange: &dyn ExchangeAdapter,
        allowlist: &[&str],
        force_refresh: bool,
        now: DateTime<Utc>,
    ) -> Result<PortfolioSummary> {
        let balances = self.fetch_balances(connector, exchange, now)?;

        let mut assets = Vec::new();
        for balance in balances {
            let amount = balance.total();
            if amount < self.dust_threshold {
                continue;
            }
            if !allowlist.contains(&balance.asset.as_str()) {
                continue;
            }
            let Some(price) =
                self.prices
                    .resolve_usd_price_at(exchange, &balance.asset, force_refresh, now)
            else {
                log::debug!("no USD price for {}; skipped in summary", balance.asset);
                continue;
            };
            assets.push(AssetValue {
                asset: balance.asset,
                amount,
                price,
                value: round2(amount * price),
                percentage: 0.0,
            });
        }

        let nav: f64 = assets.iter().map(|a| a.value).sum();
        if nav > 0.0 {
            for a in &mut assets {
                a.percentage = round1(a.value / nav * 100.0);
            }
        }
        assets.sort_by(|a, b| b.value.total_cmp(&a.value));

        Ok(PortfolioSummary {
            timestamp: now,
            nav: round2(nav),
            assets,
        })
    }

    /// Compute the strategy-scoped [`PortfolioState`], cooldown-guarded.
    ///
    /// This is the viewer path: a per-connector cooldown key prevents
    /// concurrent callers from stampeding the exchange, and a cooldown hit
    /// returns [`Error::TooManyRequests`] without recomputing. The tick
    /// engine, which owns the state row, refreshes through
    /// [`Self::refresh_strategy_state`] instead.
    pub fn strategy_state(
        &self,
        connector: &Connector,
        strategy: &Strategy,
        exchange: &dyn ExchangeAdapter,
        force_refresh: bool,
    ) -> Result<PortfolioState> {
        self.strategy_state_at(connector, strategy, exchange, force_refresh, Utc::now())
    }

    /// Time-injected form of [`Self::strategy_state`].
    pub fn strategy_state_at(
        &self,
        connector: &Connector,
        strategy: &Strategy,
        exchange: &dyn ExchangeAdapter,
        force_refresh: bool,
        now: DateTime<Utc>,
    ) -> Result<PortfolioState> {
        let cooldown_key = format!("valuation:cooldown:{}", connector.id);
        if !self
            .kv
            .set_if_absent(&cooldown_key, "1", Some(self.cooldown_secs))
        {
            return Err(Error::TooManyRequests);
        }
        self.refresh_strategy_state_at(connector, strategy, exchange, force_refresh, now)
    }

    /// Compute the strategy-scoped state without the cooldown gate.
    ///
    /// Every universe price must resolve or the computation fails with
    /// [`Error::PricingUnavailable`] — a partial plan would trade against a
    /// distorted NAV. The quote-asset balance is folded in at a fixed 1:1
    /// rate.
    pub fn refresh_strategy_state(
        &self,
        connector: &Connector,
        strategy: &Strategy,
        exchange: &dyn ExchangeAdapter,
        force_refresh: bool,
    ) -> Result<PortfolioState> {
        self.refresh_strategy_state_at(connector, strategy, exchange, force_refresh, Utc::now())
    }

    /// Time-injected form of [`Self::refresh_strategy_state`].
    pub fn refresh_strategy_state_at(
        &self,
        connector: &Connector,
        strategy: &Strategy,
        exchange: &dyn ExchangeAdapter,
        force_refresh: bool,
        now: DateTime<Utc>,
    ) -> Result<PortfolioState> {
        let balances = self.fetch_balances(connector, exchange, now)?;
        let balance_of = |asset: &str| -> f64 {
            balances
                .iter()
                .find(|b| b.asset == asset)
                .map(|b| b.total())
                .unwrap_or(0.0)
        };

        let universe = strategy.universe();
        let pairs: Vec<String> = universe
            .iter()
            .map(|base| Connector::pair(base, &strategy.quote_asset))
            .collect();
        let (prices, missing) = self
            .prices
            .get_prices_at(exchange, &pairs, force_refresh, now);
        if !missing.is_empty() {
            log::warn!(
                "valuation for connector {} missing prices: {}",
                connector.id,
                missing.join(", ")
            );
            return Err(Error::PricingUnavailable);
        }

        let mut positions = Vec::with_capacity(universe.len() + 1);
        for base in &universe {
            let pair = Connector::pair(base, &strategy.quote_asset);
            // get_prices succeeded for every pair; the map is complete.
            let price = *prices.get(&pair).ok_or(Error::PricingUnavailable)?;
            let amount = balance_of(base);
            positions.push(PositionRecord {
                asset: base.clone(),
                amount,
                quote_value: round2(amount * price),
                price,
            });
        }

        let quote_amount = balance_of(&strategy.quote_asset);
        positions.push(PositionRecord {
            asset: strategy.quote_asset.clone(),
            amount: quote_amount,
            quote_value: round2(quote_amount),
            price: 1.0,
        });

        let nav = round2(positions.iter().map(|p| p.quote_value).sum());

        Ok(PortfolioState {
            connector_id: connector.id,
            strategy_id: strategy.id,
            timestamp: now,
            quote_asset: strategy.quote_asset.clone(),
            nav,
            positions,
            source: "exchange".into(),
            universe,
        })
    }

    /// Balance fetch behind the circuit breaker. A blocked breaker and a
    /// failed fetch both surface as [`Error::PricingUnavailable`].
    fn fetch_balances(
        &self,
        connector: &Connector,
        exchange: &dyn ExchangeAdapter,
        now: DateTime<Utc>,
    ) -> Result<Vec<balancebot_exchange::Balance>> {
        let key = connector.breaker_key();
        if !self.breaker.should_attempt_at(&key, now) {
            log::debug!("breaker open for {key}; skipping balance fetch");
            return Err(Error::PricingUnavailable);
        }
        match exchange.balances(connector.account_type) {
            Ok(balances) => {
                self.breaker.record_success(&key);
                Ok(balances)
            }
            Err(e) => {
                log::warn!("balance fetch failed for {key}: {e}");
                self.breaker.record_failure_at(&key, now);
                Err(Error::PricingUnavailable)
            }
        }
    }
}
