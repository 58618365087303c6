//! TTL price cache with staleness detection and stale-cache fallback.
//!
//! Lookups fail soft: a price that cannot be resolved is reported as
//! missing, never as an error that aborts the caller's batch.

use std::sync::Mutex;
use std::time::Duration;

use balancebot_exchange::ExchangeAdapter;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use rustc_hash::FxHashMap;

/// Assets pinned at exactly 1.00 without a network call.
const STABLECOINS: &[&str] = &["USDT", "USDC", "BUSD", "USD", "DAI", "TUSD", "FDUSD"];

/// Quote variants tried when resolving a USD-equivalent price.
const USD_QUOTES: &[&str] = &["USDT", "USDC", "BUSD"];

pub fn is_stablecoin(asset: &str) -> bool {
    STABLECOINS.contains(&asset)
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    price: f64,
    fetched_at: DateTime<Utc>,
}

/// TTL-cached price lookups over an exchange adapter.
pub struct PriceCache {
    enabled: bool,
    /// Serve-from-cache horizon: max(2 × TTL, 60 s).
    stale_threshold_secs: i64,
    batch_size: usize,
    batch_delay: Duration,
    entries: Mutex<FxHashMap<String, CacheEntry>>,
}

impl PriceCache {
    pub fn new(ttl_secs: i64, enabled: bool, batch_size: usize, batch_delay_ms: u64) -> Self {
        Self {
            enabled,
            stale_threshold_secs: (ttl_secs * 2).max(60),
            batch_size: batch_size.max(1),
            batch_delay: Duration::from_millis(batch_delay_ms),
            entries: Mutex::new(FxHashMap::default()),
        }
    }

    /// Price for a trading pair, consulting the cache first. `None` means
    /// unavailable — an expected outcome, not an error.
    pub fn get_price(
        &self,
        exchange: &dyn ExchangeAdapter,
        symbol: &str,
        force_refresh: bool,
    ) -> Option<f64> {
        self.get_price_at(exchange, symbol, force_refresh, Utc::now())
    }

    /// Time-injected form of [`Self::get_price`].
    pub fn get_price_at(
        &self,
        exchange: &dyn ExchangeAdapter,
        symbol: &str,
        force_refresh: bool,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        let key = symbol.to_uppercase();

        if self.enabled && !force_refresh {
            if let Some(entry) = self.lookup(&key) {
                if (now - entry.fetched_at).num_seconds() < self.stale_threshold_secs {
                    return Some(entry.price);
                }
            }
        }

        match exchange.price(&key) {
            Ok(price) => {
                self.store(&key, price, now);
                Some(price)
            }
            Err(e) => {
                // Stale fallback: a degraded feed is better served by an old
                // price than by none at all. Callers needing freshness guard
                // with their own staleness checks.
                if let Some(entry) = self.lookup(&key) {
                    warn!("price fetch for {key} failed ({e}); serving stale cache");
                    return Some(entry.price);
                }
                debug!("price fetch for {key} failed ({e}); no cache to fall back on");
                None
            }
        }
    }

    /// Batch lookup with per-symbol failure isolation. Symbols are fetched
    /// in fixed-size chunks with a small inter-chunk delay to respect rate
    /// limits. Returns resolved prices and the list of missing symbols.
    pub fn get_prices(
        &self,
        exchange: &dyn ExchangeAdapter,
        symbols: &[String],
        force_refresh: bool,
    ) -> (FxHashMap<String, f64>, Vec<String>) {
        self.get_prices_at(exchange, symbols, force_refresh, Utc::now())
    }

    /// Time-injected form of [`Self::get_prices`].
    pub fn get_prices_at(
        &self,
        exchange: &dyn ExchangeAdapter,
        symbols: &[String],
        force_refresh: bool,
        now: DateTime<Utc>,
    ) -> (FxHashMap<String, f64>, Vec<String>) {
        let mut resolved = FxHashMap::default();
        let mut to_fetch = Vec::new();

        for symbol in symbols {
            let key = symbol.to_uppercase();
            if self.enabled && !force_refresh {
                if let Some(entry) = self.lookup(&key) {
                    if (now - entry.fetched_at).num_seconds() < self.stale_threshold_secs {
                        resolved.insert(key, entry.price);
                        continue;
                    }
                }
            }
            to_fetch.push(key);
        }

        let mut missing = Vec::new();
        for (i, chunk) in to_fetch.chunks(self.batch_size).enumerate() {
            if i > 0 && !self.batch_delay.is_zero() {
                std::thread::sleep(self.batch_delay);
            }
            for (symbol, result) in exchange.prices(chunk) {
                match result {
                    Ok(price) => {
                        self.store(&symbol, price, now);
                        resolved.insert(symbol, price);
                    }
                    Err(e) => {
                        if let Some(entry) = self.lookup(&symbol) {
                            warn!("batch price for {symbol} failed ({e}); serving stale cache");
                            resolved.insert(symbol, entry.price);
                        } else {
                            debug!("batch price for {symbol} failed: {e}");
                            missing.push(symbol);
                        }
                    }
                }
            }
        }

        (resolved, missing)
    }

    /// Resolve a USD-equivalent price for a bare asset: stablecoins at 1.00,
    /// then direct USD-quote variants (cache before forced fetch), then the
    /// inverse of the reversed pair.
    pub fn resolve_usd_price(
        &self,
        exchange: &dyn ExchangeAdapter,
        asset: &str,
        force_refresh: bool,
    ) -> Option<f64> {
        self.resolve_usd_price_at(exchange, asset, force_refresh, Utc::now())
    }

    /// Time-injected form of [`Self::resolve_usd_price`].
    pub fn resolve_usd_price_at(
        &self,
        exchange: &dyn ExchangeAdapter,
        asset: &str,
        force_refresh: bool,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        if is_stablecoin(asset) {
            return Some(1.0);
        }

        for quote in USD_QUOTES {
            let pair = format!("{asset}{quote}");
            if let Some(price) = self.get_price_at(exchange, &pair, force_refresh, now) {
                return Some(price);
            }
        }

        // Reversed pair, e.g. EUR priced via USDTEUR.
        for quote in USD_QUOTES {
            let pair = format!("{quote}{asset}");
            if let Some(price) = self.get_price_at(exchange, &pair, force_refresh, now) {
                if price > 0.0 {
                    return Some(1.0 / price);
                }
            }
        }

        None
    }

    /// Seed an entry directly (tests, warm starts).
    pub fn insert_at(&self, symbol: &str, price: f64, fetched_at: DateTime<Utc>) {
        self.store(&symbol.to_uppercase(), price, fetched_at);
    }

    fn lookup(&self, key: &str) -> Option<CacheEntry> {
        self.entries.lock().unwrap().get(key).copied()
    }

    fn store(&self, key: &str, price: f64, now: DateTime<Utc>) {
        self.entries.lock().unwrap().insert(
            key.to_string(),
            CacheEntry {
                price,
                fetched_at: now,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use balancebot_exchange::mock::MockExchange;
    use chrono::Duration as ChronoDuration;

    fn cache() -> PriceCache {
        PriceCache::new(30, true, 10, 0)
    }

    #[test]
    fn fresh_entry_served_from_cache() {
        let exchange = MockExchange::builder().with_price("BTCUSDT", 64_000.0).build();
        let c = cache();
        let now = Utc::now();

        assert_eq!(c.get_price_at(&exchange, "BTCUSDT", false, now), Some(64_000.0));
        // Exchange price changes, but the cached value is still within the
        // staleness horizon.
        exchange.set_price("BTCUSDT", 65_000.0);
        assert_eq!(c.get_price_at(&exchange, "BTCUSDT", false, now), Some(64_000.0));
    }

    #[test]
    fn force_refresh_bypasses_cache() {
        let exchange = MockExchange::builder().with_price("BTCUSDT", 64_000.0).build();
        let c = cache();
        let now = Utc::now();

        c.insert_at("BTCUSDT", 1.0, now);
        assert_eq!(c.get_price_at(&exchange, "BTCUSDT", true, now), Some(64_000.0));
    }

    #[test]
    fn stale_entry_triggers_refetch() {
        let exchange = MockExchange::builder().with_price("BTCUSDT", 65_000.0).build();
        let c = cache();
        let now = Utc::now();

        // 30s TTL → 60s stale threshold (floor).
        c.insert_at("BTCUSDT", 64_000.0, now - ChronoDuration::seconds(61));
        assert_eq!(c.get_price_at(&exchange, "BTCUSDT", false, now), Some(65_000.0));
    }

    #[test]
    fn fetch_failure_falls_back_to_stale_cache() {
        let exchange = MockExchange::builder().failing_price("BTCUSDT").build();
        let c = cache();
        let now = Utc::now();

        c.insert_at("BTCUSDT", 64_000.0, now - ChronoDuration::seconds(600));
        assert_eq!(c.get_price_at(&exchange, "BTCUSDT", false, now), Some(64_000.0));
    }

    #[test]
    fn fetch_failure_without_cache_is_soft() {
        let exchange = MockExchange::builder().failing_price("BTCUSDT").build();
        assert_eq!(cache().get_price(&exchange, "BTCUSDT", false), None);
    }

    #[test]
    fn symbol_key_is_uppercased() {
        let exchange = MockExchange::builder().with_price("BTCUSDT", 64_000.0).build();
        let c = cache();
        let now = Utc::now();
        assert_eq!(c.get_price_at(&exchange, "btcusdt", false, now), Some(64_000.0));
        assert_eq!(c.get_price_at(&exchange, "BTCUSDT", false, now), Some(64_000.0));
    }

    #[test]
    fn batch_isolates_per_symbol_failures() {
        let exchange = MockExchange::builder()
            .with_price("BTCUSDT", 64_000.0)
            .with_price("ETHUSDT", 3_000.0)
            .failing_price("SOLUSDT")
            .build();
        let c = cache();

        let symbols: Vec<String> = ["BTCUSDT", "ETHUSDT", "SOLUSDT"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (prices, missing) = c.get_prices(&exchange, &symbols, false);

        assert_eq!(prices.len(), 2);
        assert_eq!(prices["BTCUSDT"], 64_000.0);
        assert_eq!(missing, vec!["SOLUSDT".to_string()]);
    }

    #[test]
    fn stablecoins_priced_without_network() {
        // An exchange with no prices at all: stablecoins still resolve.
        let exchange = MockExchange::builder().build();
        let c = cache();
        assert_eq!(c.resolve_usd_price(&exchange, "USDT", false), Some(1.0));
        assert_eq!(c.resolve_usd_price(&exchange, "USDC", false), Some(1.0));
    }

    #[test]
    fn usd_resolution_tries_quote_variants() {
        let exchange = MockExchange::builder().with_price("BNBUSDC", 580.0).build();
        let c = cache();
        assert_eq!(c.resolve_usd_price(&exchange, "BNB", false), Some(580.0));
    }

    #[test]
    fn usd_resolution_falls_back_to_inverse_pair() {
        let exchange = MockExchange::builder().with_price("USDTEUR", 0.8).build();
        let c = cache();
        let price = c.resolve_usd_price(&exchange, "EUR", false).unwrap();
        assert!((price - 1.25).abs() < 1e-9);
    }

    #[test]
    fn unresolvable_asset_is_none() {
        let exchange = MockExchange::builder().build();
        assert_eq!(cache().resolve_usd_price(&exchange, "WAGMI", false), None);
    }
}
