//! Exchange adapter trait and implementations for balancebot.
//!
//! Provides a generic [`ExchangeAdapter`] trait that abstracts over spot
//! exchanges. Implementations:
//!
//! - **Binance** ([`binance::BinanceExchange`]): Binance spot REST API
//! - **Mock** ([`mock::MockExchange`]): scriptable in-memory adapter for tests

pub mod binance;
pub mod error;
pub mod mock;
pub mod types;

pub use error::ExchangeError;
pub use types::*;

/// A spot-exchange connection: price and balance lookup plus the order
/// lifecycle (place, status, cancel, open-orders listing).
///
/// All methods are blocking from the caller's perspective and may fail with
/// a typed [`ExchangeError`]. Adapters validate the account type (spot only)
/// and symbol format before dispatching anything over the wire.
pub trait ExchangeAdapter {
    /// Test connectivity.
    fn ping(&self) -> Result<(), ExchangeError>;

    /// Last price for a trading pair (e.g. "BTCUSDT").
    fn price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    /// Batch price lookup. The default implementation fetches sequentially,
    /// isolating per-symbol failures; adapters with a native batch endpoint
    /// override this.
    fn prices(&self, symbols: &[String]) -> Vec<(String, Result<f64, ExchangeError>)> {
        symbols
            .iter()
            .map(|s| (s.clone(), self.price(s)))
            .collect()
    }

    /// All non-zero asset balances for the account.
    fn balances(&self, account: AccountType) -> Result<Vec<Balance>, ExchangeError>;

    /// Place a limit GTC order. `quantity` is in base units; the returned
    /// order carries the exchange-assigned id and the echoed client id.
    fn place_limit_order(
        &self,
        account: AccountType,
        symbol: &str,
        side: OrderSide,
        limit_price: f64,
        quantity: f64,
        client_order_id: &str,
    ) -> Result<ExchangeOrder, ExchangeError>;

    /// All currently open orders, optionally restricted to one symbol.
    fn open_orders(
        &self,
        account: AccountType,
        symbol: Option<&str>,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError>;

    /// Current state of one order.
    fn order_status(
        &self,
        symbol: &str,
        lookup: &OrderLookup,
    ) -> Result<ExchangeOrder, ExchangeError>;

    /// Cancel an order. Returns `true` when the exchange acknowledged the
    /// cancel. "Already closed" is surfaced as a typed error so callers can
    /// treat it as success.
    fn cancel_order(&self, symbol: &str, lookup: &OrderLookup) -> Result<bool, ExchangeError>;
}
