//! Mock exchange for testing — implements [`ExchangeAdapter`] with
//! scriptable behavior.
//!
//! Use this in integration tests to simulate exchange responses without
//! network calls.
//!
//! ```ignore
//! use balancebot_exchange::mock::{MockExchange, PlaceMode};
//!
//! let exchange = MockExchange::builder()
//!     .with_price("BTCUSDT", 64_000.0)
//!     .with_balance("BTC", 0.5, 0.0)
//!     .with_balance("USDT", 10_000.0, 0.0)
//!     .build();
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::ExchangeAdapter;
use crate::error::ExchangeError;
use crate::types::*;

/// How the mock handles order placement.
#[derive(Clone, Debug)]
pub enum PlaceMode {
    /// Orders are accepted and appear in the open-orders set with status NEW.
    Accept,
    /// Placement fails with the given vendor code.
    RejectWithCode(i64),
    /// Placement fails with a connection error.
    ConnectionError,
}

/// A recorded placement for assertion in tests.
#[derive(Clone, Debug)]
pub struct RecordedPlacement {
    pub symbol: String,
    pub side: OrderSide,
    pub limit_price: f64,
    pub quantity: f64,
    pub client_order_id: String,
}

struct Inner {
    prices: HashMap<String, f64>,
    failing_prices: HashSet<String>,
    balances: Vec<Balance>,
    fail_balances: bool,
    fail_open_orders: bool,
    place_mode: PlaceMode,
    open: Vec<ExchangeOrder>,
    statuses: HashMap<String, ExchangeOrder>,
    status_error_codes: HashMap<String, i64>,
    placements: Vec<RecordedPlacement>,
    cancels: Vec<OrderLookup>,
    next_order_id: u64,
}

/// Builder for [`MockExchange`].
pub struct MockExchangeBuilder {
    inner: Inner,
}

impl MockExchangeBuilder {
    pub fn with_price(mut self, symbol: &str, price: f64) -> Self {
        self.inner.prices.insert(symbol.to_string(), price);
        self
    }

    /// Make price fetches for `symbol` fail with a connection error.
    pub fn failing_price(mut self, symbol: &str) -> Self {
        self.inner.failing_prices.insert(symbol.to_string());
        self
    }

    pub fn with_balance(mut self, asset: &str, free: f64, locked: f64) -> Self {
        self.inner.balances.push(Balance {
            asset: asset.to_string(),
            free,
            locked,
        });
        self
    }

    pub fn place_mode(mut self, mode: PlaceMode) -> Self {
        self.inner.place_mode = mode;
        self
    }

    /// Seed an exchange-side open order.
    pub fn with_open_order(mut self, order: ExchangeOrder) -> Self {
        self.inner.open.push(order);
        self
    }

    /// Script the response to a status query for one client order id.
    pub fn with_status(mut self, order: ExchangeOrder) -> Self {
        self.inner
            .statuses
            .insert(order.client_order_id.clone(), order);
        self
    }

    /// Script a vendor error code for status queries on one client order id.
    pub fn with_status_error(mut self, client_order_id: &str, code: i64) -> Self {
        self.inner
            .status_error_codes
            .insert(client_order_id.to_string(), code);
        self
    }

    pub fn build(self) -> MockExchange {
        MockExchange {
            inner: Mutex::new(self.inner),
        }
    }
}

/// A mock exchange that records placements/cancels and returns scripted
/// responses.
pub struct MockExchange {
    inner: Mutex<Inner>,
}

impl MockExchange {
    pub fn builder() -> MockExchangeBuilder {
        MockExchangeBuilder {
            inner: Inner {
                prices: HashMap::new(),
                failing_prices: HashSet::new(),
                balances: Vec::new(),
                fail_balances: false,
                fail_open_orders: false,
                place_mode: PlaceMode::Accept,
                open: Vec::new(),
                statuses: HashMap::new(),
                status_error_codes: HashMap::new(),
                placements: Vec::new(),
                cancels: Vec::new(),
                next_order_id: 1,
            },
        }
    }

    /// All placements submitted so far (for assertion in tests).
    pub fn placements(&self) -> Vec<RecordedPlacement> {
        self.inner.lock().unwrap().placements.clone()
    }

    /// All cancel requests issued so far.
    pub fn cancels(&self) -> Vec<OrderLookup> {
        self.inner.lock().unwrap().cancels.clone()
    }

    /// Update a price mid-scenario.
    pub fn set_price(&self, symbol: &str, price: f64) {
        self.inner
            .lock()
            .unwrap()
            .prices
            .insert(symbol.to_string(), price);
    }

    /// Make all balance fetches fail with a connection error.
    pub fn fail_balances(&self, fail: bool) {
        self.inner.lock().unwrap().fail_balances = fail;
    }

    /// Replace the scripted status for one client order id.
    pub fn set_status(&self, order: ExchangeOrder) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .statuses
            .insert(order.client_order_id.clone(), order);
    }

    /// Replace the exchange-side open-orders set.
    pub fn set_open_orders(&self, orders: Vec<ExchangeOrder>) {
        self.inner.lock().unwrap().open = orders;
    }

    fn matches(order: &ExchangeOrder, lookup: &OrderLookup) -> bool {
        match lookup {
            OrderLookup::ExchangeId(id) => order.exchange_order_id == *id,
            OrderLookup::ClientId(cid) => order.client_order_id == *cid,
        }
    }
}

/// Construct a bare exchange order for scripting mock responses.
pub fn scripted_order(
    symbol: &str,
    client_order_id: &str,
    side: OrderSide,
    status: ExchangeOrderStatus,
    limit_price: f64,
    qty: f64,
    filled_quote_amount: f64,
) -> ExchangeOrder {
    ExchangeOrder {
        exchange_order_id: format!("x-{client_order_id}"),
        client_order_id: client_order_id.to_string(),
        symbol: symbol.to_string(),
        side,
        status,
        limit_price,
        qty,
        executed_qty: if limit_price > 0.0 {
            filled_quote_amount / limit_price
        } else {
            0.0
        },
        quote_amount: limit_price * qty,
        filled_quote_amount,
        transact_time_ms: 1_700_000_000_000,
        reject_reason: None,
        raw: serde_json::json!({
            "symbol": symbol,
            "clientOrderId": client_order_id,
            "mock": true,
        }),
    }
}

impl ExchangeAdapter for MockExchange {
    fn ping(&self) -> Result<(), ExchangeError> {
        Ok(())
    }

    fn price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let inner = self.inner.lock().unwrap();
        if inner.failing_prices.contains(symbol) {
            return Err(ExchangeError::Connection(format!(
                "mock: price fetch failed for {symbol}"
            )));
        }
        inner
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::InvalidSymbol(symbol.to_string()))
    }

    fn balances(&self, _account: AccountType) -> Result<Vec<Balance>, ExchangeError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_balances {
            return Err(ExchangeError::Connection("mock: balances failed".into()));
        }
        Ok(inner.balances.clone())
    }

    fn place_limit_order(
        &self,
        _account: AccountType,
        symbol: &str,
        side: OrderSide,
        limit_price: f64,
        quantity: f64,
        client_order_id: &str,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.placements.push(RecordedPlacement {
            symbol: symbol.to_string(),
            side,
            limit_price,
            quantity,
            client_order_id: client_order_id.to_string(),
        });

        match inner.place_mode {
            PlaceMode::RejectWithCode(code) => {
                Err(ExchangeError::from_api_code(code, "mock: rejected"))
            }
            PlaceMode::ConnectionError => {
                Err(ExchangeError::Connection("mock: placement failed".into()))
            }
            PlaceMode::Accept => {
                let id = inner.next_order_id;
                inner.next_order_id += 1;
                let mut order = scripted_order(
                    symbol,
                    client_order_id,
                    side,
                    ExchangeOrderStatus::New,
                    limit_price,
                    quantity,
                    0.0,
                );
                order.exchange_order_id = id.to_string();
                inner.open.push(order.clone());
                Ok(order)
            }
        }
    }

    fn open_orders(
        &self,
        _account: AccountType,
        symbol: Option<&str>,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_open_orders {
            return Err(ExchangeError::Connection("mock: open orders failed".into()));
        }
        Ok(inner
            .open
            .iter()
            .filter(|o| symbol.is_none_or(|s| o.symbol == s))
            .cloned()
            .collect())
    }

    fn order_status(
        &self,
        _symbol: &str,
        lookup: &OrderLookup,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let inner = self.inner.lock().unwrap();

        if let OrderLookup::ClientId(cid) = lookup {
            if let Some(&code) = inner.status_error_codes.get(cid) {
                return Err(ExchangeError::from_api_code(code, "mock: scripted error"));
            }
            if let Some(order) = inner.statuses.get(cid) {
                return Ok(order.clone());
            }
        }

        inner
            .open
            .iter()
            .find(|o| Self::matches(o, lookup))
            .cloned()
            .ok_or_else(|| ExchangeError::OrderNotFound(format!("{lookup:?}")))
    }

    fn cancel_order(&self, _symbol: &str, lookup: &OrderLookup) -> Result<bool, ExchangeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.cancels.push(lookup.clone());

        let before = inner.open.len();
        inner.open.retain(|o| !Self::matches(o, lookup));
        if inner.open.len() == before {
            // Matches the vendor behavior for cancelling a closed order.
            return Err(ExchangeError::Api {
                code: -2011,
                message: "Unknown order sent.".into(),
            });
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_basic() {
        let exchange = MockExchange::builder()
            .with_price("BTCUSDT", 64_000.0)
            .with_balance("BTC", 0.5, 0.1)
            .build();

        assert_eq!(exchange.price("BTCUSDT").unwrap(), 64_000.0);
        assert!(exchange.price("ETHUSDT").is_err());

        let balances = exchange.balances(AccountType::Spot).unwrap();
        assert_eq!(balances.len(), 1);
        assert_eq!(balances[0].total(), 0.6);
    }

    #[test]
    fn placement_recorded_and_open() {
        let exchange = MockExchange::builder().build();
        let order = exchange
            .place_limit_order(
                AccountType::Spot,
                "BTCUSDT",
                OrderSide::Buy,
                63_000.0,
                0.01,
                "bb-1",
            )
            .unwrap();

        assert_eq!(order.status, ExchangeOrderStatus::New);
        assert_eq!(exchange.placements().len(), 1);
        let open = exchange.open_orders(AccountType::Spot, None).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].client_order_id, "bb-1");
    }

    #[test]
    fn cancel_removes_from_open() {
        let exchange = MockExchange::builder().build();
        exchange
            .place_limit_order(
                AccountType::Spot,
                "BTCUSDT",
                OrderSide::Buy,
                63_000.0,
                0.01,
                "bb-1",
            )
            .unwrap();

        let lookup = OrderLookup::ClientId("bb-1".into());
        assert!(exchange.cancel_order("BTCUSDT", &lookup).unwrap());
        assert!(exchange.open_orders(AccountType::Spot, None).unwrap().is_empty());

        // Second cancel reports "already closed".
        let err = exchange.cancel_order("BTCUSDT", &lookup).unwrap_err();
        assert!(err.means_already_closed());
    }

    #[test]
    fn scripted_status_error() {
        let exchange = MockExchange::builder()
            .with_status_error("bb-gone", -2013)
            .build();
        let err = exchange
            .order_status("BTCUSDT", &OrderLookup::ClientId("bb-gone".into()))
            .unwrap_err();
        assert!(err.means_not_found());
    }

    #[test]
    fn reject_mode() {
        let exchange = MockExchange::builder()
            .place_mode(PlaceMode::RejectWithCode(-2010))
            .build();
        let err = exchange
            .place_limit_order(
                AccountType::Spot,
                "BTCUSDT",
                OrderSide::Buy,
                63_000.0,
                0.01,
                "bb-1",
            )
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientBalance(_)));
    }
}
