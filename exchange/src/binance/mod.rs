//! Binance spot adapter.

pub mod auth;
pub mod client;
pub mod types;

use crate::ExchangeAdapter;
use crate::error::ExchangeError;
use crate::types::*;
use client::BinanceClient;
use types::OrderPayload;

/// Binance spot exchange implementing [`ExchangeAdapter`].
///
/// Uses the REST API for all operations. Blocking (sync) via
/// `reqwest::blocking`.
pub struct BinanceExchange {
    client: BinanceClient,
}

impl BinanceExchange {
    /// Create an adapter for the given credentials. `testnet` selects the
    /// testnet.binance.vision base URL.
    pub fn new(api_key: &str, secret_key: &str, testnet: bool) -> Self {
        Self {
            client: BinanceClient::new(api_key, secret_key, testnet),
        }
    }

    fn require_spot(account: AccountType) -> Result<(), ExchangeError> {
        match account {
            AccountType::Spot => Ok(()),
            other => Err(ExchangeError::FeatureNotEnabled(format!(
                "{other} trading is not supported"
            ))),
        }
    }

    /// Parse a Binance decimal string ("0.00125000"). Empty strings (absent
    /// optional fields) parse as zero; anything else malformed is an error.
    fn parse_amount(s: &str) -> Result<f64, ExchangeError> {
        if s.is_empty() {
            return Ok(0.0);
        }
        s.parse::<f64>()
            .map_err(|_| ExchangeError::Connection(format!("unparseable amount: {s:?}")))
    }

    /// Convert a raw order payload into the adapter-neutral representation,
    /// retaining the raw body for diagnostics.
    fn to_exchange_order(raw: serde_json::Value) -> Result<ExchangeOrder, ExchangeError> {
        let payload: OrderPayload = serde_json::from_value(raw.clone())
            .map_err(|e| ExchangeError::Connection(format!("failed to parse order: {e}")))?;

        let side = match payload.side.as_str() {
            "BUY" => OrderSide::Buy,
            "SELL" => OrderSide::Sell,
            other => {
                return Err(ExchangeError::InvalidOrder(format!(
                    "unrecognized side: {other}"
                )));
            }
        };

        let status = ExchangeOrderStatus::parse(&payload.status)?;
        let limit_price = Self::parse_amount(&payload.price)?;
        let qty = Self::parse_amount(&payload.orig_qty)?;
        let executed_qty = Self::parse_amount(&payload.executed_qty)?;
        let filled_quote_amount = Self::parse_amount(&payload.cummulative_quote_qty)?;
        let transact_time_ms = payload
            .transact_time
            .or(payload.update_time)
            .or(payload.time)
            .unwrap_or(0);

        Ok(ExchangeOrder {
            exchange_order_id: payload.order_id.to_string(),
            client_order_id: payload.client_order_id,
            symbol: payload.symbol,
            side,
            status,
            limit_price,
            qty,
            executed_qty,
            quote_amount: limit_price * qty,
            filled_quote_amount,
            transact_time_ms,
            reject_reason: None,
            raw,
        })
    }

    fn lookup_params(lookup: &OrderLookup) -> (Option<&str>, Option<&str>) {
        match lookup {
            OrderLookup::ExchangeId(id) => (Some(id.as_str()), None),
            OrderLookup::ClientId(cid) => (None, Some(cid.as_str())),
        }
    }
}

impl ExchangeAdapter for BinanceExchange {
    fn ping(&self) -> Result<(), ExchangeError> {
        self.client.ping()
    }

    fn price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        validate_symbol(symbol)?;
        let ticker = self.client.ticker_price(symbol)?;
        Self::parse_amount(&ticker.price)
    }

    fn balances(&self, account: AccountType) -> Result<Vec<Balance>, ExchangeError> {
        Self::require_spot(account)?;
        let info = self.client.account_info()?;

        let balances = info
            .balances
            .iter()
            .filter_map(|b| {
                let free: f64 = b.free.parse().unwrap_or(0.0);
                let locked: f64 = b.locked.parse().unwrap_or(0.0);
                if free + locked <= 0.0 {
                    return None;
                }
                Some(Balance {
                    asset: b.asset.clone(),
                    free,
                    locked,
                })
            })
            .collect();

        Ok(balances)
    }

    fn place_limit_order(
        &self,
        account: AccountType,
        symbol: &str,
        side: OrderSide,
        limit_price: f64,
        quantity: f64,
        client_order_id: &str,
    ) -> Result<ExchangeOrder, ExchangeError> {
        Self::require_spot(account)?;
        validate_symbol(symbol)?;
        if !(limit_price > 0.0) {
            return Err(ExchangeError::InvalidOrder(format!(
                "limit price must be positive, got {limit_price}"
            )));
        }
        if !(quantity > 0.0) {
            return Err(ExchangeError::InvalidOrder(format!(
                "quantity must be positive, got {quantity}"
            )));
        }

        let raw = self.client.place_limit_order(
            symbol,
            side.as_str(),
            &format!("{quantity:.8}"),
            &format!("{limit_price:.8}"),
            client_order_id,
        )?;
        Self::to_exchange_order(raw)
    }

    fn open_orders(
        &self,
        account: AccountType,
        symbol: Option<&str>,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        Self::require_spot(account)?;
        if let Some(s) = symbol {
            validate_symbol(s)?;
        }

        let raw = self.client.open_orders(symbol)?;
        let entries = raw
            .as_array()
            .ok_or_else(|| {
                ExchangeError::Connection("openOrders response is not an array".into())
            })?
            .clone();

        entries.into_iter().map(Self::to_exchange_order).collect()
    }

    fn order_status(
        &self,
        symbol: &str,
        lookup: &OrderLookup,
    ) -> Result<ExchangeOrder, ExchangeError> {
        validate_symbol(symbol)?;
        let (id, cid) = Self::lookup_params(lookup);
        let raw = self.client.query_order(symbol, id, cid)?;
        Self::to_exchange_order(raw)
    }

    fn cancel_order(&self, symbol: &str, lookup: &OrderLookup) -> Result<bool, ExchangeError> {
        validate_symbol(symbol)?;
        let (id, cid) = Self::lookup_params(lookup);
        self.client.cancel_order(symbol, id, cid)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_payload_conversion() {
        let raw = serde_json::json!({
            "symbol": "BTCUSDT",
            "orderId": 28,
            "clientOrderId": "bb-abc123",
            "status": "PARTIALLY_FILLED",
            "side": "BUY",
            "price": "64000.00000000",
            "origQty": "0.01000000",
            "executedQty": "0.00400000",
            "cummulativeQuoteQty": "256.00000000",
            "transactTime": 1_700_000_000_000u64
        });

        let order = BinanceExchange::to_exchange_order(raw.clone()).unwrap();
        assert_eq!(order.exchange_order_id, "28");
        assert_eq!(order.client_order_id, "bb-abc123");
        assert_eq!(order.side, OrderSide::Buy);
        assert_eq!(order.status, ExchangeOrderStatus::PartiallyFilled);
        assert_eq!(order.limit_price, 64000.0);
        assert_eq!(order.quote_amount, 640.0);
        assert_eq!(order.filled_quote_amount, 256.0);
        assert_eq!(order.raw, raw);
    }

    #[test]
    fn missing_amount_fields_default_to_zero() {
        let raw = serde_json::json!({
            "symbol": "ETHUSDT",
            "orderId": 7,
            "clientOrderId": "bb-xyz",
            "status": "NEW",
            "side": "SELL"
        });
        let order = BinanceExchange::to_exchange_order(raw).unwrap();
        assert_eq!(order.qty, 0.0);
        assert_eq!(order.filled_quote_amount, 0.0);
        assert_eq!(order.transact_time_ms, 0);
    }

    #[test]
    fn non_spot_account_not_enabled() {
        assert!(matches!(
            BinanceExchange::require_spot(AccountType::Margin),
            Err(ExchangeError::FeatureNotEnabled(_))
        ));
        assert!(BinanceExchange::require_spot(AccountType::Spot).is_ok());
    }

    #[test]
    fn bad_side_rejected() {
        let raw = serde_json::json!({
            "symbol": "ETHUSDT",
            "orderId": 7,
            "clientOrderId": "bb-xyz",
            "status": "NEW",
            "side": "HOLD"
        });
        assert!(BinanceExchange::to_exchange_order(raw).is_err());
    }
}
