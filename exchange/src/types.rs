//! Shared adapter types: account, sides, balances, exchange-side orders.

use serde::{Deserialize, Serialize};

use crate::error::ExchangeError;

/// Exchange account type. Only spot trading is supported; adapters reject
/// anything else with [`ExchangeError::FeatureNotEnabled`] before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Spot,
    Margin,
}

impl std::fmt::Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountType::Spot => write!(f, "spot"),
            AccountType::Margin => write!(f, "margin"),
        }
    }
}

/// Buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Vendor wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One asset balance on the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Balance {
    pub asset: String,
    pub free: f64,
    pub locked: f64,
}

impl Balance {
    pub fn total(&self) -> f64 {
        self.free + self.locked
    }
}

/// Exchange-reported order lifecycle status, normalized across vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeOrderStatus {
    /// Accepted by the exchange, not expected to have fills yet.
    New,
    /// Working on the book.
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

impl ExchangeOrderStatus {
    /// Parse a vendor status string. Unknown strings are an adapter bug
    /// surfaced as an error, not silently mapped.
    pub fn parse(s: &str) -> Result<Self, ExchangeError> {
        match s {
            "NEW" => Ok(ExchangeOrderStatus::New),
            "OPEN" => Ok(ExchangeOrderStatus::Open),
            "PARTIALLY_FILLED" => Ok(ExchangeOrderStatus::PartiallyFilled),
            "FILLED" => Ok(ExchangeOrderStatus::Filled),
            "CANCELED" => Ok(ExchangeOrderStatus::Canceled),
            "EXPIRED" => Ok(ExchangeOrderStatus::Expired),
            "REJECTED" => Ok(ExchangeOrderStatus::Rejected),
            other => Err(ExchangeError::Api {
                code: 0,
                message: format!("unrecognized order status: {other}"),
            }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExchangeOrderStatus::Filled
                | ExchangeOrderStatus::Canceled
                | ExchangeOrderStatus::Expired
                | ExchangeOrderStatus::Rejected
        )
    }
}

/// Exchange-side view of an order, as returned by placement, status, and
/// open-orders endpoints. Amounts are denominated in both base (`qty`) and
/// quote (`quote_amount`) terms; the raw vendor response is retained for
/// diagnostics.
#[derive(Debug, Clone)]
pub struct ExchangeOrder {
    pub exchange_order_id: String,
    pub client_order_id: String,
    /// Trading pair, e.g. "BTCUSDT".
    pub symbol: String,
    pub side: OrderSide,
    pub status: ExchangeOrderStatus,
    pub limit_price: f64,
    /// Original order quantity in base units.
    pub qty: f64,
    /// Executed quantity in base units.
    pub executed_qty: f64,
    /// Original order value in quote units (price × qty).
    pub quote_amount: f64,
    /// Cumulative filled value in quote units.
    pub filled_quote_amount: f64,
    /// Exchange timestamp in epoch milliseconds.
    pub transact_time_ms: u64,
    /// Rejection reason, when the exchange supplies one.
    pub reject_reason: Option<String>,
    /// Raw vendor response body.
    pub raw: serde_json::Value,
}

/// How to address an order on the exchange: by its exchange-assigned id or
/// by the client-assigned idempotency id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderLookup {
    ExchangeId(String),
    ClientId(String),
}

/// Validate a trading-pair symbol before dispatch: uppercase alphanumeric,
/// plausible length. Adapters call this on every symbol-taking method.
pub fn validate_symbol(symbol: &str) -> Result<(), ExchangeError> {
    let ok = (5..=20).contains(&symbol.len())
        && symbol
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
    if ok {
        Ok(())
    } else {
        Err(ExchangeError::InvalidSymbol(symbol.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parse_known() {
        assert_eq!(
            ExchangeOrderStatus::parse("PARTIALLY_FILLED").unwrap(),
            ExchangeOrderStatus::PartiallyFilled
        );
        assert_eq!(
            ExchangeOrderStatus::parse("CANCELED").unwrap(),
            ExchangeOrderStatus::Canceled
        );
    }

    #[test]
    fn status_parse_unknown_is_error() {
        assert!(ExchangeOrderStatus::parse("PENDING_CANCEL_MAYBE").is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(ExchangeOrderStatus::Filled.is_terminal());
        assert!(ExchangeOrderStatus::Expired.is_terminal());
        assert!(!ExchangeOrderStatus::Open.is_terminal());
        assert!(!ExchangeOrderStatus::New.is_terminal());
    }

    #[test]
    fn symbol_validation() {
        assert!(validate_symbol("BTCUSDT").is_ok());
        assert!(validate_symbol("1INCHUSDT").is_ok());
        assert!(validate_symbol("btcusdt").is_err());
        assert!(validate_symbol("BTC").is_err());
        assert!(validate_symbol("BTC-USDT").is_err());
    }

    #[test]
    fn balance_total() {
        let b = Balance {
            asset: "BTC".into(),
            free: 0.5,
            locked: 0.25,
        };
        assert_eq!(b.total(), 0.75);
    }
}
