//! Exchange error taxonomy.
//!
//! Vendor-specific failure codes are normalized here so the engine can make
//! terminal-vs-retry decisions without pattern-matching raw response text.

/// Errors that can occur during exchange operations.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// Account type or exchange feature the adapter does not support.
    #[error("feature not enabled: {0}")]
    FeatureNotEnabled(String),

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    /// Bad side, price, or amount detected before dispatch.
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    /// Network or transport failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// The exchange rejected the request; carries the vendor code.
    #[error("exchange API error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("rate limit exceeded")]
    RateLimit,

    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("authentication error: {0}")]
    Auth(String),
}

impl ExchangeError {
    /// Classify a vendor error body into the taxonomy.
    ///
    /// Codes follow the Binance convention: -1003 rate limit, -1022 bad
    /// signature, -2010 insufficient balance / rejected placement, -2013
    /// order does not exist, -2014/-2015 bad or unauthorized API key.
    pub fn from_api_code(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            -1003 => ExchangeError::RateLimit,
            -1022 | -2014 | -2015 => ExchangeError::Auth(message),
            -2010 => ExchangeError::InsufficientBalance(message),
            -2013 => ExchangeError::OrderNotFound(message),
            _ => ExchangeError::Api { code, message },
        }
    }

    /// True for failures worth retrying (network, throttling).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Connection(_) | ExchangeError::RateLimit
        )
    }

    /// A cancel bounced because the order is already closed on the exchange
    /// (Binance -2011 "Unknown order sent").
    pub fn means_already_closed(&self) -> bool {
        matches!(self, ExchangeError::Api { code: -2011, .. })
    }

    /// The exchange has no record of the order (yet). Not fatal: a freshly
    /// placed order can lag the query endpoints.
    pub fn means_not_found(&self) -> bool {
        matches!(self, ExchangeError::OrderNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_code_classification() {
        assert!(matches!(
            ExchangeError::from_api_code(-1003, "too many requests"),
            ExchangeError::RateLimit
        ));
        assert!(matches!(
            ExchangeError::from_api_code(-2010, "insufficient balance"),
            ExchangeError::InsufficientBalance(_)
        ));
        assert!(matches!(
            ExchangeError::from_api_code(-2013, "order does not exist"),
            ExchangeError::OrderNotFound(_)
        ));
        assert!(matches!(
            ExchangeError::from_api_code(-1021, "timestamp outside recvWindow"),
            ExchangeError::Api { code: -1021, .. }
        ));
    }

    #[test]
    fn credential_codes_map_to_auth() {
        for code in [-1022, -2014, -2015] {
            assert!(matches!(
                ExchangeError::from_api_code(code, "bad key or signature"),
                ExchangeError::Auth(_)
            ));
        }
    }

    #[test]
    fn already_closed_detection() {
        let err = ExchangeError::from_api_code(-2011, "Unknown order sent.");
        assert!(err.means_already_closed());
        assert!(!err.means_not_found());
    }

    #[test]
    fn transient_detection() {
        assert!(ExchangeError::RateLimit.is_transient());
        assert!(ExchangeError::Connection("timeout".into()).is_transient());
        assert!(!ExchangeError::InvalidSymbol("??".into()).is_transient());
    }
}
