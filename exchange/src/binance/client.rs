//! Binance REST API client.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::debug;
use reqwest::blocking::Client;
use zeroize::Zeroizing;

use super::auth;
use super::types::{AccountInfo, ApiErrorBody, TickerPrice};
use crate::error::ExchangeError;

/// HTTP verb for a signed request.
#[derive(Debug, Clone, Copy)]
pub enum Verb {
    Get,
    Post,
    Delete,
}

/// Blocking Binance REST client.
pub struct BinanceClient {
    client: Client,
    api_key: String,
    secret_key: Zeroizing<String>,
    base_url: String,
}

impl BinanceClient {
    /// Create a new Binance client.
    pub fn new(api_key: &str, secret_key: &str, testnet: bool) -> Self {
        let base_url = if testnet {
            "https://testnet.binance.vision"
        } else {
            "https://api.binance.com"
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key: api_key.to_string(),
            secret_key: Zeroizing::new(secret_key.to_string()),
            base_url: base_url.to_string(),
        }
    }

    /// Test connectivity (GET /api/v3/ping).
    pub fn ping(&self) -> Result<(), ExchangeError> {
        let url = format!("{}/api/v3/ping", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .map_err(|e| ExchangeError::Connection(format!("ping failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(ExchangeError::Connection(format!(
                "ping returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Last price for a symbol (GET /api/v3/ticker/price). Public endpoint.
    pub fn ticker_price(&self, symbol: &str) -> Result<TickerPrice, ExchangeError> {
        let url = format!("{}/api/v3/ticker/price?symbol={symbol}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .map_err(|e| ExchangeError::Connection(format!("ticker request failed: {e}")))?;

        let value = Self::check(resp)?;
        serde_json::from_value(value)
            .map_err(|e| ExchangeError::Connection(format!("failed to parse ticker: {e}")))
    }

    /// Account information including balances (GET /api/v3/account, signed).
    pub fn account_info(&self) -> Result<AccountInfo, ExchangeError> {
        let value = self.signed_request(Verb::Get, "/api/v3/account", &[])?;
        serde_json::from_value(value)
            .map_err(|e| ExchangeError::Connection(format!("failed to parse account: {e}")))
    }

    /// Place a limit GTC order (POST /api/v3/order, signed).
    pub fn place_limit_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: &str,
        price: &str,
        client_order_id: &str,
    ) -> Result<serde_json::Value, ExchangeError> {
        debug!("placing order: {symbol} {side} {quantity} @ {price} ({client_order_id})");
        self.signed_request(
            Verb::Post,
            "/api/v3/order",
            &[
                ("symbol", symbol.to_string()),
                ("side", side.to_string()),
                ("type", "LIMIT".to_string()),
                ("timeInForce", "GTC".to_string()),
                ("quantity", quantity.to_string()),
                ("price", price.to_string()),
                ("newClientOrderId", client_order_id.to_string()),
            ],
        )
    }

    /// Query one order by exchange id or client id (GET /api/v3/order, signed).
    pub fn query_order(
        &self,
        symbol: &str,
        order_id: Option<&str>,
        client_order_id: Option<&str>,
    ) -> Result<serde_json::Value, ExchangeError> {
        let mut params = vec![("symbol", symbol.to_string())];
        if let Some(id) = order_id {
            params.push(("orderId", id.to_string()));
        }
        if let Some(cid) = client_order_id {
            params.push(("origClientOrderId", cid.to_string()));
        }
        self.signed_request(Verb::Get, "/api/v3/order", &params)
    }

    /// Cancel one order (DELETE /api/v3/order, signed).
    pub fn cancel_order(
        &self,
        symbol: &str,
        order_id: Option<&str>,
        client_order_id: Option<&str>,
    ) -> Result<serde_json::Value, ExchangeError> {
        let mut params = vec![("symbol", symbol.to_string())];
        if let Some(id) = order_id {
            params.push(("orderId", id.to_string()));
        }
        if let Some(cid) = client_order_id {
            params.push(("origClientOrderId", cid.to_string()));
        }
        self.signed_request(Verb::Delete, "/api/v3/order", &params)
    }

    /// All open orders, optionally for one symbol (GET /api/v3/openOrders,
    /// signed). The symbol-less form is weight-expensive on Binance; callers
    /// issue it at most once per reconciliation sweep.
    pub fn open_orders(&self, symbol: Option<&str>) -> Result<serde_json::Value, ExchangeError> {
        let params: Vec<(&str, String)> = match symbol {
            Some(s) => vec![("symbol", s.to_string())],
            None => Vec::new(),
        };
        self.signed_request(Verb::Get, "/api/v3/openOrders", &params)
    }

    /// Issue a signed request and return the parsed JSON body.
    fn signed_request(
        &self,
        verb: Verb,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value, ExchangeError> {
        let mut query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("timestamp={}", current_timestamp_ms()));

        let signature = auth::sign(&query, &self.secret_key);
        let url = format!("{}{path}?{query}&signature={signature}", self.base_url);

        let req = match verb {
            Verb::Get => self.client.get(&url),
            Verb::Post => self.client.post(&url),
            Verb::Delete => self.client.delete(&url),
        };

        let resp = req
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .map_err(|e| ExchangeError::Connection(format!("request to {path} failed: {e}")))?;

        Self::check(resp)
    }

    /// Map a response to JSON, converting vendor error bodies to the
    /// taxonomy. HTTP 418/429 mean throttling regardless of body.
    fn check(resp: reqwest::blocking::Response) -> Result<serde_json::Value, ExchangeError> {
        let status = resp.status();
        if status.as_u16() == 429 || status.as_u16() == 418 {
            return Err(ExchangeError::RateLimit);
        }

        let body = resp
            .text()
            .map_err(|e| ExchangeError::Connection(format!("failed to read body: {e}")))?;

        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<ApiErrorBody>(&body) {
                return Err(ExchangeError::from_api_code(err.code, err.msg));
            }
            return Err(ExchangeError::Connection(format!(
                "request returned {status}: {body}"
            )));
        }

        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Connection(format!("failed to parse response: {e}")))
    }
}

/// Current timestamp in milliseconds.
fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
