//! Error types for the rebalancing engine.

use std::path::PathBuf;

use balancebot_exchange::ExchangeError;

/// All errors that can occur during engine operation.
///
/// The first four variants are the stable caller-facing codes: consumers of
/// the engine (CLI, API surface) see these, never raw exchange error text.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connector has no usable exchange account.
    #[error("no exchange account")]
    NoExchangeAccount,

    /// The connector has no active strategy.
    #[error("no active strategy")]
    NoActiveStrategy,

    /// Pricing could not be computed (exchange down, breaker open, or a
    /// required universe price missing). Expected outcome, not exceptional.
    #[error("pricing unavailable")]
    PricingUnavailable,

    /// A per-connector cooldown suppressed the recomputation.
    #[error("too many requests")]
    TooManyRequests,

    /// The portfolio state is too old to trade on.
    #[error("portfolio state is stale ({age_secs}s old)")]
    StaleState { age_secs: i64 },

    /// Non-positive tick size or lot size.
    #[error("invalid exchange filter: {0}")]
    InvalidFilter(String),

    /// An order state transition the state machine forbids.
    #[error("invalid order transition: {0}")]
    InvalidTransition(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("strategy error: {0}")]
    Strategy(String),

    #[error("failed to read strategy file {path}: {source}")]
    StrategyRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse strategy JSON: {0}")]
    StrategyParse(#[from] serde_json::Error),

    /// Internal passthrough for adapter failures. Logged with context at the
    /// failure site; converted to `PricingUnavailable` or counted before
    /// crossing the stable contract.
    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("execution aborted: {0}")]
    Aborted(String),

    #[error("audit log error: {0}")]
    Audit(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
