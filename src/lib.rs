//! balancebot: crypto portfolio auto-rebalancing engine.
//!
//! Keeps a spot portfolio at target allocations: values the account,
//! diffs it against a strategy's target percentages, and places capped
//! limit orders on the drifted legs. A periodic tick engine does the
//! trading; a separate reconciler polls exchange order state back into
//! the local store. Exchange access goes through the adapter trait in
//! `balancebot-exchange`.

pub mod app;
pub mod audit;
pub mod breaker;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod normalize;
pub mod planner;
pub mod pricing;
pub mod reconcile;
pub mod store;
pub mod valuation;

pub use error::{Error, Result};
