//! Per-connector circuit breaker.
//!
//! Keyed by (exchange, testnet, account type). Opens after a number of
//! consecutive failures, then allows a single probe call once the cooldown
//! has elapsed. Bounds retry storms against a degraded or misconfigured
//! exchange connection.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;

#[derive(Debug, Default, Clone)]
struct BreakerState {
    failures: u32,
    last_failure: Option<DateTime<Utc>>,
    probe_issued: bool,
}

/// Failure-counting gate in front of exchange calls.
pub struct CircuitBreaker {
    threshold: u32,
    timeout_secs: i64,
    state: Mutex<FxHashMap<String, BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, timeout_secs: i64) -> Self {
        Self {
            threshold,
            timeout_secs,
            state: Mutex::new(FxHashMap::default()),
        }
    }

    /// Whether a call for `key` may proceed right now.
    pub fn should_attempt(&self, key: &str) -> bool {
        self.should_attempt_at(key, Utc::now())
    }

    /// Time-injected form of [`Self::should_attempt`].
    ///
    /// While open, the first call after the cooldown elapses is granted as a
    /// probe; further calls are blocked until the probe resolves via
    /// `record_success` or `record_failure`.
    pub fn should_attempt_at(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut map = self.state.lock().unwrap();
        let entry = map.entry(key.to_string()).or_default();

        if entry.failures < self.threshold {
            return true;
        }

        let Some(last) = entry.last_failure else {
            return true;
        };
        if (now - last).num_seconds() < self.timeout_secs {
            return false;
        }
        if entry.probe_issued {
            return false;
        }
        entry.probe_issued = true;
        true
    }

    /// Record a successful call: the failure count resets to zero.
    pub fn record_success(&self, key: &str) {
        let mut map = self.state.lock().unwrap();
        map.remove(key);
    }

    /// Record a failed call.
    pub fn record_failure(&self, key: &str) {
        self.record_failure_at(key, Utc::now());
    }

    /// Time-injected form of [`Self::record_failure`].
    pub fn record_failure_at(&self, key: &str, now: DateTime<Utc>) {
        let mut map = self.state.lock().unwrap();
        let entry = map.entry(key.to_string()).or_default();
        entry.failures += 1;
        entry.last_failure = Some(now);
        entry.probe_issued = false;
    }

    /// Current consecutive-failure count for `key`.
    pub fn failure_count(&self, key: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .get(key)
            .map(|s| s.failures)
            .unwrap_or(0)
    }

    /// True when `key` is currently blocking calls.
    pub fn is_open(&self, key: &str) -> bool {
        !self.should_attempt_at_peek(key, Utc::now())
    }

    // Peek variant that does not consume the probe.
    fn should_attempt_at_peek(&self, key: &str, now: DateTime<Utc>) -> bool {
        let map = self.state.lock().unwrap();
        let Some(entry) = map.get(key) else {
            return true;
        };
        if entry.failures < self.threshold {
            return true;
        }
        match entry.last_failure {
            Some(last) => (now - last).num_seconds() >= self.timeout_secs && !entry.probe_issued,
            None => true,
        }
    }
}
