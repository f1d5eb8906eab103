//! Decision observers and the violation logger.

use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

use super::decision::CheckOutcome;
use super::key::RequestInfo;
use crate::config::LoggingConfig;

/// Tracing target for violation records.
pub const VIOLATION_TARGET: &str = "ratekeeper::violations";

/// Observes each decision after it has been made.
///
/// Observers run synchronously on the request path but cannot change the
/// decision; a panicking observer is contained by the limiter.
pub trait DecisionObserver: Send + Sync {
    fn observe(&self, outcome: &CheckOutcome, request: &RequestInfo);
}

/// Logs denials and allowed requests that are close to the limit.
#[derive(Debug)]
pub struct ViolationLogger {
    hash_keys: bool,
    warning_ratio: f64,
    denials: AtomicU64,
    warnings: AtomicU64,
}

impl ViolationLogger {
    pub fn new(config: &LoggingConfig) -> Self {
        Self {
            hash_keys: config.hash_keys,
            warning_ratio: config.warning_ratio,
            denials: AtomicU64::new(0),
            warnings: AtomicU64::new(0),
        }
    }

    /// Denials logged so far.
    pub fn denials(&self) -> u64 {
        self.denials.load(Ordering::Relaxed)
    }

    /// Near-limit warnings logged so far.
    pub fn warnings(&self) -> u64 {
        self.warnings.load(Ordering::Relaxed)
    }

    /// Remaining-count at or below which an allowed request is near the limit.
    pub fn warning_threshold(&self, limit: u64) -> u64 {
        (limit as f64 * self.warning_ratio).ceil() as u64
    }

    fn key_field(&self, outcome: &CheckOutcome) -> String {
        if self.hash_keys {
            outcome.key.hashed()
        } else {
            outcome.key.to_string()
        }
    }
}

impl Default for ViolationLogger {
    fn default() -> Self {
        Self::new(&LoggingConfig::default())
    }
}

impl DecisionObserver for ViolationLogger {
    fn observe(&self, outcome: &CheckOutcome, request: &RequestInfo) {
        let decision = &outcome.decision;

        if !decision.allowed {
            self.denials.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: VIOLATION_TARGET,
                key = %self.key_field(outcome),
                policy = %outcome.class,
                method = %request.method,
                path = %request.path,
                user_agent = request.user_agent().unwrap_or("-"),
                limit = decision.limit,
                current = decision.current,
                reset_time = %decision.reset_time_iso(),
                timestamp = %iso(outcome.now_ms),
                "Rate limit exceeded"
            );
            return;
        }

        if decision.remaining <= self.warning_threshold(decision.limit) {
            self.warnings.fetch_add(1, Ordering::Relaxed);
            info!(
                target: VIOLATION_TARGET,
                key = %self.key_field(outcome),
                policy = %outcome.class,
                limit = decision.limit,
                remaining = decision.remaining,
                "Approaching rate limit"
            );
        }
    }
}

fn iso(ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms as i64)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}
