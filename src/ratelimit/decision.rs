//! Rate limit decisions.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use super::key::CounterKey;
use super::policy::RouteClass;

/// The result of recording one request against a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The limit that was applied
    pub limit: u64,
    /// Requests counted in the window, including this one when granted
    pub current: u64,
    /// `max(0, limit - current)`
    pub remaining: u64,
    /// When the counter next frees capacity, in unix milliseconds
    #[serde(rename = "resetTime")]
    pub reset_time_ms: u64,
}

impl Decision {
    pub fn new(allowed: bool, limit: u64, current: u64, reset_time_ms: u64) -> Self {
        Self {
            allowed,
            limit,
            current,
            remaining: limit.saturating_sub(current),
            reset_time_ms,
        }
    }

    /// An allowing decision used when the limiter cannot decide reliably.
    pub fn fail_open(limit: u64, now_ms: u64, window_ms: u64) -> Self {
        Self::new(true, limit, 0, now_ms.saturating_add(window_ms))
    }

    /// Seconds until the reset, rounded up.
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        self.reset_time_ms.saturating_sub(now_ms).div_ceil(1000)
    }

    /// Reset time as unix seconds, rounded up.
    pub fn reset_unix_secs(&self) -> u64 {
        self.reset_time_ms.div_ceil(1000)
    }

    /// Reset time as an ISO-8601 UTC string with millisecond precision.
    pub fn reset_time_iso(&self) -> String {
        DateTime::<Utc>::from_timestamp_millis(self.reset_time_ms as i64)
            .unwrap_or_default()
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// A decision together with the context it was made in.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub decision: Decision,
    /// Route class whose policy was applied
    pub class: RouteClass,
    /// Counter key the request was recorded under
    pub key: CounterKey,
    /// Denial message configured on the policy
    pub message: String,
    /// Seconds a denied client should wait; `None` when allowed
    pub retry_after_secs: Option<u64>,
    /// Evaluation time in unix milliseconds
    pub now_ms: u64,
    /// True when the decision was forced open by an internal fault
    pub failed_open: bool,
}

impl CheckOutcome {
    pub fn allowed(&self) -> bool {
        self.decision.allowed
    }
}
