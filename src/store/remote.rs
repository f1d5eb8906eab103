//! Sliding-log counter store backed by a shared command service.
//!
//! Each key holds a sorted set of `(timestamp, nonce)` members, one per
//! granted request still inside the trailing window. The set is trimmed,
//! counted and conditionally extended in a single round trip, and the key
//! carries a TTL so abandoned sets expire on their own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::transport::{command, Command, CommandTransport, HttpCommandTransport};
use super::{CounterStore, StoreError};
use crate::ratelimit::{CounterKey, Decision};

/// Trim, count, conditionally add and refresh the TTL atomically.
///
/// Returns `{allowed, current, oldest_score}`; nothing is added on denial.
pub(crate) const SLIDING_LOG_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]
local ttl = tonumber(ARGV[5])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local current = redis.call('ZCARD', key)
local allowed = 0
if current < limit then
  redis.call('ZADD', key, now, member)
  redis.call('EXPIRE', key, ttl)
  current = current + 1
  allowed = 1
end

local oldest = now
local first = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if first[2] then
  oldest = tonumber(first[2])
end
return {allowed, current, oldest}
"#;

/// How the check is issued against the backing service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteMode {
    /// One server-side script; fully atomic.
    #[default]
    Script,
    /// Plain pipelined commands with a compensating removal on denial.
    /// Entries are added before counting, so concurrent checks at the
    /// boundary can both be denied while a slot is still free; they never
    /// admit more than the limit.
    Pipeline,
}

/// Connection settings for the shared store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the REST command endpoint
    #[serde(default)]
    pub url: Option<String>,

    /// Bearer token for the endpoint
    #[serde(default)]
    pub token: Option<String>,

    /// Upper bound on one check's round trip, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub mode: RemoteMode,

    /// Namespace for keys in the shared store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            timeout_ms: default_timeout_ms(),
            mode: RemoteMode::default(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    1500
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

impl RemoteConfig {
    /// Endpoint and token, when both are present and non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        let url = self.url.as_deref().filter(|u| !u.trim().is_empty())?;
        let token = self.token.as_deref().filter(|t| !t.trim().is_empty())?;
        Some((url, token))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Exact sliding-log counters in a shared store.
pub struct RemoteAtomicStore {
    transport: Arc<dyn CommandTransport>,
    mode: RemoteMode,
    timeout: Duration,
    key_prefix: String,
}

impl RemoteAtomicStore {
    pub fn new(transport: Arc<dyn CommandTransport>, mode: RemoteMode, timeout: Duration) -> Self {
        Self {
            transport,
            mode,
            timeout,
            key_prefix: default_key_prefix(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Build an HTTP-backed store. Fails when credentials are missing.
    pub fn from_config(config: &RemoteConfig) -> Result<Self, StoreError> {
        let (url, token) = config
            .credentials()
            .ok_or_else(|| StoreError::Unavailable("remote store not configured".into()))?;
        let transport = HttpCommandTransport::new(url, token, config.timeout())?;

        Ok(Self::new(Arc::new(transport), config.mode, config.timeout())
            .with_key_prefix(config.key_prefix.clone()))
    }

    pub fn mode(&self) -> RemoteMode {
        self.mode
    }

    fn store_key(&self, key: &CounterKey) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }

    /// One round trip, bounded by the store timeout. No retries.
    async fn execute(&self, commands: &[Command]) -> Result<Vec<Value>, StoreError> {
        match tokio::time::timeout(self.timeout, self.transport.execute(commands)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    async fn check_script(
        &self,
        key: &str,
        window_ms: u64,
        limit: u64,
        now_ms: u64,
        member: &str,
    ) -> Result<Decision, StoreError> {
        let commands = vec![command!(
            "EVAL",
            SLIDING_LOG_SCRIPT,
            1,
            key,
            now_ms,
            window_ms,
            limit,
            member,
            ttl_secs(window_ms)
        )];

        let results = self.execute(&commands).await?;
        let reply = match results.first() {
            Some(Value::Array(items)) if items.len() == 3 => items,
            other => {
                return Err(StoreError::Protocol(format!(
                    "unexpected script reply: {:?}",
                    other
                )))
            }
        };

        let allowed = as_u64(&reply[0])? == 1;
        let current = as_u64(&reply[1])?;
        let oldest = as_u64(&reply[2])?;

        Ok(Decision::new(
            allowed,
            limit,
            current,
            reset_time(oldest, window_ms, now_ms),
        ))
    }

    async fn check_pipeline(
        &self,
        key: &str,
        window_ms: u64,
        limit: u64,
        now_ms: u64,
        member: &str,
    ) -> Result<Decision, StoreError> {
        let commands = vec![
            command!("ZREMRANGEBYSCORE", key, "-inf", cutoff(now_ms, window_ms)),
            command!("ZADD", key, now_ms, member),
            command!("ZCARD", key),
            command!("EXPIRE", key, ttl_secs(window_ms)),
            command!("ZRANGE", key, 0, 0, "WITHSCORES"),
        ];

        let results = self.execute(&commands).await?;
        let card = as_u64(results.get(2).unwrap_or(&Value::Null))?;
        let oldest = match results.get(4) {
            Some(Value::Array(pair)) if pair.len() == 2 => as_u64(&pair[1])?,
            _ => now_ms,
        };
        let reset = reset_time(oldest, window_ms, now_ms);

        if card <= limit {
            return Ok(Decision::new(true, limit, card, reset));
        }

        // Over the limit: take back the speculative entry.
        if let Err(err) = self.execute(&[command!("ZREM", key, member)]).await {
            warn!(
                error = %err,
                "Failed to remove speculative entry after denial"
            );
        }

        Ok(Decision::new(false, limit, card - 1, reset))
    }
}

#[async_trait]
impl CounterStore for RemoteAtomicStore {
    async fn record_and_check(
        &self,
        key: &CounterKey,
        window: Duration,
        limit: u64,
        now_ms: u64,
    ) -> Result<Decision, StoreError> {
        let store_key = self.store_key(key);
        let window_ms = window.as_millis() as u64;
        let member = format!("{}:{}", now_ms, uuid::Uuid::new_v4());

        trace!(
            key = %key,
            mode = ?self.mode,
            window_ms = window_ms,
            limit = limit,
            "Checking remote sliding log"
        );

        let decision = match self.mode {
            RemoteMode::Script => {
                self.check_script(&store_key, window_ms, limit, now_ms, &member)
                    .await?
            }
            RemoteMode::Pipeline => {
                self.check_pipeline(&store_key, window_ms, limit, now_ms, &member)
                    .await?
            }
        };

        if !decision.allowed {
            debug!(
                key = %key,
                current = decision.current,
                limit = limit,
                "Remote rate limit exceeded"
            );
        }

        Ok(decision)
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

/// Scores at or below this have left the window. May be negative.
fn cutoff(now_ms: u64, window_ms: u64) -> i64 {
    now_ms as i64 - window_ms as i64
}

fn ttl_secs(window_ms: u64) -> u64 {
    window_ms.div_ceil(1000).max(1)
}

/// The oldest in-window entry frees its slot one window after it was added.
fn reset_time(oldest_ms: u64, window_ms: u64, now_ms: u64) -> u64 {
    oldest_ms
        .saturating_add(window_ms)
        .clamp(now_ms, now_ms.saturating_add(window_ms))
}

fn as_u64(value: &Value) -> Result<u64, StoreError> {
    let parsed = match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.parse::<f64>().ok().filter(|f| *f >= 0.0).map(|f| f as u64),
        _ => None,
    };
    parsed.ok_or_else(|| StoreError::Protocol(format!("expected a count, got {}", value)))
}
