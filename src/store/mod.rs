//! Counter stores.
//!
//! A [`CounterStore`] records one request against a key and decides whether
//! it fits in the window. Two implementations exist: the shared
//! [`RemoteAtomicStore`] (exact sliding log) and the in-process
//! [`LocalFallbackStore`] (approximate fixed window). [`FallbackStore`]
//! chains them so a remote fault degrades to local counting for that check.

mod local;
mod remote;
mod selector;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::ratelimit::{CounterKey, Decision};

pub use local::{LocalFallbackStore, LocalStoreConfig};
pub use remote::{RemoteAtomicStore, RemoteConfig, RemoteMode};
pub use selector::{Runtime, RuntimeSelector, SelectedStore, StoreStrategy};
pub use transport::{Command, CommandTransport, HttpCommandTransport};

/// Errors raised by counter stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Network-level failure talking to the backing service
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The backing service did not answer in time
    #[error("backing store timed out after {0:?}")]
    Timeout(Duration),

    /// The backing service answered with an error
    #[error("backing store error: {0}")]
    Backend(String),

    /// The reply could not be understood
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The store cannot be consulted at all
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Trait for counter store implementations.
///
/// `record_and_check` must be atomic per key: two concurrent calls arriving
/// at the limit boundary must not both be granted.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Record a request for `key` at `now_ms` and decide if it is within
    /// `limit` requests per `window`.
    async fn record_and_check(
        &self,
        key: &CounterKey,
        window: Duration,
        limit: u64,
        now_ms: u64,
    ) -> Result<Decision, StoreError>;

    /// Short name for logs and health output.
    fn name(&self) -> &'static str;
}

/// A primary store that falls back to a secondary store when it faults.
///
/// The primary is consulted once per check with no retry. On error a single
/// warning is logged and the fallback decides that check.
pub struct FallbackStore {
    primary: Arc<dyn CounterStore>,
    fallback: Arc<dyn CounterStore>,
    fallbacks: AtomicU64,
}

impl FallbackStore {
    pub fn new(primary: Arc<dyn CounterStore>, fallback: Arc<dyn CounterStore>) -> Self {
        Self {
            primary,
            fallback,
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Number of checks that were decided by the fallback store.
    pub fn fallbacks(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CounterStore for FallbackStore {
    async fn record_and_check(
        &self,
        key: &CounterKey,
        window: Duration,
        limit: u64,
        now_ms: u64,
    ) -> Result<Decision, StoreError> {
        match self.primary.record_and_check(key, window, limit, now_ms).await {
            Ok(decision) => Ok(decision),
            Err(err) => {
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                warn!(
                    store = self.primary.name(),
                    fallback = self.fallback.name(),
                    key = %key.hashed(),
                    error = %err,
                    "Counter store failed, using fallback for this check"
                );
                self.fallback
                    .record_and_check(key, window, limit, now_ms)
                    .await
            }
        }
    }

    fn name(&self) -> &'static str {
        "remote+local"
    }
}
