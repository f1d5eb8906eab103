//! In-process fixed-window counter store.
//!
//! This is an approximation: a client can be granted up to twice the limit
//! across a window boundary. It is used as the fallback when the shared
//! store faults, and as the only store where instances cannot share state.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace};

use super::{CounterStore, StoreError};
use crate::ratelimit::{CounterKey, Decision};

/// Bounds for the local counter map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStoreConfig {
    /// Eviction starts once the map holds more keys than this
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,

    /// Number of keys evicted at once, soonest reset first
    #[serde(default = "default_evict_batch")]
    pub evict_batch: usize,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            max_keys: default_max_keys(),
            evict_batch: default_evict_batch(),
        }
    }
}

fn default_max_keys() -> usize {
    1000
}

fn default_evict_batch() -> usize {
    200
}

/// A fixed-window counter for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CounterEntry {
    count: u64,
    reset_time_ms: u64,
}

/// Fixed-window counters held in process memory.
///
/// Every check runs as one critical section under the map lock: prune,
/// read, reset, increment and evict happen without releasing it.
pub struct LocalFallbackStore {
    entries: Mutex<HashMap<CounterKey, CounterEntry>>,
    config: LocalStoreConfig,
}

impl LocalFallbackStore {
    pub fn new(config: LocalStoreConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Record a request and decide it.
    pub fn check(&self, key: &CounterKey, window: Duration, limit: u64, now_ms: u64) -> Decision {
        let window_ms = window.as_millis() as u64;
        let mut entries = self.entries.lock();

        entries.retain(|_, entry| entry.reset_time_ms >= now_ms);

        let entry = entries.entry(key.clone()).or_insert(CounterEntry {
            count: 0,
            reset_time_ms: now_ms.saturating_add(window_ms),
        });

        if now_ms > entry.reset_time_ms {
            entry.count = 0;
            entry.reset_time_ms = now_ms.saturating_add(window_ms);
        }
        entry.count += 1;

        let decision = Decision::new(entry.count <= limit, limit, entry.count, entry.reset_time_ms);

        trace!(
            key = %key,
            count = entry.count,
            limit = limit,
            "Local counter updated"
        );

        if entries.len() > self.config.max_keys {
            // Never evict fewer keys than it takes to get back under the bound.
            let batch = self
                .config
                .evict_batch
                .max(entries.len() - self.config.max_keys);
            Self::evict(&mut entries, key, batch);
        }

        decision
    }

    /// Drop the keys with the soonest reset time, sparing the key in use.
    fn evict(entries: &mut HashMap<CounterKey, CounterEntry>, keep: &CounterKey, batch: usize) {
        let mut by_reset: Vec<(CounterKey, u64)> = entries
            .iter()
            .filter(|(k, _)| *k != keep)
            .map(|(k, e)| (k.clone(), e.reset_time_ms))
            .collect();
        by_reset.sort_by_key(|(_, reset)| *reset);

        for (k, _) in by_reset.into_iter().take(batch) {
            entries.remove(&k);
        }

        debug!(remaining = entries.len(), "Evicted local rate limit counters");
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Current `(count, reset_time_ms)` for a key.
    pub fn counter(&self, key: &CounterKey) -> Option<(u64, u64)> {
        self.entries
            .lock()
            .get(key)
            .map(|e| (e.count, e.reset_time_ms))
    }
}

impl Default for LocalFallbackStore {
    fn default() -> Self {
        Self::new(LocalStoreConfig::default())
    }
}

#[async_trait]
impl CounterStore for LocalFallbackStore {
    async fn record_and_check(
        &self,
        key: &CounterKey,
        window: Duration,
        limit: u64,
        now_ms: u64,
    ) -> Result<Decision, StoreError> {
        Ok(self.check(key, window, limit, now_ms))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
