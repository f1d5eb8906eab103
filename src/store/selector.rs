//! Choosing the counter store chain for this process.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use super::local::LocalFallbackStore;
use super::remote::RemoteAtomicStore;
use super::transport::CommandTransport;
use super::{CounterStore, FallbackStore};
use crate::config::StoreConfig;

/// What kind of host the limiter runs in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    /// A long-lived server able to reach the shared store
    #[default]
    Server,
    /// A sandbox that cannot hold outbound connections to the shared store
    Isolated,
}

/// The store chain in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStrategy {
    /// Shared sliding-log store, falling back to local counters on error
    RemoteWithFallback,
    /// Local fixed-window counters only
    LocalOnly,
}

impl fmt::Display for StoreStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreStrategy::RemoteWithFallback => f.write_str("remote+local"),
            StoreStrategy::LocalOnly => f.write_str("local"),
        }
    }
}

/// The outcome of store selection.
#[derive(Clone)]
pub struct SelectedStore {
    pub strategy: StoreStrategy,
    pub store: Arc<dyn CounterStore>,
}

/// Picks the store chain once, at limiter construction.
pub struct RuntimeSelector;

impl RuntimeSelector {
    /// The strategy the configuration calls for.
    pub fn strategy(config: &StoreConfig) -> StoreStrategy {
        if config.runtime == Runtime::Isolated || config.remote.credentials().is_none() {
            StoreStrategy::LocalOnly
        } else {
            StoreStrategy::RemoteWithFallback
        }
    }

    /// Build the store chain, talking to the shared store over HTTP.
    pub fn select(config: &StoreConfig) -> SelectedStore {
        let local = Arc::new(LocalFallbackStore::new(config.local.clone()));

        match Self::strategy(config) {
            StoreStrategy::LocalOnly => {
                info!(
                    runtime = ?config.runtime,
                    "Remote store unavailable in this runtime, using local counters only"
                );
                Self::local_only(local)
            }
            StoreStrategy::RemoteWithFallback => match RemoteAtomicStore::from_config(&config.remote) {
                Ok(remote) => Self::chain(Arc::new(remote), local),
                Err(err) => {
                    warn!(error = %err, "Failed to build remote store, using local counters only");
                    Self::local_only(local)
                }
            },
        }
    }

    /// Build the store chain over a caller-supplied transport. Credentials
    /// are not required; an isolated runtime still gets local counters only.
    pub fn select_with_transport(
        config: &StoreConfig,
        transport: Arc<dyn CommandTransport>,
    ) -> SelectedStore {
        let local = Arc::new(LocalFallbackStore::new(config.local.clone()));
        if config.runtime == Runtime::Isolated {
            return Self::local_only(local);
        }

        let remote = RemoteAtomicStore::new(transport, config.remote.mode, config.remote.timeout())
            .with_key_prefix(config.remote.key_prefix.clone());
        Self::chain(Arc::new(remote), local)
    }

    fn chain(remote: Arc<RemoteAtomicStore>, local: Arc<LocalFallbackStore>) -> SelectedStore {
        info!(mode = ?remote.mode(), "Using remote sliding-log store with local fallback");
        SelectedStore {
            strategy: StoreStrategy::RemoteWithFallback,
            store: Arc::new(FallbackStore::new(remote, local)),
        }
    }

    fn local_only(local: Arc<LocalFallbackStore>) -> SelectedStore {
        SelectedStore {
            strategy: StoreStrategy::LocalOnly,
            store: local,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::remote::RemoteConfig;
    use crate::store::testing::MemoryCommandService;

    fn configured() -> StoreConfig {
        StoreConfig {
            remote: RemoteConfig {
                url: Some("https://example.upstash.io".into()),
                token: Some("secret".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_credentials_selects_local() {
        let config = StoreConfig::default();
        assert_eq!(RuntimeSelector::strategy(&config), StoreStrategy::LocalOnly);

        let selected = RuntimeSelector::select(&config);
        assert_eq!(selected.strategy, StoreStrategy::LocalOnly);
        assert_eq!(selected.store.name(), "local");
    }

    #[test]
    fn test_isolated_runtime_selects_local() {
        let mut config = configured();
        config.runtime = Runtime::Isolated;
        assert_eq!(RuntimeSelector::strategy(&config), StoreStrategy::LocalOnly);

        let selected =
            RuntimeSelector::select_with_transport(&config, Arc::new(MemoryCommandService::new()));
        assert_eq!(selected.strategy, StoreStrategy::LocalOnly);
    }

    #[test]
    fn test_configured_server_selects_remote_chain() {
        let config = configured();
        assert_eq!(
            RuntimeSelector::strategy(&config),
            StoreStrategy::RemoteWithFallback
        );

        let selected = RuntimeSelector::select(&config);
        assert_eq!(selected.strategy, StoreStrategy::RemoteWithFallback);
        assert_eq!(selected.store.name(), "remote+local");
        assert_eq!(selected.strategy.to_string(), "remote+local");
    }
}
