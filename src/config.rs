//! Configuration management for Ratekeeper.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then environment variables prefixed with `RATEKEEPER_` using `__` to
//! separate nested keys (for example `RATEKEEPER_STORE__REMOTE__TOKEN`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use tracing::info;

use crate::error::{RatekeeperError, Result};
use crate::ratelimit::{PolicyOverride, PolicyRegistry, RouteClass};
use crate::store::{LocalStoreConfig, RemoteConfig, Runtime};

/// Main configuration for the Ratekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Per-route-class overrides of the built-in policy table
    #[serde(default)]
    pub policies: HashMap<RouteClass, PolicyOverride>,

    /// Violation logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Counter store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Host runtime; isolated runtimes never use the shared store
    #[serde(default)]
    pub runtime: Runtime,

    /// Shared store connection
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Local counter bounds
    #[serde(default)]
    pub local: LocalStoreConfig,
}

/// Violation logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log a hash of the counter key instead of the key itself
    #[serde(default = "default_hash_keys")]
    pub hash_keys: bool,

    /// Allowed requests with `remaining <= ceil(limit * ratio)` are logged
    /// as approaching the limit
    #[serde(default = "default_warning_ratio")]
    pub warning_ratio: f64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            hash_keys: default_hash_keys(),
            warning_ratio: default_warning_ratio(),
        }
    }
}

fn default_hash_keys() -> bool {
    true
}

fn default_warning_ratio() -> f64 {
    0.1
}

impl RatekeeperConfig {
    /// Load configuration from defaults, an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }

        let config: RatekeeperConfig = builder
            .add_source(
                config::Environment::with_prefix("RATEKEEPER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file without environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RatekeeperConfig =
            serde_yaml::from_str(yaml).map_err(|e| RatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Build the policy registry this configuration describes.
    pub fn policy_registry(&self) -> Result<PolicyRegistry> {
        PolicyRegistry::from_overrides(&self.policies)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.logging.warning_ratio) {
            return Err(RatekeeperError::Config(format!(
                "logging.warning_ratio must be within 0..=1, got {}",
                self.logging.warning_ratio
            )));
        }
        if self.store.remote.timeout_ms == 0 {
            return Err(RatekeeperError::Config(
                "store.remote.timeout_ms must be greater than zero".into(),
            ));
        }
        if self.store.local.max_keys == 0 {
            return Err(RatekeeperError::Config(
                "store.local.max_keys must be greater than zero".into(),
            ));
        }
        let local = &self.store.local;
        if local.evict_batch == 0 || local.evict_batch > local.max_keys {
            return Err(RatekeeperError::Config(format!(
                "store.local.evict_batch must be within 1..={}, got {}",
                local.max_keys, local.evict_batch
            )));
        }
        self.policy_registry().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RemoteMode;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RatekeeperConfig::default();
        assert_eq!(config.server.listen_addr.port(), 8081);
        assert_eq!(config.store.runtime, Runtime::Server);
        assert_eq!(config.store.remote.timeout_ms, 1500);
        assert_eq!(config.store.remote.mode, RemoteMode::Script);
        assert_eq!(config.store.local.max_keys, 1000);
        assert_eq!(config.store.local.evict_batch, 200);
        assert!(config.logging.hash_keys);
        assert!(config.policies.is_empty());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
server:
  listen_addr: "0.0.0.0:9000"
store:
  runtime: isolated
  remote:
    url: https://example.upstash.io
    token: secret
    mode: pipeline
  local:
    max_keys: 50
    evict_batch: 10
policies:
  auth:
    limit: 3
    window_ms: 600000
logging:
  hash_keys: false
"#;
        let config = RatekeeperConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.listen_addr.port(), 9000);
        assert_eq!(config.store.runtime, Runtime::Isolated);
        assert_eq!(config.store.remote.mode, RemoteMode::Pipeline);
        assert_eq!(config.store.local.max_keys, 50);
        assert_eq!(config.store.local.evict_batch, 10);
        assert!(!config.logging.hash_keys);

        let registry = config.policy_registry().unwrap();
        assert_eq!(registry.policy(RouteClass::Auth).limit, 3);
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let yaml = r#"
policies:
  api:
    limit: 0
"#;
        assert!(RatekeeperConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_invalid_warning_ratio_rejected() {
        let yaml = r#"
logging:
  warning_ratio: 1.5
"#;
        assert!(RatekeeperConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_invalid_evict_batch_rejected() {
        let yaml = "store:\n  local:\n    max_keys: 10\n    evict_batch: 0\n";
        assert!(RatekeeperConfig::from_yaml(yaml).is_err());

        let yaml = "store:\n  local:\n    max_keys: 10\n    evict_batch: 11\n";
        assert!(RatekeeperConfig::from_yaml(yaml).is_err());

        let yaml = "store:\n  local:\n    max_keys: 10\n    evict_batch: 10\n";
        assert!(RatekeeperConfig::from_yaml(yaml).is_ok());
    }

    #[test]
    fn test_from_file_ignores_environment() {
        let path = std::env::temp_dir().join(format!("ratekeeper-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "server:\n  listen_addr: \"127.0.0.1:9100\"\n").unwrap();

        let config = RatekeeperConfig::from_file(&path).unwrap();
        assert_eq!(config.server.listen_addr.port(), 9100);
        assert_eq!(config.store.remote.timeout_ms, 1500);

        std::fs::remove_file(&path).unwrap();
        assert!(RatekeeperConfig::from_file(&path).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("ratekeeper-{}.yaml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "store:\n  remote:\n    timeout_ms: 250\n    key_prefix: rk").unwrap();

        let config = RatekeeperConfig::load(Some(&path)).unwrap();
        assert_eq!(config.store.remote.timeout_ms, 250);
        assert_eq!(config.store.remote.key_prefix, "rk");

        std::fs::remove_file(&path).unwrap();
    }
}
