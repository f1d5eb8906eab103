//! Rate limit policies and route classification.
//!
//! Every inbound request is classified into exactly one [`RouteClass`]. Each
//! class carries a [`RateLimitPolicy`] describing its window, limit and the
//! way counter keys are derived. The table is static for the lifetime of the
//! process: it is built once from the built-in defaults plus deployment
//! configuration and never mutated by request handling.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::key::RequestInfo;
use crate::error::{RatekeeperError, Result};

/// Route classification, declared in precedence order.
///
/// When a request matches several classes the earliest variant wins:
/// admin > payment > fileUpload > signup > auth > api > general.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RouteClass {
    #[serde(rename = "admin")]
    Admin,
    #[serde(rename = "payment")]
    Payment,
    #[serde(rename = "fileUpload", alias = "fileupload", alias = "file_upload")]
    FileUpload,
    #[serde(rename = "signup")]
    Signup,
    #[serde(rename = "auth")]
    Auth,
    #[serde(rename = "api")]
    Api,
    #[serde(rename = "general")]
    General,
}

impl RouteClass {
    /// All classes in precedence order.
    pub const ALL: [RouteClass; 7] = [
        RouteClass::Admin,
        RouteClass::Payment,
        RouteClass::FileUpload,
        RouteClass::Signup,
        RouteClass::Auth,
        RouteClass::Api,
        RouteClass::General,
    ];

    /// The policy name, also used as the counter key namespace.
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteClass::Admin => "admin",
            RouteClass::Payment => "payment",
            RouteClass::FileUpload => "fileUpload",
            RouteClass::Signup => "signup",
            RouteClass::Auth => "auth",
            RouteClass::Api => "api",
            RouteClass::General => "general",
        }
    }
}

impl fmt::Display for RouteClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the identity part of a counter key is derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyStrategy {
    /// `policy:ip`
    #[default]
    Ip,
    /// `policy:ip:action`
    #[serde(alias = "ipaction", alias = "ip_action")]
    IpAction,
    /// `policy:user:subject:action`, falling back to `Ip` for anonymous requests
    Account,
}

/// A caller-supplied key function. Its output is still namespaced by the
/// policy name.
#[derive(Clone)]
pub struct CustomKeyFn(pub Arc<dyn Fn(&RequestInfo) -> String + Send + Sync>);

impl CustomKeyFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&RequestInfo) -> String + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for CustomKeyFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomKeyFn(..)")
    }
}

/// A rate limit policy for one route class.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    /// The class this policy applies to
    pub class: RouteClass,
    /// Length of the rate limit window
    pub window: Duration,
    /// Maximum requests allowed in the window
    pub limit: u64,
    /// Message returned to denied clients
    pub message: String,
    /// Built-in key derivation
    pub key_strategy: KeyStrategy,
    /// Custom key derivation, takes precedence over `key_strategy`
    pub custom_key: Option<CustomKeyFn>,
}

impl RateLimitPolicy {
    pub fn new(class: RouteClass, window: Duration, limit: u64, message: impl Into<String>) -> Self {
        Self {
            class,
            window,
            limit,
            message: message.into(),
            key_strategy: KeyStrategy::Ip,
            custom_key: None,
        }
    }

    pub fn with_key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.key_strategy = strategy;
        self
    }

    /// Policy name, used as the key namespace.
    pub fn name(&self) -> &'static str {
        self.class.as_str()
    }

    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }
}

/// Which request paths and methods fall into a class.
#[derive(Debug, Clone)]
struct RouteRule {
    class: RouteClass,
    prefixes: Vec<String>,
    /// Upper-cased methods; `None` matches every method
    methods: Option<Vec<String>>,
}

impl RouteRule {
    fn matches_method(&self, method: &str) -> bool {
        match &self.methods {
            Some(methods) => methods.iter().any(|m| m.eq_ignore_ascii_case(method)),
            None => true,
        }
    }

    /// Longest prefix of this rule that covers `path`.
    fn longest_match(&self, path: &str) -> Option<&str> {
        self.prefixes
            .iter()
            .filter(|prefix| prefix_matches(prefix, path))
            .max_by_key(|prefix| prefix.len())
            .map(String::as_str)
    }
}

/// Segment-aware, ASCII case-insensitive prefix match: `/api` covers `/api`,
/// `/API/x` and `/api/x`, not `/apix`.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => {
            let rest = &path[prefix.len()..];
            rest.is_empty() || rest.starts_with('/')
        }
        _ => false,
    }
}

/// Collapse runs of `/` so `/api//admin` classifies like `/api/admin`.
fn normalize_path(path: &str) -> Cow<'_, str> {
    if !path.contains("//") {
        return Cow::Borrowed(path);
    }
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    Cow::Owned(out)
}

/// Per-class override of the built-in policy table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyOverride {
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub key_strategy: Option<KeyStrategy>,
    #[serde(default)]
    pub prefixes: Option<Vec<String>>,
    #[serde(default)]
    pub methods: Option<Vec<String>>,
}

/// Result of classifying a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification<'a> {
    pub class: RouteClass,
    /// The prefix that selected the class; `None` for the default class
    pub matched_prefix: Option<&'a str>,
}

/// Static mapping from route classification to rate limit policy.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: HashMap<RouteClass, Arc<RateLimitPolicy>>,
    /// Kept in precedence order
    rules: Vec<RouteRule>,
}

const MINUTE: Duration = Duration::from_secs(60);

impl PolicyRegistry {
    /// The built-in policy table.
    pub fn builtin() -> Self {
        let policies = [
            RateLimitPolicy::new(
                RouteClass::Admin,
                MINUTE,
                30,
                "Too many admin requests. Please slow down.",
            ),
            RateLimitPolicy::new(
                RouteClass::Payment,
                MINUTE,
                10,
                "Too many payment attempts. Please try again later.",
            ),
            RateLimitPolicy::new(
                RouteClass::FileUpload,
                MINUTE,
                10,
                "Too many file uploads. Please try again later.",
            ),
            RateLimitPolicy::new(
                RouteClass::Signup,
                Duration::from_secs(60 * 60),
                3,
                "Too many signup attempts. Please try again later.",
            ),
            RateLimitPolicy::new(
                RouteClass::Auth,
                Duration::from_secs(15 * 60),
                5,
                "Too many authentication attempts. Please try again later.",
            ),
            RateLimitPolicy::new(
                RouteClass::Api,
                MINUTE,
                60,
                "Too many API requests. Please try again later.",
            ),
            RateLimitPolicy::new(
                RouteClass::General,
                MINUTE,
                100,
                "Too many requests. Please try again later.",
            ),
        ];

        let rules = vec![
            rule(RouteClass::Admin, &["/api/admin", "/admin"], None),
            rule(
                RouteClass::Payment,
                &["/api/payment", "/api/checkout", "/api/stripe"],
                None,
            ),
            rule(RouteClass::FileUpload, &["/api/upload"], Some(&["POST", "PUT"])),
            rule(
                RouteClass::Signup,
                &["/api/auth/signup", "/api/auth/register", "/signup"],
                None,
            ),
            rule(RouteClass::Auth, &["/api/auth", "/login"], None),
            rule(RouteClass::Api, &["/api"], None),
        ];

        Self {
            policies: policies
                .into_iter()
                .map(|p| (p.class, Arc::new(p)))
                .collect(),
            rules,
        }
    }

    /// Build the registry from the built-in table plus overrides.
    pub fn from_overrides(overrides: &HashMap<RouteClass, PolicyOverride>) -> Result<Self> {
        let mut registry = Self::builtin();

        for (class, over) in overrides {
            let mut policy = registry.policy(*class).as_ref().clone();
            if let Some(window_ms) = over.window_ms {
                policy.window = Duration::from_millis(window_ms);
            }
            if let Some(limit) = over.limit {
                policy.limit = limit;
            }
            if let Some(ref message) = over.message {
                policy.message = message.clone();
            }
            if let Some(strategy) = over.key_strategy {
                policy.key_strategy = strategy;
            }

            if policy.limit == 0 {
                return Err(RatekeeperError::Config(format!(
                    "policy '{}' must allow at least one request",
                    class
                )));
            }
            if policy.window.is_zero() {
                return Err(RatekeeperError::Config(format!(
                    "policy '{}' must have a non-zero window",
                    class
                )));
            }

            if over.prefixes.is_some() || over.methods.is_some() {
                if *class == RouteClass::General {
                    return Err(RatekeeperError::Config(
                        "the general policy is the default and takes no route prefixes".into(),
                    ));
                }
                registry.set_rule(*class, over.prefixes.clone(), over.methods.clone());
            }

            debug!(
                policy = %class,
                window_ms = policy.window_ms(),
                limit = policy.limit,
                "Applied policy override"
            );
            registry.policies.insert(*class, Arc::new(policy));
        }

        Ok(registry)
    }

    /// Load policy overrides from a YAML mapping of class name to override.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let overrides: HashMap<RouteClass, PolicyOverride> = serde_yaml::from_str(yaml)
            .map_err(|e| RatekeeperError::Config(format!("Failed to parse policy config: {}", e)))?;
        Self::from_overrides(&overrides)
    }

    /// Load policy overrides from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Attach a custom key function to a class.
    pub fn with_custom_key(mut self, class: RouteClass, key_fn: CustomKeyFn) -> Self {
        let mut policy = self.policy(class).as_ref().clone();
        policy.custom_key = Some(key_fn);
        self.policies.insert(class, Arc::new(policy));
        self
    }

    /// Replace a class's policy wholesale.
    pub fn with_policy(mut self, policy: RateLimitPolicy) -> Self {
        self.policies.insert(policy.class, Arc::new(policy));
        self
    }

    fn set_rule(&mut self, class: RouteClass, prefixes: Option<Vec<String>>, methods: Option<Vec<String>>) {
        let methods = methods.map(|ms| ms.into_iter().map(|m| m.to_ascii_uppercase()).collect());
        match self.rules.iter_mut().find(|r| r.class == class) {
            Some(existing) => {
                if let Some(prefixes) = prefixes {
                    existing.prefixes = prefixes;
                }
                if methods.is_some() {
                    existing.methods = methods;
                }
            }
            None => {
                self.rules.push(RouteRule {
                    class,
                    prefixes: prefixes.unwrap_or_default(),
                    methods,
                });
                self.rules.sort_by_key(|r| r.class);
            }
        }
    }

    /// Classify a request. Deterministic and single-valued: the highest
    /// precedence class with a matching prefix wins, and the longest prefix
    /// of that class is reported.
    pub fn classify<'a>(&'a self, method: &str, path: &str) -> Classification<'a> {
        let path = normalize_path(path);
        for rule in &self.rules {
            if !rule.matches_method(method) {
                continue;
            }
            if let Some(prefix) = rule.longest_match(&path) {
                return Classification {
                    class: rule.class,
                    matched_prefix: Some(prefix),
                };
            }
        }

        Classification {
            class: RouteClass::General,
            matched_prefix: None,
        }
    }

    /// Resolve the policy for a request. Never fails: unmatched routes get
    /// the general policy.
    pub fn resolve(&self, method: &str, path: &str) -> Arc<RateLimitPolicy> {
        self.policy(self.classify(method, path).class)
    }

    /// The policy for a class, or the general policy when the class has none.
    pub fn policy(&self, class: RouteClass) -> Arc<RateLimitPolicy> {
        match self.policies.get(&class) {
            Some(policy) => policy.clone(),
            None => self.general(),
        }
    }

    fn general(&self) -> Arc<RateLimitPolicy> {
        self.policies
            .get(&RouteClass::General)
            .cloned()
            .unwrap_or_else(|| {
                Arc::new(RateLimitPolicy::new(
                    RouteClass::General,
                    MINUTE,
                    100,
                    "Too many requests. Please try again later.",
                ))
            })
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn rule(class: RouteClass, prefixes: &[&str], methods: Option<&[&str]>) -> RouteRule {
    RouteRule {
        class,
        prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
        methods: methods.map(|ms| ms.iter().map(|m| m.to_string()).collect()),
    }
}
