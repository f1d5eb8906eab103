//! Counter key derivation.

use http::HeaderMap;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};

use super::policy::{KeyStrategy, RateLimitPolicy};

/// Header carrying the proxy chain; the first entry is the client.
pub const FORWARDED_FOR: &str = "x-forwarded-for";
/// Header set by proxies that forward a single client address.
pub const REAL_IP: &str = "x-real-ip";
/// Header carrying the connection's remote address.
pub const REMOTE_ADDR: &str = "x-remote-addr";
/// Identity shared by every client whose address cannot be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";
/// Action used by action-scoped keys when the caller names none.
pub const DEFAULT_ACTION: &str = "default";

/// The parts of an inbound request the limiter consumes.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    /// Peer address of the connection, if the host exposes it
    pub remote_addr: Option<IpAddr>,
    /// Authenticated subject, for account-scoped policies
    pub subject: Option<String>,
    /// Named action, for action-scoped policies
    pub action: Option<String>,
}

impl RequestInfo {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = value.parse() {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>, action: Option<String>) -> Self {
        self.subject = Some(subject.into());
        self.action = action;
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.headers
            .get(http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

/// A namespaced counter key: `policyName:identityToken`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey(String);

impl CounterKey {
    pub fn new(policy: &str, identity: &str) -> Self {
        Self(format!("{}:{}", policy, identity))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Truncated SHA-256 of the key, for logs that must not carry identities.
    pub fn hashed(&self) -> String {
        let digest = format!("{:x}", Sha256::digest(self.0.as_bytes()));
        digest[..16].to_string()
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives deterministic counter keys from request identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyGenerator;

impl KeyGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Derive the counter key for a request under a policy.
    ///
    /// The policy name is always the key prefix, so two policies never share
    /// a counter.
    pub fn key(&self, request: &RequestInfo, policy: &RateLimitPolicy) -> CounterKey {
        let name = policy.name();

        if let Some(ref custom) = policy.custom_key {
            return CounterKey::new(name, &(custom.0)(request));
        }

        let action = escape(request.action.as_deref().unwrap_or(DEFAULT_ACTION));
        match policy.key_strategy {
            KeyStrategy::Account => match request.subject.as_deref() {
                Some(subject) => {
                    CounterKey::new(name, &format!("user:{}:{}", escape(subject), action))
                }
                None => CounterKey::new(name, &self.client_address(request)),
            },
            KeyStrategy::IpAction => CounterKey::new(
                name,
                &format!("{}:{}", self.client_address(request), action),
            ),
            KeyStrategy::Ip => CounterKey::new(name, &self.client_address(request)),
        }
    }

    /// Extract the client address.
    ///
    /// Precedence: first forwarded-for entry, real-IP header, remote-address
    /// header, connection peer, then the shared `"unknown"` identity.
    /// Unparseable values are skipped.
    pub fn client_address(&self, request: &RequestInfo) -> String {
        let forwarded = request
            .header(FORWARDED_FOR)
            .and_then(|list| list.split(',').next())
            .and_then(parse_ip);

        forwarded
            .or_else(|| request.header(REAL_IP).and_then(parse_ip))
            .or_else(|| request.header(REMOTE_ADDR).and_then(parse_ip))
            .or(request.remote_addr)
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
    }
}

/// Percent-encode the key separator so caller-supplied parts cannot run
/// into each other.
fn escape(part: &str) -> Cow<'_, str> {
    if part.contains([':', '%']) {
        Cow::Owned(part.replace('%', "%25").replace(':', "%3A"))
    } else {
        Cow::Borrowed(part)
    }
}

fn parse_ip(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    raw.parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}
