//! Decision endpoint for proxies and services that delegate rate limiting.

use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::middleware::{apply_headers, denied_response};
use crate::ratelimit::{RateLimiter, RequestInfo, RouteClass};

/// A request to be checked on behalf of a caller.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckRequest {
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Peer address as seen by the caller
    #[serde(default)]
    pub remote_addr: Option<IpAddr>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    /// Check against this class instead of the one the path resolves to
    #[serde(default)]
    pub class: Option<RouteClass>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Body of an allowed check.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub allowed: bool,
    pub limit: u64,
    pub current: u64,
    pub remaining: u64,
    pub reset_time: String,
    pub policy: RouteClass,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    store: &'static str,
}

impl CheckRequest {
    fn into_request_info(self) -> RequestInfo {
        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => debug!(header = %name, "Skipping invalid header"),
            }
        }

        RequestInfo {
            method: self.method.to_ascii_uppercase(),
            path: self.path,
            headers,
            remote_addr: self.remote_addr,
            subject: self.subject,
            action: self.action,
        }
    }
}

/// Routes served by the sidecar.
pub fn router(limiter: Arc<RateLimiter>) -> Router {
    Router::new()
        .route("/v1/check", post(check))
        .route("/healthz", get(healthz))
        .with_state(limiter)
}

#[instrument(skip(limiter, request), fields(method = %request.method, path = %request.path))]
async fn check(State(limiter): State<Arc<RateLimiter>>, Json(request): Json<CheckRequest>) -> Response {
    if request.path.is_empty() || !request.path.starts_with('/') {
        warn!("Received check request with invalid path");
        return (StatusCode::BAD_REQUEST, "path must start with '/'").into_response();
    }

    let class = request.class;
    let info = request.into_request_info();
    let outcome = match class {
        Some(class) => limiter.check_class(&info, class).await,
        None => limiter.check(&info).await,
    };

    if !outcome.allowed() {
        return denied_response(&outcome);
    }

    let decision = &outcome.decision;
    let body = CheckResponse {
        allowed: true,
        limit: decision.limit,
        current: decision.current,
        remaining: decision.remaining,
        reset_time: decision.reset_time_iso(),
        policy: outcome.class,
    };

    let mut response = Json(body).into_response();
    apply_headers(response.headers_mut(), decision);
    response
}

async fn healthz(State(limiter): State<Arc<RateLimiter>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        store: limiter.store_name(),
    })
}
