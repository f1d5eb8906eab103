//! Tower middleware enforcing rate limits at the front of request handling.
//!
//! Each request is evaluated exactly once and ends in one of two outcomes:
//! it is forwarded with `X-RateLimit-*` headers attached to the response,
//! or it is answered with `429 Too Many Requests` without reaching the
//! inner service.

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use crate::ratelimit::{CheckOutcome, Decision, RateLimiter, RequestInfo};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Authenticated identity for account-scoped policies.
///
/// Upstream authentication inserts this as a request extension; the limiter
/// then keys account-scoped policies by subject instead of address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSubject {
    pub subject: String,
    pub action: Option<String>,
}

/// Body of a 429 response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeniedBody {
    pub error: String,
    pub limit: u64,
    pub remaining: u64,
    /// ISO-8601
    pub reset_time: String,
}

/// Extract what the limiter needs from an HTTP request.
pub fn request_info<B>(request: &Request<B>) -> RequestInfo {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip());
    let subject = request.extensions().get::<RateLimitSubject>();

    RequestInfo {
        method: request.method().as_str().to_string(),
        path: request.uri().path().to_string(),
        headers: request.headers().clone(),
        remote_addr,
        subject: subject.map(|s| s.subject.clone()),
        action: subject.and_then(|s| s.action.clone()),
    }
}

/// Attach `X-RateLimit-Limit`, `-Remaining` and `-Reset` (unix seconds).
pub fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_unix_secs()));
}

/// The 429 response for a denied request.
pub fn denied_response(outcome: &CheckOutcome) -> Response {
    let decision = &outcome.decision;
    let body = DeniedBody {
        error: outcome.message.clone(),
        limit: decision.limit,
        remaining: decision.remaining,
        reset_time: decision.reset_time_iso(),
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    apply_headers(headers, decision);
    headers.insert(
        http::header::RETRY_AFTER,
        HeaderValue::from(
            outcome
                .retry_after_secs
                .unwrap_or_else(|| decision.retry_after_secs(outcome.now_ms)),
        ),
    );
    response
}

/// Layer applying [`RateLimitService`].
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let limiter = self.limiter.clone();
        // Use the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let info = request_info(&request);
            let outcome = limiter.check(&info).await;

            if !outcome.allowed() {
                return Ok(denied_response(&outcome));
            }

            let mut response = inner.call(request).await?;
            apply_headers(response.headers_mut(), &outcome.decision);
            Ok(response)
        })
    }
}
