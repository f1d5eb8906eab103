//! HTTP surface: the rate limiting middleware and the sidecar server.

pub mod middleware;
mod server;
mod service;

pub use middleware::{RateLimitLayer, RateLimitService, RateLimitSubject};
pub use server::HttpServer;
pub use service::{router, CheckRequest, CheckResponse};
