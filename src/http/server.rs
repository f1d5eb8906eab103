//! HTTP server hosting the decision endpoint.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::service::router;
use crate::error::{RatekeeperError, Result};
use crate::ratelimit::RateLimiter;

/// HTTP server for the rate limit sidecar.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, rate_limiter: Arc<RateLimiter>) -> Self {
        Self { addr, rate_limiter }
    }

    /// Start the server, shutting down gracefully once `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve_listener(listener, signal).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!(
            addr = %listener.local_addr()?,
            store = self.rate_limiter.store_name(),
            "Starting rate limit HTTP server"
        );

        let app = router(self.rate_limiter);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            RatekeeperError::Server(e.to_string())
        })
    }
}
