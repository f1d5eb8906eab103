//! Error types for the Ratekeeper service.

use thiserror::Error;

/// Main error type for Ratekeeper startup and configuration paths.
///
/// Request handling never surfaces these: a limiter fault resolves to an
/// allowing decision instead.
#[derive(Error, Debug)]
pub enum RatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for RatekeeperError {
    fn from(err: config::ConfigError) -> Self {
        RatekeeperError::Config(err.to_string())
    }
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RatekeeperError>;
