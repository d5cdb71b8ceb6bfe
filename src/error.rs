//! Error types for hproxy

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for hproxy
pub type Result<T> = std::result::Result<T, Error>;

/// hproxy errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed transported request
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Request rejected before reaching the cache (TTL order, method)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transport-level failure of the forward call
    #[error("Origin error: {0}")]
    Origin(String),

    /// Backing store unreachable or returned garbage
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Server shutdown
    #[error("Server shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status used when this error is returned to a proxy client.
    ///
    /// Request-local errors are 400; anything that went wrong while fetching
    /// or caching is 502.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Encoding(_) | Self::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    /// Rebuild an owned copy of a shared error.
    ///
    /// Single-flight fans one failure out to every waiter; `io::Error` and
    /// `serde_json::Error` are not `Clone`, so those collapse to `Internal`.
    #[must_use]
    pub fn replicate(&self) -> Self {
        match self {
            Self::Encoding(m) => Self::Encoding(m.clone()),
            Self::Validation(m) => Self::Validation(m.clone()),
            Self::Origin(m) => Self::Origin(m.clone()),
            Self::Store(m) => Self::Store(m.clone()),
            Self::Config(m) => Self::Config(m.clone()),
            Self::Shutdown => Self::Shutdown,
            Self::Internal(m) => Self::Internal(m.clone()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::Store(err.to_string())
    }
}
