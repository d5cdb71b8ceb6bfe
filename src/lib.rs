//! hproxy
//!
//! Caching HTTP proxy built on a general-purpose computation cache.
//!
//! # Features
//!
//! - **Two-threshold TTLs**: fresh entries are served directly, stale entries
//!   are served while one background refresh runs, expired entries block
//! - **Single-flight**: concurrent misses for the same key share one origin call
//! - **Shared store**: entries persist in Redis so every instance sees them
//! - **Bounded workers**: computations queue behind a fixed worker budget
//! - **Graceful shutdown**: pending computations are cancelled, connections drained

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod forward;
pub mod gateway;
pub mod key;
pub mod request;
pub mod store;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| Error::Config(format!("invalid log level {level}: {e}")))?;

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
    }

    Ok(())
}
