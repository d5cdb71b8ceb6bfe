//! Configuration management

use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::cache::{DEFAULT_WORKERS, Ttl};
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Cache policy and worker budget
    pub cache: CacheConfig,
    /// Origin client configuration
    pub forward: ForwardConfig,
    /// Backing store configuration
    pub store: StoreConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum encoded request size (bytes)
    pub max_body_size: usize,
    /// Grace period for draining connections on shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_body_size: 10 * 1024 * 1024, // 10MB
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// `min_ttl` used when the request omits it or it does not parse
    #[serde(with = "humantime_serde")]
    pub default_min_ttl: Duration,
    /// `max_ttl` used when the request omits it or it does not parse
    #[serde(with = "humantime_serde")]
    pub default_max_ttl: Duration,
    /// Computations allowed to run at once; the rest queue
    pub workers: usize,
    /// How often outlived in-process entries are dropped
    #[serde(with = "humantime_serde")]
    pub maintenance_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_min_ttl: Duration::from_secs(60 * 60),
            default_max_ttl: Duration::from_secs(24 * 60 * 60),
            workers: DEFAULT_WORKERS,
            maintenance_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl CacheConfig {
    /// Default TTL pair
    pub fn default_ttl(&self) -> Result<Ttl> {
        Ttl::new(self.default_min_ttl, self.default_max_ttl)
    }
}

/// Origin client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    /// Per-call timeout for origin requests
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// User-Agent sent when the proxied request does not set one
    pub user_agent: String,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: format!("hproxy/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Backing store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis connection URL (`redis://host:port/db`)
    pub url: Option<String>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // HPROXY_SERVER__PORT=9000, HPROXY_STORE__URL=redis://...
        figment = figment.merge(Env::prefixed("HPROXY_").split("__"));
        // REDIS_URI only fills in a store URL nothing else set
        figment = figment.join(
            Env::raw()
                .only(&["REDIS_URI"])
                .map(|_| "store.url".into()),
        );

        figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Check cross-field constraints before serving
    pub fn validate(&self) -> Result<()> {
        self.cache
            .default_ttl()
            .map_err(|e| Error::Config(format!("cache defaults: {e}")))?;
        if self.cache.workers == 0 {
            return Err(Error::Config("cache.workers must be at least 1".to_string()));
        }
        if self.cache.maintenance_interval.is_zero() {
            return Err(Error::Config(
                "cache.maintenance_interval must be non-zero".to_string(),
            ));
        }
        match self.store.url.as_deref() {
            Some(url) if !url.trim().is_empty() => Ok(()),
            _ => Err(Error::Config(
                "backing store URL not set (store.url, --store-url or REDIS_URI)".to_string(),
            )),
        }
    }
}
