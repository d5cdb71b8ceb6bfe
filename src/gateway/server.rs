//! Proxy server lifecycle

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::router::{AppState, create_router};
use crate::cache::{Clock, ComputationCache, SystemClock};
use crate::config::Config;
use crate::forward::ForwardExecutor;
use crate::store::{BackingStore, RedisStore};
use crate::{Error, Result};

/// The caching HTTP proxy
pub struct ProxyServer {
    config: Config,
    state: Arc<AppState>,
}

impl ProxyServer {
    /// Validate `config`, connect to the configured Redis store and build the
    /// server.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or the store is unreachable.
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate()?;
        let url = config
            .store
            .url
            .as_deref()
            .ok_or_else(|| Error::Config("backing store URL not set".to_string()))?;
        let store = RedisStore::connect(url).await?;
        Self::new(config, Arc::new(store), Arc::new(SystemClock))
    }

    /// Build a server over an already-connected store
    pub fn new(config: Config, store: Arc<dyn BackingStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        let default_ttl = config.cache.default_ttl()?;
        let executor = ForwardExecutor::new(&config.forward, Arc::clone(&clock))?;
        let store_name = store.name();
        let cache = ComputationCache::new(
            store,
            clock,
            config.cache.workers,
            CancellationToken::new(),
        );

        let state = Arc::new(AppState {
            cache,
            executor,
            default_ttl,
            store_name,
        });

        Ok(Self { config, state })
    }

    /// The cache requests go through
    #[must_use]
    pub fn cache(&self) -> &ComputationCache {
        &self.state.cache
    }

    /// Router for this server's state
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state), self.config.server.max_body_size)
    }

    /// Bind the configured address and serve until SIGINT or SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `signal` resolves or the cache's shutdown
    /// token is cancelled.
    ///
    /// On shutdown, pending computations are cancelled and open connections
    /// get `server.shutdown_timeout` to finish before the server is dropped.
    pub async fn serve<S>(self, listener: TcpListener, signal: S) -> Result<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let local = listener.local_addr()?;
        info!("============================================================");
        info!("HPROXY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(addr = %local, "Listening");
        info!(store = self.state.store_name, workers = self.config.cache.workers, "Cache");
        info!(
            min_ttl = %humantime::format_duration(self.state.default_ttl.min()),
            max_ttl = %humantime::format_duration(self.state.default_ttl.max()),
            "Default TTLs"
        );
        info!("  POST /proxy?min_ttl=..&max_ttl=..");
        info!("  GET  /health");
        info!("  GET  /stats");
        info!("============================================================");

        let maintenance = self
            .state
            .cache
            .spawn_maintenance(self.config.cache.maintenance_interval);

        let token = self.state.cache.shutdown_token().clone();
        let stop = token.clone();
        let app = self.router();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
        });

        tokio::select! {
            result = &mut server => {
                token.cancel();
                let _ = maintenance.await;
                return join_result(result);
            }
            () = signal => info!("Shutdown signal received, draining connections"),
            () = token.cancelled() => info!("Shutdown requested, draining connections"),
        }

        token.cancel();
        let grace = self.config.server.shutdown_timeout;
        let outcome = match tokio::time::timeout(grace, &mut server).await {
            Ok(result) => join_result(result),
            Err(_) => {
                warn!(grace = %humantime::format_duration(grace), "Drain timed out, forcing shutdown");
                server.abort();
                Ok(())
            }
        };
        let _ = maintenance.await;

        info!(stats = ?self.state.cache.stats(), "Proxy shutdown complete");
        outcome
    }
}

fn join_result(result: std::result::Result<std::io::Result<()>, JoinError>) -> Result<()> {
    result
        .map_err(|e| Error::Internal(format!("server task failed: {e}")))?
        .map_err(Error::from)
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
