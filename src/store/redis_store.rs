//! Redis-backed store shared between proxy instances

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::AsyncCommands;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use tracing::{debug, info};

use super::BackingStore;
use crate::{Error, Result};

/// Reconnect attempts before startup gives up on the store
const CONNECT_RETRIES: usize = 2;

/// [`BackingStore`] over a Redis connection manager.
///
/// The manager reconnects on its own after transient failures; the connection
/// is only required to be reachable at startup.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to `url` (`redis://host:port/db`) and verify it with `PING`
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Store(format!("invalid store URL: {e}")))?;
        let config = ConnectionManagerConfig::new().set_number_of_retries(CONNECT_RETRIES);
        let conn = ConnectionManager::new_with_config(client, config)
            .await
            .map_err(|e| Error::Store(format!("cannot connect to store: {e}")))?;
        let store = Self { conn };
        store.ping().await?;
        info!(url = %redact(url), "Connected to Redis store");
        Ok(store)
    }
}

#[async_trait]
impl BackingStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        debug!(key, hit = value.is_some(), "Store read");
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, retention: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let expiry = expiry_millis(retention);
        let () = conn.pset_ex(key, value.as_ref(), expiry).await?;
        debug!(key, bytes = value.len(), expiry_ms = expiry, "Store write");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(Error::Store(format!("unexpected PING reply: {reply}")))
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// `PX` argument for `retention`; Redis rejects a zero expiry
fn expiry_millis(retention: Duration) -> u64 {
    u64::try_from(retention.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Strip credentials from a connection URL before logging it
fn redact(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => "<unparsable>".to_string(),
    }
}
