//! Backing stores for the computation cache
//!
//! The store is the durable, shared half of the cache: every proxy instance
//! pointed at the same store sees the same entries. It is treated as
//! externally synchronized; replacement is last-writer-wins.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

/// Durable key/value store fronted by the computation cache
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Read the bytes stored under `key`, `None` if absent
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// The store must keep it for at least `retention` and may drop it after.
    async fn set(&self, key: &str, value: Bytes, retention: Duration) -> Result<()>;

    /// Check that the store is reachable
    async fn ping(&self) -> Result<()>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}
