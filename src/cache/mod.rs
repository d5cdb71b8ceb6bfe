//! Computation cache: single-flight execution, two-threshold TTL policy and
//! refresh-ahead, fronting a shared [`BackingStore`].
//!
//! # How it works
//!
//! 1. `get(key, ttl, compute)` looks the key up in the in-process layer; if
//!    that copy is not fresh, the backing store is consulted and the newer of
//!    the two entries wins (another instance may have refreshed it).
//! 2. The entry is classified against `ttl`:
//!    - `Fresh` → returned, `compute` is dropped unused.
//!    - `Stale` → returned immediately; a background refresh is started unless
//!      one is already running for the key.
//!    - `Expired` or missing → the caller joins (or starts) the key's flight
//!      and waits for its result.
//! 3. A flight is a spawned task that acquires a worker permit, runs
//!    `compute`, writes the entry through to the store, then to the in-process
//!    layer, and finally removes itself from the flight map. Failures are
//!    never stored.

mod clock;
mod entry;
mod stats;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{CacheEntry, Freshness, Ttl};
pub use stats::{CacheStats, CacheStatsSnapshot};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture, Shared};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::store::BackingStore;
use crate::{Error, Result};

/// Default number of computations allowed to run at once
pub const DEFAULT_WORKERS: usize = 4;

type FlightResult = std::result::Result<Arc<CacheEntry>, Arc<Error>>;
type Flight = Shared<BoxFuture<'static, FlightResult>>;
type ComputeFuture = BoxFuture<'static, Result<Bytes>>;
type ComputeFn = Box<dyn FnOnce(CancellationToken) -> ComputeFuture + Send>;

/// Key-addressed cache of expensive computations.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct ComputationCache {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn BackingStore>,
    clock: Arc<dyn Clock>,
    /// In-process copies of entries this instance has seen
    local: DashMap<String, Arc<CacheEntry>>,
    /// One pending computation per key
    flights: DashMap<String, Flight>,
    /// Bounded worker budget for computations
    workers: Semaphore,
    /// Process-lifetime token; computations get child tokens
    shutdown: CancellationToken,
    stats: CacheStats,
}

impl ComputationCache {
    /// Create a cache in front of `store`
    #[must_use]
    pub fn new(
        store: Arc<dyn BackingStore>,
        clock: Arc<dyn Clock>,
        workers: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                clock,
                local: DashMap::new(),
                flights: DashMap::new(),
                workers: Semaphore::new(workers.max(1)),
                shutdown,
                stats: CacheStats::default(),
            }),
        }
    }

    /// Return the value for `key`, computing it with `compute` when needed.
    ///
    /// `compute` receives a cancellation token that fires on shutdown. It runs
    /// at most once per outstanding flight; if another caller already started
    /// a computation for `key` it is dropped without being called.
    pub async fn get<F, Fut>(&self, key: &str, ttl: Ttl, compute: F) -> Result<Bytes>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        let compute: ComputeFn = Box::new(move |token| compute(token).boxed());
        let now = self.inner.clock.now();

        match self.lookup(key, &ttl).await? {
            Some(entry) => match entry.freshness(now, &ttl) {
                Freshness::Fresh => {
                    CacheStats::bump(&self.inner.stats.fresh_hits);
                    debug!(key, "Cache hit (fresh)");
                    Ok(entry.value.clone())
                }
                Freshness::Stale => {
                    CacheStats::bump(&self.inner.stats.stale_hits);
                    debug!(key, age = ?entry.age(now), "Cache hit (stale), refreshing in background");
                    // The flight runs as its own task; dropping the handle does not cancel it.
                    drop(self.flight(key, ttl, Some(entry.computed_at), compute));
                    Ok(entry.value.clone())
                }
                Freshness::Expired => {
                    CacheStats::bump(&self.inner.stats.misses);
                    debug!(key, age = ?entry.age(now), "Cache entry expired, recomputing");
                    self.wait(key, ttl, Some(entry.computed_at), compute).await
                }
            },
            None => {
                CacheStats::bump(&self.inner.stats.misses);
                debug!(key, "Cache miss");
                self.wait(key, ttl, None, compute).await
            }
        }
    }

    /// Statistics snapshot
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.inner
            .stats
            .snapshot(self.inner.flights.len(), self.inner.local.len())
    }

    /// Whether a computation for `key` is currently pending
    #[must_use]
    pub fn is_computing(&self, key: &str) -> bool {
        self.inner.flights.contains_key(key)
    }

    /// Drop in-process entries older than the `max_ttl` they were stored with.
    ///
    /// The backing store keeps its own copy; this only bounds local memory.
    pub fn evict_expired(&self) -> usize {
        let now = self.inner.clock.now();
        let before = self.inner.local.len();
        self.inner.local.retain(|_, entry| !entry.outlived(now));
        let evicted = before.saturating_sub(self.inner.local.len());
        if evicted > 0 {
            debug!(count = evicted, "Evicted outlived in-process entries");
        }
        evicted
    }

    /// Spawn a task that runs [`Self::evict_expired`] every `interval` until
    /// shutdown.
    pub fn spawn_maintenance(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.evict_expired();
                    }
                    () = cache.inner.shutdown.cancelled() => break,
                }
            }
        })
    }

    /// The shutdown token computations observe
    #[must_use]
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    async fn lookup(&self, key: &str, ttl: &Ttl) -> Result<Option<Arc<CacheEntry>>> {
        let local = self.inner.local.get(key).map(|e| Arc::clone(e.value()));
        if let Some(entry) = &local {
            if entry.freshness(self.inner.clock.now(), ttl) == Freshness::Fresh {
                return Ok(local);
            }
        }

        let stored = self
            .inner
            .with_shutdown(self.inner.store.get(key))
            .await
            .and_then(|raw| raw.map(|raw| CacheEntry::decode(key, raw)).transpose());
        let stored = match stored {
            Ok(stored) => stored,
            Err(err) if local.is_some() && !matches!(err, Error::Shutdown) => {
                warn!(key, error = %err, "Store read failed; using in-process copy");
                None
            }
            Err(err) => return Err(err),
        };

        Ok(match (local, stored) {
            (Some(local), Some(stored)) if stored.computed_at > local.computed_at => {
                Some(self.inner.remember(stored))
            }
            (Some(local), _) => Some(local),
            (None, Some(stored)) => Some(self.inner.remember(stored)),
            (None, None) => None,
        })
    }

    async fn wait(
        &self,
        key: &str,
        ttl: Ttl,
        seen: Option<DateTime<Utc>>,
        compute: ComputeFn,
    ) -> Result<Bytes> {
        match self.flight(key, ttl, seen, compute).await {
            Ok(entry) => Ok(entry.value.clone()),
            Err(err) => Err(err.replicate()),
        }
    }

    /// Join the pending computation for `key`, or start one.
    ///
    /// `seen` is the `computed_at` of the entry this caller looked at, if any.
    /// A flight may have finished between that lookup and now; its result is
    /// reused instead of computing again.
    fn flight(
        &self,
        key: &str,
        ttl: Ttl,
        seen: Option<DateTime<Utc>>,
        compute: ComputeFn,
    ) -> Flight {
        match self.inner.flights.entry(key.to_string()) {
            Entry::Occupied(pending) => {
                debug!(key, "Joining in-flight computation");
                pending.get().clone()
            }
            Entry::Vacant(slot) => {
                if let Some(landed) = self.landed_since(key, &ttl, seen) {
                    debug!(key, "Computation finished since lookup, reusing its result");
                    return future::ready(Ok(landed)).boxed().shared();
                }

                CacheStats::bump(&self.inner.stats.computations);
                // Dropping the guard waits on this shard until the vacant slot
                // below is filled.
                let guard = FlightGuard {
                    inner: Arc::clone(&self.inner),
                    key: key.to_string(),
                };
                let handle = tokio::spawn(async move {
                    guard.inner.compute(&guard.key, ttl, compute).await
                });
                let flight = async move {
                    handle.await.unwrap_or_else(|e| {
                        warn!(error = %e, "Computation task died; nothing cached");
                        Err(Arc::new(Error::Internal(format!("computation task failed: {e}"))))
                    })
                }
                .boxed()
                .shared();
                slot.insert(flight.clone());
                flight
            }
        }
    }

    /// In-process entry newer than `seen` that `ttl` still allows serving
    fn landed_since(
        &self,
        key: &str,
        ttl: &Ttl,
        seen: Option<DateTime<Utc>>,
    ) -> Option<Arc<CacheEntry>> {
        let entry = self.inner.local.get(key).map(|e| Arc::clone(e.value()))?;
        let newer = seen.is_none_or(|at| entry.computed_at > at);
        let usable = entry.freshness(self.inner.clock.now(), ttl) != Freshness::Expired;
        (newer && usable).then_some(entry)
    }
}

/// Removes a key's flight when its task ends, whether it returned or panicked
struct FlightGuard {
    inner: Arc<Inner>,
    key: String,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.inner.flights.remove(&self.key);
    }
}

impl Inner {
    async fn compute(&self, key: &str, ttl: Ttl, compute: ComputeFn) -> FlightResult {
        let result = self.run(key, ttl, compute).await;
        if let Err(err) = &result {
            CacheStats::bump(&self.stats.failures);
            warn!(key, error = %err, "Computation failed; nothing cached");
        }
        result.map_err(Arc::new)
    }

    async fn run(&self, key: &str, ttl: Ttl, compute: ComputeFn) -> Result<Arc<CacheEntry>> {
        let _permit = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => return Err(Error::Shutdown),
            permit = self.workers.acquire() => {
                permit.map_err(|_| Error::Internal("worker pool closed".to_string()))?
            }
        };

        let token = self.shutdown.child_token();
        let value = tokio::select! {
            biased;
            () = token.cancelled() => return Err(Error::Shutdown),
            result = compute(token.clone()) => result?,
        };

        let entry = CacheEntry {
            key: key.to_string(),
            value,
            computed_at: self.clock.now(),
            ttl,
        };
        self.with_shutdown(self.store.set(key, entry.encode(), ttl.max()))
            .await?;
        debug!(key, bytes = entry.value.len(), "Computed and stored");
        Ok(self.remember(entry))
    }

    fn remember(&self, entry: CacheEntry) -> Arc<CacheEntry> {
        let entry = Arc::new(entry);
        self.local.insert(entry.key.clone(), Arc::clone(&entry));
        entry
    }

    async fn with_shutdown<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Err(Error::Shutdown),
            result = op => result,
        }
    }
}
