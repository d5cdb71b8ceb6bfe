//! Cache statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters tracked atomically by the computation cache
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Entries served without recomputation
    pub fresh_hits: AtomicU64,
    /// Stale entries served while a refresh was scheduled
    pub stale_hits: AtomicU64,
    /// Lookups that found nothing usable and had to wait for a computation
    pub misses: AtomicU64,
    /// Computations started (synchronous and background)
    pub computations: AtomicU64,
    /// Computations that ended in an error
    pub failures: AtomicU64,
}

impl CacheStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Hit rate (fresh + stale over all lookups, 0.0-1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.fresh_hits.load(Ordering::Relaxed) + self.stale_hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub(crate) fn snapshot(&self, in_flight: usize, local_entries: usize) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            fresh_hits: self.fresh_hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            computations: self.computations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            in_flight,
            local_entries,
            hit_rate: self.hit_rate(),
        }
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatsSnapshot {
    /// Entries served without recomputation
    pub fresh_hits: u64,
    /// Stale entries served
    pub stale_hits: u64,
    /// Lookups that waited on a computation
    pub misses: u64,
    /// Computations started
    pub computations: u64,
    /// Failed computations
    pub failures: u64,
    /// Computations currently running or queued
    pub in_flight: usize,
    /// Entries held in the in-process layer
    pub local_entries: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_counts_stale_as_hit() {
        let stats = CacheStats::default();
        CacheStats::bump(&stats.fresh_hits);
        CacheStats::bump(&stats.stale_hits);
        CacheStats::bump(&stats.misses);
        CacheStats::bump(&stats.misses);

        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
        let snap = stats.snapshot(1, 3);
        assert_eq!(snap.misses, 2);
        assert_eq!(snap.in_flight, 1);
        assert_eq!(snap.local_entries, 3);
    }

    #[test]
    fn empty_hit_rate_is_zero() {
        assert!(CacheStats::default().hit_rate().abs() < f64::EPSILON);
    }
}
