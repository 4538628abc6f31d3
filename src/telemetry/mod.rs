//! Telemetry: profiler hooks and atomic cache statistics
//!
//! Two instrumentation surfaces. The [`SessionProfiler`] trait is the
//! external hook the owning session plugs in; its calls are skipped
//! entirely when the manager's pre-check flag says no profiler is active,
//! so the un-instrumented hot path pays nothing. [`CacheStatistics`] is the
//! always-on internal counter block: plain relaxed atomics, cache-padded to
//! keep counter traffic off shared lines.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use serde::Serialize;

/// Operation kinds reported to a profiler around cache-touching work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileOperation {
    /// Identity-map get/put/remove traffic.
    Caching,
    /// Entry and whole-cache lock acquisition.
    Locking,
    /// Query-result cache traffic.
    QueryCache,
}

/// Counters a profiler may aggregate beyond timed operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileCounter {
    CacheHit,
    CacheMiss,
    DeferredLock,
}

/// External profiling hooks, called only when instrumentation is active.
///
/// Implementations must be cheap to call and safe from any thread; the
/// cache invokes them inline on its hot paths.
pub trait SessionProfiler: Send + Sync + fmt::Debug {
    /// Whether this profiler wants callbacks at all. Checked once at
    /// manager construction, not per operation.
    fn is_enabled(&self) -> bool {
        true
    }

    fn start_operation(&self, operation: ProfileOperation);

    fn end_operation(&self, operation: ProfileOperation);

    fn increment(&self, counter: ProfileCounter);
}

/// The default profiler: permanently disabled, every call a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProfiler;

impl SessionProfiler for NoopProfiler {
    fn is_enabled(&self) -> bool {
        false
    }

    fn start_operation(&self, _operation: ProfileOperation) {}

    fn end_operation(&self, _operation: ProfileOperation) {}

    fn increment(&self, _counter: ProfileCounter) {}
}

/// Always-on cache counters with atomic coordination.
#[derive(Debug, Default)]
pub struct CacheStatistics {
    hits: CachePadded<AtomicU64>,
    misses: CachePadded<AtomicU64>,
    puts: CachePadded<AtomicU64>,
    removals: CachePadded<AtomicU64>,
    invalidations: CachePadded<AtomicU64>,
    /// Dead weak slots removed by cleanup sweeps.
    reclamations: CachePadded<AtomicU64>,
    deferred_locks: CachePadded<AtomicU64>,
}

/// Point-in-time view of [`CacheStatistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub removals: u64,
    pub invalidations: u64,
    pub reclamations: u64,
    pub deferred_locks: u64,
}

impl CacheStatsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl CacheStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_removal(&self) {
        self.removals.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_invalidations(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_reclamations(&self, count: u64) {
        self.reclamations.fetch_add(count, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_deferred_lock(&self) {
        self.deferred_locks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            reclamations: self.reclamations.load(Ordering::Relaxed),
            deferred_locks: self.deferred_locks.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.puts.store(0, Ordering::Relaxed);
        self.removals.store(0, Ordering::Relaxed);
        self.invalidations.store(0, Ordering::Relaxed);
        self.reclamations.store(0, Ordering::Relaxed);
        self.deferred_locks.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counts() {
        let stats = CacheStatistics::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        stats.record_put();
        stats.record_invalidations(3);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.puts, 1);
        assert_eq!(snapshot.invalidations, 3);
        assert!((snapshot.hit_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn reset_zeroes_everything() {
        let stats = CacheStatistics::new();
        stats.record_hit();
        stats.record_reclamations(5);
        stats.reset();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.hits, 0);
        assert_eq!(snapshot.reclamations, 0);
        assert_eq!(snapshot.hit_rate(), 0.0);
    }
}
