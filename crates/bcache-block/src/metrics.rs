//! Cache counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// `acquire` calls that found the block already cached.
    pub hits: AtomicU64,
    /// `acquire` calls that had to claim a slot.
    pub misses: AtomicU64,
    /// Misses satisfied by reusing a slot of the home shard.
    pub local_evictions: AtomicU64,
    /// Misses satisfied by moving a slot from another shard.
    pub steals: AtomicU64,
    /// `acquire` calls that failed with no free slot anywhere.
    pub exhausted: AtomicU64,
    /// Transport reads issued.
    pub device_reads: AtomicU64,
    /// Transport writes issued.
    pub device_writes: AtomicU64,
}

impl CacheMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_local_eviction(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.local_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_steal(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.steals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_exhausted(&self) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_device_read(&self) {
        self.device_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_device_write(&self) {
        self.device_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the counters for reporting.
    #[must_use]
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            local_evictions: self.local_evictions.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            device_reads: self.device_reads.load(Ordering::Relaxed),
            device_writes: self.device_writes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CacheMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub local_evictions: u64,
    pub steals: u64,
    pub exhausted: u64,
    pub device_reads: u64,
    pub device_writes: u64,
}

impl CacheMetricsSnapshot {
    /// Hit rate as a fraction in [0.0, 1.0].
    #[must_use]
    #[expect(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}
