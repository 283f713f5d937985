//! Orchestrator counters.

use std::sync::atomic::{AtomicU64, Ordering};

use smartcache_storage::CacheStats;

/// Counters shared by the orchestrator and its refresh tasks.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Foreground fetches actually started (joins excluded)
    pub fetches: AtomicU64,
    /// Foreground fetches that failed
    pub fetch_failures: AtomicU64,
    /// Cold reads that joined a fetch already in flight
    pub deduplicated: AtomicU64,
    /// Background refreshes that updated the store
    pub refreshes: AtomicU64,
    /// Background refreshes that failed and were swallowed
    pub refresh_failures: AtomicU64,
    /// Background results discarded because their key was cancelled mid-fetch
    pub discarded_refreshes: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            fetches: self.fetches.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            discarded_refreshes: self.discarded_refreshes.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of orchestrator metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
    pub fetches: u64,
    pub fetch_failures: u64,
    pub deduplicated: u64,
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub discarded_refreshes: u64,
}

/// Store statistics plus orchestrator counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmartCacheStats {
    pub store: CacheStats,
    pub orchestrator: CacheMetricsSnapshot,
    /// Keys with a live background-refresh task.
    pub scheduled_refreshes: usize,
}
