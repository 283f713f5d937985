//! Durable mirror trait and cache statistics.
//!
//! A mirror is a dumb byte store keyed by the canonical cache key. The
//! [`CacheStore`](super::CacheStore) owns envelope encoding, freshness and
//! error policy; a mirror only has to persist what it is handed.

use std::fmt;

use smartcache_core::StorageError;

/// A raw record read back from a durable mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRecord {
    pub key: String,
    pub bytes: Vec<u8>,
}

/// Durable backing for the in-memory cache.
///
/// Implementations must be thread-safe. The store issues writes one at a
/// time, in the order it applied them in memory, and never holds its entry
/// lock across a call, so slow I/O does not block readers. Implementations
/// must not call back into the store.
///
/// # Errors
///
/// Any error is treated by the store as a storage failure: it is logged,
/// counted, and the mirror is detached for the remainder of the store's life.
pub trait DurableMirror: Send + Sync + fmt::Debug {
    /// Every record currently persisted, in any order.
    fn load_all(&self) -> Result<Vec<MirrorRecord>, StorageError>;

    /// Insert or overwrite one record.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Delete one record. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Delete every record whose key starts with `prefix`; returns how many.
    fn delete_prefix(&self, prefix: &str) -> Result<u64, StorageError>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of fresh reads.
    pub hits: u64,
    /// Number of reads that found nothing or only a stale entry.
    pub misses: u64,
    /// Number of entries currently held in memory (fresh or not yet purged).
    pub entry_count: u64,
    /// Mirror operations that failed.
    pub storage_failures: u64,
    /// Whether writes are still reaching a durable mirror.
    pub mirrored: bool,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
