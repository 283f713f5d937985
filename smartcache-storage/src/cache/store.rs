//! TTL-aware key→entry store with an optional durable mirror.
//!
//! Reads only ever see fresh entries: an entry whose age has reached its TTL
//! is reported as absent, even though it stays in memory until overwritten,
//! removed or purged. The mirror is best-effort. The first mirror error
//! detaches it and the store carries on in memory.
//!
//! Writers take `mirror_io` before the entry lock and keep it through the
//! mirror call, so mirror writes land in the same order as the in-memory
//! changes. The entry lock itself is released before any mirror I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde_json::Value;
use smartcache_core::{CacheEntry, Clock, StorageError, StoredEnvelope};

use super::key::CacheKey;
use super::traits::{CacheStats, DurableMirror};

/// In-memory cache store.
///
/// All operations are synchronous and take `&self`; the store is shared
/// behind an `Arc` by the orchestrator and its refresh tasks.
pub struct CacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    mirror: RwLock<Option<Arc<dyn DurableMirror>>>,
    /// Serializes writers. Always taken before `entries`.
    mirror_io: Mutex<()>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
    storage_failures: AtomicU64,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.len())
            .field("mirrored", &self.is_mirrored())
            .field("clock", &self.clock)
            .finish()
    }
}

impl CacheStore {
    /// A memory-only store.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            mirror: RwLock::new(None),
            mirror_io: Mutex::new(()),
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            storage_failures: AtomicU64::new(0),
        }
    }

    /// A store backed by a durable mirror, hydrated from its current contents.
    ///
    /// Records that are expired, carry a non-canonical key, or fail to decode
    /// are skipped. If the mirror cannot be read at all the store starts
    /// empty and memory-only.
    pub fn with_mirror(clock: Arc<dyn Clock>, mirror: Arc<dyn DurableMirror>) -> Self {
        let store = Self::new(clock);

        let records = match mirror.load_all() {
            Ok(records) => records,
            Err(e) => {
                store.record_storage_failure("load_all", &e);
                return store;
            }
        };

        let now = store.clock.now();
        let mut loaded = 0usize;
        let mut skipped = 0usize;
        {
            let mut entries = store.write_entries();
            for record in records {
                let entry = CacheKey::parse(&record.key)
                    .map_err(|e| e.to_string())
                    .and_then(|_| {
                        StoredEnvelope::from_bytes(&record.key, &record.bytes)
                            .and_then(|env| CacheEntry::from_envelope(record.key.clone(), env))
                            .map_err(|e| e.to_string())
                    });

                match entry {
                    Ok(entry) if entry.is_fresh_at(now) => {
                        entries.insert(record.key, entry);
                        loaded += 1;
                    }
                    Ok(_) => skipped += 1,
                    Err(reason) => {
                        tracing::debug!(key = %record.key, reason = %reason, "Skipping unreadable mirror record");
                        skipped += 1;
                    }
                }
            }
        }

        *store.mirror.write().unwrap_or_else(PoisonError::into_inner) = Some(mirror);
        tracing::info!(loaded, skipped, "Hydrated cache store from durable mirror");
        store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The entry for `key`, only if it is still fresh.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now();
        let fresh = self
            .read_entries()
            .get(key)
            .filter(|entry| entry.is_fresh_at(now))
            .cloned();

        if fresh.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        fresh
    }

    /// Write `payload` under `key`, replacing any previous entry and
    /// restarting its TTL at the current clock time.
    pub fn set(&self, key: &str, payload: Value, ttl: Duration) -> CacheEntry {
        let entry = CacheEntry::new(key, payload, self.clock.now(), ttl);

        let _io = self.lock_mirror_io();
        self.write_entries().insert(key.to_string(), entry.clone());
        self.with_mirror_op("put", |mirror| {
            let bytes = entry.to_envelope().to_bytes()?;
            mirror.put(key, &bytes)
        });
        entry
    }

    /// Delete one entry. Returns whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        let _io = self.lock_mirror_io();
        let existed = self.write_entries().remove(key).is_some();
        self.with_mirror_op("delete", |mirror| mirror.delete(key));
        existed
    }

    /// Delete every entry whose key starts with `prefix`.
    ///
    /// Readers observe either all matching entries or none of them.
    /// Returns the number of in-memory entries removed.
    pub fn remove_by_prefix(&self, prefix: &str) -> usize {
        let _io = self.lock_mirror_io();
        let removed = {
            let mut entries = self.write_entries();
            let before = entries.len();
            entries.retain(|key, _| !key.starts_with(prefix));
            before - entries.len()
        };
        self.with_mirror_op("delete_prefix", |mirror| mirror.delete_prefix(prefix));

        tracing::debug!(prefix = %prefix, removed, "Removed cache entries by prefix");
        removed
    }

    /// Eagerly drop expired entries from memory and the mirror.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let _io = self.lock_mirror_io();
        let expired: Vec<String> = {
            let mut entries = self.write_entries();
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| !entry.is_fresh_at(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                entries.remove(key);
            }
            expired
        };

        for key in &expired {
            self.with_mirror_op("delete", |mirror| mirror.delete(key));
        }
        expired.len()
    }

    /// Number of entries held in memory, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_entries().is_empty()
    }

    /// All keys held in memory, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read_entries().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Whether a durable mirror is still attached.
    pub fn is_mirrored(&self) -> bool {
        self.mirror
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.len() as u64,
            storage_failures: self.storage_failures.load(Ordering::Relaxed),
            mirrored: self.is_mirrored(),
        }
    }

    // A panicking reader cannot leave the map half-written, so a poisoned
    // lock still guards consistent data.
    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_mirror_io(&self) -> MutexGuard<'_, ()> {
        self.mirror_io.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_mirror_op<R>(
        &self,
        operation: &'static str,
        op: impl FnOnce(&dyn DurableMirror) -> Result<R, StorageError>,
    ) -> Option<R> {
        let mirror = self
            .mirror
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;

        match op(mirror.as_ref()) {
            Ok(result) => Some(result),
            Err(e) => {
                self.record_storage_failure(operation, &e);
                None
            }
        }
    }

    fn record_storage_failure(&self, operation: &'static str, error: &StorageError) {
        self.storage_failures.fetch_add(1, Ordering::Relaxed);
        let detached = self
            .mirror
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();

        tracing::warn!(
            operation,
            error = %error,
            detached,
            "Durable mirror failed, continuing memory-only"
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use smartcache_core::ManualClock;

    proptest! {
        /// Property: an entry is visible exactly while its age is below its TTL.
        #[test]
        fn prop_visible_iff_fresh(ttl_ms in 1u64..1_000_000, elapsed_ms in 0u64..2_000_000) {
            let clock = Arc::new(ManualClock::at_epoch());
            let store = CacheStore::new(clock.clone());
            store.set("k", Value::Null, Duration::from_millis(ttl_ms));

            clock.advance_ms(elapsed_ms);
            prop_assert_eq!(store.get("k").is_some(), elapsed_ms < ttl_ms);
        }

        /// Property: prefix removal leaves exactly the non-matching keys.
        #[test]
        fn prop_remove_by_prefix_partitions(
            keys in proptest::collection::btree_set("(orders|shipments):[a-z]{1,4}", 0..20),
        ) {
            let clock = Arc::new(ManualClock::at_epoch());
            let store = CacheStore::new(clock);
            for key in &keys {
                store.set(key, Value::Null, Duration::from_secs(60));
            }

            let expected_removed = keys.iter().filter(|k| k.starts_with("orders:")).count();
            prop_assert_eq!(store.remove_by_prefix("orders:"), expected_removed);
            prop_assert!(store.keys().iter().all(|k| k.starts_with("shipments:")));
        }
    }
}
