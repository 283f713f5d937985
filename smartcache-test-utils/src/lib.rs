//! SmartCache Test Utilities
//!
//! Centralized test infrastructure for the SmartCache workspace:
//! - Scripted, counting and gated fetchers
//! - In-memory and always-failing durable mirrors
//! - Proptest generators for keys, parameters and strategies

// Re-export core types for convenience
pub use smartcache_core::{
    CacheError, CacheResult, CacheStrategy, Clock, FetchError, ManualClock, StorageError,
    Timestamp,
};
pub use smartcache_storage::{DurableMirror, MirrorRecord};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use smartcache::Fetcher;
use tokio::sync::{watch, Semaphore};

// ============================================================================
// FETCHERS
// ============================================================================

struct CountingInner<T> {
    script: Mutex<VecDeque<Result<T, FetchError>>>,
    last: Mutex<Option<Result<T, FetchError>>>,
    calls: watch::Sender<usize>,
    gate: Option<Semaphore>,
}

/// Fetcher that replays scripted results and counts its calls.
///
/// Results are handed out in order; once the script runs out the last
/// result repeats. Clones share the script and the counter.
///
/// A gated fetcher blocks every call until [`release`](Self::release) hands
/// out a permit, which lets tests hold a fetch "in flight".
pub struct CountingFetcher<T> {
    inner: Arc<CountingInner<T>>,
}

impl<T> Clone for CountingFetcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> CountingFetcher<T> {
    /// Always succeed with `value`.
    pub fn returning(value: T) -> Self {
        Self::sequence(vec![Ok(value)])
    }

    /// Always fail with `message`.
    pub fn failing(message: &str) -> Self {
        Self::sequence(vec![Err(FetchError::msg(message))])
    }

    /// Replay `results` in order, then keep repeating the last one.
    pub fn sequence(results: Vec<Result<T, FetchError>>) -> Self {
        Self::build(results, None)
    }

    /// Like [`sequence`](Self::sequence), but every call waits for a permit.
    pub fn gated(results: Vec<Result<T, FetchError>>) -> Self {
        Self::build(results, Some(Semaphore::new(0)))
    }

    fn build(results: Vec<Result<T, FetchError>>, gate: Option<Semaphore>) -> Self {
        let (calls, _) = watch::channel(0);
        Self {
            inner: Arc::new(CountingInner {
                script: Mutex::new(results.into()),
                last: Mutex::new(None),
                calls,
                gate,
            }),
        }
    }

    /// Number of fetches started so far.
    pub fn calls(&self) -> usize {
        *self.inner.calls.borrow()
    }

    /// Wait until at least `n` fetches have started.
    pub async fn wait_for_calls(&self, n: usize) {
        let mut rx = self.inner.calls.subscribe();
        let _ = rx.wait_for(|calls| *calls >= n).await;
    }

    /// Let `n` gated fetches complete. No effect on ungated fetchers.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.inner.gate {
            gate.add_permits(n);
        }
    }

    fn next_result(&self) -> Result<T, FetchError> {
        let scripted = self
            .inner
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let mut last = self.inner.last.lock().unwrap_or_else(PoisonError::into_inner);
        match scripted {
            Some(result) => {
                *last = Some(result.clone());
                result
            }
            None => last
                .clone()
                .unwrap_or_else(|| Err(FetchError::msg("CountingFetcher has no scripted results"))),
        }
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> Fetcher<T> for CountingFetcher<T> {
    async fn fetch(&self) -> Result<T, FetchError> {
        let result = self.next_result();
        self.inner.calls.send_modify(|calls| *calls += 1);

        if let Some(gate) = &self.inner.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        result
    }
}

// ============================================================================
// MIRRORS
// ============================================================================

/// In-memory [`DurableMirror`] that can be switched into failure mode.
#[derive(Debug, Default)]
pub struct MemoryMirror {
    records: Mutex<HashMap<String, Vec<u8>>>,
    failing: AtomicBool,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following operation fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Persisted keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Plant raw bytes, bypassing the store.
    pub fn insert_raw(&self, key: &str, bytes: &[u8]) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), bytes.to_vec());
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StorageError::MirrorUnavailable {
                reason: "memory mirror switched to failing".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

impl DurableMirror for MemoryMirror {
    fn load_all(&self) -> Result<Vec<MirrorRecord>, StorageError> {
        self.check()?;
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, bytes)| MirrorRecord {
                key: key.clone(),
                bytes: bytes.clone(),
            })
            .collect())
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.check()?;
        self.insert_raw(key, bytes);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        self.records.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        self.check()?;
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|key, _| !key.starts_with(prefix));
        Ok((before - records.len()) as u64)
    }
}

/// Mirror whose every operation fails, e.g. a full or read-only disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingMirror;

impl DurableMirror for FailingMirror {
    fn load_all(&self) -> Result<Vec<MirrorRecord>, StorageError> {
        Err(StorageError::MirrorUnavailable {
            reason: "quota exceeded".to_string(),
        })
    }

    fn put(&self, key: &str, _bytes: &[u8]) -> Result<(), StorageError> {
        Err(StorageError::MirrorWriteFailed {
            key: key.to_string(),
            reason: "quota exceeded".to_string(),
        })
    }

    fn delete(&self, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::TransactionFailed {
            reason: "quota exceeded".to_string(),
        })
    }

    fn delete_prefix(&self, _prefix: &str) -> Result<u64, StorageError> {
        Err(StorageError::TransactionFailed {
            reason: "quota exceeded".to_string(),
        })
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;
    use smartcache_storage::Params;
    use std::time::Duration;

    /// A dashboard resource group.
    pub fn arb_group() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("orders".to_string()),
            Just("shipments".to_string()),
            Just("warehouses".to_string()),
            Just("couriers".to_string()),
        ]
    }

    /// A resource path of one or two segments, e.g. `orders:list`.
    pub fn arb_resource() -> impl Strategy<Value = String> {
        (arb_group(), proptest::option::of("[a-z]{1,8}")).prop_map(|(group, sub)| match sub {
            Some(sub) => format!("{group}:{sub}"),
            None => group,
        })
    }

    /// Parameter text that likes the reserved characters `:`, `=` and `%`.
    pub fn arb_param_text() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9:=% _-]{0,12}"
    }

    /// Parameter pairs with unique names, in arbitrary order.
    pub fn arb_param_pairs() -> impl Strategy<Value = Vec<(String, String)>> {
        proptest::collection::hash_map(arb_param_text(), arb_param_text(), 0..8)
            .prop_map(|m| m.into_iter().collect())
    }

    pub fn arb_params() -> impl Strategy<Value = Params> {
        arb_param_pairs().prop_map(|pairs| pairs.into_iter().collect())
    }

    /// A valid strategy: positive TTL, optional positive refresh interval.
    pub fn arb_strategy() -> impl Strategy<Value = CacheStrategy> {
        (1u64..3_600_000, proptest::option::of(1u64..600_000)).prop_map(|(ttl, every)| {
            CacheStrategy {
                ttl: Duration::from_millis(ttl),
                background_refresh: every.map(Duration::from_millis),
            }
        })
    }
}
