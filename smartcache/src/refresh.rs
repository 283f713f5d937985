//! Background refresh jobs.
//!
//! A [`RefreshJob`] is everything a key's timer needs to re-run its refresh
//! cycle: the latest fetcher, the TTL to store results with, and the sinks
//! of every live subscription. The job is shared between the timer task and
//! those subscriptions.
//!
//! Closing a job and publishing from it take the same lock. Once
//! [`RefreshJob::close`] returns, no result can reach the store or a
//! subscriber through this job, including results of a fetch that was
//! already running.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use smartcache_core::Timestamp;
use smartcache_storage::{CacheKey, CacheStore};

use crate::delivery::{DeliverySender, DeliverySource, RawDelivery, SubscriptionId};
use crate::fetcher::{ErasedFetcher, Fetcher, JsonFetcher};
use crate::metrics::CacheMetrics;

struct JobState {
    fetcher: Arc<dyn ErasedFetcher>,
    ttl: Duration,
    subscribers: Vec<(SubscriptionId, DeliverySender)>,
    /// Id of the last foreground fetch adopted by this job.
    last_fetch: Option<u64>,
    closed: bool,
}

/// The refresh cycle for one cache key.
pub struct RefreshJob {
    key: CacheKey,
    store: Arc<CacheStore>,
    metrics: Arc<CacheMetrics>,
    state: Mutex<JobState>,
}

impl std::fmt::Debug for RefreshJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("RefreshJob")
            .field("key", &self.key)
            .field("ttl", &state.ttl)
            .field("subscribers", &state.subscribers.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl RefreshJob {
    /// A job that refreshes `key` with `fetcher`, storing results for `ttl`.
    pub fn new<T, F>(
        key: CacheKey,
        store: Arc<CacheStore>,
        metrics: Arc<CacheMetrics>,
        fetcher: F,
        ttl: Duration,
    ) -> Self
    where
        T: Serialize + Send + 'static,
        F: Fetcher<T>,
    {
        let fetcher = JsonFetcher::erase(key.as_str(), fetcher);
        Self::from_erased(key, store, metrics, fetcher, ttl)
    }

    pub(crate) fn from_erased(
        key: CacheKey,
        store: Arc<CacheStore>,
        metrics: Arc<CacheMetrics>,
        fetcher: Arc<dyn ErasedFetcher>,
        ttl: Duration,
    ) -> Self {
        Self {
            key,
            store,
            metrics,
            state: Mutex::new(JobState {
                fetcher,
                ttl,
                subscribers: Vec::new(),
                last_fetch: None,
                closed: false,
            }),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Take over the result of foreground fetch `fetch`.
    ///
    /// The first call for a given fetch id publishes `payload` to every sink
    /// and switches to `fetcher` and `ttl`; it returns true. Later calls with
    /// the same id come from callers that shared that fetch and change
    /// nothing.
    pub(crate) fn adopt(
        &self,
        fetch: u64,
        payload: &Value,
        delivered_at: Timestamp,
        fetcher: Arc<dyn ErasedFetcher>,
        ttl: Duration,
    ) -> bool {
        let mut state = self.lock();
        if state.closed || state.last_fetch == Some(fetch) {
            return false;
        }
        state.last_fetch = Some(fetch);
        state.fetcher = fetcher;
        state.ttl = ttl;
        Self::fan_out(&mut state, payload, delivered_at);
        true
    }

    /// Add a sink. Returns false if the job is already closed.
    pub(crate) fn attach(&self, id: SubscriptionId, sender: DeliverySender) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.subscribers.push((id, sender));
        true
    }

    /// Remove a sink; returns how many remain.
    pub(crate) fn detach(&self, id: SubscriptionId) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|(sid, _)| *sid != id);
        state.subscribers.len()
    }

    /// Stop the job for good and drop every sink.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    /// Run one refresh cycle.
    ///
    /// Failures are logged and counted; they never stop the job.
    pub async fn tick(&self) {
        let fetcher = {
            let state = self.lock();
            if state.closed {
                return;
            }
            Arc::clone(&state.fetcher)
        };

        // The lock is not held here: the fetch may take arbitrarily long.
        let result = fetcher.fetch_value().await;

        match result {
            Ok(payload) => {
                let mut state = self.lock();
                if state.closed {
                    CacheMetrics::incr(&self.metrics.discarded_refreshes);
                    tracing::debug!(key = %self.key, "Discarding refresh result for cancelled key");
                    return;
                }

                let entry = self.store.set(self.key.as_str(), payload, state.ttl);
                let delivered = Self::fan_out(&mut state, &entry.payload, entry.stored_at);
                CacheMetrics::incr(&self.metrics.refreshes);
                tracing::debug!(key = %self.key, subscribers = delivered, "Background refresh stored");
            }
            Err(e) => {
                CacheMetrics::incr(&self.metrics.refresh_failures);
                tracing::warn!(key = %self.key, error = %e, "Background refresh failed");
            }
        }
    }

    fn fan_out(state: &mut JobState, payload: &Value, delivered_at: Timestamp) -> usize {
        state.subscribers.retain(|(_, sender)| {
            sender
                .send(RawDelivery {
                    payload: payload.clone(),
                    source: DeliverySource::Network,
                    delivered_at,
                })
                .is_ok()
        });
        state.subscribers.len()
    }

    // Every critical section leaves `JobState` consistent, so a poisoned
    // lock can be recovered.
    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
