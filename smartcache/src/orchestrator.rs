//! The SmartCache orchestrator.
//!
//! Stale-while-revalidate over [`CacheStore`]:
//! - a fresh hit resolves immediately from the cache and makes sure the key
//!   has a background-refresh task
//! - a miss fetches, stores, resolves with the network result and
//!   (re)starts the key's refresh task
//! - a failed fetch resolves with the caller's error and changes nothing
//!
//! The context is an explicit value. Construct one per process (or per test)
//! and clone it wherever it is needed; clones share all state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use smartcache_core::{
    CacheError, CacheResult, CacheStrategy, Clock, SmartCacheConfig, DEFAULT_DEDUPE_IN_FLIGHT,
};
use smartcache_storage::{build_key, CacheKey, CacheStore, LmdbMirror, Params};
use tokio::sync::mpsc;

use crate::delivery::{
    Delivery, DeliverySender, DeliverySource, JobLink, RawDelivery, Subscription, SubscriptionId,
};
use crate::fetcher::{ErasedFetcher, Fetcher, JsonFetcher};
use crate::metrics::{CacheMetrics, SmartCacheStats};
use crate::refresh::RefreshJob;
use crate::timers::TimerRegistry;

type SharedFetch = Shared<BoxFuture<'static, CacheResult<Value>>>;

/// A fetched payload and the id of the fetch that produced it. Callers that
/// joined a shared fetch see the same id.
type Fetched = (Value, u64);

struct Inner {
    store: Arc<CacheStore>,
    timers: Arc<TimerRegistry>,
    metrics: Arc<CacheMetrics>,
    in_flight: Mutex<HashMap<CacheKey, (u64, SharedFetch)>>,
    next_fetch: AtomicU64,
    dedupe_in_flight: bool,
}

/// Cache orchestrator context.
#[derive(Clone)]
pub struct SmartCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SmartCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartCache")
            .field("store", &self.inner.store)
            .field("timers", &self.inner.timers)
            .field("dedupe_in_flight", &self.inner.dedupe_in_flight)
            .finish()
    }
}

/// How a foreground result relates to the key's refresh task.
#[derive(Debug, Clone, Copy)]
enum Attach {
    /// Cache hit: join the existing task or start one.
    Ensure,
    /// Fresh fetch: publish the result and restart the task from zero, once
    /// per `fetch`, unless `cancel_all` ran since the epoch was read.
    Restart { epoch: u64, fetch: u64 },
}

impl SmartCache {
    /// Orchestrate an existing store, with in-flight de-duplication on.
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self::with_options(store, DEFAULT_DEDUPE_IN_FLIGHT)
    }

    /// A memory-only cache.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::new(Arc::new(CacheStore::new(clock)))
    }

    pub fn with_options(store: Arc<CacheStore>, dedupe_in_flight: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                timers: Arc::new(TimerRegistry::new()),
                metrics: Arc::new(CacheMetrics::new()),
                in_flight: Mutex::new(HashMap::new()),
                next_fetch: AtomicU64::new(0),
                dedupe_in_flight,
            }),
        }
    }

    /// Build a context from configuration.
    ///
    /// A mirror that cannot be opened is a storage failure, not a startup
    /// error: the cache runs memory-only and says so in the log.
    pub fn from_config(config: &SmartCacheConfig, clock: Arc<dyn Clock>) -> CacheResult<Self> {
        config.validate()?;

        let store = match &config.mirror_path {
            Some(path) => match LmdbMirror::open(path, config.mirror_max_size_mb) {
                Ok(mirror) => CacheStore::with_mirror(clock, Arc::new(mirror)),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Durable mirror unavailable, running memory-only"
                    );
                    CacheStore::new(clock)
                }
            },
            None => CacheStore::new(clock),
        };

        tracing::info!(
            mirrored = store.is_mirrored(),
            entries = store.len(),
            dedupe_in_flight = config.dedupe_in_flight,
            "SmartCache initialised"
        );
        Ok(Self::with_options(Arc::new(store), config.dedupe_in_flight))
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }

    pub fn timers(&self) -> &Arc<TimerRegistry> {
        &self.inner.timers
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        self.inner.store.clock()
    }

    /// Read `key`, serving a fresh cached value when there is one.
    ///
    /// The returned subscription resolves with the cached payload
    /// (`DeliverySource::Cache`) or the fetched one (`DeliverySource::Network`),
    /// and then keeps receiving background refreshes for the key while the
    /// strategy asks for them.
    ///
    /// # Errors
    ///
    /// - `CacheError::Fetch`: the fetch failed; nothing was stored and no
    ///   refresh task was started
    /// - `CacheError::Codec`: the payload could not be converted to or from JSON
    pub async fn get_data<T, F>(
        &self,
        key: &CacheKey,
        strategy: &CacheStrategy,
        fetcher: F,
    ) -> CacheResult<Subscription<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fetcher<T>,
    {
        let fetcher = JsonFetcher::erase(key.as_str(), fetcher);

        if let Some(entry) = self.inner.store.get(key.as_str()) {
            match serde_json::from_value::<T>(entry.payload.clone()) {
                Ok(payload) => {
                    tracing::debug!(key = %key, "Cache hit");
                    return Ok(self.open_subscription(
                        key,
                        strategy,
                        fetcher,
                        payload,
                        entry.payload,
                        DeliverySource::Cache,
                        Attach::Ensure,
                    ));
                }
                Err(e) => {
                    tracing::warn!(
                        key = %key,
                        error = %e,
                        "Cached payload does not match requested type, refetching"
                    );
                }
            }
        }

        tracing::debug!(key = %key, "Cache miss");
        let epoch = self.inner.timers.epoch();
        let fetched = self.fetch_deduplicated(key, &fetcher).await?;
        self.store_and_subscribe(key, strategy, fetcher, fetched, epoch)
    }

    /// Fetch `key` regardless of what is cached, overwrite the entry, and
    /// restart its refresh task.
    ///
    /// Never joins a fetch already in flight for the key.
    pub async fn force_refresh<T, F>(
        &self,
        key: &CacheKey,
        strategy: &CacheStrategy,
        fetcher: F,
    ) -> CacheResult<Subscription<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fetcher<T>,
    {
        let fetcher = JsonFetcher::erase(key.as_str(), fetcher);
        let epoch = self.inner.timers.epoch();

        tracing::debug!(key = %key, "Forced refresh");
        let fetch = self.next_fetch_id();
        let value = fetch_counted(&self.inner.metrics, key, fetcher.as_ref()).await?;
        self.store_and_subscribe(key, strategy, fetcher, (value, fetch), epoch)
    }

    /// Cancel every background-refresh task.
    ///
    /// After this returns no refresh fires and no delivery reaches any
    /// subscriber, including deliveries from fetches already in flight.
    /// Cached entries are kept.
    pub fn clear_all_timers(&self) -> usize {
        let cancelled = self.inner.timers.cancel_all();
        tracing::info!(cancelled, "All refresh tasks cleared");
        cancelled
    }

    /// Evict one key and stop refreshing it.
    pub fn remove(&self, key: &CacheKey) -> bool {
        self.inner.timers.cancel(key);
        self.inner.store.remove(key.as_str())
    }

    /// Evict every key starting with `prefix` and stop refreshing them.
    ///
    /// Use [`CacheKey::group_prefix`] to target exactly one group.
    pub fn remove_by_prefix(&self, prefix: &str) -> usize {
        let cancelled = self.inner.timers.cancel_prefix(prefix);
        let removed = self.inner.store.remove_by_prefix(prefix);
        tracing::info!(prefix = %prefix, removed, cancelled, "Cache group invalidated");
        removed
    }

    /// Evict a whole group, e.g. `"orders"` after an order was created.
    ///
    /// Covers the bare group key (`orders`) as well as every key below it
    /// (`orders:...`), and nothing from neighbouring groups.
    pub fn invalidate_group(&self, group: &str) -> usize {
        let bare = build_key(group, &Params::new());
        let removed = usize::from(self.remove(&bare));
        removed + self.remove_by_prefix(&CacheKey::group_prefix(group))
    }

    pub fn stats(&self) -> SmartCacheStats {
        SmartCacheStats {
            store: self.inner.store.stats(),
            orchestrator: self.inner.metrics.snapshot(),
            scheduled_refreshes: self.inner.timers.len(),
        }
    }

    fn store_and_subscribe<T>(
        &self,
        key: &CacheKey,
        strategy: &CacheStrategy,
        fetcher: Arc<dyn ErasedFetcher>,
        (value, fetch): Fetched,
        epoch: u64,
    ) -> CacheResult<Subscription<T>>
    where
        T: DeserializeOwned,
    {
        let payload = serde_json::from_value::<T>(value.clone()).map_err(|e| CacheError::Codec {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        self.inner.store.set(key.as_str(), value.clone(), strategy.ttl);
        Ok(self.open_subscription(
            key,
            strategy,
            fetcher,
            payload,
            value,
            DeliverySource::Network,
            Attach::Restart { epoch, fetch },
        ))
    }

    /// Share one fetch between concurrent cold reads of the same key.
    async fn fetch_deduplicated(
        &self,
        key: &CacheKey,
        fetcher: &Arc<dyn ErasedFetcher>,
    ) -> CacheResult<Fetched> {
        if !self.inner.dedupe_in_flight {
            let fetch = self.next_fetch_id();
            let value = fetch_counted(&self.inner.metrics, key, fetcher.as_ref()).await?;
            return Ok((value, fetch));
        }

        let (fetch, shared) = {
            let mut in_flight = self.lock_in_flight();
            match in_flight.get(key) {
                Some((fetch, existing)) => {
                    CacheMetrics::incr(&self.inner.metrics.deduplicated);
                    tracing::debug!(key = %key, "Joining in-flight fetch");
                    (*fetch, existing.clone())
                }
                None => {
                    let metrics = Arc::clone(&self.inner.metrics);
                    let owned_key = key.clone();
                    let fetcher = Arc::clone(fetcher);
                    let fetch: BoxFuture<'static, CacheResult<Value>> = Box::pin(async move {
                        fetch_counted(&metrics, &owned_key, fetcher.as_ref()).await
                    });
                    let shared = fetch.shared();
                    let id = self.next_fetch_id();
                    in_flight.insert(key.clone(), (id, shared.clone()));
                    (id, shared)
                }
            }
        };

        let result = shared.clone().await;

        let mut in_flight = self.lock_in_flight();
        if in_flight.get(key).is_some_and(|(current, _)| *current == fetch) {
            in_flight.remove(key);
        }
        result.map(|value| (value, fetch))
    }

    fn next_fetch_id(&self) -> u64 {
        self.inner.next_fetch.fetch_add(1, Ordering::Relaxed)
    }

    #[allow(clippy::too_many_arguments)]
    fn open_subscription<T>(
        &self,
        key: &CacheKey,
        strategy: &CacheStrategy,
        fetcher: Arc<dyn ErasedFetcher>,
        payload: T,
        raw: Value,
        source: DeliverySource,
        attach: Attach,
    ) -> Subscription<T>
    where
        T: DeserializeOwned,
    {
        let id = SubscriptionId::new();
        let delivered_at = self.clock().now();
        let (sender, receiver) = mpsc::unbounded_channel();

        // The resolved value goes first so later refreshes queue behind it.
        let _ = sender.send(RawDelivery {
            payload: raw.clone(),
            source,
            delivered_at,
        });

        let link = strategy.refresh_interval().and_then(|every| {
            self.attach_refresh(key, every, strategy.ttl, fetcher, id, sender, &raw, attach)
        });

        Subscription::new(
            id,
            key.clone(),
            Delivery {
                payload,
                source,
                delivered_at,
            },
            receiver,
            link,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn attach_refresh(
        &self,
        key: &CacheKey,
        every: Duration,
        ttl: Duration,
        fetcher: Arc<dyn ErasedFetcher>,
        id: SubscriptionId,
        sender: DeliverySender,
        raw: &Value,
        attach: Attach,
    ) -> Option<JobLink> {
        let epoch = match attach {
            Attach::Ensure => None,
            Attach::Restart { epoch, .. } => Some(epoch),
        };
        let now = self.clock().now();

        // Find-or-create and attach run under the registry lock, so two
        // concurrent reads of one key always end up on the same job.
        let job = self.inner.timers.attach_with(key, every, epoch, |existing| {
            if let Some(job) = existing {
                let restart = match attach {
                    Attach::Ensure => false,
                    Attach::Restart { fetch, .. } => {
                        job.adopt(fetch, raw, now, Arc::clone(&fetcher), ttl)
                    }
                };
                if job.attach(id, sender.clone()) {
                    return Some((job, restart));
                }
            }

            let job = self.new_job(key, Arc::clone(&fetcher), ttl);
            if let Attach::Restart { fetch, .. } = attach {
                job.adopt(fetch, raw, now, fetcher, ttl);
            }
            job.attach(id, sender);
            Some((job, true))
        });

        match job {
            Some(job) => Some(self.link(job)),
            None => {
                tracing::debug!(key = %key, "Timers cleared during fetch, not scheduling refresh");
                None
            }
        }
    }

    fn new_job(&self, key: &CacheKey, fetcher: Arc<dyn ErasedFetcher>, ttl: Duration) -> Arc<RefreshJob> {
        Arc::new(RefreshJob::from_erased(
            key.clone(),
            Arc::clone(&self.inner.store),
            Arc::clone(&self.inner.metrics),
            fetcher,
            ttl,
        ))
    }

    fn link(&self, job: Arc<RefreshJob>) -> JobLink {
        JobLink {
            job,
            timers: Arc::clone(&self.inner.timers),
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<CacheKey, (u64, SharedFetch)>> {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run one foreground fetch, counting it and logging failures.
async fn fetch_counted(
    metrics: &CacheMetrics,
    key: &CacheKey,
    fetcher: &dyn ErasedFetcher,
) -> CacheResult<Value> {
    CacheMetrics::incr(&metrics.fetches);
    let result = fetcher.fetch_value().await;
    if let Err(e) = &result {
        CacheMetrics::incr(&metrics.fetch_failures);
        tracing::warn!(key = %key, error = %e, "Fetch failed");
    }
    result
}
