//! Registry of background-refresh tasks.
//!
//! At most one task is live per key. Each task sleeps for its interval, runs
//! one [`RefreshJob::tick`], and repeats until its shutdown signal fires. A
//! tick that has already started is allowed to finish; cancellation closes
//! the job, so the late result is discarded instead of delivered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use smartcache_core::MAX_REFRESH_INTERVAL;
use smartcache_storage::CacheKey;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::refresh::RefreshJob;

/// Shortest interval a task runs at; tokio rejects a zero period.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(1);

/// A live task for one key.
struct TimerHandle {
    job: Arc<RefreshJob>,
    every: Duration,
    shutdown: watch::Sender<bool>,
}

impl TimerHandle {
    fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Owner of every background-refresh task.
///
/// Scheduling spawns onto the current tokio runtime, so `schedule` must be
/// called from within one.
#[derive(Default)]
pub struct TimerRegistry {
    handles: RwLock<HashMap<CacheKey, TimerHandle>>,
    /// Bumped by every `cancel_all`.
    epoch: AtomicU64,
}

impl std::fmt::Debug for TimerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerRegistry")
            .field("scheduled", &self.len())
            .field("epoch", &self.epoch())
            .finish()
    }
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start refreshing `key` every `every`, replacing any existing task.
    ///
    /// If the replaced task ran a different job, that job is closed. The
    /// interval is clamped to [`MAX_REFRESH_INTERVAL`].
    pub fn schedule(&self, key: CacheKey, every: Duration, job: Arc<RefreshJob>) {
        let mut handles = self.write_handles();
        self.schedule_locked(&mut handles, key, every, job);
    }

    /// Find or create the job for `key` under the registry's write lock.
    ///
    /// `decide` receives the live job for `key`, if any, and returns the job
    /// to keep together with whether its task must restart from zero. A job
    /// that is not the one already scheduled always gets a fresh task.
    ///
    /// With `Some(epoch)`, nothing happens if `cancel_all` ran since `epoch`
    /// was read; `decide` is not called and `None` is returned.
    pub(crate) fn attach_with<F>(
        &self,
        key: &CacheKey,
        every: Duration,
        epoch: Option<u64>,
        decide: F,
    ) -> Option<Arc<RefreshJob>>
    where
        F: FnOnce(Option<Arc<RefreshJob>>) -> Option<(Arc<RefreshJob>, bool)>,
    {
        let mut handles = self.write_handles();
        if epoch.is_some_and(|epoch| epoch != self.epoch.load(Ordering::SeqCst)) {
            return None;
        }

        let existing = handles
            .get(key)
            .map(|h| Arc::clone(&h.job))
            .filter(|job| !job.is_closed());
        let (job, restart) = decide(existing)?;

        let current = handles.get(key).is_some_and(|h| Arc::ptr_eq(&h.job, &job));
        if restart || !current {
            self.schedule_locked(&mut handles, key.clone(), every, Arc::clone(&job));
        }
        Some(job)
    }

    /// The job currently scheduled for `key`.
    pub fn job(&self, key: &CacheKey) -> Option<Arc<RefreshJob>> {
        self.read_handles().get(key).map(|h| Arc::clone(&h.job))
    }

    /// Interval of the task for `key`.
    pub fn interval(&self, key: &CacheKey) -> Option<Duration> {
        self.read_handles().get(key).map(|h| h.every)
    }

    /// Cancel the task for one key. Returns whether one existed.
    pub fn cancel(&self, key: &CacheKey) -> bool {
        let removed = self.write_handles().remove(key);
        match removed {
            Some(handle) => {
                Self::retire(&handle);
                tracing::debug!(key = %key, "Refresh task cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every task whose key starts with `prefix`.
    pub fn cancel_prefix(&self, prefix: &str) -> usize {
        let mut handles = self.write_handles();
        let keys: Vec<CacheKey> = handles
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();

        for key in &keys {
            if let Some(handle) = handles.remove(key) {
                Self::retire(&handle);
            }
        }
        keys.len()
    }

    /// Cancel every task.
    ///
    /// When this returns no task will fire again and no in-flight refresh
    /// will store or deliver its result.
    pub fn cancel_all(&self) -> usize {
        let mut handles = self.write_handles();
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let cancelled = handles.len();
        for (_, handle) in handles.drain() {
            Self::retire(&handle);
        }
        cancelled
    }

    /// Cancel `key`'s task if it still runs `job` and nobody listens to it.
    pub(crate) fn cancel_if_idle(&self, key: &CacheKey, job: &Arc<RefreshJob>) -> bool {
        let mut handles = self.write_handles();
        let idle = handles
            .get(key)
            .is_some_and(|h| Arc::ptr_eq(&h.job, job) && job.subscriber_count() == 0);
        if !idle {
            return false;
        }

        if let Some(handle) = handles.remove(key) {
            Self::retire(&handle);
            tracing::debug!(key = %key, "Refresh task cancelled, no subscribers left");
        }
        true
    }

    pub fn is_scheduled(&self, key: &CacheKey) -> bool {
        self.read_handles().contains_key(key)
    }

    /// Number of live tasks.
    pub fn len(&self) -> usize {
        self.read_handles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_handles().is_empty()
    }

    /// How many times `cancel_all` has run.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn schedule_locked(
        &self,
        handles: &mut HashMap<CacheKey, TimerHandle>,
        key: CacheKey,
        every: Duration,
        job: Arc<RefreshJob>,
    ) {
        let every = every.clamp(MIN_REFRESH_INTERVAL, MAX_REFRESH_INTERVAL);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = TimerHandle {
            job: Arc::clone(&job),
            every,
            shutdown,
        };

        if let Some(previous) = handles.insert(key.clone(), handle) {
            previous.stop();
            if !Arc::ptr_eq(&previous.job, &job) {
                previous.job.close();
            }
        }

        tracing::debug!(key = %key, every_ms = every.as_millis() as u64, "Refresh task scheduled");
        tokio::spawn(refresh_task(key, every, job, shutdown_rx));
    }

    fn retire(handle: &TimerHandle) {
        handle.stop();
        handle.job.close();
    }

    fn read_handles(&self) -> RwLockReadGuard<'_, HashMap<CacheKey, TimerHandle>> {
        self.handles.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_handles(&self) -> RwLockWriteGuard<'_, HashMap<CacheKey, TimerHandle>> {
        self.handles.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        for handle in self.write_handles().values() {
            Self::retire(handle);
        }
    }
}

/// Task body: wait one interval, refresh, repeat until shut down.
async fn refresh_task(
    key: CacheKey,
    every: Duration,
    job: Arc<RefreshJob>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // Fires on `true` and when the handle is dropped.
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {}
        }

        if *shutdown_rx.borrow() {
            break;
        }
        job.tick().await;
    }

    tracing::trace!(key = %key, "Refresh task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CacheMetrics;
    use serde_json::json;
    use smartcache_core::{FetchError, ManualClock};
    use smartcache_storage::{build_key, CacheStore, Params};
    use std::sync::atomic::AtomicU32;

    struct Fixture {
        store: Arc<CacheStore>,
        metrics: Arc<CacheMetrics>,
        calls: Arc<AtomicU32>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(CacheStore::new(Arc::new(ManualClock::at_epoch()))),
                metrics: Arc::new(CacheMetrics::new()),
                calls: Arc::new(AtomicU32::new(0)),
            }
        }

        fn job(&self, key: &CacheKey) -> Arc<RefreshJob> {
            let calls = self.calls.clone();
            Arc::new(RefreshJob::new(
                key.clone(),
                self.store.clone(),
                self.metrics.clone(),
                move || {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { Ok::<_, FetchError>(n) }
                },
                Duration::from_secs(300),
            ))
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn key(page: u32) -> CacheKey {
        build_key("orders", &Params::new().with("page", page))
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_fires_every_interval() {
        let fx = Fixture::new();
        let registry = TimerRegistry::new();
        registry.schedule(key(1), Duration::from_secs(60), fx.job(&key(1)));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(fx.calls(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fx.calls(), 1);
        assert_eq!(fx.store.get(key(1).as_str()).map(|e| e.payload), Some(json!(1)));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fx.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_task() {
        let fx = Fixture::new();
        let registry = TimerRegistry::new();
        let job = fx.job(&key(1));

        registry.schedule(key(1), Duration::from_secs(60), job.clone());
        tokio::time::sleep(Duration::from_secs(30)).await;
        registry.schedule(key(1), Duration::from_secs(60), job.clone());

        assert_eq!(registry.len(), 1);
        assert!(!job.is_closed(), "same job survives a reschedule");

        // The old task would have fired at t=60; the new one fires at t=90.
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(fx.calls(), 0);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(fx.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacing_with_new_job_closes_old_one() {
        let fx = Fixture::new();
        let registry = TimerRegistry::new();
        let old = fx.job(&key(1));
        let new = fx.job(&key(1));

        registry.schedule(key(1), Duration::from_secs(60), old.clone());
        registry.schedule(key(1), Duration::from_secs(60), new.clone());

        assert!(old.is_closed());
        assert!(!new.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_firing() {
        let fx = Fixture::new();
        let registry = TimerRegistry::new();
        let job = fx.job(&key(1));
        registry.schedule(key(1), Duration::from_secs(60), job.clone());

        assert!(registry.cancel(&key(1)));
        assert!(!registry.cancel(&key(1)));
        assert!(job.is_closed());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(fx.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prefix() {
        let fx = Fixture::new();
        let registry = TimerRegistry::new();
        let shipments = build_key("shipments", &Params::new());
        registry.schedule(key(1), Duration::from_secs(60), fx.job(&key(1)));
        registry.schedule(key(2), Duration::from_secs(60), fx.job(&key(2)));
        registry.schedule(shipments.clone(), Duration::from_secs(60), fx.job(&shipments));

        assert_eq!(registry.cancel_prefix(&CacheKey::group_prefix("orders")), 2);
        assert!(registry.is_scheduled(&shipments));
        assert!(!registry.is_scheduled(&key(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_bumps_epoch() {
        let fx = Fixture::new();
        let registry = TimerRegistry::new();
        registry.schedule(key(1), Duration::from_secs(60), fx.job(&key(1)));
        registry.schedule(key(2), Duration::from_secs(60), fx.job(&key(2)));

        let before = registry.epoch();
        assert_eq!(registry.cancel_all(), 2);
        assert_eq!(registry.epoch(), before + 1);
        assert!(registry.is_empty());

        let stale = registry.attach_with(&key(3), Duration::from_secs(60), Some(before), |_| {
            panic!("stale epoch must not reach decide")
        });
        assert!(stale.is_none());
        assert!(registry
            .attach_with(&key(3), Duration::from_secs(60), Some(registry.epoch()), |_| {
                Some((fx.job(&key(3)), true))
            })
            .is_some());

        tokio::time::sleep(Duration::from_secs(61)).await;
        // Only the key scheduled after the clear fired.
        assert_eq!(fx.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_with_reuses_live_job() {
        let fx = Fixture::new();
        let registry = TimerRegistry::new();
        let every = Duration::from_secs(60);

        let first = registry
            .attach_with(&key(1), every, None, |existing| {
                assert!(existing.is_none());
                Some((fx.job(&key(1)), true))
            })
            .expect("scheduled");

        tokio::time::sleep(Duration::from_secs(30)).await;
        let second = registry
            .attach_with(&key(1), every, None, |existing| existing.map(|job| (job, false)))
            .expect("reused");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);

        // Not restarted: the task still fires at t=60.
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(fx.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_attach_with_creates_one_job() {
        let fx = Arc::new(Fixture::new());
        let registry = Arc::new(TimerRegistry::new());
        let barrier = Arc::new(tokio::sync::Barrier::new(8));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let fx = fx.clone();
            let registry = registry.clone();
            let barrier = barrier.clone();
            tasks.push(tokio::spawn(async move {
                barrier.wait().await;
                registry.attach_with(&key(1), Duration::from_secs(60), None, |existing| {
                    Some(match existing {
                        Some(job) => (job, false),
                        None => (fx.job(&key(1)), true),
                    })
                })
            }));
        }

        let mut jobs = Vec::new();
        for task in tasks {
            jobs.push(task.await.unwrap().expect("attached"));
        }

        assert_eq!(registry.len(), 1);
        assert!(jobs.iter().all(|job| Arc::ptr_eq(job, &jobs[0])));
        assert!(jobs.iter().all(|job| !job.is_closed()));
        registry.cancel_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_interval_is_clamped() {
        let fx = Fixture::new();
        let registry = TimerRegistry::new();
        registry.schedule(key(1), Duration::MAX, fx.job(&key(1)));

        assert!(registry.is_scheduled(&key(1)));
        assert_eq!(registry.interval(&key(1)), Some(MAX_REFRESH_INTERVAL));

        tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
        assert_eq!(fx.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_if_idle_respects_subscribers() {
        let fx = Fixture::new();
        let registry = TimerRegistry::new();
        let job = fx.job(&key(1));
        registry.schedule(key(1), Duration::from_secs(60), job.clone());

        let id = crate::delivery::SubscriptionId::new();
        job.attach(id, tokio::sync::mpsc::unbounded_channel().0);
        assert!(!registry.cancel_if_idle(&key(1), &job));

        job.detach(id);
        assert!(registry.cancel_if_idle(&key(1), &job));
        assert!(!registry.is_scheduled(&key(1)));
    }
}
