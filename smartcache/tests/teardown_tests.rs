//! Teardown and Invalidation Tests
//!
//! Once `clear_all_timers` returns, nothing may be delivered or stored on
//! behalf of a cancelled refresh, including fetches that were already in
//! flight. Group invalidation must stop exactly the keys it evicts.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use smartcache::{
    build_key, CacheKey, CacheStrategy, DeliverySource, ManualClock, Params, SmartCache,
    Subscription,
};
use smartcache_test_utils::CountingFetcher;

const TTL: Duration = Duration::from_secs(120);
const EVERY: Duration = Duration::from_secs(30);

type Rows = Vec<String>;

fn rows(ids: &[&str]) -> Rows {
    ids.iter().map(|id| id.to_string()).collect()
}

fn key(group: &str, page: u32) -> CacheKey {
    build_key(group, &Params::new().with("page", page))
}

fn setup() -> SmartCache {
    SmartCache::in_memory(Arc::new(ManualClock::at_epoch()))
}

// ============================================================================
// CLEAR ALL TIMERS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_clear_all_timers_stops_every_refresh() {
    let cache = setup();
    let strategy = CacheStrategy::refreshing(TTL, EVERY);
    let fetcher = CountingFetcher::returning(rows(&["R-1"]));

    let mut subs: Vec<Subscription<Rows>> = Vec::new();
    for page in 1..=3 {
        subs.push(cache.get_data(&key("orders", page), &strategy, fetcher.clone()).await.unwrap());
    }
    assert_eq!(cache.stats().scheduled_refreshes, 3);

    assert_eq!(cache.clear_all_timers(), 3);
    assert!(cache.timers().is_empty());

    tokio::time::sleep(EVERY * 10).await;
    assert_eq!(fetcher.calls(), 3, "only the three foreground fetches ran");

    for sub in &mut subs {
        assert!(!sub.is_refreshing());
        assert_eq!(sub.next().await.map(|d| d.source), Some(DeliverySource::Network));
        assert!(sub.next().await.is_none());
    }

    // Entries are kept; only timers go.
    assert_eq!(cache.store().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_refresh_is_discarded_after_clear() {
    let cache = setup();
    let k = key("orders", 1);
    cache.store().set(k.as_str(), json!(["R-OLD"]), TTL);

    let fetcher = CountingFetcher::gated(vec![Ok(rows(&["R-LATE"]))]);
    let mut sub: Subscription<Rows> = cache
        .get_data(&k, &CacheStrategy::refreshing(TTL, EVERY), fetcher.clone())
        .await
        .unwrap();
    assert_eq!(sub.source(), DeliverySource::Cache);

    // Let the background fetch start and park on the gate.
    tokio::time::sleep(EVERY + Duration::from_secs(1)).await;
    fetcher.wait_for_calls(1).await;

    assert_eq!(cache.clear_all_timers(), 1);
    fetcher.release(1);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(
        cache.store().get(k.as_str()).map(|e| e.payload),
        Some(json!(["R-OLD"]))
    );
    assert_eq!(sub.next().await.map(|d| d.payload), Some(rows(&["R-OLD"])));
    assert!(sub.next().await.is_none());

    let stats = cache.stats().orchestrator;
    assert_eq!(stats.discarded_refreshes, 1);
    assert_eq!(stats.refreshes, 0);

    tokio::time::sleep(EVERY * 4).await;
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_foreground_fetch_spanning_clear_schedules_nothing() {
    let cache = setup();
    let k = key("orders", 1);
    let fetcher = CountingFetcher::gated(vec![Ok(rows(&["R-1"]))]);

    let read = {
        let cache = cache.clone();
        let k = k.clone();
        let fetcher = fetcher.clone();
        tokio::spawn(async move {
            cache
                .get_data::<Rows, _>(&k, &CacheStrategy::refreshing(TTL, EVERY), fetcher)
                .await
                .map(|sub| (sub.source(), sub.is_refreshing(), sub.into_value()))
        })
    };

    fetcher.wait_for_calls(1).await;
    cache.clear_all_timers();
    fetcher.release(1);

    let (source, refreshing, value) = read.await.unwrap().unwrap();
    assert_eq!(source, DeliverySource::Network);
    assert_eq!(value, rows(&["R-1"]));
    assert!(!refreshing);

    // The result is still cached, but the key is not refreshed.
    assert!(cache.store().get(k.as_str()).is_some());
    assert!(!cache.timers().is_scheduled(&k));
}

#[tokio::test(start_paused = true)]
async fn test_reads_after_clear_schedule_again() {
    let cache = setup();
    let k = key("orders", 1);
    let strategy = CacheStrategy::refreshing(TTL, EVERY);
    let fetcher = CountingFetcher::returning(rows(&["R-1"]));

    let _first: Subscription<Rows> = cache.get_data(&k, &strategy, fetcher.clone()).await.unwrap();
    cache.clear_all_timers();

    let second: Subscription<Rows> = cache.get_data(&k, &strategy, fetcher.clone()).await.unwrap();
    assert_eq!(second.source(), DeliverySource::Cache);
    assert!(second.is_refreshing());
    assert!(cache.timers().is_scheduled(&k));

    tokio::time::sleep(EVERY + Duration::from_secs(1)).await;
    assert_eq!(fetcher.calls(), 2);
}

// ============================================================================
// GROUP INVALIDATION
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_invalidate_group_evicts_and_cancels_only_that_group() {
    let cache = setup();
    let strategy = CacheStrategy::refreshing(TTL, EVERY);
    let fetcher = CountingFetcher::returning(rows(&["R-1"]));

    let mut orders_1: Subscription<Rows> = cache.get_data(&key("orders", 1), &strategy, fetcher.clone()).await.unwrap();
    let _orders_2: Subscription<Rows> = cache.get_data(&key("orders", 2), &strategy, fetcher.clone()).await.unwrap();
    let _ledger: Subscription<Rows> = cache.get_data(&key("ordersledger", 1), &strategy, fetcher.clone()).await.unwrap();
    let _shipments: Subscription<Rows> = cache.get_data(&key("shipments", 1), &strategy, fetcher.clone()).await.unwrap();

    assert_eq!(cache.invalidate_group("orders"), 2);

    assert!(cache.store().get(key("orders", 1).as_str()).is_none());
    assert!(cache.store().get(key("orders", 2).as_str()).is_none());
    assert!(cache.store().get(key("ordersledger", 1).as_str()).is_some());
    assert!(cache.store().get(key("shipments", 1).as_str()).is_some());

    assert!(!cache.timers().is_scheduled(&key("orders", 1)));
    assert!(!cache.timers().is_scheduled(&key("orders", 2)));
    assert!(cache.timers().is_scheduled(&key("ordersledger", 1)));
    assert!(cache.timers().is_scheduled(&key("shipments", 1)));

    assert!(orders_1.next().await.is_some());
    assert!(orders_1.next().await.is_none());

    // Two surviving keys refresh once each.
    tokio::time::sleep(EVERY + Duration::from_secs(1)).await;
    assert_eq!(fetcher.calls(), 4 + 2);
}

#[tokio::test(start_paused = true)]
async fn test_remove_by_prefix_with_raw_prefix() {
    let cache = setup();
    let fetcher = CountingFetcher::returning(rows(&["R-1"]));
    let strategy = CacheStrategy::ttl_only(TTL);

    for page in 1..=3 {
        let _: Subscription<Rows> = cache.get_data(&key("orders", page), &strategy, fetcher.clone()).await.unwrap();
    }
    let _: Subscription<Rows> = cache.get_data(&key("ordersledger", 1), &strategy, fetcher.clone()).await.unwrap();

    // A bare prefix is matched literally and takes the neighbouring group too.
    assert_eq!(cache.remove_by_prefix("orders"), 4);
    assert!(cache.store().is_empty());
    assert_eq!(cache.remove_by_prefix("orders"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_remove_single_key() {
    let cache = setup();
    let k = key("couriers", 1);
    let fetcher = CountingFetcher::returning(rows(&["C-1"]));

    let mut sub: Subscription<Rows> = cache
        .get_data(&k, &CacheStrategy::refreshing(TTL, EVERY), fetcher.clone())
        .await
        .unwrap();

    assert!(cache.remove(&k));
    assert!(!cache.remove(&k));
    assert!(!cache.timers().is_scheduled(&k));
    assert!(sub.next().await.is_some());
    assert!(sub.next().await.is_none());
}
