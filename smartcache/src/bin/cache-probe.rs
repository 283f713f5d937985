//! cache-probe: exercise a SmartCache configured from the environment.
//!
//! Runs a cold read, a warm read and a group invalidation against a
//! synthetic upstream, then prints the resulting statistics. Useful for
//! checking a mirror directory and strategy file before a deployment.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use smartcache::{
    build_key, init_tracing, FetchError, Params, SmartCache, SmartCacheConfig, SystemClock,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = SmartCacheConfig::from_env();
    init_tracing(config.log_format);

    let strategies = config.strategies()?;
    let cache = SmartCache::from_config(&config, Arc::new(SystemClock))?;

    let calls = Arc::new(AtomicU64::new(0));
    let upstream = {
        let calls = Arc::clone(&calls);
        move || {
            let n = calls.fetch_add(1, Ordering::Relaxed) + 1;
            async move {
                tokio::time::sleep(Duration::from_millis(25)).await;
                Ok::<_, FetchError>(vec![format!("ORD-{n:04}")])
            }
        }
    };

    let key = build_key("orders", &Params::new().with("page", 1).with("size", 50));
    let strategy = strategies.get("orders")?;

    let cold = cache.get_data(&key, strategy, upstream.clone()).await?;
    tracing::info!(key = %key, source = %cold.source(), payload = ?cold.value(), "Cold read");

    let warm = cache.get_data(&key, strategy, upstream).await?;
    tracing::info!(key = %key, source = %warm.source(), payload = ?warm.value(), "Warm read");

    let removed = cache.invalidate_group("orders");
    tracing::info!(removed, "Invalidated orders group");

    let stats = cache.stats();
    println!("upstream calls:      {}", calls.load(Ordering::Relaxed));
    println!("cache hits:          {}", stats.store.hits);
    println!("cache misses:        {}", stats.store.misses);
    println!("hit rate:            {:.2}", stats.store.hit_rate());
    println!("entries:             {}", stats.store.entry_count);
    println!("mirrored:            {}", stats.store.mirrored);
    println!("storage failures:    {}", stats.store.storage_failures);
    println!("foreground fetches:  {}", stats.orchestrator.fetches);
    println!("scheduled refreshes: {}", stats.scheduled_refreshes);

    drop(cold);
    drop(warm);
    cache.clear_all_timers();
    Ok(())
}
