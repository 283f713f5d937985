//! SmartCache - Data Cache and Fetch Coordination
//!
//! The client-side cache behind the dispatch dashboard. Screens build a key,
//! pick the strategy for their resource category, and hand the orchestrator
//! a fetch; the orchestrator serves fresh cached data immediately, fetches on
//! a miss, and keeps cached keys warm in the background.
//!
//! ```no_run
//! use std::sync::Arc;
//! use smartcache::{build_key, FetchError, Params, SmartCache, StrategyRegistry, SystemClock};
//!
//! # async fn screen() -> smartcache::CacheResult<()> {
//! let cache = SmartCache::in_memory(Arc::new(SystemClock));
//! let strategies = StrategyRegistry::standard();
//!
//! let key = build_key("orders", &Params::new().with("page", 1).with("size", 50));
//! let mut orders = cache
//!     .get_data(&key, strategies.get("orders")?, || async {
//!         Ok::<_, FetchError>(vec!["ORD-1".to_string()])
//!     })
//!     .await?;
//!
//! println!("{:?} from {}", orders.value(), orders.source());
//! while let Some(update) = orders.next().await {
//!     println!("{:?}", update.payload);
//! }
//!
//! // Screen unmounted: nothing may be delivered after this.
//! cache.clear_all_timers();
//! # Ok(())
//! # }
//! ```

pub mod delivery;
pub mod fetcher;
pub mod metrics;
pub mod orchestrator;
pub mod refresh;
pub mod telemetry;
pub mod timers;

pub use delivery::{Delivery, DeliverySource, Subscription, SubscriptionId};
pub use fetcher::Fetcher;
pub use metrics::{CacheMetrics, CacheMetricsSnapshot, SmartCacheStats};
pub use orchestrator::SmartCache;
pub use refresh::RefreshJob;
pub use telemetry::init_tracing;
pub use timers::TimerRegistry;

// Re-export the types every caller needs alongside the orchestrator
pub use smartcache_core::{
    CacheError, CacheResult, CacheStrategy, Clock, ConfigError, FetchError, LogFormat,
    ManualClock, SmartCacheConfig, StrategyRegistry, SystemClock, Timestamp, MAX_REFRESH_INTERVAL,
};
pub use smartcache_storage::{build_key, CacheKey, CacheStats, CacheStore, KeyBuilder, Params};
