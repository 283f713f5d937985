//! SmartCache Core - Data Types
//!
//! Pure data structures shared by the storage layer and the orchestrator:
//! errors, clocks, cache entries, strategies and configuration.
//! This crate contains no I/O beyond reading a strategy override file.

use chrono::{DateTime, Utc};

mod clock;
mod config;
mod entry;
mod error;
mod strategy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    LogFormat, SmartCacheConfig, DEFAULT_DEDUPE_IN_FLIGHT, DEFAULT_LOG_FILTER,
    DEFAULT_MIRROR_MAX_SIZE_MB,
};
pub use entry::{CacheEntry, StoredEnvelope};
pub use error::{CacheError, CacheResult, ConfigError, FetchError, KeyError, StorageError};
pub use strategy::{CacheStrategy, StrategyRegistry, MAX_REFRESH_INTERVAL};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;
