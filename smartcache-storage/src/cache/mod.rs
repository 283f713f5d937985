//! Cache layer: canonical keys, a TTL-aware store and its durable mirror.
//!
//! # Design Philosophy
//!
//! Staleness is never served. A reader either gets an entry younger than its
//! TTL or nothing, and the orchestrator decides what to do about the miss.
//!
//! # Key Canonicalisation
//!
//! The [`CacheKey`] type can only be built through [`build_key`] (or parsed
//! back with [`CacheKey::parse`]), so two requests that differ only in
//! parameter order always land on the same entry, and two different
//! requests never do.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use serde_json::json;
//! use smartcache_core::SystemClock;
//! use smartcache_storage::cache::{build_key, CacheKey, CacheStore, Params};
//!
//! let store = CacheStore::new(Arc::new(SystemClock));
//! let key = build_key("orders", &Params::new().with("page", 1));
//!
//! store.set(key.as_str(), json!([{"id": 7}]), Duration::from_secs(120));
//! assert!(store.get(key.as_str()).is_some());
//!
//! store.remove_by_prefix(&CacheKey::group_prefix("orders"));
//! assert!(store.get(key.as_str()).is_none());
//! ```

pub mod key;
pub mod lmdb_mirror;
pub mod store;
pub mod traits;

pub use key::{build_key, CacheKey, KeyBuilder, Params};
pub use lmdb_mirror::{LmdbMirror, LmdbMirrorError};
pub use store::CacheStore;
pub use traits::{CacheStats, DurableMirror, MirrorRecord};
