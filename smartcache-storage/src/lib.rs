//! SmartCache Storage - Keys, Store and Durable Mirror
//!
//! The synchronous half of SmartCache. Nothing in this crate spawns tasks or
//! awaits; the orchestrator in the `smartcache` crate drives it.

pub mod cache;

// Re-export cache types for orchestrator integration
pub use cache::{
    build_key, CacheKey, CacheStats, CacheStore, DurableMirror, KeyBuilder, LmdbMirror,
    LmdbMirrorError, MirrorRecord, Params,
};
