//! Error types for SmartCache operations

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error produced by a caller-supplied fetch operation.
///
/// The original error is kept behind an `Arc` so the same failure can be
/// handed to every caller that joined a shared in-flight fetch. Use
/// [`FetchError::downcast_ref`] to recover the concrete type.
#[derive(Clone)]
pub struct FetchError {
    inner: Arc<dyn StdError + Send + Sync + 'static>,
}

impl FetchError {
    /// Wrap any error type.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(error),
        }
    }

    /// Build a fetch error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MessageError(message.into())),
        }
    }

    /// Borrow the wrapped error.
    pub fn inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.inner.as_ref()
    }

    /// Attempt to view the wrapped error as a concrete type.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.inner.downcast_ref::<E>()
    }
}

impl fmt::Debug for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FetchError").field(&self.inner).finish()
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl StdError for FetchError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source()
    }
}

impl From<String> for FetchError {
    fn from(message: String) -> Self {
        Self::msg(message)
    }
}

impl From<&str> for FetchError {
    fn from(message: &str) -> Self {
        Self::msg(message)
    }
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for MessageError {}

/// Durable mirror and in-memory store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Mirror unavailable: {reason}")]
    MirrorUnavailable { reason: String },

    #[error("Mirror write failed for {key}: {reason}")]
    MirrorWriteFailed { key: String, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Corrupt envelope for {key}: {reason}")]
    CorruptEnvelope { key: String, reason: String },
}

/// Cache key errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid cache key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Parameters must be a JSON object, got {found}")]
    ParamsNotAnObject { found: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No cache strategy registered for category: {category}")]
    UnknownCategory { category: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load strategy file {path}: {reason}")]
    StrategyFile { path: String, reason: String },
}

/// Master error type for all SmartCache errors.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The caller's fetch operation failed. Carried verbatim.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Payload for {key} could not be converted: {reason}")]
    Codec { key: String, reason: String },
}

impl CacheError {
    /// Returns true if this error came from the caller's fetch operation.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(self, Self::Fetch(_))
    }

    /// Borrow the fetch failure, if this is one.
    pub fn as_fetch_error(&self) -> Option<&FetchError> {
        match self {
            Self::Fetch(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type alias for SmartCache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct UpstreamDown {
        status: u16,
    }

    impl fmt::Display for UpstreamDown {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "upstream returned {}", self.status)
        }
    }

    impl StdError for UpstreamDown {}

    #[test]
    fn test_fetch_error_display_is_verbatim() {
        let err = CacheError::from(FetchError::new(UpstreamDown { status: 503 }));
        assert_eq!(err.to_string(), "upstream returned 503");
        assert!(err.is_fetch_failure());
    }

    #[test]
    fn test_fetch_error_downcast() {
        let err = FetchError::new(UpstreamDown { status: 502 });
        let clone = err.clone();
        assert_eq!(
            clone.downcast_ref::<UpstreamDown>(),
            Some(&UpstreamDown { status: 502 })
        );
        assert!(err.downcast_ref::<std::io::Error>().is_none());
    }

    #[test]
    fn test_fetch_error_from_message() {
        let err: FetchError = "timeout".into();
        assert_eq!(err.to_string(), "timeout");
    }

    #[test]
    fn test_storage_error_display_write_failed() {
        let err = StorageError::MirrorWriteFailed {
            key: "orders:page=1".to_string(),
            reason: "MDB_MAP_FULL".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("orders:page=1"));
        assert!(msg.contains("MDB_MAP_FULL"));
    }

    #[test]
    fn test_config_error_display_unknown_category() {
        let err = ConfigError::UnknownCategory {
            category: "invoices".to_string(),
        };
        assert!(err.to_string().contains("invoices"));
    }

    #[test]
    fn test_cache_error_from_variants() {
        let storage = CacheError::from(StorageError::TransactionFailed {
            reason: "MDB_READERS_FULL".to_string(),
        });
        assert!(matches!(storage, CacheError::Storage(_)));

        let key = CacheError::from(KeyError::InvalidKey {
            key: "x".to_string(),
            reason: "bad".to_string(),
        });
        assert!(matches!(key, CacheError::Key(_)));

        let config = CacheError::from(ConfigError::UnknownCategory {
            category: "x".to_string(),
        });
        assert!(matches!(config, CacheError::Config(_)));
        assert!(config.as_fetch_error().is_none());
    }
}
