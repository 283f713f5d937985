//! Configuration types

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, StrategyRegistry};

// ============================================================================
// DEFAULTS
// ============================================================================

/// Default LMDB map size for the durable mirror, in megabytes.
pub const DEFAULT_MIRROR_MAX_SIZE_MB: usize = 64;

/// De-duplicate concurrent cold reads of one key into a single fetch.
pub const DEFAULT_DEDUPE_IN_FLIGHT: bool = true;

/// Default tracing filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "smartcache=info,smartcache_storage=info";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Master configuration for a SmartCache context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmartCacheConfig {
    /// Directory for the durable LMDB mirror. `None` runs memory-only.
    pub mirror_path: Option<PathBuf>,
    /// LMDB map size in megabytes.
    pub mirror_max_size_mb: usize,
    /// Share one in-flight fetch between concurrent cold reads of a key.
    pub dedupe_in_flight: bool,
    /// Optional TOML file overriding the built-in strategies.
    pub strategy_file: Option<PathBuf>,
    pub log_format: LogFormat,
}

impl Default for SmartCacheConfig {
    fn default() -> Self {
        Self {
            mirror_path: None,
            mirror_max_size_mb: DEFAULT_MIRROR_MAX_SIZE_MB,
            dedupe_in_flight: DEFAULT_DEDUPE_IN_FLIGHT,
            strategy_file: None,
            log_format: LogFormat::Text,
        }
    }
}

impl SmartCacheConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create SmartCacheConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `SMARTCACHE_MIRROR_PATH`: LMDB mirror directory (default: unset, memory-only)
    /// - `SMARTCACHE_MIRROR_MAX_SIZE_MB`: LMDB map size (default: 64)
    /// - `SMARTCACHE_DEDUPE_IN_FLIGHT`: Share concurrent cold fetches (default: true)
    /// - `SMARTCACHE_STRATEGY_FILE`: TOML strategy overrides (default: unset)
    /// - `SMARTCACHE_LOG_FORMAT`: `text` or `json` (default: text)
    pub fn from_env() -> Self {
        let mirror_path = std::env::var("SMARTCACHE_MIRROR_PATH")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let mirror_max_size_mb = std::env::var("SMARTCACHE_MIRROR_MAX_SIZE_MB")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|mb: &usize| *mb > 0)
            .unwrap_or(DEFAULT_MIRROR_MAX_SIZE_MB);

        let dedupe_in_flight = std::env::var("SMARTCACHE_DEDUPE_IN_FLIGHT")
            .ok()
            .map(|s| s.to_lowercase() != "false" && s != "0")
            .unwrap_or(DEFAULT_DEDUPE_IN_FLIGHT);

        let strategy_file = std::env::var("SMARTCACHE_STRATEGY_FILE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let log_format = match std::env::var("SMARTCACHE_LOG_FORMAT")
            .map(|s| s.to_lowercase())
            .as_deref()
        {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Self {
            mirror_path,
            mirror_max_size_mb,
            dedupe_in_flight,
            strategy_file,
            log_format,
        }
    }

    /// Set the mirror directory.
    pub fn with_mirror_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mirror_path = Some(path.into());
        self
    }

    /// Set the LMDB map size.
    pub fn with_mirror_max_size_mb(mut self, mb: usize) -> Self {
        self.mirror_max_size_mb = mb;
        self
    }

    /// Enable or disable in-flight de-duplication.
    pub fn with_dedupe_in_flight(mut self, enabled: bool) -> Self {
        self.dedupe_in_flight = enabled;
        self
    }

    /// Set the strategy override file.
    pub fn with_strategy_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.strategy_file = Some(path.into());
        self
    }

    /// Set the log format.
    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mirror_max_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "mirror_max_size_mb".to_string(),
                value: "0".to_string(),
                reason: "mirror_max_size_mb must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// The built-in strategies with any configured file overrides applied.
    pub fn strategies(&self) -> Result<StrategyRegistry, ConfigError> {
        let registry = StrategyRegistry::standard();
        match &self.strategy_file {
            Some(path) => registry.with_overrides_from_file(path),
            None => Ok(registry),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
