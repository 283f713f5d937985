//! Cache strategies per resource category.
//!
//! A strategy is immutable configuration, not a runtime entity. Screens look
//! one up by category and hand it to the orchestrator alongside their fetch.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Longest accepted background-refresh interval (one year).
///
/// Intervals are added to a monotonic instant when a refresh is scheduled;
/// anything longer is rejected at configuration time and clamped at
/// scheduling time.
pub const MAX_REFRESH_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// TTL and background-refresh policy for one resource category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStrategy {
    /// How long a stored entry counts as fresh.
    #[serde(rename = "ttl_ms", with = "duration_ms")]
    pub ttl: Duration,
    /// How often a cached key is silently re-fetched. `None` disables
    /// background refresh for the category.
    #[serde(
        rename = "background_refresh_ms",
        default,
        with = "opt_duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub background_refresh: Option<Duration>,
}

impl CacheStrategy {
    /// A strategy with a TTL and no background refresh.
    pub const fn ttl_only(ttl: Duration) -> Self {
        Self {
            ttl,
            background_refresh: None,
        }
    }

    /// A strategy with both a TTL and a background refresh interval.
    pub const fn refreshing(ttl: Duration, every: Duration) -> Self {
        Self {
            ttl,
            background_refresh: Some(every),
        }
    }

    pub fn ttl_ms(&self) -> u64 {
        u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX)
    }

    /// Background refresh interval, ignoring a configured zero interval.
    pub fn refresh_interval(&self) -> Option<Duration> {
        self.background_refresh.filter(|every| !every.is_zero())
    }

    fn validate(&self, category: &str) -> Result<(), ConfigError> {
        if self.ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.ttl_ms", category),
                value: "0".to_string(),
                reason: "ttl must be positive".to_string(),
            });
        }
        if let Some(every) = self.background_refresh {
            if every > MAX_REFRESH_INTERVAL {
                return Err(ConfigError::InvalidValue {
                    field: format!("{}.background_refresh_ms", category),
                    value: every.as_millis().to_string(),
                    reason: format!(
                        "refresh interval must not exceed {} ms",
                        MAX_REFRESH_INTERVAL.as_millis()
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Read-only lookup from resource category to [`CacheStrategy`].
///
/// A missing category is a caller configuration error and is reported as
/// [`ConfigError::UnknownCategory`]; there is no silent fallback strategy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategyRegistry {
    strategies: HashMap<String, CacheStrategy>,
}

impl StrategyRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The dashboard's built-in categories.
    pub fn standard() -> Self {
        Self::new()
            .with("orders", CacheStrategy::refreshing(secs(120), secs(60)))
            .with("shipments", CacheStrategy::refreshing(secs(120), secs(60)))
            .with("warehouses", CacheStrategy::refreshing(secs(600), secs(300)))
            .with("couriers", CacheStrategy::refreshing(secs(300), secs(120)))
            .with("dashboard", CacheStrategy::refreshing(secs(60), secs(30)))
            .with("reference", CacheStrategy::ttl_only(secs(3600)))
    }

    /// Add or replace a category (builder pattern).
    #[must_use]
    pub fn with(mut self, category: impl Into<String>, strategy: CacheStrategy) -> Self {
        self.strategies.insert(category.into(), strategy);
        self
    }

    /// Look up the strategy for a category.
    pub fn get(&self, category: &str) -> Result<&CacheStrategy, ConfigError> {
        self.strategies
            .get(category)
            .ok_or_else(|| ConfigError::UnknownCategory {
                category: category.to_string(),
            })
    }

    pub fn contains(&self, category: &str) -> bool {
        self.strategies.contains_key(category)
    }

    /// Registered category names, sorted.
    pub fn categories(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.strategies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Parse a registry from TOML, one table per category:
    ///
    /// ```toml
    /// [orders]
    /// ttl_ms = 120000
    /// background_refresh_ms = 60000
    /// ```
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let strategies: HashMap<String, CacheStrategy> =
            toml::from_str(source).map_err(|e| ConfigError::InvalidValue {
                field: "strategies".to_string(),
                value: "<toml>".to_string(),
                reason: e.to_string(),
            })?;

        for (category, strategy) in &strategies {
            strategy.validate(category)?;
        }

        Ok(Self { strategies })
    }

    /// Overlay another registry; categories in `other` win.
    #[must_use]
    pub fn merged(mut self, other: StrategyRegistry) -> Self {
        self.strategies.extend(other.strategies);
        self
    }

    /// Overlay strategies read from a TOML file.
    pub fn with_overrides_from_file(self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| ConfigError::StrategyFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let overrides = Self::from_toml_str(&source).map_err(|e| ConfigError::StrategyFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(self.merged(overrides))
    }
}

const fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}
