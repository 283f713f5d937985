//! Cache entries and their durable envelope.

use std::time::Duration;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{StorageError, Timestamp};

/// A cached payload with the metadata needed to judge its freshness.
///
/// An entry is fresh iff `now - stored_at < ttl`. A stale entry must behave
/// exactly like a missing one for readers.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Value,
    pub stored_at: Timestamp,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, payload: Value, stored_at: Timestamp, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            payload,
            stored_at,
            ttl,
        }
    }

    /// Age of the entry at `now`. Entries stored "in the future" have age zero.
    pub fn age_at(&self, now: Timestamp) -> Duration {
        now.signed_duration_since(self.stored_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Strict freshness check: an entry exactly `ttl` old is already stale.
    pub fn is_fresh_at(&self, now: Timestamp) -> bool {
        self.age_at(now) < self.ttl
    }

    /// The instant at which this entry stops being fresh.
    pub fn expires_at(&self) -> Timestamp {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.stored_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<chrono::Utc>::MAX_UTC)
    }

    /// Durable form of this entry.
    pub fn to_envelope(&self) -> StoredEnvelope {
        StoredEnvelope {
            payload: self.payload.clone(),
            stored_at: self.stored_at.timestamp_millis(),
            ttl_ms: u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Rebuild an entry from its durable form.
    pub fn from_envelope(key: impl Into<String>, envelope: StoredEnvelope) -> Result<Self, StorageError> {
        let key = key.into();
        let stored_at = DateTime::from_timestamp_millis(envelope.stored_at).ok_or_else(|| {
            StorageError::CorruptEnvelope {
                key: key.clone(),
                reason: format!("storedAt out of range: {}", envelope.stored_at),
            }
        })?;
        Ok(Self {
            key,
            payload: envelope.payload,
            stored_at,
            ttl: Duration::from_millis(envelope.ttl_ms),
        })
    }
}

/// Wire layout for durable backing stores: `{ payload, storedAt, ttlMs }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEnvelope {
    pub payload: Value,
    /// Milliseconds since the Unix epoch.
    pub stored_at: i64,
    pub ttl_ms: u64,
}

impl StoredEnvelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(self).map_err(|e| StorageError::CorruptEnvelope {
            key: String::new(),
            reason: e.to_string(),
        })
    }

    pub fn from_bytes(key: &str, bytes: &[u8]) -> Result<Self, StorageError> {
        serde_json::from_slice(bytes).map_err(|e| StorageError::CorruptEnvelope {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}
