//! LMDB-backed durable mirror.
//!
//! Uses the heed crate (Rust bindings for LMDB) to persist cache envelopes
//! across process restarts. Keys are the UTF-8 bytes of the canonical cache
//! key, so a group prefix such as `orders:` is also a byte prefix.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The mirror uses:
//! - Read transactions for `load_all` and prefix scans
//! - One write transaction per `put`, `delete` and `delete_prefix`

use std::path::{Path, PathBuf};

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use smartcache_core::StorageError;

use super::traits::{DurableMirror, MirrorRecord};

/// Error type for LMDB mirror operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbMirrorError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment at {path}: {reason}")]
    EnvOpen { path: PathBuf, reason: String },

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbMirrorError> for StorageError {
    fn from(e: LmdbMirrorError) -> Self {
        match e {
            LmdbMirrorError::EnvOpen { .. } | LmdbMirrorError::DbOpen(_) | LmdbMirrorError::Io(_) => {
                StorageError::MirrorUnavailable {
                    reason: e.to_string(),
                }
            }
            LmdbMirrorError::Transaction(reason) => StorageError::TransactionFailed { reason },
        }
    }
}

fn txn_error(e: heed::Error) -> LmdbMirrorError {
    LmdbMirrorError::Transaction(e.to_string())
}

/// LMDB mirror for [`CacheStore`](super::CacheStore).
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use smartcache_core::SystemClock;
/// use smartcache_storage::cache::{CacheStore, LmdbMirror};
///
/// let mirror = LmdbMirror::open("/var/cache/dispatch", 64)?;
/// let store = CacheStore::with_mirror(Arc::new(SystemClock), Arc::new(mirror));
/// # Ok::<(), smartcache_storage::cache::LmdbMirrorError>(())
/// ```
pub struct LmdbMirror {
    env: Env,
    db: Database<Bytes, Bytes>,
    path: PathBuf,
}

impl std::fmt::Debug for LmdbMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbMirror").field("path", &self.path).finish()
    }
}

impl LmdbMirror {
    /// Open (or create) a mirror.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Database cannot be created
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbMirrorError> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per directory by this
        // process; LMDB's requirement is that the same path is not opened
        // twice in one process without sharing the `Env`.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb.saturating_mul(1024 * 1024))
                .max_dbs(1)
                .open(&path)
        }
        .map_err(|e| LmdbMirrorError::EnvOpen {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let mut wtxn = env.write_txn().map_err(txn_error)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbMirrorError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_error)?;

        Ok(Self { env, db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of persisted records.
    pub fn len(&self) -> Result<u64, LmdbMirrorError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        self.db.len(&rtxn).map_err(txn_error)
    }

    pub fn is_empty(&self) -> Result<bool, LmdbMirrorError> {
        Ok(self.len()? == 0)
    }

    /// Iterate over keys matching a prefix and collect them.
    fn collect_keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, LmdbMirrorError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;

        let mut keys = Vec::new();
        for result in self.db.iter(&rtxn).map_err(txn_error)? {
            let (key, _) = result.map_err(txn_error)?;
            if key.starts_with(prefix) {
                keys.push(key.to_vec());
            }
        }
        Ok(keys)
    }

    fn load_records(&self) -> Result<Vec<MirrorRecord>, LmdbMirrorError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;

        let mut records = Vec::new();
        for result in self.db.iter(&rtxn).map_err(txn_error)? {
            let (key, bytes) = result.map_err(txn_error)?;
            match std::str::from_utf8(key) {
                Ok(key) => records.push(MirrorRecord {
                    key: key.to_string(),
                    bytes: bytes.to_vec(),
                }),
                Err(_) => {
                    tracing::warn!(path = %self.path.display(), "Skipping non UTF-8 mirror key");
                }
            }
        }
        Ok(records)
    }

    fn put_record(&self, key: &str, bytes: &[u8]) -> Result<(), LmdbMirrorError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        self.db
            .put(&mut wtxn, key.as_bytes(), bytes)
            .map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)
    }

    fn delete_record(&self, key: &str) -> Result<(), LmdbMirrorError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        self.db.delete(&mut wtxn, key.as_bytes()).map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)
    }

    fn delete_records_with_prefix(&self, prefix: &str) -> Result<u64, LmdbMirrorError> {
        let keys_to_delete = self.collect_keys_with_prefix(prefix.as_bytes())?;
        if keys_to_delete.is_empty() {
            return Ok(0);
        }

        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let mut deleted = 0u64;
        for key in &keys_to_delete {
            if self.db.delete(&mut wtxn, key).map_err(txn_error)? {
                deleted += 1;
            }
        }
        wtxn.commit().map_err(txn_error)?;

        Ok(deleted)
    }
}

impl DurableMirror for LmdbMirror {
    fn load_all(&self) -> Result<Vec<MirrorRecord>, StorageError> {
        Ok(self.load_records()?)
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.put_record(key, bytes).map_err(|e| StorageError::MirrorWriteFailed {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        Ok(self.delete_record(key)?)
    }

    fn delete_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        Ok(self.delete_records_with_prefix(prefix)?)
    }
}

// ============================================================================
// TESTS
// ============================================================================
