//! CacheStore: redb-backed expiring blob cache.
//!
//! Values carry an absolute expiry in milliseconds since the Unix epoch.
//! Expired entries are invisible to `get`, which deletes them on sight;
//! everything else waits for [`gc`](CacheStore::gc).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use kvpool_core::CacheConfig;
use parking_lot::RwLock;
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::debug;

use crate::error::{CacheError, CacheResult};

/// Cache entries: key → (expire_at_ms, payload).
const KB: TableDefinition<&[u8], (i64, &[u8])> = TableDefinition::new("kb");

/// Convert any `Display` error into a `CacheError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| CacheError::$variant(e.to_string())
    };
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Thread-safe cache store; clones share the same database.
#[derive(Clone)]
pub struct CacheStore {
    // Write-locked only for compaction, which needs exclusive access.
    db: Arc<RwLock<Database>>,
    path: Option<PathBuf>,
    threshold_file_size: u64,
}

impl CacheStore {
    /// Open (or create) a cache file. `threshold_file_size == 0` disables eviction.
    pub fn open(path: &Path, threshold_file_size: u64) -> CacheResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(RwLock::new(db)),
            path: Some(path.to_path_buf()),
            threshold_file_size,
        };
        store.ensure_table()?;
        debug!(?path, threshold_file_size, "cache store opened");
        Ok(store)
    }

    pub fn from_config(config: &CacheConfig) -> CacheResult<Self> {
        Self::open(&config.path, config.threshold_file_size)
    }

    /// Create an ephemeral in-memory cache store (for testing).
    pub fn open_in_memory() -> CacheResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(RwLock::new(db)),
            path: None,
            threshold_file_size: 0,
        };
        store.ensure_table()?;
        debug!("in-memory cache store opened");
        Ok(store)
    }

    fn ensure_table(&self) -> CacheResult<()> {
        let db = self.db.read();
        let txn = db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(KB).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn threshold_file_size(&self) -> u64 {
        self.threshold_file_size
    }

    /// Number of stored entries, expired ones included.
    pub fn count(&self) -> CacheResult<u64> {
        let db = self.db.read();
        let txn = db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KB).map_err(map_err!(Table))?;
        table.len().map_err(map_err!(Read))
    }

    /// Whether `key` is stored, regardless of expiry.
    pub fn exists(&self, key: &[u8]) -> CacheResult<bool> {
        let db = self.db.read();
        let txn = db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KB).map_err(map_err!(Table))?;
        let found = table.get(key).map_err(map_err!(Read))?.is_some();
        Ok(found)
    }

    /// Fetch a live value. An expired entry is removed and reported as absent.
    pub fn get(&self, key: &[u8]) -> CacheResult<Option<Vec<u8>>> {
        let entry = {
            let db = self.db.read();
            let txn = db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(KB).map_err(map_err!(Table))?;
            let entry = table.get(key).map_err(map_err!(Read))?.map(|guard| {
                let (expire, value) = guard.value();
                (expire, value.to_vec())
            });
            entry
        };

        match entry {
            Some((expire, value)) if expire > now_ms() => Ok(Some(value)),
            Some(_) => {
                self.remove(key)?;
                debug!(key_len = key.len(), "dropped expired cache entry");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Store `value` under `key` for `ttl_ms` milliseconds, replacing any previous value.
    pub fn set(&self, key: &[u8], value: &[u8], ttl_ms: i64) -> CacheResult<()> {
        if key.is_empty() {
            return Err(CacheError::EmptyKey);
        }
        if ttl_ms <= 0 {
            return Err(CacheError::InvalidTtl(ttl_ms));
        }
        self.put(key, value, now_ms().saturating_add(ttl_ms))
    }

    pub(crate) fn put(&self, key: &[u8], value: &[u8], expire_at_ms: i64) -> CacheResult<()> {
        let db = self.db.read();
        let txn = db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(KB).map_err(map_err!(Table))?;
            table
                .insert(key, (expire_at_ms, value))
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Delete `key`. Returns true if it existed.
    pub fn remove(&self, key: &[u8]) -> CacheResult<bool> {
        let db = self.db.read();
        let txn = db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(KB).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Delete every entry. Returns the number removed.
    pub fn clear(&self) -> CacheResult<u64> {
        self.remove_matching(|_| true)
    }

    /// Alias of [`clear`](Self::clear).
    pub fn remove_all(&self) -> CacheResult<u64> {
        self.clear()
    }

    /// Delete entries expiring before `expire_at_ms`. Returns the number removed.
    pub fn remove_older_than(&self, expire_at_ms: i64) -> CacheResult<u64> {
        self.remove_matching(|expire| expire < expire_at_ms)
    }

    /// Delete the `count` entries with the earliest expiry. Returns the number removed.
    pub fn remove_older(&self, count: u64) -> CacheResult<u64> {
        if count == 0 {
            return Ok(0);
        }
        let db = self.db.read();
        let txn = db.begin_write().map_err(map_err!(Transaction))?;
        let removed;
        {
            let mut table = txn.open_table(KB).map_err(map_err!(Table))?;
            let mut entries = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                entries.push((value.value().0, key.value().to_vec()));
            }
            entries.sort_unstable();
            entries.truncate(count as usize);
            for (_, key) in &entries {
                table.remove(key.as_slice()).map_err(map_err!(Write))?;
            }
            removed = entries.len() as u64;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(removed, "removed oldest cache entries");
        Ok(removed)
    }

    fn remove_matching(&self, matches: impl Fn(i64) -> bool) -> CacheResult<u64> {
        let db = self.db.read();
        let txn = db.begin_write().map_err(map_err!(Transaction))?;
        let removed;
        {
            let mut table = txn.open_table(KB).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                if matches(value.value().0) {
                    keys.push(key.value().to_vec());
                }
            }
            for key in &keys {
                table.remove(key.as_slice()).map_err(map_err!(Write))?;
            }
            removed = keys.len() as u64;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(removed)
    }

    /// Reclaim free pages so the file can shrink.
    pub fn compact(&self) -> CacheResult<()> {
        let mut db = self.db.write();
        db.compact().map_err(map_err!(Compact))?;
        Ok(())
    }

    /// On-disk size in bytes; `None` for in-memory stores.
    pub fn db_size(&self) -> Option<u64> {
        let path = self.path.as_ref()?;
        std::fs::metadata(path).map(|m| m.len()).ok()
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("path", &self.path)
            .field("threshold_file_size", &self.threshold_file_size)
            .finish_non_exhaustive()
    }
}
