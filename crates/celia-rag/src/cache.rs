use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use celia_common::{Error, Result};
use chrono::Utc;
use dashmap::DashMap;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

/// Writes between sweeps of expired entries.
const PURGE_EVERY_WRITES: usize = 256;

/// Key/value cache with optional per-entry expiry.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn backend_id(&self) -> &str;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Cache that never stores anything.
#[derive(Debug, Default)]
pub struct NoopCache;

#[async_trait]
impl CacheBackend for NoopCache {
    fn backend_id(&self) -> &str {
        "none"
    }

    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Option<Duration>) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}

/// Counts writes and signals every `every`-th one, so entries that are
/// never read again still get swept.
struct PurgeSchedule {
    writes: AtomicUsize,
    every: usize,
}

impl Default for PurgeSchedule {
    fn default() -> Self {
        Self {
            writes: AtomicUsize::new(0),
            every: PURGE_EVERY_WRITES,
        }
    }
}

impl PurgeSchedule {
    fn due(&self) -> bool {
        let written = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        self.every > 0 && written % self.every == 0
    }
}

struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

/// Process-local cache. Expired entries are dropped on read and swept
/// periodically on write.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, MemoryEntry>,
    purge: PurgeSchedule,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.expires_at.is_none_or(|at| at > now));
        before - self.entries.len()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    fn backend_id(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at.is_none_or(|at| at > Instant::now()) => {
                return Ok(Some(entry.value.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        if self.purge.due() {
            self.purge_expired();
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

const CACHE_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS embedding_cache (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    expires_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_embedding_cache_expires ON embedding_cache(expires_at);";

/// Cache persisted in a SQLite file so embeddings survive restarts.
pub struct SqliteCache {
    conn: Mutex<Connection>,
    purge: PurgeSchedule,
}

impl SqliteCache {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening embedding cache at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Cache(format!("failed to open cache database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| Error::Cache(format!("failed to set pragmas: {e}")))?;

        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Cache(format!("failed to open in-memory cache: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(CACHE_SCHEMA)
            .map_err(|e| Error::Cache(format!("cache migration failed: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
            purge: PurgeSchedule::default(),
        })
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Cache("cache database lock poisoned".into()))
    }

    pub fn purge_expired(&self) -> Result<usize> {
        let removed = self
            .connection()?
            .execute(
                "DELETE FROM embedding_cache WHERE expires_at IS NOT NULL AND expires_at <= ?",
                params![Utc::now().timestamp_millis()],
            )
            .map_err(|e| Error::Cache(format!("failed to purge cache: {e}")))?;
        if removed > 0 {
            debug!("purged {removed} expired cache entries");
        }
        Ok(removed)
    }
}

#[async_trait]
impl CacheBackend for SqliteCache {
    fn backend_id(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.connection()?;
        let row: Option<(Vec<u8>, Option<i64>)> = conn
            .query_row(
                "SELECT value, expires_at FROM embedding_cache WHERE key = ?",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| Error::Cache(format!("cache read failed: {e}")))?;

        match row {
            Some((_, Some(expires_at))) if expires_at <= Utc::now().timestamp_millis() => {
                conn.execute("DELETE FROM embedding_cache WHERE key = ?", params![key])
                    .map_err(|e| Error::Cache(format!("cache delete failed: {e}")))?;
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|t| Utc::now().timestamp_millis() + t.as_millis() as i64);
        self.connection()?
            .execute(
                "INSERT OR REPLACE INTO embedding_cache (key, value, expires_at) VALUES (?, ?, ?)",
                params![key, value, expires_at],
            )
            .map_err(|e| Error::Cache(format!("cache write failed: {e}")))?;
        if self.purge.due() {
            self.purge_expired()?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.connection()?
            .execute("DELETE FROM embedding_cache WHERE key = ?", params![key])
            .map_err(|e| Error::Cache(format!("cache delete failed: {e}")))?;
        Ok(())
    }
}
