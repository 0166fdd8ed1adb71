use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use celia_common::{Error, Result};
use celia_config::StoreConfig;
use rusqlite::{Connection, params, params_from_iter};
use tracing::{debug, info};

use super::{SearchHit, VectorDocument, VectorStore, check_dimensions};
use crate::vector::{blob_to_embedding, cosine_similarity, embedding_to_blob};

pub struct SqliteVectorStore {
    conn: Mutex<Connection>,
    index_name: String,
    num_dimensions: usize,
}

impl SqliteVectorStore {
    pub fn open(db_path: &Path, config: &StoreConfig) -> Result<Self> {
        info!("opening vector store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Store(format!("failed to open vector database: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| Error::Store(format!("failed to set pragmas: {e}")))?;
        Self::with_connection(conn, config)
    }

    pub fn in_memory(config: &StoreConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Store(format!("failed to open in-memory vector store: {e}")))?;
        Self::with_connection(conn, config)
    }

    fn with_connection(conn: Connection, config: &StoreConfig) -> Result<Self> {
        if config.num_dimensions == 0 {
            return Err(Error::Store("num_dimensions must be positive".into()));
        }

        let store = Self {
            conn: Mutex::new(conn),
            index_name: config.index_name.clone(),
            num_dimensions: config.num_dimensions,
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        self.connection()?
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS embeddings (
                    id TEXT PRIMARY KEY,
                    source TEXT NOT NULL,
                    content TEXT NOT NULL,
                    embedding BLOB NOT NULL,
                    metadata TEXT DEFAULT '{}',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );
                CREATE INDEX IF NOT EXISTS idx_embeddings_source ON embeddings(source);",
            )
            .map_err(|e| Error::Store(format!("vector store migration failed: {e}")))?;

        Ok(())
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Store("vector store lock poisoned".into()))
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn store_id(&self) -> &str {
        "sqlite"
    }

    fn index_name(&self) -> &str {
        &self.index_name
    }

    fn num_dimensions(&self) -> usize {
        self.num_dimensions
    }

    async fn upsert(&self, docs: &[VectorDocument]) -> Result<usize> {
        for doc in docs {
            check_dimensions(self.num_dimensions, &doc.embedding)?;
        }

        let mut conn = self.connection()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Store(format!("failed to begin transaction: {e}")))?;
        for doc in docs {
            tx.execute(
                "INSERT OR REPLACE INTO embeddings (id, source, content, embedding, metadata)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    doc.id,
                    doc.source,
                    doc.text,
                    embedding_to_blob(&doc.embedding),
                    doc.metadata.to_string(),
                ],
            )
            .map_err(|e| Error::Store(format!("failed to upsert {}: {e}", doc.id)))?;
        }
        tx.commit()
            .map_err(|e| Error::Store(format!("failed to commit upsert: {e}")))?;

        debug!("upserted {} documents", docs.len());
        Ok(docs.len())
    }

    async fn search(&self, embedding: &[f32], top_k: usize) -> Result<Vec<SearchHit>> {
        check_dimensions(self.num_dimensions, embedding)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let conn = self.connection()?;
        let mut stmt = conn
            .prepare("SELECT id, content, embedding, metadata FROM embeddings")
            .map_err(|e| Error::Store(format!("failed to prepare search: {e}")))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })
            .map_err(|e| Error::Store(format!("search query failed: {e}")))?;

        let mut hits = Vec::new();
        for row in rows {
            let (id, text, blob, metadata) =
                row.map_err(|e| Error::Store(format!("failed to read row: {e}")))?;
            let stored = blob_to_embedding(&blob)?;
            let metadata = metadata
                .and_then(|m| serde_json::from_str(&m).ok())
                .unwrap_or(serde_json::Value::Null);
            hits.push(SearchHit {
                id,
                text,
                metadata,
                score: cosine_similarity(embedding, &stored),
            });
        }

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn count(&self) -> Result<usize> {
        let count: i64 = self
            .connection()?
            .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))
            .map_err(|e| Error::Store(format!("count failed: {e}")))?;
        Ok(count as usize)
    }

    async fn prune(&self, source: &str, keep_ids: &[String]) -> Result<usize> {
        let conn = self.connection()?;
        let result = if keep_ids.is_empty() {
            conn.execute("DELETE FROM embeddings WHERE source = ?", params![source])
        } else {
            let placeholders = vec!["?"; keep_ids.len()].join(", ");
            let sql =
                format!("DELETE FROM embeddings WHERE source = ? AND id NOT IN ({placeholders})");
            let values = std::iter::once(source).chain(keep_ids.iter().map(String::as_str));
            conn.execute(&sql, params_from_iter(values))
        };
        let removed = result.map_err(|e| Error::Store(format!("prune failed: {e}")))?;

        if removed > 0 {
            info!("pruned {removed} stale documents from source '{source}'");
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<usize> {
        self.connection()?
            .execute("DELETE FROM embeddings", [])
            .map_err(|e| Error::Store(format!("clear failed: {e}")))
    }
}
