//! Vector persistence behind [`VectorStore`].
//!
//! [`AtlasStore`] talks to MongoDB Atlas through the official driver and
//! relies on an Atlas Vector Search index. [`SqliteVectorStore`] keeps everything in a
//! local file and scores with brute-force cosine similarity.

mod atlas;
mod sqlite;

use async_trait::async_trait;
use celia_common::{Error, Result};
use serde::{Deserialize, Serialize};

pub use atlas::AtlasStore;
pub use sqlite::SqliteVectorStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorDocument {
    pub id: String,
    /// Name of the retrieval source that owns the document.
    pub source: String,
    pub text: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub score: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    fn store_id(&self) -> &str;
    fn index_name(&self) -> &str;
    fn num_dimensions(&self) -> usize;

    /// Insert or replace documents by id. Returns the number written.
    async fn upsert(&self, docs: &[VectorDocument]) -> Result<usize>;

    /// Nearest documents to `embedding`, best first.
    async fn search(&self, embedding: &[f32], top_k: usize) -> Result<Vec<SearchHit>>;

    async fn count(&self) -> Result<usize>;

    /// Delete documents of `source` whose id is not in `keep_ids`.
    async fn prune(&self, source: &str, keep_ids: &[String]) -> Result<usize>;

    async fn clear(&self) -> Result<usize>;
}

pub(crate) fn check_dimensions(expected: usize, embedding: &[f32]) -> Result<()> {
    if embedding.len() != expected {
        return Err(Error::Store(format!(
            "embedding has {} dimensions, store expects {expected}",
            embedding.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimension_check_names_both_sizes() {
        assert!(check_dimensions(3, &[0.0, 1.0, 2.0]).is_ok());
        let err = check_dimensions(1536, &[0.0; 8]).unwrap_err().to_string();
        assert!(err.contains("8"));
        assert!(err.contains("1536"));
    }
}
