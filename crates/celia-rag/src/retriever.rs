use async_trait::async_trait;
use celia_common::Result;

use crate::store::SearchHit;

/// Anything the assistant can pull grounding context from.
#[async_trait]
pub trait Retriever: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>>;
}
