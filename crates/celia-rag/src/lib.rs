pub mod cache;
pub mod cached;
pub mod embeddings;
pub mod markdown;
pub mod retriever;
pub mod splitter;
pub mod store;
mod vector;

pub use cache::{CacheBackend, MemoryCache, NoopCache, SqliteCache};
pub use cached::CachedEmbedding;
pub use embeddings::{EmbeddingProvider, OpenAiEmbeddingProvider};
pub use markdown::MarkdownRag;
pub use retriever::Retriever;
pub use splitter::{MarkdownChunk, MarkdownSplitter};
pub use store::{AtlasStore, SearchHit, SqliteVectorStore, VectorDocument, VectorStore};
