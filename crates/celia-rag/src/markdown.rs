use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use celia_common::{Error, Result};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::embeddings::EmbeddingProvider;
use crate::retriever::Retriever;
use crate::splitter::{MarkdownChunk, MarkdownSplitter};
use crate::store::{SearchHit, VectorDocument, VectorStore};

/// Retrieval source backed by a single markdown file.
///
/// `load()` splits the file, embeds every chunk and upserts it under the id
/// `<name>:<chunk index>`. Documents left over from an earlier, longer
/// version of the file are pruned so the store mirrors the file.
pub struct MarkdownRag {
    name: String,
    file_path: PathBuf,
    text2vec: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    splitter: MarkdownSplitter,
    entries: RwLock<Vec<MarkdownChunk>>,
}

impl MarkdownRag {
    pub fn new(
        name: impl Into<String>,
        file_path: impl Into<PathBuf>,
        text2vec: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            name: name.into(),
            file_path: file_path.into(),
            text2vec,
            store,
            splitter: MarkdownSplitter::default(),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn with_splitter(mut self, splitter: MarkdownSplitter) -> Self {
        self.splitter = splitter;
        self
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Chunks registered by the last successful `load()`.
    pub fn entries(&self) -> Vec<MarkdownChunk> {
        self.entries
            .read()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    fn document_id(&self, chunk: &MarkdownChunk) -> String {
        format!("{}:{}", self.name, chunk.index)
    }

    /// Read, split, embed and store the file. Returns the number of entries.
    #[instrument(skip(self), fields(source = %self.name, file = %self.file_path.display()))]
    pub async fn load(&self) -> Result<usize> {
        let markdown = tokio::fs::read_to_string(&self.file_path)
            .await
            .map_err(|e| {
                Error::Rag(format!(
                    "failed to read {}: {e}",
                    self.file_path.display()
                ))
            })?;

        let chunks = self.splitter.split(&markdown);
        if chunks.is_empty() {
            warn!("{} contains no retrievable text", self.file_path.display());
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = if texts.is_empty() {
            Vec::new()
        } else {
            self.text2vec.embed_documents(&texts).await?
        };
        if embeddings.len() != chunks.len() {
            return Err(Error::Rag(format!(
                "expected {} embeddings, got {}",
                chunks.len(),
                embeddings.len()
            )));
        }

        let file = self.file_path.display().to_string();
        let docs: Vec<VectorDocument> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| VectorDocument {
                id: self.document_id(chunk),
                source: self.name.clone(),
                text: chunk.text.clone(),
                embedding,
                metadata: json!({
                    "source": self.name,
                    "heading": chunk.heading,
                    "path": chunk.path,
                    "file": file,
                    "chunk_index": chunk.index,
                }),
            })
            .collect();

        self.store.upsert(&docs).await?;
        let keep: Vec<String> = docs.into_iter().map(|d| d.id).collect();
        self.store.prune(&self.name, &keep).await?;

        let count = chunks.len();
        if let Ok(mut entries) = self.entries.write() {
            *entries = chunks;
        }

        info!(
            "loaded {count} entries into {} index '{}'",
            self.store.store_id(),
            self.store.index_name()
        );
        Ok(count)
    }

    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        let embedding = self.text2vec.embed_query(query).await?;
        self.store.search(&embedding, top_k).await
    }
}

#[async_trait]
impl Retriever for MarkdownRag {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        MarkdownRag::search(self, query, top_k).await
    }
}
