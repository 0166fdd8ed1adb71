use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use celia_common::{Error, Result};
use ring::digest;
use tracing::{debug, warn};

use crate::cache::CacheBackend;
use crate::embeddings::EmbeddingProvider;
use crate::vector::{blob_to_embedding, embedding_to_blob};

/// Embedding provider decorator that memoizes vectors in a [`CacheBackend`].
///
/// Cache failures never fail a request: a broken cache behaves like an
/// empty one and the inner provider is asked instead.
pub struct CachedEmbedding {
    inner: Arc<dyn EmbeddingProvider>,
    cache: Arc<dyn CacheBackend>,
    expire: Option<Duration>,
    id: String,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedEmbedding {
    pub fn new(
        inner: Arc<dyn EmbeddingProvider>,
        cache: Arc<dyn CacheBackend>,
        expire: Option<Duration>,
    ) -> Self {
        let id = format!("cached-{}", inner.provider_id());
        Self {
            inner,
            cache,
            expire,
            id,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn cache_backend(&self) -> &str {
        self.cache.backend_id()
    }

    /// `(hits, misses)` since construction.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    fn cache_key(&self, text: &str) -> String {
        let mut ctx = digest::Context::new(&digest::SHA256);
        ctx.update(self.inner.model().as_bytes());
        ctx.update(b"\0");
        ctx.update(text.as_bytes());

        let mut key = String::with_capacity(71);
        key.push_str("emb:");
        for byte in ctx.finish().as_ref() {
            let _ = write!(key, "{byte:02x}");
        }
        key
    }

    async fn lookup(&self, key: &str) -> Option<Vec<f32>> {
        match self.cache.get(key).await {
            Ok(Some(blob)) => match blob_to_embedding(&blob) {
                Ok(vector) => Some(vector),
                Err(e) => {
                    warn!("discarding corrupt cache entry {key}: {e}");
                    let _ = self.cache.delete(key).await;
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("embedding cache read failed, treating as miss: {e}");
                None
            }
        }
    }

    async fn store(&self, key: &str, vector: &[f32]) {
        if let Err(e) = self
            .cache
            .set(key, embedding_to_blob(vector), self.expire)
            .await
        {
            warn!("embedding cache write failed: {e}");
        }
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbedding {
    fn provider_id(&self) -> &str {
        &self.id
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let keys: Vec<String> = texts.iter().map(|t| self.cache_key(t)).collect();
        let mut out: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut missing = Vec::new();

        for (i, key) in keys.iter().enumerate() {
            let cached = self.lookup(key).await;
            if cached.is_none() {
                missing.push(i);
            }
            out.push(cached);
        }

        let hit_count = (texts.len() - missing.len()) as u64;
        self.hits.fetch_add(hit_count, Ordering::Relaxed);
        self.misses
            .fetch_add(missing.len() as u64, Ordering::Relaxed);
        debug!(
            backend = self.cache.backend_id(),
            hits = hit_count,
            misses = missing.len(),
            "embedding cache lookup"
        );

        if !missing.is_empty() {
            let batch: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
            let fresh = self.inner.embed_documents(&batch).await?;
            if fresh.len() != batch.len() {
                return Err(Error::Rag(format!(
                    "{} returned {} embeddings for {} inputs",
                    self.inner.provider_id(),
                    fresh.len(),
                    batch.len()
                )));
            }

            for (&i, vector) in missing.iter().zip(fresh) {
                self.store(&keys[i], &vector).await;
                out[i] = Some(vector);
            }
        }

        out.into_iter()
            .map(|v| v.ok_or_else(|| Error::Rag("embedding missing after cache fill".into())))
            .collect()
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_documents(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| Error::Rag("no embedding returned for query".into()))
    }

    async fn health_check(&self) -> Result<bool> {
        self.inner.health_check().await
    }
}
