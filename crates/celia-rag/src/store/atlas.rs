use async_trait::async_trait;
use celia_common::{Error, Result};
use celia_config::StoreConfig;
use futures::{StreamExt, TryStreamExt, stream};
use mongodb::bson::{Bson, Document, doc};
use mongodb::{Client, Collection};
use serde_json::Value;
use tracing::{debug, info, instrument};

use super::{SearchHit, VectorDocument, VectorStore, check_dimensions};

/// Concurrent `update_one` calls per upsert.
const UPSERT_CONCURRENCY: usize = 8;
/// `$vectorSearch` candidates scanned per requested result.
const CANDIDATE_FACTOR: usize = 10;

/// MongoDB Atlas collection searched through Atlas Vector Search.
///
/// `mongo_uri` is a regular connection string (`mongodb+srv://...`). The
/// collection needs a vector search index named `index_name` over
/// `embedding_field` with `num_dimensions` dimensions.
pub struct AtlasStore {
    collection: Collection<Document>,
    db_name: String,
    collection_name: String,
    index_name: String,
    embedding_field: String,
    num_dimensions: usize,
}

impl AtlasStore {
    /// Build the client. The driver connects lazily, so an unreachable
    /// cluster surfaces on the first store call rather than here.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let uri = config
            .mongo_uri
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::Config("MONGO_URI is required for the atlas store".into()))?;
        if config.num_dimensions == 0 {
            return Err(Error::Config(
                "store.num_dimensions must be positive".into(),
            ));
        }

        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| Error::Config(format!("invalid MONGO_URI: {e}")))?;
        let collection = client
            .database(&config.db_name)
            .collection::<Document>(&config.collection_name);

        info!(
            db = %config.db_name,
            collection = %config.collection_name,
            index = %config.index_name,
            dims = config.num_dimensions,
            "configured atlas vector store"
        );

        Ok(Self {
            collection,
            db_name: config.db_name.clone(),
            collection_name: config.collection_name.clone(),
            index_name: config.index_name.clone(),
            embedding_field: config.embedding_field.clone(),
            num_dimensions: config.num_dimensions,
        })
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    fn update_fields(&self, doc: &VectorDocument) -> Result<Document> {
        let metadata = mongodb::bson::to_bson(&doc.metadata)
            .map_err(|e| Error::Store(format!("metadata of '{}' is not storable: {e}", doc.id)))?;
        let embedding: Vec<Bson> = doc
            .embedding
            .iter()
            .map(|v| Bson::Double(f64::from(*v)))
            .collect();

        let mut fields = Document::new();
        fields.insert("source", doc.source.as_str());
        fields.insert("text", doc.text.as_str());
        fields.insert("metadata", metadata);
        fields.insert(self.embedding_field.as_str(), Bson::Array(embedding));
        Ok(fields)
    }

    fn search_pipeline(&self, embedding: &[f32], top_k: usize) -> Vec<Document> {
        let query: Vec<Bson> = embedding
            .iter()
            .map(|v| Bson::Double(f64::from(*v)))
            .collect();
        let num_candidates = (top_k * CANDIDATE_FACTOR) as i64;
        let limit = top_k as i64;
        vec![
            doc! {
                "$vectorSearch": {
                    "index": self.index_name.as_str(),
                    "path": self.embedding_field.as_str(),
                    "queryVector": query,
                    "numCandidates": num_candidates,
                    "limit": limit,
                }
            },
            doc! {
                "$project": {
                    "_id": 1,
                    "text": 1,
                    "metadata": 1,
                    "score": { "$meta": "vectorSearchScore" },
                }
            },
        ]
    }

    async fn delete_where(&self, filter: Document) -> Result<usize> {
        let deleted = self
            .collection
            .delete_many(filter)
            .await
            .map_err(|e| Error::Store(format!("atlas delete failed: {e}")))?;
        Ok(deleted.deleted_count as usize)
    }
}

fn hit_from_document(doc: Document) -> Result<SearchHit> {
    let id = match doc.get("_id") {
        Some(Bson::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => return Err(Error::Store("atlas search hit without _id".into())),
    };
    Ok(SearchHit {
        id,
        text: doc.get_str("text").unwrap_or_default().to_string(),
        metadata: doc
            .get("metadata")
            .cloned()
            .map(Bson::into_relaxed_extjson)
            .unwrap_or(Value::Null),
        score: doc.get_f64("score").unwrap_or_default() as f32,
    })
}

#[async_trait]
impl VectorStore for AtlasStore {
    fn store_id(&self) -> &str {
        "atlas"
    }

    fn index_name(&self) -> &str {
        &self.index_name
    }

    fn num_dimensions(&self) -> usize {
        self.num_dimensions
    }

    #[instrument(skip(self, docs), fields(collection = %self.collection_name, count = docs.len()))]
    async fn upsert(&self, docs: &[VectorDocument]) -> Result<usize> {
        for doc in docs {
            check_dimensions(self.num_dimensions, &doc.embedding)?;
        }

        let upserts: Vec<futures::future::BoxFuture<'_, Result<()>>> = docs
            .iter()
            .map(|doc| -> futures::future::BoxFuture<'_, Result<()>> {
                Box::pin(async move {
                    let fields = self.update_fields(doc)?;
                    self.collection
                        .update_one(doc! { "_id": doc.id.as_str() }, doc! { "$set": fields })
                        .upsert(true)
                        .await
                        .map_err(|e| {
                            Error::Store(format!("atlas upsert of '{}' failed: {e}", doc.id))
                        })?;
                    Ok::<_, Error>(())
                })
            })
            .collect();
        let written: Vec<()> = stream::iter(upserts)
            .buffer_unordered(UPSERT_CONCURRENCY)
            .try_collect()
            .await?;

        debug!("upserted {} documents into atlas", written.len());
        Ok(written.len())
    }

    #[instrument(skip(self, embedding), fields(index = %self.index_name))]
    async fn search(&self, embedding: &[f32], top_k: usize) -> Result<Vec<SearchHit>> {
        check_dimensions(self.num_dimensions, embedding)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let documents: Vec<Document> = self
            .collection
            .aggregate(self.search_pipeline(embedding, top_k))
            .await
            .map_err(|e| Error::Store(format!("atlas vector search failed: {e}")))?
            .try_collect()
            .await
            .map_err(|e| Error::Store(format!("atlas vector search failed: {e}")))?;

        documents.into_iter().map(hit_from_document).collect()
    }

    async fn count(&self) -> Result<usize> {
        let total = self
            .collection
            .count_documents(doc! {})
            .await
            .map_err(|e| Error::Store(format!("atlas count failed: {e}")))?;
        Ok(total as usize)
    }

    async fn prune(&self, source: &str, keep_ids: &[String]) -> Result<usize> {
        let deleted = self
            .delete_where(doc! { "source": source, "_id": { "$nin": keep_ids.to_vec() } })
            .await?;
        if deleted > 0 {
            info!("pruned {deleted} stale documents from source '{source}'");
        }
        Ok(deleted)
    }

    async fn clear(&self) -> Result<usize> {
        self.delete_where(doc! {}).await
    }
}
