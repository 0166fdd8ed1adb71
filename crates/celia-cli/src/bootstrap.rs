//! Builds the running system from an [`AppConfig`]: prompt, assistant,
//! cached embeddings, vector store, markdown RAG, enhancer, gateway and
//! the Telegram connector.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use celia_agents::{
    Assistant, LlmProvider, MessageEnhancer, OpenAiProvider, PromptTemplate, SmartMessageEnhancer,
};
use celia_channels::TelegramConnector;
use celia_config::{AppConfig, CacheBackendKind, StoreBackendKind};
use celia_gateway::MessageGateway;
use celia_rag::{
    AtlasStore, CacheBackend, CachedEmbedding, EmbeddingProvider, MarkdownRag, MarkdownSplitter,
    MemoryCache, NoopCache, OpenAiEmbeddingProvider, SqliteCache, SqliteVectorStore, VectorStore,
};
use tracing::info;

const DATA_DIR: &str = ".celia";

pub fn build_prompt(config: &AppConfig) -> PromptTemplate {
    PromptTemplate::new(config.assistant.prompt.clone())
}

pub fn build_llm(config: &AppConfig) -> Result<Arc<dyn LlmProvider>> {
    let api_key = config
        .llm
        .api_key
        .clone()
        .ok_or_else(|| anyhow!("OPENAI_API_KEY is not set"))?;
    Ok(Arc::new(OpenAiProvider::new(
        api_key,
        config.llm.model.clone(),
        config.llm.base_url.clone(),
    )))
}

pub fn build_assistant(config: &AppConfig, llm: Arc<dyn LlmProvider>) -> Assistant {
    let mut assistant = Assistant::new(config.assistant.name.clone(), build_prompt(config));
    if let Some(max_tokens) = config.assistant.max_tokens {
        assistant.set_max_tokens(max_tokens);
    }
    assistant.set_top_k(config.rag.top_k);
    assistant.register_provider(llm);
    assistant
}

pub fn build_cache(config: &AppConfig) -> Result<Arc<dyn CacheBackend>> {
    let cache: Arc<dyn CacheBackend> = match config.cache.backend {
        CacheBackendKind::Sqlite => {
            let path = data_path(config.cache.path.as_deref(), "embedding_cache.db")?;
            Arc::new(SqliteCache::open(&path).context("failed to open embedding cache")?)
        }
        CacheBackendKind::Memory => Arc::new(MemoryCache::new()),
        CacheBackendKind::None => Arc::new(NoopCache),
    };
    info!("embedding cache backend: {}", cache.backend_id());
    Ok(cache)
}

pub fn build_text2vec(config: &AppConfig) -> Result<Arc<CachedEmbedding>> {
    let api_key = config
        .embedding_api_key()
        .ok_or_else(|| anyhow!("OPENAI_API_KEY is not set"))?;
    let provider = OpenAiEmbeddingProvider::new(
        api_key,
        config.embeddings.model.clone(),
        config
            .embeddings
            .base_url
            .clone()
            .or_else(|| config.llm.base_url.clone()),
    )
    .with_dimensions(config.store.num_dimensions);

    Ok(Arc::new(CachedEmbedding::new(
        Arc::new(provider) as Arc<dyn EmbeddingProvider>,
        build_cache(config)?,
        Some(Duration::from_secs(config.cache.expire_secs)),
    )))
}

pub async fn build_store(config: &AppConfig) -> Result<Arc<dyn VectorStore>> {
    let store: Arc<dyn VectorStore> = match config.store.backend {
        StoreBackendKind::Atlas => Arc::new(AtlasStore::connect(&config.store).await?),
        StoreBackendKind::Sqlite => {
            let path = data_path(config.store.path.as_deref(), "vectors.db")?;
            Arc::new(SqliteVectorStore::open(&path, &config.store)?)
        }
    };
    info!(
        "vector store: {} (index '{}', {} dimensions)",
        store.store_id(),
        store.index_name(),
        store.num_dimensions()
    );
    Ok(store)
}

/// The markdown knowledge base, not yet loaded.
pub async fn build_rag(config: &AppConfig) -> Result<Arc<MarkdownRag>> {
    let rag = MarkdownRag::new(
        config.rag.name.clone(),
        config.rag.file_path.clone(),
        build_text2vec(config)?,
        build_store(config).await?,
    )
    .with_splitter(MarkdownSplitter::new(config.rag.max_chunk_chars));
    Ok(Arc::new(rag))
}

pub fn build_enhancer(
    config: &AppConfig,
    llm: Arc<dyn LlmProvider>,
) -> Option<Arc<dyn MessageEnhancer>> {
    if !config.enhancer.enabled {
        return None;
    }
    Some(Arc::new(
        SmartMessageEnhancer::new(llm).with_max_chars(config.enhancer.max_chars),
    ))
}

pub fn build_connector(config: &AppConfig) -> Result<Arc<TelegramConnector>> {
    let token = config
        .telegram
        .token
        .as_deref()
        .ok_or_else(|| anyhow!("TELEGRAM_TOKEN is not set"))?;
    Ok(Arc::new(TelegramConnector::new(
        token,
        config.telegram.stream_mode,
        config.telegram.secret_token.clone(),
    )))
}

/// Assistant with the markdown knowledge base loaded and attached.
pub async fn build_rag_assistant(config: &AppConfig) -> Result<(Assistant, Arc<dyn LlmProvider>)> {
    let llm = build_llm(config)?;
    let mut assistant = build_assistant(config, Arc::clone(&llm));

    let rag = build_rag(config).await?;
    let entries = rag
        .load()
        .await
        .with_context(|| format!("failed to load {}", config.rag.file_path.display()))?;
    info!("registered {entries} entries from {}", config.rag.file_path.display());
    assistant.set_rag_retrieval(rag);

    Ok((assistant, llm))
}

/// Everything `celia start` runs, ready to serve.
pub async fn build_gateway(config: &AppConfig) -> Result<MessageGateway> {
    let (assistant, llm) = build_rag_assistant(config).await?;
    let enhancer = build_enhancer(config, llm);

    let mut gateway = MessageGateway::new(config.gateway.clone(), Arc::new(assistant), enhancer)
        .with_history_limit(config.assistant.history_limit);
    gateway.register_connector(build_connector(config)?)?;
    Ok(gateway)
}

/// `configured` if set, otherwise `<DATA_DIR>/<file_name>`. Parent directories are created.
fn data_path(configured: Option<&Path>, file_name: &str) -> Result<PathBuf> {
    let path = configured
        .map(Path::to_path_buf)
        .unwrap_or_else(|| Path::new(DATA_DIR).join(file_name));
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(path)
}
