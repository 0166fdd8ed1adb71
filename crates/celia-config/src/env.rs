use celia_common::{Error, Result, mask_secret};
use tracing::{debug, info};

use crate::model::{AppConfig, StoreBackendKind};

pub const WEBHOOK_URL: &str = "WEBHOOK_URL";
pub const TELEGRAM_TOKEN: &str = "TELEGRAM_TOKEN";
pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const MONGO_URI: &str = "MONGO_URI";

impl AppConfig {
    /// Overlay process environment values on top of the file config.
    ///
    /// `lookup` is `std::env::var` in the binary; tests pass a map.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(WEBHOOK_URL) {
            debug!("{WEBHOOK_URL} set from environment");
            self.gateway.webhook_url = Some(url);
        }
        if let Some(host) = get("CELIA_HOST") {
            self.gateway.host = host;
        }
        if let Some(port) = get("CELIA_PORT").and_then(|p| p.parse().ok()) {
            self.gateway.port = port;
        }
        if let Some(token) = get(TELEGRAM_TOKEN) {
            info!("telegram token loaded from environment ({})", mask_secret(&token));
            self.telegram.token = Some(token);
        }
        if let Some(secret) = get("TELEGRAM_SECRET_TOKEN") {
            self.telegram.secret_token = Some(secret);
        }
        if let Some(key) = get(OPENAI_API_KEY) {
            self.llm.api_key = Some(key);
        }
        if let Some(base_url) = get("OPENAI_BASE_URL") {
            self.llm.base_url = Some(base_url);
        }
        if let Some(uri) = get(MONGO_URI) {
            self.store.mongo_uri = Some(uri);
        }
    }

    /// Fail fast when a required value is missing, naming every missing variable.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();

        if is_blank(&self.gateway.webhook_url) {
            missing.push(WEBHOOK_URL);
        }
        if is_blank(&self.telegram.token) {
            missing.push(TELEGRAM_TOKEN);
        }
        if is_blank(&self.llm.api_key) {
            missing.push(OPENAI_API_KEY);
        }
        if self.store.backend == StoreBackendKind::Atlas && is_blank(&self.store.mongo_uri) {
            missing.push(MONGO_URI);
        }

        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "missing required environment variables: {} (set them in .env or the environment)",
                missing.join(", ")
            )));
        }

        self.validate_values()
    }

    /// Checks that apply regardless of where the values came from.
    fn validate_values(&self) -> Result<()> {
        if let Some(url) = &self.gateway.webhook_url {
            let parsed = url::Url::parse(url)
                .map_err(|e| Error::Config(format!("invalid {WEBHOOK_URL} '{url}': {e}")))?;
            if parsed.scheme() != "https" {
                return Err(Error::Config(format!(
                    "{WEBHOOK_URL} must use https, got '{}'",
                    parsed.scheme()
                )));
            }
        }

        let store = &self.store;
        if let Some(uri) = store.mongo_uri.as_deref().map(str::trim)
            && store.backend == StoreBackendKind::Atlas
            && !uri.starts_with("mongodb://")
            && !uri.starts_with("mongodb+srv://")
        {
            return Err(Error::Config(format!(
                "{MONGO_URI} must be a MongoDB connection string (mongodb:// or mongodb+srv://), got '{}'",
                uri.split("://").next().unwrap_or(uri)
            )));
        }
        for (name, value) in [
            ("store.collection_name", &store.collection_name),
            ("store.db_name", &store.db_name),
            ("store.index_name", &store.index_name),
            ("store.embedding_field", &store.embedding_field),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{name} must not be empty")));
            }
        }
        if store.num_dimensions == 0 {
            return Err(Error::Config("store.num_dimensions must be positive".into()));
        }
        if self.assistant.prompt.trim().is_empty() {
            return Err(Error::Config("assistant.prompt must not be empty".into()));
        }

        Ok(())
    }

    /// Embedding API key, defaulting to the chat completion key.
    pub fn embedding_api_key(&self) -> Option<&str> {
        self.embeddings
            .api_key
            .as_deref()
            .or(self.llm.api_key.as_deref())
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(|v| v.trim().is_empty())
}
