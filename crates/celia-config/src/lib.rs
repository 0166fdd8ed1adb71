pub mod env;
pub mod loader;
pub mod model;

pub use loader::ConfigLoader;
pub use model::{
    AppConfig, AssistantConfig, CacheBackendKind, CacheConfig, DEFAULT_PROMPT, EmbeddingConfig,
    EnhancerConfig, GatewayConfig, LlmProviderConfig, RagConfig, StoreBackendKind, StoreConfig,
    StreamMode, TelegramConfig,
};
