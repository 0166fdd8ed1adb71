pub mod assistant;
pub mod enhancer;
pub mod openai;
pub mod prompt;
pub mod providers;

pub use assistant::Assistant;
pub use enhancer::{MessageEnhancer, PassthroughEnhancer, SmartMessageEnhancer};
pub use openai::OpenAiProvider;
pub use prompt::PromptTemplate;
pub use providers::{ChatMessage, ChatRole, LlmProvider, LlmRequest, LlmResponse, StreamEvent};
