use std::collections::HashMap;
use std::sync::Arc;

use celia_common::{Error, Result};
use celia_rag::Retriever;
use futures::StreamExt;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::prompt::PromptTemplate;
use crate::providers::{ChatMessage, LlmProvider, LlmRequest, StreamEvent};

const DEFAULT_TOP_K: usize = 3;
const DEFAULT_MAX_TOKENS: u32 = 1024;
const DEFAULT_CONTEXT_TOKENS: usize = 16_000;

/// Q&A assistant: a prompt template, an LLM provider and an optional
/// retrieval source consulted before every turn.
pub struct Assistant {
    name: String,
    prompt: PromptTemplate,
    providers: Vec<Arc<dyn LlmProvider>>,
    default_provider: Option<String>,
    retriever: Option<Arc<dyn Retriever>>,
    top_k: usize,
    max_tokens: Option<u32>,
    max_context_tokens: Option<usize>,
}

impl Assistant {
    pub fn new(name: impl Into<String>, prompt: PromptTemplate) -> Self {
        Self {
            name: name.into(),
            prompt,
            providers: Vec::new(),
            default_provider: None,
            retriever: None,
            top_k: DEFAULT_TOP_K,
            max_tokens: None,
            max_context_tokens: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prompt(&self) -> &PromptTemplate {
        &self.prompt
    }

    pub fn set_max_tokens(&mut self, max_tokens: u32) {
        self.max_tokens = Some(max_tokens);
    }

    pub fn set_max_context_tokens(&mut self, max_context_tokens: usize) {
        self.max_context_tokens = Some(max_context_tokens);
    }

    pub fn set_top_k(&mut self, top_k: usize) {
        self.top_k = top_k;
    }

    pub fn register_provider(&mut self, provider: Arc<dyn LlmProvider>) {
        let id = provider.provider_id().to_string();
        info!("registered LLM provider: {}", id);
        if self.default_provider.is_none() {
            self.default_provider = Some(id);
        }
        self.providers.push(provider);
    }

    pub fn default_provider(&self) -> Option<&Arc<dyn LlmProvider>> {
        let id = self.default_provider.as_ref()?;
        self.providers.iter().find(|p| p.provider_id() == id)
    }

    pub fn set_rag_retrieval(&mut self, retriever: Arc<dyn Retriever>) {
        info!("retrieval source '{}' attached to assistant", retriever.name());
        self.retriever = Some(retriever);
    }

    pub fn retriever(&self) -> Option<&Arc<dyn Retriever>> {
        self.retriever.as_ref()
    }

    /// The rendered template, without retrieved context.
    pub fn system_prompt(&self) -> String {
        let mut vars = HashMap::new();
        vars.insert("name", self.name.clone());
        vars.insert("date", chrono::Local::now().format("%Y-%m-%d").to_string());
        self.prompt.render(&vars)
    }

    async fn retrieval_context(&self, user_text: &str) -> Option<String> {
        let retriever = self.retriever.as_ref()?;
        match retriever.search(user_text, self.top_k).await {
            Ok(hits) if !hits.is_empty() => {
                debug!("retrieved {} chunks from '{}'", hits.len(), retriever.name());
                let context: Vec<&str> = hits.iter().map(|h| h.text.as_str()).collect();
                Some(format!(
                    "Relevant information:\n- {}",
                    context.join("\n- ")
                ))
            }
            Ok(_) => None,
            Err(e) => {
                warn!("retrieval failed, continuing without context: {}", e);
                None
            }
        }
    }

    async fn build_request(
        &self,
        user_text: &str,
        conversation_history: &[ChatMessage],
    ) -> LlmRequest {
        let prompt = self.system_prompt();
        let system = match self.retrieval_context(user_text).await {
            Some(ctx) => format!("{prompt}\n\n{ctx}"),
            None => prompt,
        };

        let mut messages = conversation_history.to_vec();
        messages.push(ChatMessage::user(user_text));

        let max_ctx = self.max_context_tokens.unwrap_or(DEFAULT_CONTEXT_TOKENS);
        trim_messages_to_budget(&mut messages, &system, max_ctx);

        LlmRequest {
            messages,
            system: Some(system),
            max_tokens: Some(self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
            ..LlmRequest::default()
        }
    }

    fn provider(&self) -> Result<&Arc<dyn LlmProvider>> {
        self.default_provider()
            .ok_or_else(|| Error::Agent("no LLM provider configured".into()))
    }

    /// Answer one user turn.
    #[instrument(skip(self, user_text, conversation_history), fields(history = conversation_history.len()))]
    pub async fn process_message(
        &self,
        session_id: &str,
        user_text: &str,
        conversation_history: &[ChatMessage],
    ) -> Result<String> {
        let provider = self.provider()?;
        let request = self.build_request(user_text, conversation_history).await;
        let response = provider.complete(&request).await?;
        Ok(response.text)
    }

    /// Answer one user turn, forwarding text deltas through `delta_tx` as
    /// they arrive. Returns the full reply.
    ///
    /// Providers without streaming support produce a single delta holding
    /// the whole reply.
    #[instrument(skip(self, user_text, conversation_history, delta_tx), fields(history = conversation_history.len()))]
    pub async fn process_message_streaming(
        &self,
        session_id: &str,
        user_text: &str,
        conversation_history: &[ChatMessage],
        delta_tx: mpsc::Sender<String>,
    ) -> Result<String> {
        let provider = self.provider()?;
        let request = self.build_request(user_text, conversation_history).await;

        let mut stream = match provider.stream_complete(&request).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("streaming unavailable, falling back to complete: {e}");
                let text = provider.complete(&request).await?.text;
                let _ = delta_tx.send(text.clone()).await;
                return Ok(text);
            }
        };

        let mut full_response = String::new();
        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::TextDelta(text) => {
                    full_response.push_str(&text);
                    let _ = delta_tx.send(text).await;
                }
                StreamEvent::MessageDelta { stop_reason, .. } => {
                    if let Some(reason) = stop_reason.filter(|r| r != "stop") {
                        warn!("completion stopped early: {reason}");
                    }
                }
                StreamEvent::MessageStop => break,
            }
        }

        Ok(full_response)
    }

    pub async fn health_check_all(&self) -> Vec<(String, bool)> {
        let checks = self.providers.iter().map(|provider| async {
            let provider_id = provider.provider_id().to_string();
            let ok = provider.health_check().await.unwrap_or(false);
            (provider_id, ok)
        });

        join_all(checks).await
    }
}

/// Rough token estimate: ~4 characters per token.
fn estimate_tokens(messages: &[ChatMessage], system: &str) -> usize {
    let chars: usize = system.len() + messages.iter().map(|m| m.content.len()).sum::<usize>();
    chars / 4
}

/// Drop the oldest messages until the estimated token count fits the budget.
/// Always keeps at least the last message (the current user input).
fn trim_messages_to_budget(messages: &mut Vec<ChatMessage>, system: &str, max_tokens: usize) {
    while messages.len() > 1 && estimate_tokens(messages, system) > max_tokens {
        messages.remove(0);
    }
}
