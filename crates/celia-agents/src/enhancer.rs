//! Reply enhancement: turning a finished assistant reply into a richer
//! [`OutboundMessage`] (quick-reply options or link buttons).

use std::sync::Arc;

use async_trait::async_trait;
use celia_common::{LinkButton, OutboundMessage};
use tracing::{debug, warn};

use crate::providers::{ChatMessage, LlmProvider, LlmRequest};

const MAX_OPTIONS: usize = 6;
const MAX_OPTION_CHARS: usize = 64;
const MAX_LINKS: usize = 4;

const ENHANCER_PROMPT: &str = "\
You format chatbot replies for a messaging app. Given the user's message and \
the assistant's reply, answer with a single JSON object and nothing else.
Use {\"kind\": \"select\", \"text\": <reply>, \"options\": [<short answers>]} when the reply \
asks the user to choose between a few explicit alternatives.
Use {\"kind\": \"link\", \"text\": <reply>, \"links\": [{\"text\": <label>, \"url\": <url>}]} \
when the reply mentions URLs the user should open. Only use URLs that appear in the reply.
Otherwise use {\"kind\": \"text\", \"text\": <reply>}.
Keep the reply text unchanged apart from removing URLs that became buttons.";

#[async_trait]
pub trait MessageEnhancer: Send + Sync {
    fn name(&self) -> &str;

    /// Never fails: anything unusable degrades to a plain text message.
    async fn enhance(&self, user_text: &str, reply: &str) -> OutboundMessage;
}

/// Sends replies through unchanged.
#[derive(Debug, Default)]
pub struct PassthroughEnhancer;

#[async_trait]
impl MessageEnhancer for PassthroughEnhancer {
    fn name(&self) -> &str {
        "passthrough"
    }

    async fn enhance(&self, _user_text: &str, reply: &str) -> OutboundMessage {
        OutboundMessage::plain(reply)
    }
}

/// Asks an LLM whether a reply is better shown with options or buttons.
pub struct SmartMessageEnhancer {
    provider: Arc<dyn LlmProvider>,
    max_chars: usize,
}

impl SmartMessageEnhancer {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            max_chars: 1200,
        }
    }

    /// Replies longer than this skip the enhancement round-trip.
    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }
}

#[async_trait]
impl MessageEnhancer for SmartMessageEnhancer {
    fn name(&self) -> &str {
        "smart"
    }

    async fn enhance(&self, user_text: &str, reply: &str) -> OutboundMessage {
        if reply.trim().is_empty() || reply.chars().count() > self.max_chars {
            return OutboundMessage::plain(reply);
        }

        let request = LlmRequest {
            messages: vec![ChatMessage::user(format!(
                "User message:\n{user_text}\n\nAssistant reply:\n{reply}"
            ))],
            system: Some(ENHANCER_PROMPT.to_string()),
            max_tokens: Some(800),
            temperature: Some(0.0),
            json_mode: true,
            ..LlmRequest::default()
        };

        match self.provider.complete(&request).await {
            Ok(response) => parse_enhanced(&response.text, reply).unwrap_or_else(|| {
                debug!("enhancer output unusable, sending plain text");
                OutboundMessage::plain(reply)
            }),
            Err(e) => {
                warn!("message enhancement failed, sending plain text: {e}");
                OutboundMessage::plain(reply)
            }
        }
    }
}

/// Validate the enhancer's JSON. `None` means fall back to the original reply.
///
/// The enhancer only adds structure: the reply text is kept, except that
/// URLs turned into buttons may be dropped from it.
fn parse_enhanced(raw: &str, reply: &str) -> Option<OutboundMessage> {
    let message: OutboundMessage = serde_json::from_str(strip_code_fence(raw)).ok()?;
    let text = reply_text(message.text(), reply);

    match message {
        OutboundMessage::Text { .. } => Some(OutboundMessage::plain(reply)),
        OutboundMessage::Select { options, .. } => {
            let options: Vec<String> = options
                .into_iter()
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty() && o.chars().count() <= MAX_OPTION_CHARS)
                .take(MAX_OPTIONS)
                .collect();
            if options.is_empty() {
                return Some(OutboundMessage::plain(reply));
            }
            Some(OutboundMessage::Select { text, options })
        }
        OutboundMessage::Link { links, .. } => {
            let links: Vec<LinkButton> = links
                .into_iter()
                .filter(|l| !l.text.trim().is_empty() && is_reply_url(&l.url, reply))
                .take(MAX_LINKS)
                .collect();
            if links.is_empty() {
                return Some(OutboundMessage::plain(reply));
            }
            Some(OutboundMessage::Link { text, links })
        }
    }
}

/// `candidate` if it is `reply` with some URLs removed, otherwise `reply`.
fn reply_text(candidate: &str, reply: &str) -> String {
    let is_url = |word: &&str| word.contains("http://") || word.contains("https://");
    let kept: Vec<&str> = reply.split_whitespace().filter(|w| !is_url(w)).collect();
    let proposed: Vec<&str> = candidate.split_whitespace().collect();

    if !proposed.is_empty() && proposed == kept && kept.len() < reply.split_whitespace().count() {
        candidate.trim().to_string()
    } else {
        reply.to_string()
    }
}

/// Only http(s) URLs the assistant actually wrote may become buttons.
fn is_reply_url(candidate: &str, reply: &str) -> bool {
    match url::Url::parse(candidate) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && reply.contains(candidate),
        Err(_) => false,
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::LlmResponse;
    use celia_common::{Error, Result};

    struct CannedProvider(std::result::Result<&'static str, &'static str>);

    #[async_trait]
    impl LlmProvider for CannedProvider {
        fn provider_id(&self) -> &str {
            "canned"
        }

        async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
            assert!(request.json_mode);
            match self.0 {
                Ok(text) => Ok(LlmResponse {
                    text: text.to_string(),
                    model: "test".into(),
                    usage: None,
                    stop_reason: None,
                }),
                Err(e) => Err(Error::Agent(e.to_string())),
            }
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    async fn enhance(canned: std::result::Result<&'static str, &'static str>, reply: &str) -> OutboundMessage {
        SmartMessageEnhancer::new(Arc::new(CannedProvider(canned)))
            .enhance("question", reply)
            .await
    }

    #[tokio::test]
    async fn select_replies_keep_valid_options() {
        let out = enhance(
            Ok(r#"{"kind":"select","text":"Which currency?","options":["USD"," EUR ",""]}"#),
            "Which currency? USD or EUR?",
        )
        .await;
        assert_eq!(
            out,
            OutboundMessage::Select {
                text: "Which currency? USD or EUR?".into(),
                options: vec!["USD".into(), "EUR".into()],
            }
        );
    }

    #[tokio::test]
    async fn rewritten_text_is_ignored() {
        let reply = "Transfers are free up to 100 USD.";
        let out = enhance(Ok(r#"{"kind":"text","text":"Transfers cost 5 USD."}"#), reply).await;
        assert_eq!(out, OutboundMessage::plain(reply));

        let out = enhance(
            Ok(r#"{"kind":"select","text":"Transfers cost 5 USD.","options":["Send now"]}"#),
            reply,
        )
        .await;
        assert_eq!(out.text(), reply);

        let out = enhance(
            Ok(r#"{"kind":"select","text":"Transfers cost 5 USD.","options":[]}"#),
            reply,
        )
        .await;
        assert_eq!(out, OutboundMessage::plain(reply));
    }

    #[tokio::test]
    async fn link_text_may_only_drop_urls() {
        let reply = "See https://example.com/fees for details.";
        let out = enhance(
            Ok(r#"{"kind":"link","text":"See for details.","links":[{"text":"Fees","url":"https://example.com/fees"}]}"#),
            reply,
        )
        .await;
        assert_eq!(out.text(), "See for details.");

        let out = enhance(
            Ok(r#"{"kind":"link","text":"Fees are waived.","links":[{"text":"Fees","url":"https://example.com/fees"}]}"#),
            reply,
        )
        .await;
        assert_eq!(out.text(), reply);
        assert!(matches!(out, OutboundMessage::Link { .. }));
    }

    #[tokio::test]
    async fn links_must_appear_in_the_reply() {
        let reply = "See https://example.com/fees for details.";
        let out = enhance(
            Ok(r#"```json
{"kind":"link","text":"See the fee page.","links":[
  {"text":"Fees","url":"https://example.com/fees"},
  {"text":"Phish","url":"https://evil.example/login"}
]}
```"#),
            reply,
        )
        .await;

        match out {
            OutboundMessage::Link { links, .. } => {
                assert_eq!(links.len(), 1);
                assert_eq!(links[0].url, "https://example.com/fees");
            }
            other => panic!("expected link message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invented_links_fall_back_to_the_reply() {
        let reply = "Transfers are free.";
        let out = enhance(
            Ok(r#"{"kind":"link","text":"x","links":[{"text":"a","url":"https://x.example"}]}"#),
            reply,
        )
        .await;
        assert_eq!(out, OutboundMessage::plain(reply));
    }

    #[tokio::test]
    async fn malformed_output_falls_back_to_text() {
        let reply = "Open the app and tap Send.";
        assert_eq!(enhance(Ok("not json"), reply).await, OutboundMessage::plain(reply));
        assert_eq!(
            enhance(Ok(r#"{"kind":"carousel","text":"x"}"#), reply).await,
            OutboundMessage::plain(reply)
        );
        assert_eq!(
            enhance(Err("provider down"), reply).await,
            OutboundMessage::plain(reply)
        );
    }

    #[tokio::test]
    async fn empty_text_keeps_the_original_reply() {
        let reply = "Transfers are free.";
        let out = enhance(Ok(r#"{"kind":"text","text":"  "}"#), reply).await;
        assert_eq!(out, OutboundMessage::plain(reply));
    }

    #[tokio::test]
    async fn long_replies_skip_the_llm() {
        let reply = "x".repeat(50);
        let enhancer = SmartMessageEnhancer::new(Arc::new(CannedProvider(Err("must not be called"))))
            .with_max_chars(10);
        assert_eq!(
            enhancer.enhance("q", &reply).await,
            OutboundMessage::plain(reply)
        );
    }

    #[tokio::test]
    async fn passthrough_is_plain_text() {
        assert_eq!(
            PassthroughEnhancer.enhance("q", "hello").await,
            OutboundMessage::plain("hello")
        );
    }
}
