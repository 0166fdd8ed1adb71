use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use celia_common::{Error, Result};
use futures::StreamExt;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::providers::{ChatMessage, LlmProvider, LlmRequest, LlmResponse, StreamEvent, Usage};

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// OpenAI Chat Completions provider.
/// Also works with OpenAI-compatible APIs (Azure, local models) via `base_url`.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(
        api_key: impl Into<String>,
        model: Option<String>,
        base_url: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }

    fn build_request(&self, request: &LlmRequest, stream: bool) -> OpenAiRequest {
        let model = if request.model.is_empty() {
            self.model.clone()
        } else {
            request.model.clone()
        };

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(OpenAiMessage {
                role: "system".to_string(),
                content: Some(system.clone()),
            });
        }
        messages.extend(request.messages.iter().map(OpenAiMessage::from));

        OpenAiRequest {
            model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format: request
                .json_mode
                .then(|| serde_json::json!({ "type": "json_object" })),
            stream: stream.then_some(true),
        }
    }

    async fn post(&self, body: &OpenAiRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Agent(format!("openai request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Agent(format!(
                "openai API error: status={status}, body={body}"
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_id(&self) -> &str {
        "openai"
    }

    #[instrument(skip(self, request), fields(model))]
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let body = self.build_request(request, false);
        tracing::Span::current().record("model", body.model.as_str());
        debug!("openai request: model={}", body.model);

        let api_response: OpenAiResponse = self
            .post(&body)
            .await?
            .json()
            .await
            .map_err(|e| Error::Agent(format!("failed to parse openai response: {e}")))?;

        Ok(from_openai_response(api_response))
    }

    #[instrument(skip(self, request), fields(model))]
    async fn stream_complete(
        &self,
        request: &LlmRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>> {
        let body = self.build_request(request, true);
        tracing::Span::current().record("model", body.model.as_str());
        debug!("openai stream request: model={}", body.model);

        let response = self.post(&body).await?;
        let byte_stream: Pin<
            Box<dyn Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>> + Send>,
        > = Box::pin(response.bytes_stream());

        Ok(Box::pin(sse_events(byte_stream)))
    }

    fn configured_model(&self) -> Option<&str> {
        Some(&self.model)
    }

    async fn health_check(&self) -> Result<bool> {
        let request = LlmRequest {
            messages: vec![ChatMessage::user("ping")],
            max_tokens: Some(1),
            ..LlmRequest::default()
        };

        match self.complete(&request).await {
            Ok(_) => Ok(true),
            Err(e) => {
                info!("openai health check failed: {e}");
                Ok(false)
            }
        }
    }
}

/// Turn a chunked SSE body into stream events.
///
/// Bytes are buffered until a blank line closes an event, so a UTF-8
/// character split across network chunks is decoded whole. A single
/// `data:` line can carry several events (text plus finish reason); extras
/// wait in `pending` until the consumer polls again.
fn sse_events<S>(bytes: S) -> impl Stream<Item = Result<StreamEvent>> + Send
where
    S: Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>> + Send + Unpin,
{
    futures::stream::unfold(
        (bytes, Vec::<u8>::new(), VecDeque::new(), false),
        |(mut stream, mut buffer, mut pending, mut done)| async move {
            loop {
                if let Some(event) = pending.pop_front() {
                    return Some((Ok(event), (stream, buffer, pending, done)));
                }
                if done {
                    return None;
                }

                if let Some(pos) = buffer.windows(2).position(|w| w == b"\n\n") {
                    let block: Vec<u8> = buffer.drain(..pos + 2).collect();
                    done = push_sse_block(&block[..pos], &mut pending);
                    continue;
                }

                match stream.next().await {
                    // `\r` never occurs inside a multi-byte UTF-8 sequence.
                    Some(Ok(bytes)) => buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r')),
                    Some(Err(e)) => {
                        return Some((
                            Err(Error::Agent(format!("stream read error: {e}"))),
                            (stream, buffer, pending, true),
                        ));
                    }
                    None => {
                        // Body ended without a closing blank line.
                        let block = std::mem::take(&mut buffer);
                        push_sse_block(&block, &mut pending);
                        done = true;
                    }
                }
            }
        },
    )
}

/// Parse one complete SSE event block. Returns true on `[DONE]`.
fn push_sse_block(block: &[u8], pending: &mut VecDeque<StreamEvent>) -> bool {
    let block = String::from_utf8_lossy(block);
    for line in block.lines() {
        let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
            continue;
        };
        if data == "[DONE]" {
            pending.push_back(StreamEvent::MessageStop);
            return true;
        }
        pending.extend(parse_stream_chunk(data));
    }
    false
}

// --- OpenAI Wire Types (private) ---

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

impl From<&ChatMessage> for OpenAiMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            role: msg.role.as_str().to_string(),
            content: Some(msg.content.clone()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    model: String,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl From<OpenAiUsage> for Usage {
    fn from(u: OpenAiUsage) -> Self {
        Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDelta {
    content: Option<String>,
}

/// Parse one `data:` payload. Malformed payloads yield no events.
fn parse_stream_chunk(data: &str) -> Vec<StreamEvent> {
    let Ok(chunk) = serde_json::from_str::<OpenAiStreamChunk>(data) else {
        return Vec::new();
    };
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Vec::new();
    };

    let mut events = Vec::new();
    if let Some(content) = choice.delta.content
        && !content.is_empty()
    {
        events.push(StreamEvent::TextDelta(content));
    }
    if let Some(reason) = choice.finish_reason {
        events.push(StreamEvent::MessageDelta {
            stop_reason: Some(reason),
            usage: chunk.usage.map(Usage::from),
        });
    }
    events
}

fn from_openai_response(response: OpenAiResponse) -> LlmResponse {
    let (text, stop_reason) = match response.choices.into_iter().next() {
        Some(choice) => (
            choice.message.content.unwrap_or_default(),
            choice.finish_reason,
        ),
        None => (String::new(), None),
    };

    LlmResponse {
        text,
        model: response.model,
        usage: response.usage.map(Usage::from),
        stop_reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(text: &str) -> LlmRequest {
        LlmRequest {
            messages: vec![ChatMessage::user(text)],
            system: Some("You are helpful".to_string()),
            max_tokens: Some(256),
            ..LlmRequest::default()
        }
    }

    #[test]
    fn builds_request_with_default_model_and_system_first() {
        let provider = OpenAiProvider::new("test-key", None, None);
        let openai_req = provider.build_request(&request("hello"), false);

        assert_eq!(openai_req.model, DEFAULT_MODEL);
        assert_eq!(openai_req.messages[0].role, "system");
        assert_eq!(
            openai_req.messages[0].content.as_deref(),
            Some("You are helpful")
        );
        assert_eq!(openai_req.messages[1].role, "user");

        let json = serde_json::to_value(&openai_req).unwrap();
        assert_eq!(json["max_tokens"], 256);
        assert!(json.get("temperature").is_none());
        assert!(json.get("stream").is_none());
        assert!(json.get("response_format").is_none());
    }

    #[test]
    fn json_mode_and_stream_flags_serialize() {
        let provider = OpenAiProvider::new("k", Some("gpt-4o".into()), None);
        let mut req = request("hi");
        req.json_mode = true;

        let json = serde_json::to_value(provider.build_request(&req, true)).unwrap();
        assert_eq!(json["model"], "gpt-4o");
        assert_eq!(json["stream"], true);
        assert_eq!(json["response_format"]["type"], "json_object");
    }

    #[test]
    fn deserializes_text_response() {
        let json = r#"{
            "choices": [{
                "message": {"role": "assistant", "content": "Hello! How can I help?"},
                "finish_reason": "stop"
            }],
            "model": "gpt-4o-mini",
            "usage": {"prompt_tokens": 10, "completion_tokens": 20}
        }"#;

        let response = from_openai_response(serde_json::from_str(json).unwrap());
        assert_eq!(response.text, "Hello! How can I help?");
        assert_eq!(response.stop_reason.as_deref(), Some("stop"));
        assert_eq!(
            response.usage,
            Some(Usage {
                input_tokens: 10,
                output_tokens: 20
            })
        );
    }

    #[test]
    fn endpoint_strips_trailing_slash() {
        let provider =
            OpenAiProvider::new("key", None, Some("https://api.example.com/".to_string()));
        assert_eq!(
            provider.endpoint(),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn parses_text_and_finish_in_one_chunk() {
        let data = r#"{"id":"c","object":"chat.completion.chunk","choices":[{"index":0,"delta":{"content":"Bye"},"finish_reason":"stop"}]}"#;
        let events = parse_stream_chunk(data);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::TextDelta("Bye".into()));
        assert!(matches!(
            &events[1],
            StreamEvent::MessageDelta { stop_reason: Some(r), .. } if r == "stop"
        ));
    }

    #[test]
    fn malformed_chunks_yield_nothing() {
        assert!(parse_stream_chunk("[DONE]").is_empty());
        assert!(parse_stream_chunk(r#"{"choices":[]}"#).is_empty());
    }

    #[tokio::test]
    async fn sse_stream_reassembles_split_events() {
        let parts = [
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
            "\ndata: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        ];
        let chunks = futures::stream::iter(
            parts
                .iter()
                .map(|p| Ok::<_, reqwest::Error>(bytes::Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        );

        let events: Vec<StreamEvent> = sse_events(chunks)
            .map(|e| e.unwrap())
            .collect()
            .await;

        assert_eq!(events[0], StreamEvent::TextDelta("Hel".into()));
        assert_eq!(events[1], StreamEvent::TextDelta("lo".into()));
        assert!(matches!(events[2], StreamEvent::MessageDelta { .. }));
        assert_eq!(events[3], StreamEvent::MessageStop);
        assert_eq!(events.len(), 4);
    }

    fn byte_chunks(
        parts: Vec<Vec<u8>>,
    ) -> impl Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>> + Send + Unpin {
        futures::stream::iter(
            parts
                .into_iter()
                .map(|p| Ok::<_, reqwest::Error>(bytes::Bytes::from(p)))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn sse_stream_keeps_characters_split_across_chunks() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"¿Hola? 👋\"}}]}\r\n\r\n".as_bytes();
        let inverted_question = body.iter().position(|b| *b == 0xC2).unwrap();
        let wave = body.iter().position(|b| *b == 0xF0).unwrap();
        let parts = vec![
            body[..inverted_question + 1].to_vec(),
            body[inverted_question + 1..wave + 2].to_vec(),
            body[wave + 2..].to_vec(),
        ];

        let events: Vec<StreamEvent> = sse_events(byte_chunks(parts))
            .map(|e| e.unwrap())
            .collect()
            .await;

        assert_eq!(events, vec![StreamEvent::TextDelta("¿Hola? 👋".into())]);
    }

    #[tokio::test]
    async fn sse_stream_flushes_a_trailing_event() {
        let parts = vec![
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Tap \"}}]}\n\n".to_vec(),
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Send.\"}}]}\n".to_vec(),
        ];

        let events: Vec<StreamEvent> = sse_events(byte_chunks(parts))
            .map(|e| e.unwrap())
            .collect()
            .await;

        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta("Tap ".into()),
                StreamEvent::TextDelta("Send.".into()),
            ]
        );
    }

    #[tokio::test]
    async fn completes_against_mock_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({ "max_tokens": 256 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "Tap Send."}, "finish_reason": "stop"}],
                "model": "gpt-4o-mini"
            })))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new("test-key", None, Some(server.uri()));
        let response = provider.complete(&request("how?")).await.unwrap();
        assert_eq!(response.text, "Tap Send.");
    }

    #[tokio::test]
    async fn api_errors_carry_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new("test-key", None, Some(server.uri()));
        let err = provider.complete(&request("x")).await.unwrap_err().to_string();
        assert!(err.contains("429"));
        assert!(err.contains("rate limited"));
        assert!(!provider.health_check().await.unwrap());
    }
}
