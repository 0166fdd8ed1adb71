mod render;
mod webhook;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::routing::post;
use celia_common::{Error, OutboundMessage, Result, mask_secret};
use celia_config::StreamMode;
use teloxide::prelude::*;
use tracing::{info, warn};

use crate::traits::{Connector, ConnectorStatus, OnMessageFn};
use webhook::WebhookState;

pub(crate) const CHANNEL_NAME: &str = "telegram";

/// Route Telegram posts updates to, relative to the gateway's public URL.
pub const WEBHOOK_PATH: &str = "/telegram/webhook";

/// Telegram bot driven by webhook updates delivered to the gateway.
pub struct TelegramConnector {
    bot: Bot,
    stream_mode: StreamMode,
    secret_token: Option<String>,
    status: Mutex<ConnectorStatus>,
}

impl TelegramConnector {
    pub fn new(token: &str, stream_mode: StreamMode, secret_token: Option<String>) -> Self {
        info!(
            "telegram connector configured (token {}, stream mode {:?})",
            mask_secret(token),
            stream_mode
        );
        Self {
            bot: Bot::new(token),
            stream_mode,
            secret_token: secret_token.filter(|s| !s.is_empty()),
            status: Mutex::new(ConnectorStatus::Disconnected),
        }
    }

    /// Point the bot at a different Bot API server (a local one, or a test double).
    pub fn with_api_url(mut self, url: url::Url) -> Self {
        self.bot = self.bot.set_api_url(url);
        self
    }

    pub fn stream_mode(&self) -> StreamMode {
        self.stream_mode
    }

    fn set_status(&self, status: ConnectorStatus) {
        let mut current = self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = status;
    }

    async fn register_webhook(&self, webhook_url: &str) -> Result<()> {
        let me = self
            .bot
            .get_me()
            .await
            .map_err(|e| Error::Channel(format!("telegram get_me failed: {e}")))?;

        let url = webhook_endpoint(webhook_url)?;
        let mut request = self.bot.set_webhook(url.clone());
        if let Some(secret) = &self.secret_token {
            request = request.secret_token(secret.clone());
        }
        request
            .await
            .map_err(|e| Error::Channel(format!("telegram set_webhook failed: {e}")))?;

        info!("telegram bot @{} receiving updates at {}", me.username(), url);
        Ok(())
    }
}

/// Full webhook URL for a gateway reachable at `base`.
pub fn webhook_endpoint(base: &str) -> Result<url::Url> {
    let base = base.trim().trim_end_matches('/');
    url::Url::parse(&format!("{base}{WEBHOOK_PATH}"))
        .map_err(|e| Error::Config(format!("invalid WEBHOOK_URL '{base}': {e}")))
}

/// Sender details of a message the bot should answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MessageInfo {
    pub chat_id: i64,
    pub user_id: String,
    pub user_name: String,
}

/// `None` for messages the bot must not answer: other bots and posts
/// without a sender (channel posts).
pub(crate) fn extract_message_info(msg: &teloxide::types::Message) -> Option<MessageInfo> {
    let user = msg.from.as_ref()?;

    // "Group Anonymous Bot", the sender shown for anonymous group admins.
    const ANONYMOUS_ADMIN_ID: u64 = 1087968824;

    if user.is_bot && user.id.0 != ANONYMOUS_ADMIN_ID {
        return None;
    }

    Some(MessageInfo {
        chat_id: msg.chat.id.0,
        user_id: user.id.0.to_string(),
        user_name: user.first_name.clone(),
    })
}

#[async_trait]
impl Connector for TelegramConnector {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    fn display_name(&self) -> &str {
        "Telegram"
    }

    fn router(&self, on_message: OnMessageFn) -> Router {
        let state = Arc::new(WebhookState {
            bot: self.bot.clone(),
            secret_token: self.secret_token.clone(),
            stream_mode: self.stream_mode,
            on_message,
        });
        Router::new()
            .route(WEBHOOK_PATH, post(webhook::telegram_webhook))
            .with_state(state)
    }

    async fn startup(&self, webhook_url: &str) -> Result<()> {
        self.set_status(ConnectorStatus::Connecting);
        match self.register_webhook(webhook_url).await {
            Ok(()) => {
                self.set_status(ConnectorStatus::Connected);
                Ok(())
            }
            Err(e) => {
                self.set_status(ConnectorStatus::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.set_status(ConnectorStatus::Disconnected);
        self.bot
            .delete_webhook()
            .await
            .map_err(|e| Error::Channel(format!("telegram delete_webhook failed: {e}")))?;
        info!("telegram webhook removed");
        Ok(())
    }

    async fn send_message(&self, chat_id: &str, message: &OutboundMessage) -> Result<()> {
        let chat_id: i64 = chat_id
            .parse()
            .map_err(|_| Error::Channel(format!("invalid telegram chat id '{chat_id}'")))?;
        webhook::send_outbound(&self.bot, ChatId(chat_id), message).await
    }

    fn status(&self) -> ConnectorStatus {
        match self.status.lock() {
            Ok(status) => status.clone(),
            Err(poisoned) => {
                warn!("telegram status lock poisoned");
                poisoned.into_inner().clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::ServiceExt;
    use wiremock::matchers::{body_string_contains, method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn parse(json: &str) -> teloxide::types::Message {
        serde_json::from_str(json).expect("failed to parse json")
    }

    fn update_json(from: &str, text: &str) -> String {
        format!(
            r#"{{
                "update_id": 1,
                "message": {{
                    "message_id": 7,
                    "date": 1620000000,
                    "chat": {{"id": 42, "type": "private", "first_name": "Alice"}},
                    "from": {from},
                    "text": "{text}"
                }}
            }}"#
        )
    }

    const ALICE: &str = r#"{"id": 111, "is_bot": false, "first_name": "Alice"}"#;

    fn echo_handler(seen: mpsc::UnboundedSender<celia_common::InboundMessage>) -> OnMessageFn {
        Arc::new(move |msg, _delta_tx| {
            let seen = seen.clone();
            Box::pin(async move {
                let reply = format!("echo: {}", msg.text);
                let _ = seen.send(msg);
                Ok(OutboundMessage::Select {
                    text: reply,
                    options: vec!["Yes".into(), "No".into()],
                })
            })
        })
    }

    fn webhook_request(body: String, secret: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(WEBHOOK_PATH)
            .header("content-type", "application/json");
        if let Some(secret) = secret {
            builder = builder.header(webhook::SECRET_HEADER, secret);
        }
        builder.body(Body::from(body)).unwrap()
    }

    #[test]
    fn connector_identity() {
        let connector = TelegramConnector::new("123:fake-token", StreamMode::Full, None);
        assert_eq!(connector.name(), "telegram");
        assert_eq!(connector.display_name(), "Telegram");
        assert_eq!(connector.status(), ConnectorStatus::Disconnected);
    }

    #[test]
    fn webhook_endpoint_appends_route() {
        let url = webhook_endpoint("https://abc.ngrok.app/").unwrap();
        assert_eq!(url.as_str(), "https://abc.ngrok.app/telegram/webhook");
        assert!(webhook_endpoint("not a url").is_err());
    }

    #[test]
    fn test_extract_message_info_private() {
        let msg = parse(
            r#"{
                "message_id": 1,
                "date": 1620000000,
                "chat": {"id": 12345, "type": "private", "first_name": "Alice"},
                "from": {"id": 111, "is_bot": false, "first_name": "Alice", "username": "alice"},
                "text": "hello"
            }"#,
        );
        let info = extract_message_info(&msg).expect("should extract info");
        assert_eq!(
            info,
            MessageInfo {
                chat_id: 12345,
                user_id: "111".into(),
                user_name: "Alice".into(),
            }
        );
    }

    #[test]
    fn test_extract_message_info_group() {
        let msg = parse(
            r#"{
                "message_id": 2,
                "date": 1620000000,
                "chat": {"id": -987654321, "type": "supergroup", "title": "Remit Users"},
                "from": {"id": 222, "is_bot": false, "first_name": "Bob"},
                "text": "what are the fees?"
            }"#,
        );
        let info = extract_message_info(&msg).expect("should extract info");
        assert_eq!(info.chat_id, -987654321);
        assert_eq!(info.user_id, "222");
        assert_eq!(info.user_name, "Bob");
    }

    #[test]
    fn test_extract_message_info_bot_ignored() {
        let msg = parse(
            r#"{
                "message_id": 3,
                "date": 1620000000,
                "chat": {"id": 12345, "type": "private"},
                "from": {"id": 333, "is_bot": true, "first_name": "SomeBot"},
                "text": "I am a bot"
            }"#,
        );
        assert!(extract_message_info(&msg).is_none(), "should ignore bot messages");
    }

    #[test]
    fn test_extract_message_info_anonymous_admin_allowed() {
        let msg = parse(
            r#"{
                "message_id": 5,
                "date": 1620000000,
                "chat": {"id": -987654321, "type": "supergroup", "title": "Remit Users"},
                "from": {
                    "id": 1087968824,
                    "is_bot": true,
                    "first_name": "Group Anonymous Bot",
                    "username": "GroupAnonymousBot"
                },
                "sender_chat": {"id": -987654321, "type": "supergroup", "title": "Remit Users"},
                "text": "admin question"
            }"#,
        );
        let info = extract_message_info(&msg).expect("should allow anonymous admin");
        assert_eq!(info.chat_id, -987654321);
        assert_eq!(info.user_id, "1087968824");
        assert_eq!(info.user_name, "Group Anonymous Bot");
    }

    #[test]
    fn test_extract_message_info_channel_post_ignored() {
        let msg = parse(
            r#"{
                "message_id": 4,
                "date": 1620000000,
                "chat": {"id": -1001234567890, "type": "channel", "title": "News"},
                "text": "channel post"
            }"#,
        );
        assert!(
            extract_message_info(&msg).is_none(),
            "should ignore messages without sender"
        );
    }

    #[tokio::test]
    async fn webhook_rejects_wrong_secret() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connector =
            TelegramConnector::new("123:fake-token", StreamMode::Full, Some("s3cret".into()));
        let app = connector.router(echo_handler(tx));

        let response = app
            .clone()
            .oneshot(webhook_request(update_json(ALICE, "hi"), Some("wrong")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(webhook_request(update_json(ALICE, "hi"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn webhook_acknowledges_updates_it_ignores() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connector = TelegramConnector::new("123:fake-token", StreamMode::Full, None);
        let app = connector.router(echo_handler(tx));

        let bot_sender = r#"{"id": 333, "is_bot": true, "first_name": "SomeBot"}"#;
        for body in [
            "not json".to_string(),
            update_json(ALICE, "edited").replace("\"message\"", "\"edited_message\""),
            update_json(bot_sender, "loop?"),
        ] {
            let response = app.clone().oneshot(webhook_request(body, None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "handler must not run for ignored updates");
    }

    #[tokio::test]
    async fn message_is_answered_through_the_bot_api() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex("(?i)/bot[^/]+/sendchataction$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true,
                "result": true
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex("(?i)/bot[^/]+/sendmessage$"))
            .and(body_string_contains("echo: what are the fees?"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true,
                "result": {
                    "message_id": 8,
                    "date": 1620000001,
                    "chat": {"id": 42, "type": "private", "first_name": "Alice"},
                    "text": "echo: what are the fees?"
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let connector =
            TelegramConnector::new("123:fake-token", StreamMode::Full, Some("s3cret".into()))
                .with_api_url(url::Url::parse(&server.uri()).unwrap());
        let app = connector.router(echo_handler(tx));

        let response = app
            .oneshot(webhook_request(
                update_json(ALICE, "what are the fees?"),
                Some("s3cret"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let inbound = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.session_id.as_str(), "telegram-42");
        assert_eq!(inbound.user_id.as_str(), "111");
        assert_eq!(inbound.metadata["telegram_chat_id"], 42);

        // The reply is sent after the handler returns; wait for it to land.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let requests = server.received_requests().await.unwrap_or_default();
            let sent = requests
                .iter()
                .find(|r| r.url.path().to_lowercase().ends_with("/sendmessage"));
            if let Some(sent) = sent {
                let body: serde_json::Value = serde_json::from_slice(&sent.body).unwrap();
                assert_eq!(body["chat_id"], 42);
                assert_eq!(body["reply_markup"]["keyboard"][0][0]["text"], "Yes");
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "reply never sent");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
