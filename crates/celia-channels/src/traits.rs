use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use celia_common::{InboundMessage, OutboundMessage, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Callback invoked for every inbound user message.
///
/// When the delta sender is `Some`, the callback streams reply text through
/// it as it is generated and still returns the complete reply at the end.
pub type OnMessageFn = Arc<
    dyn Fn(
            InboundMessage,
            Option<mpsc::Sender<String>>,
        ) -> Pin<Box<dyn Future<Output = Result<OutboundMessage>> + Send>>
        + Send
        + Sync,
>;

/// A messaging platform that delivers user messages to the gateway over HTTP
/// webhooks and sends replies back.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Unique identifier (e.g. "telegram").
    fn name(&self) -> &str;

    fn display_name(&self) -> &str;

    /// Webhook routes, mounted by the gateway on its own listener.
    fn router(&self, on_message: OnMessageFn) -> axum::Router;

    /// Register the public webhook URL with the platform.
    async fn startup(&self, webhook_url: &str) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;

    async fn send_message(&self, chat_id: &str, message: &OutboundMessage) -> Result<()>;

    fn status(&self) -> ConnectorStatus;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "state", content = "detail")]
pub enum ConnectorStatus {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}
