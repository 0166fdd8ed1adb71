use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChannelId, SessionId, UserId};

/// A user message received by a connector, normalized for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub session_id: SessionId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub user_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl InboundMessage {
    pub fn text(
        session_id: SessionId,
        channel_id: ChannelId,
        user_id: UserId,
        user_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id,
            channel_id,
            user_id,
            user_name: user_name.into(),
            text: text.into(),
            timestamp: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Bot commands start with `/`, e.g. `/start` or `/clear@celia_bot`.
    pub fn command(&self) -> Option<&str> {
        let rest = self.text.trim().strip_prefix('/')?;
        let word = rest.split_whitespace().next()?;
        Some(word.split('@').next().unwrap_or(word))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkButton {
    pub text: String,
    pub url: String,
}

/// A reply produced by the assistant, possibly enhanced with interactive elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundMessage {
    Text { text: String },
    Select { text: String, options: Vec<String> },
    Link { text: String, links: Vec<LinkButton> },
}

impl OutboundMessage {
    pub fn plain(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Text { text } | Self::Select { text, .. } | Self::Link { text, .. } => text,
        }
    }
}
