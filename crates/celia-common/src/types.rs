use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Conversation key. One per external chat, e.g. `telegram-12345`.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(String);

#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct UserId(String);

/// Connector name a message arrived through (e.g. "telegram").
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChannelId(String);

macro_rules! impl_id_type {
    ($t:ty) => {
        impl $t {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $t {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $t {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

impl_id_type!(SessionId);
impl_id_type!(UserId);
impl_id_type!(ChannelId);

impl SessionId {
    /// Session key for a chat on a given connector.
    pub fn for_chat(channel: &ChannelId, chat_id: impl fmt::Display) -> Self {
        Self(format!("{channel}-{chat_id}"))
    }
}
