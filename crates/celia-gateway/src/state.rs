use std::sync::Arc;
use std::time::{Duration, Instant};

use celia_agents::{Assistant, ChatMessage, MessageEnhancer};
use celia_channels::ConnectorRegistry;
use celia_common::{ChannelId, InboundMessage, SessionId};
use celia_config::GatewayConfig;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::info;

/// How long an idle chat keeps its history.
pub const SESSION_TTL: Duration = Duration::from_secs(3600); // 1 hour
/// How often the cleanup task runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300); // 5 minutes

/// Shared application state accessible from all request handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub assistant: Arc<Assistant>,
    /// Applied to complete (non-streamed) replies only.
    pub enhancer: Option<Arc<dyn MessageEnhancer>>,
    pub connectors: ConnectorRegistry,
    pub sessions: DashMap<SessionId, SessionState>,
    /// Messages kept per session (user and assistant turns both count).
    pub history_limit: usize,
    pub started_at: DateTime<Utc>,
}

/// Conversation state of one external chat.
pub struct SessionState {
    pub id: SessionId,
    pub channel_id: ChannelId,
    pub user_name: String,
    pub history: Vec<ChatMessage>,
    /// Held for a whole turn so one chat's messages are answered in order.
    pub turn_lock: Arc<Mutex<()>>,
    pub created_at: Instant,
    pub last_active: Instant,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        assistant: Arc<Assistant>,
        enhancer: Option<Arc<dyn MessageEnhancer>>,
    ) -> Self {
        Self {
            config,
            assistant,
            enhancer,
            connectors: ConnectorRegistry::new(),
            sessions: DashMap::new(),
            history_limit: 20,
            started_at: Utc::now(),
        }
    }

    /// Mark the message's session active, creating it on first contact, and
    /// return the history the assistant should see.
    pub fn touch_session(&self, msg: &InboundMessage) -> Vec<ChatMessage> {
        let mut session = self.session_entry(msg);
        session.last_active = Instant::now();
        session.history.clone()
    }

    /// The lock serialising turns of the message's session.
    pub fn turn_lock(&self, msg: &InboundMessage) -> Arc<Mutex<()>> {
        Arc::clone(&self.session_entry(msg).turn_lock)
    }

    fn session_entry(
        &self,
        msg: &InboundMessage,
    ) -> dashmap::mapref::one::RefMut<'_, SessionId, SessionState> {
        self.sessions
            .entry(msg.session_id.clone())
            .or_insert_with(|| {
                let now = Instant::now();
                SessionState {
                    id: msg.session_id.clone(),
                    channel_id: msg.channel_id.clone(),
                    user_name: msg.user_name.clone(),
                    history: Vec::new(),
                    turn_lock: Arc::new(Mutex::new(())),
                    created_at: now,
                    last_active: now,
                }
            })
    }

    pub fn session_history(&self, session_id: &SessionId) -> Vec<ChatMessage> {
        self.sessions
            .get(session_id)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    /// Append a completed exchange, dropping the oldest messages past the limit.
    pub fn record_turn(&self, session_id: &SessionId, user_text: &str, reply: &str) {
        let Some(mut session) = self.sessions.get_mut(session_id) else {
            return;
        };
        session.history.push(ChatMessage::user(user_text));
        session.history.push(ChatMessage::assistant(reply));

        let excess = session.history.len().saturating_sub(self.history_limit);
        if excess > 0 {
            session.history.drain(..excess);
        }
    }

    /// Returns `true` if the session existed.
    pub fn clear_history(&self, session_id: &SessionId) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                session.history.clear();
                session.last_active = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove sessions idle for longer than `ttl`.
    pub fn cleanup_expired_sessions(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| now.duration_since(session.last_active) <= ttl);
        let removed = before.saturating_sub(self.sessions.len());

        if removed > 0 {
            info!("cleaned up {removed} expired sessions");
        }
        removed
    }

    /// Spawn a background task that periodically cleans up expired sessions.
    pub fn spawn_session_cleanup(self: &Arc<Self>) {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                state.cleanup_expired_sessions(SESSION_TTL);
            }
        });
    }
}

pub type SharedState = Arc<AppState>;

#[cfg(test)]
mod tests {
    use super::*;
    use celia_agents::PromptTemplate;
    use celia_common::UserId;

    fn state(history_limit: usize) -> AppState {
        let assistant = Assistant::new("Celia", PromptTemplate::new("You are {name}."));
        let mut state = AppState::new(GatewayConfig::default(), Arc::new(assistant), None);
        state.history_limit = history_limit;
        state
    }

    fn message(chat_id: i64, text: &str) -> InboundMessage {
        let channel = ChannelId::from("telegram");
        InboundMessage::text(
            SessionId::for_chat(&channel, chat_id),
            channel,
            UserId::from("111"),
            "Alice",
            text,
        )
    }

    #[test]
    fn sessions_are_keyed_per_chat() {
        let state = state(20);
        assert!(state.touch_session(&message(1, "hi")).is_empty());
        state.touch_session(&message(1, "again"));
        state.touch_session(&message(2, "hi"));
        assert_eq!(state.sessions.len(), 2);
    }

    #[test]
    fn history_is_capped_at_the_limit() {
        let state = state(4);
        let msg = message(1, "q");
        state.touch_session(&msg);
        for i in 0..3 {
            state.record_turn(&msg.session_id, &format!("q{i}"), &format!("a{i}"));
        }

        let history = state.session_history(&msg.session_id);
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["q1", "a1", "q2", "a2"]);
    }

    #[test]
    fn clear_history_keeps_the_session() {
        let state = state(20);
        let msg = message(1, "q");
        state.touch_session(&msg);
        state.record_turn(&msg.session_id, "q", "a");

        assert!(state.clear_history(&msg.session_id));
        assert!(state.session_history(&msg.session_id).is_empty());
        assert_eq!(state.sessions.len(), 1);
        assert!(!state.clear_history(&SessionId::from("telegram-999")));
    }

    #[test]
    fn turn_lock_is_shared_per_session() {
        let state = state(20);
        let first = state.turn_lock(&message(1, "a"));
        let again = state.turn_lock(&message(1, "b"));
        let other = state.turn_lock(&message(2, "c"));

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn idle_sessions_expire() {
        let state = state(20);
        let msg = message(1, "q");
        state.touch_session(&msg);
        if let Some(mut session) = state.sessions.get_mut(&msg.session_id) {
            session.last_active = Instant::now() - Duration::from_secs(120);
        }
        state.touch_session(&message(2, "fresh"));

        assert_eq!(state.cleanup_expired_sessions(Duration::from_secs(60)), 1);
        assert!(state.sessions.get(&msg.session_id).is_none());
        assert_eq!(state.sessions.len(), 1);
    }
}
