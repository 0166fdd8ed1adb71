use std::sync::Arc;

use celia_channels::OnMessageFn;
use celia_common::{InboundMessage, OutboundMessage, Result};
use tokio::sync::mpsc;
use tracing::{info, instrument};

use crate::state::{AppState, SharedState};

/// The callback connectors invoke for every inbound message.
pub fn build_message_handler(state: SharedState) -> OnMessageFn {
    Arc::new(
        move |msg: InboundMessage, delta_tx: Option<mpsc::Sender<String>>| {
            let state = Arc::clone(&state);
            Box::pin(async move { handle_message(&state, msg, delta_tx).await })
        },
    )
}

/// Answer one inbound message.
///
/// Turns of one session run one at a time, so each sees the previous
/// exchange and history stays in arrival order. With a delta sender the reply is streamed and returned as plain text.
/// Without one the complete reply goes through the enhancer, if any.
#[instrument(skip_all, fields(session = %msg.session_id))]
pub async fn handle_message(
    state: &AppState,
    msg: InboundMessage,
    delta_tx: Option<mpsc::Sender<String>>,
) -> Result<OutboundMessage> {
    let turn_lock = state.turn_lock(&msg);
    let _turn = turn_lock.lock().await;

    if let Some(cmd) = msg.command() {
        return Ok(handle_command(state, cmd, &msg));
    }

    let history = state.touch_session(&msg);
    let session_id = msg.session_id.as_str();

    let (reply_text, reply) = match delta_tx {
        Some(tx) => {
            let text = state
                .assistant
                .process_message_streaming(session_id, &msg.text, &history, tx)
                .await?;
            let reply = OutboundMessage::plain(text.clone());
            (text, reply)
        }
        None => {
            let text = state
                .assistant
                .process_message(session_id, &msg.text, &history)
                .await?;
            let reply = match &state.enhancer {
                Some(enhancer) => enhancer.enhance(&msg.text, &text).await,
                None => OutboundMessage::plain(text.clone()),
            };
            (text, reply)
        }
    };

    state.record_turn(&msg.session_id, &msg.text, &reply_text);
    Ok(reply)
}

fn handle_command(state: &AppState, cmd: &str, msg: &InboundMessage) -> OutboundMessage {
    let name = state.assistant.name();
    match cmd {
        "start" => {
            state.touch_session(msg);
            info!("{} started a chat ({})", msg.user_name, msg.session_id);
            OutboundMessage::plain(format!(
                "Hi {}! I'm {name}. Ask me anything about our service.\n\n\
                 Commands:\n\
                 /help - show this help\n\
                 /clear - reset conversation history",
                msg.user_name
            ))
        }
        "help" => OutboundMessage::plain(format!(
            "{name} commands:\n\
             /help - show this help\n\
             /clear - reset conversation history"
        )),
        "clear" => {
            state.clear_history(&msg.session_id);
            OutboundMessage::plain("Conversation history cleared.")
        }
        other => OutboundMessage::plain(format!(
            "Unknown command: /{other}\nUse /help for available commands."
        )),
    }
}
