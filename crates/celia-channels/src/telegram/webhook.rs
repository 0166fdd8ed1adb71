use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use celia_common::{ChannelId, Error, InboundMessage, OutboundMessage, Result, SessionId, UserId};
use celia_config::StreamMode;
use subtle::ConstantTimeEq;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, MessageId, Update, UpdateKind};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::render::{MAX_MESSAGE_CHARS, drain_sentences, reply_markup, split_message};
use super::{CHANNEL_NAME, MessageInfo, extract_message_info};
use crate::traits::OnMessageFn;

pub(crate) const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

const TYPING_INTERVAL: Duration = Duration::from_secs(4);
const EDIT_INTERVAL: Duration = Duration::from_secs(1);
const ERROR_REPLY: &str = "Sorry, an error occurred. Please try again.";

pub(crate) struct WebhookState {
    pub bot: Bot,
    pub secret_token: Option<String>,
    pub stream_mode: StreamMode,
    pub on_message: OnMessageFn,
}

/// POST handler for Telegram updates. Answers right away; the reply is
/// produced in a spawned task so Telegram never retries a slow update.
pub(crate) async fn telegram_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if !secret_matches(state.secret_token.as_deref(), &headers) {
        warn!("telegram: webhook call rejected, secret token mismatch");
        return StatusCode::UNAUTHORIZED;
    }

    let update: Update = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            warn!("telegram: ignoring malformed update: {e}");
            return StatusCode::OK;
        }
    };

    let UpdateKind::Message(msg) = update.kind else {
        trace!("telegram: ignoring non-message update");
        return StatusCode::OK;
    };

    let Some(info) = extract_message_info(&msg) else {
        return StatusCode::OK;
    };
    let Some(text) = msg.text().map(str::to_string) else {
        debug!("telegram: ignoring non-text message in chat {}", info.chat_id);
        return StatusCode::OK;
    };

    tokio::spawn(handle_message(state, info, text));
    StatusCode::OK
}

fn secret_matches(expected: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    match headers.get(SECRET_HEADER) {
        Some(provided) => provided.as_bytes().ct_eq(expected.as_bytes()).into(),
        None => false,
    }
}

async fn handle_message(state: Arc<WebhookState>, info: MessageInfo, text: String) {
    let chat_id = ChatId(info.chat_id);
    let channel_id = ChannelId::from(CHANNEL_NAME);

    info!(
        "telegram message from {} [uid={}] (chat {}): {} chars",
        info.user_name,
        info.user_id,
        chat_id,
        text.len()
    );

    let inbound = InboundMessage::text(
        SessionId::for_chat(&channel_id, info.chat_id),
        channel_id,
        UserId::from(info.user_id),
        info.user_name,
        text,
    )
    .with_metadata(serde_json::json!({ "telegram_chat_id": info.chat_id }));

    send_typing(&state.bot, chat_id).await;

    let result = match state.stream_mode {
        StreamMode::Full => deliver_full(&state, chat_id, inbound).await,
        StreamMode::Sentence => deliver_sentences(&state, chat_id, inbound).await,
        StreamMode::Direct => deliver_direct(&state, chat_id, inbound).await,
    };

    if let Err(e) = result {
        warn!("telegram: reply to chat {chat_id} failed: {e}");
        if let Err(e) = state.bot.send_message(chat_id, ERROR_REPLY).await {
            warn!("telegram: could not report error to chat {chat_id}: {e}");
        }
    }
}

/// Wait for the complete reply, then send it with its keyboard.
async fn deliver_full(state: &WebhookState, chat_id: ChatId, inbound: InboundMessage) -> Result<()> {
    let reply = with_typing(&state.bot, chat_id, (state.on_message)(inbound, None)).await?;
    send_outbound(&state.bot, chat_id, &reply).await
}

/// Send each sentence as soon as it is complete.
async fn deliver_sentences(
    state: &WebhookState,
    chat_id: ChatId,
    inbound: InboundMessage,
) -> Result<()> {
    let (delta_tx, mut delta_rx) = mpsc::channel::<String>(64);
    let handle = tokio::spawn((state.on_message)(inbound, Some(delta_tx)));

    let mut buffer = String::new();
    let mut streamed = false;
    loop {
        tokio::select! {
            delta = delta_rx.recv() => match delta {
                Some(delta) => {
                    streamed = true;
                    buffer.push_str(&delta);
                    for sentence in drain_sentences(&mut buffer) {
                        send_text(&state.bot, chat_id, &sentence).await?;
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep(TYPING_INTERVAL) => send_typing(&state.bot, chat_id).await,
        }
    }

    let reply = join_handler(handle).await?;
    if !streamed {
        return send_outbound(&state.bot, chat_id, &reply).await;
    }
    if !buffer.trim().is_empty() {
        send_text(&state.bot, chat_id, buffer.trim()).await?;
    }
    Ok(())
}

/// Send one message on the first delta and keep editing it, at most once
/// per [`EDIT_INTERVAL`], until the reply is complete.
async fn deliver_direct(state: &WebhookState, chat_id: ChatId, inbound: InboundMessage) -> Result<()> {
    let bot = &state.bot;
    let (delta_tx, mut delta_rx) = mpsc::channel::<String>(64);
    let handle = tokio::spawn((state.on_message)(inbound, Some(delta_tx)));

    let mut accumulated = String::new();
    let mut shown = String::new();
    let mut msg_id: Option<MessageId> = None;
    let mut last_edit = tokio::time::Instant::now();

    loop {
        tokio::select! {
            delta = delta_rx.recv() => match delta {
                Some(delta) => {
                    accumulated.push_str(&delta);
                    if accumulated.trim().is_empty()
                        || accumulated.chars().count() > MAX_MESSAGE_CHARS
                    {
                        continue;
                    }
                    match msg_id {
                        None => {
                            let sent = bot
                                .send_message(chat_id, &accumulated)
                                .await
                                .map_err(|e| Error::Channel(format!("telegram send failed: {e}")))?;
                            msg_id = Some(sent.id);
                            shown.clone_from(&accumulated);
                            last_edit = tokio::time::Instant::now();
                        }
                        Some(id) if last_edit.elapsed() >= EDIT_INTERVAL => {
                            if let Err(e) = bot.edit_message_text(chat_id, id, &accumulated).await {
                                debug!("telegram: intermediate edit failed: {e}");
                            }
                            shown.clone_from(&accumulated);
                            last_edit = tokio::time::Instant::now();
                        }
                        Some(_) => {}
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep(TYPING_INTERVAL) => send_typing(bot, chat_id).await,
        }
    }

    let reply = join_handler(handle).await?;
    let Some(id) = msg_id else {
        return send_outbound(bot, chat_id, &reply).await;
    };

    let mut parts = split_message(reply.text(), MAX_MESSAGE_CHARS).into_iter();
    if let Some(first) = parts.next()
        && first != shown
    {
        bot.edit_message_text(chat_id, id, &first)
            .await
            .map_err(|e| Error::Channel(format!("telegram edit failed: {e}")))?;
    }
    for part in parts {
        send_text(bot, chat_id, &part).await?;
    }
    Ok(())
}

/// Send a reply, attaching its keyboard to the last piece.
pub(crate) async fn send_outbound(bot: &Bot, chat_id: ChatId, message: &OutboundMessage) -> Result<()> {
    let parts = split_message(message.text(), MAX_MESSAGE_CHARS);
    if parts.is_empty() {
        warn!("telegram: empty reply for chat {chat_id}, nothing sent");
        return Ok(());
    }

    let mut markup = reply_markup(message);
    let last = parts.len() - 1;
    for (i, part) in parts.into_iter().enumerate() {
        let mut request = bot.send_message(chat_id, part);
        if i == last
            && let Some(markup) = markup.take()
        {
            request = request.reply_markup(markup);
        }
        request
            .await
            .map_err(|e| Error::Channel(format!("telegram send failed: {e}")))?;
    }
    Ok(())
}

async fn send_text(bot: &Bot, chat_id: ChatId, text: &str) -> Result<()> {
    bot.send_message(chat_id, text)
        .await
        .map_err(|e| Error::Channel(format!("telegram send failed: {e}")))?;
    Ok(())
}

async fn send_typing(bot: &Bot, chat_id: ChatId) {
    if let Err(e) = bot.send_chat_action(chat_id, ChatAction::Typing).await {
        debug!("telegram: typing indicator failed: {e}");
    }
}

/// Drive `fut` to completion, refreshing the typing indicator while it runs.
async fn with_typing<F: Future>(bot: &Bot, chat_id: ChatId, fut: F) -> F::Output {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return out,
            _ = tokio::time::sleep(TYPING_INTERVAL) => send_typing(bot, chat_id).await,
        }
    }
}

async fn join_handler(handle: tokio::task::JoinHandle<Result<OutboundMessage>>) -> Result<OutboundMessage> {
    handle
        .await
        .map_err(|e| Error::Channel(format!("message handler task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn secret_is_optional() {
        assert!(secret_matches(None, &HeaderMap::new()));
    }

    #[test]
    fn secret_must_match_exactly() {
        let mut headers = HeaderMap::new();
        assert!(!secret_matches(Some("s3cret"), &headers));

        headers.insert(SECRET_HEADER, HeaderValue::from_static("s3cre"));
        assert!(!secret_matches(Some("s3cret"), &headers));

        headers.insert(SECRET_HEADER, HeaderValue::from_static("s3cret"));
        assert!(secret_matches(Some("s3cret"), &headers));
    }
}
