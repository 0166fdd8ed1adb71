//! Turning assistant replies into Telegram messages.

use celia_common::OutboundMessage;
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, KeyboardButton, KeyboardMarkup, ReplyMarkup,
};
use tracing::warn;

/// Telegram rejects message texts longer than this.
pub(crate) const MAX_MESSAGE_CHARS: usize = 4096;

const OPTIONS_PER_ROW: usize = 2;

/// Split a reply into sendable pieces, preferring line boundaries.
/// Whitespace-only text yields no pieces.
pub(crate) fn split_message(text: &str, limit: usize) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len > limit && !current.is_empty() {
            parts.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len <= limit {
            current.push_str(line);
            current_len += line_len;
            continue;
        }
        for c in line.chars() {
            if current_len == limit {
                parts.push(std::mem::take(&mut current));
                current_len = 0;
            }
            current.push(c);
            current_len += 1;
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

/// Remove every completed sentence from the front of `buffer`.
///
/// A sentence ends at `.`, `!` or `?` followed by whitespace, or at a newline.
/// The unfinished tail stays in the buffer.
pub(crate) fn drain_sentences(buffer: &mut String) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = buffer.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let end = match c {
            '\n' => Some(i + 1),
            '.' | '!' | '?' => match chars.peek() {
                Some((j, next)) if next.is_whitespace() => Some(*j),
                _ => None,
            },
            _ => None,
        };
        if let Some(end) = end {
            let sentence = buffer[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            start = end;
        }
    }

    buffer.drain(..start);
    sentences
}

/// Reply keyboard for `Select`, URL buttons for `Link`, nothing for plain text.
pub(crate) fn reply_markup(message: &OutboundMessage) -> Option<ReplyMarkup> {
    match message {
        OutboundMessage::Text { .. } => None,
        OutboundMessage::Select { options, .. } => {
            if options.is_empty() {
                return None;
            }
            let rows = options.chunks(OPTIONS_PER_ROW).map(|row| {
                row.iter()
                    .map(|option| KeyboardButton::new(option.clone()))
                    .collect::<Vec<_>>()
            });
            Some(ReplyMarkup::Keyboard(KeyboardMarkup::new(rows)))
        }
        OutboundMessage::Link { links, .. } => {
            let rows: Vec<Vec<InlineKeyboardButton>> = links
                .iter()
                .filter_map(|link| match url::Url::parse(&link.url) {
                    Ok(url) => Some(vec![InlineKeyboardButton::url(link.text.clone(), url)]),
                    Err(e) => {
                        warn!("telegram: dropping link button {:?}: {e}", link.url);
                        None
                    }
                })
                .collect();
            if rows.is_empty() {
                return None;
            }
            Some(ReplyMarkup::InlineKeyboard(InlineKeyboardMarkup::new(rows)))
        }
    }
}
