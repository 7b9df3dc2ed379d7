//! Resilient messaging wrappers for Telegram API operations.
//!
//! Every send and edit goes through [`crate::utils::retry_telegram_operation`],
//! so transient network failures are retried with exponential backoff before
//! they surface to the handlers.

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{ChatId, Message, MessageId, ParseMode};
use tracing::{debug, warn};

/// Telegram caps messages at 4096 characters; stay under it with room for
/// the truncation marker.
const EDIT_TEXT_LIMIT: usize = 4000;

/// Send a message, retrying on transient network failures.
///
/// # Errors
///
/// Returns an error once all retries are exhausted.
pub async fn send_message_resilient(
    bot: &Bot,
    chat_id: ChatId,
    text: impl Into<String>,
    parse_mode: Option<ParseMode>,
) -> Result<Message> {
    let text = text.into();
    crate::utils::retry_telegram_operation(|| async {
        let mut req = bot.send_message(chat_id, text.clone());
        if let Some(pm) = parse_mode {
            req = req.parse_mode(pm);
        }
        req.await
            .map_err(|e| anyhow::anyhow!("Telegram send error: {e}"))
    })
    .await
}

/// Edit a message, retrying on transient network failures.
///
/// # Errors
///
/// Returns an error once all retries are exhausted.
pub async fn edit_message_resilient(
    bot: &Bot,
    chat_id: ChatId,
    msg_id: MessageId,
    text: impl Into<String>,
    parse_mode: Option<ParseMode>,
) -> Result<Message> {
    let text = text.into();
    crate::utils::retry_telegram_operation(|| async {
        let mut req = bot.edit_message_text(chat_id, msg_id, text.clone());
        if let Some(pm) = parse_mode {
            req = req.parse_mode(pm);
        }
        req.await
            .map_err(|e| anyhow::anyhow!("Telegram edit error: {e}"))
    })
    .await
}

/// Edit a message with graceful degradation.
///
/// The text is clamped to the Telegram length limit and sent as HTML.
/// Expected edit failures ("message is not modified", "message to edit
/// not found") are logged and swallowed.
///
/// # Returns
///
/// `true` if the message was edited, `false` if the edit was skipped or
/// failed after retries. Callers that must deliver the text can fall
/// back to sending a fresh message on `false`.
pub async fn edit_message_safe_resilient(
    bot: &Bot,
    chat_id: ChatId,
    msg_id: MessageId,
    text: &str,
) -> bool {
    const ERROR_NOT_MODIFIED: &str = "message is not modified";
    const ERROR_NOT_FOUND: &str = "message to edit not found";

    let clamped = clamp_for_telegram(text);
    match edit_message_resilient(bot, chat_id, msg_id, clamped, Some(ParseMode::Html)).await {
        Ok(_) => true,
        Err(e) => {
            let err_msg = e.to_string();
            if err_msg.contains(ERROR_NOT_MODIFIED) || err_msg.contains(ERROR_NOT_FOUND) {
                debug!("Message update skipped: {err_msg}");
            } else {
                warn!("Failed to edit message after retries: {e}");
            }
            false
        }
    }
}

fn clamp_for_telegram(text: &str) -> String {
    if text.chars().count() <= EDIT_TEXT_LIMIT {
        return text.to_string();
    }
    let truncated = crate::utils::truncate_str(text, EDIT_TEXT_LIMIT);
    format!("{truncated}...\n\n<i>(message truncated)</i>")
}
