//! Telegram handlers for the provisioning dialogue.
//!
//! The dialogue has two steps: the user picks a username (checked for
//! uniqueness on the panel side), then a password. Provisioning itself
//! lives in [`complete_provisioning`] so it can be driven without a bot.

use crate::api::{ApiError, IchancyClient};
use crate::bot::resilient::{edit_message_safe_resilient, send_message_resilient};
use crate::bot::state::State;
use crate::config::PLAYER_LOGIN_URL;
use crate::storage::{PlayerRecord, PlayerStorage, StorageError};
use crate::utils::{
    check_password, panel_notification, random_suffix, sanitize_username, PasswordIssue,
    MIN_PASSWORD_LEN, MIN_USERNAME_LEN,
};
use anyhow::{anyhow, Result};
use chrono::Utc;
use std::sync::Arc;
use teloxide::{
    dispatching::dialogue::InMemStorage,
    prelude::*,
    types::{ChatId, MessageId, ParseMode},
    utils::command::BotCommands,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Every provisioned username starts with this prefix.
const USERNAME_PREFIX: &str = "ZEUS_";
/// How many usernames to probe before giving up: the bare prefixed name
/// plus randomly suffixed variants.
const USERNAME_CANDIDATES: usize = 6;
const USERNAME_SUFFIX_LEN: usize = 3;

// Helper function to get user name from Message
fn get_user_name(msg: &Message) -> String {
    if let Some(ref user) = msg.from {
        if let Some(ref username) = user.username {
            return username.clone();
        }
        // first_name is String, not Option<String>
        if !user.first_name.is_empty() {
            return user.first_name.clone();
        }
    }
    "Unknown".to_string()
}

/// Safe extraction of user ID from a message.
/// Returns 0 if the user information is missing.
#[must_use]
pub fn get_user_id_safe(msg: &Message) -> i64 {
    msg.from.as_ref().map_or(0, |u| u.id.0.cast_signed())
}

/// Supported commands for the bot
#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Supported commands:")]
pub enum Command {
    /// Start the bot and begin provisioning
    #[command(description = "Start and create a player account.")]
    Start,
    /// Begin provisioning
    #[command(description = "Create a player account.")]
    Create,
    /// Show the balance of the provisioned account
    #[command(description = "Show your player balance.")]
    Balance,
    /// Cancel the current operation
    #[command(description = "Cancel the current operation.")]
    Cancel,
    /// Show available commands
    #[command(description = "Show this help.")]
    Help,
}

/// Why provisioning did not produce an account
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// The reserved username was taken between the two dialogue steps
    #[error("username is already taken")]
    UsernameTaken,
    /// The panel refused the registration
    #[error("panel rejected the registration: {0}")]
    Rejected(String),
    /// A panel call failed outright
    #[error(transparent)]
    Api(#[from] ApiError),
    /// The provisioned identity could not be persisted
    #[error(transparent)]
    Store(#[from] StorageError),
}

/// A provisioned account, ready to be rendered back to the user
#[derive(Debug, Clone)]
pub struct ProvisionedAccount {
    /// Panel login
    pub username: String,
    /// Panel password
    pub password: String,
    /// Registration email
    pub email: String,
    /// Resolved numeric player id
    pub player_id: String,
}

/// Probes the panel for a free username derived from the sanitized base:
/// the bare prefixed form first, then randomly suffixed variants.
/// Returns `None` when every candidate is taken.
///
/// # Errors
///
/// Returns an error if a uniqueness probe fails even after the session
/// has been re-established.
pub async fn resolve_free_username(
    client: &IchancyClient,
    sanitized: &str,
) -> Result<Option<String>, ApiError> {
    let base = format!("{USERNAME_PREFIX}{sanitized}");
    for attempt in 0..USERNAME_CANDIDATES {
        let candidate = if attempt == 0 {
            base.clone()
        } else {
            format!("{base}_{}", random_suffix(USERNAME_SUFFIX_LEN))
        };
        if !client.check_player_exists(&candidate).await? {
            return Ok(Some(candidate));
        }
        debug!("Username candidate {candidate} is taken.");
    }
    Ok(None)
}

/// Runs the remote side of provisioning: a final uniqueness check, the
/// registration call, and the player-store write.
///
/// # Errors
///
/// Returns [`ProvisionError::UsernameTaken`] if the username got taken
/// since it was reserved, [`ProvisionError::Rejected`] if the panel did
/// not confirm the registration, and transport or storage errors
/// otherwise.
pub async fn complete_provisioning(
    client: &IchancyClient,
    store: &dyn PlayerStorage,
    telegram_id: i64,
    username: &str,
    password: &str,
) -> Result<ProvisionedAccount, ProvisionError> {
    if client.check_player_exists(username).await? {
        return Err(ProvisionError::UsernameTaken);
    }

    let created = client
        .create_player_with_credentials(username, password)
        .await?;
    let player_id = match created.player_id {
        Some(id) if created.reply.is_success() => id,
        _ => {
            let reason = created
                .reply
                .json()
                .as_ref()
                .and_then(panel_notification)
                .unwrap_or_else(|| "registration was not confirmed".to_string());
            return Err(ProvisionError::Rejected(reason));
        }
    };

    let record = PlayerRecord {
        player_id: player_id.clone(),
        username: created.login.clone(),
        email: created.email.clone(),
        password: created.password.clone(),
        created_at: Utc::now(),
    };
    store.update_player_info(telegram_id, &record).await?;

    Ok(ProvisionedAccount {
        username: created.login,
        password: created.password,
        email: created.email,
        player_id,
    })
}

/// Renders the HTML confirmation card for a provisioned account.
#[must_use]
pub fn render_confirmation(account: &ProvisionedAccount) -> String {
    format!(
        "✅ <b>Your account is ready!</b>\n\n\
         👤 Username: <code>{}</code>\n\
         🔑 Password: <code>{}</code>\n\
         📧 Email: <code>{}</code>\n\
         🆔 Player ID: <code>{}</code>\n\n\
         🌐 Log in at {PLAYER_LOGIN_URL}\n\n\
         ⚠️ <b>Save these credentials now.</b> They cannot be recovered later.",
        html_escape::encode_text(&account.username),
        html_escape::encode_text(&account.password),
        html_escape::encode_text(&account.email),
        html_escape::encode_text(&account.player_id),
    )
}

// Replaces the progress message with the outcome, falling back to a
// fresh message when the edit is rejected.
async fn deliver(bot: &Bot, chat_id: ChatId, progress_id: MessageId, text: &str) -> Result<()> {
    if !edit_message_safe_resilient(bot, chat_id, progress_id, text).await {
        send_message_resilient(bot, chat_id, text, Some(ParseMode::Html)).await?;
    }
    Ok(())
}

/// Start handler: greets the user and asks for a username.
///
/// # Errors
///
/// Returns an error if the dialogue state cannot be updated or the
/// prompt cannot be sent.
pub async fn start(
    bot: Bot,
    msg: Message,
    dialogue: Dialogue<State, InMemStorage<State>>,
) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    let user_name = get_user_name(&msg);

    info!("User {user_id} ({user_name}) started account provisioning.");

    dialogue
        .update(State::AwaitingUsername)
        .await
        .map_err(|e| anyhow!(e.to_string()))?;

    let text = "👋 <b>Welcome!</b>\n\n\
         I create Ichancy player accounts.\n\n\
         Send me the username you want. At least 3 characters; letters, digits, \
         <code>_</code> and <code>-</code> are kept, anything else is dropped.";
    send_message_resilient(&bot, msg.chat.id, text, Some(ParseMode::Html)).await?;
    Ok(())
}

/// Username step: sanitizes the input and reserves a free name on the panel.
///
/// # Errors
///
/// Returns an error if the dialogue state cannot be updated or a reply
/// cannot be sent.
pub async fn receive_username(
    bot: Bot,
    msg: Message,
    dialogue: Dialogue<State, InMemStorage<State>>,
    client: Arc<IchancyClient>,
) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    let sanitized = sanitize_username(msg.text().unwrap_or(""));

    if sanitized.chars().count() < MIN_USERNAME_LEN {
        let text = format!(
            "The username must keep at least {MIN_USERNAME_LEN} characters after \
             sanitizing (letters, digits, <code>_</code>, <code>-</code>). Try another one:"
        );
        send_message_resilient(&bot, msg.chat.id, text, Some(ParseMode::Html)).await?;
        return Ok(());
    }

    match resolve_free_username(&client, &sanitized).await {
        Ok(Some(username)) => {
            info!("User {user_id} reserved username {username}.");
            dialogue
                .update(State::AwaitingPassword {
                    username: username.clone(),
                })
                .await
                .map_err(|e| anyhow!(e.to_string()))?;
            let text = format!(
                "Username <code>{}</code> is free.\n\n\
                 Now send a password: at least {MIN_PASSWORD_LEN} characters with an \
                 uppercase letter, a lowercase letter and a digit.",
                html_escape::encode_text(&username)
            );
            send_message_resilient(&bot, msg.chat.id, text, Some(ParseMode::Html)).await?;
        }
        Ok(None) => {
            send_message_resilient(
                &bot,
                msg.chat.id,
                "😕 Every variant of that username is taken. Send a different one:",
                None,
            )
            .await?;
        }
        Err(e) => {
            error!("Username probing failed for user {user_id}: {e}");
            send_message_resilient(
                &bot,
                msg.chat.id,
                "⚠️ Could not check that username right now. Send it again in a moment:",
                None,
            )
            .await?;
        }
    }
    Ok(())
}

/// Password step: validates the password and provisions the account.
///
/// # Errors
///
/// Returns an error if the dialogue state cannot be updated or a reply
/// cannot be sent.
pub async fn receive_password(
    bot: Bot,
    msg: Message,
    dialogue: Dialogue<State, InMemStorage<State>>,
    username: String,
    client: Arc<IchancyClient>,
    store: Arc<dyn PlayerStorage>,
) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    let password = msg.text().unwrap_or("").trim().to_string();

    if let Some(issue) = check_password(&password) {
        let text = match issue {
            PasswordIssue::TooShort => format!(
                "The password must be at least {MIN_PASSWORD_LEN} characters long. Try another one:"
            ),
            PasswordIssue::MissingMixedCase => {
                "The password must mix uppercase and lowercase letters. Try another one:"
                    .to_string()
            }
            PasswordIssue::MissingDigit => {
                "The password must contain at least one digit. Try another one:".to_string()
            }
        };
        send_message_resilient(&bot, msg.chat.id, text, None).await?;
        return Ok(());
    }

    let progress =
        send_message_resilient(&bot, msg.chat.id, "⏳ Creating your account...", None).await?;

    match complete_provisioning(&client, store.as_ref(), user_id, &username, &password).await {
        Ok(account) => {
            info!(
                "User {user_id} provisioned player {} ({}).",
                account.player_id, account.username
            );
            dialogue.exit().await.map_err(|e| anyhow!(e.to_string()))?;
            deliver(&bot, msg.chat.id, progress.id, &render_confirmation(&account)).await?;
        }
        Err(ProvisionError::UsernameTaken) => {
            warn!("Username {username} was taken before user {user_id} finished.");
            dialogue
                .update(State::AwaitingUsername)
                .await
                .map_err(|e| anyhow!(e.to_string()))?;
            deliver(
                &bot,
                msg.chat.id,
                progress.id,
                "😕 That username was just taken. Send a different one:",
            )
            .await?;
        }
        Err(ProvisionError::Rejected(reason)) => {
            warn!("Panel rejected registration for user {user_id}: {reason}");
            dialogue.exit().await.map_err(|e| anyhow!(e.to_string()))?;
            let text = format!(
                "❌ The panel rejected the registration: {}.\n\nTry again later with /create.",
                html_escape::encode_text(&reason)
            );
            deliver(&bot, msg.chat.id, progress.id, &text).await?;
        }
        Err(e) => {
            error!("Account provisioning failed for user {user_id}: {e}");
            dialogue.exit().await.map_err(|e| anyhow!(e.to_string()))?;
            deliver(
                &bot,
                msg.chat.id,
                progress.id,
                "❌ Account creation failed. Please try again later with /create.",
            )
            .await?;
        }
    }
    Ok(())
}

/// Balance handler: looks up the stored account and queries its balance.
///
/// # Errors
///
/// Returns an error if a reply cannot be sent.
pub async fn balance(
    bot: Bot,
    msg: Message,
    client: Arc<IchancyClient>,
    store: Arc<dyn PlayerStorage>,
) -> Result<()> {
    let user_id = get_user_id_safe(&msg);

    let record = match store.get_player_info(user_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            send_message_resilient(
                &bot,
                msg.chat.id,
                "You have no account yet. Send /create to provision one.",
                None,
            )
            .await?;
            return Ok(());
        }
        Err(e) => {
            error!("Failed to read the player record for user {user_id}: {e}");
            send_message_resilient(
                &bot,
                msg.chat.id,
                "⚠️ Could not read your account record. Try again later.",
                None,
            )
            .await?;
            return Ok(());
        }
    };

    match client.get_player_balance(&record.player_id).await {
        Ok(amount) => {
            let text = format!(
                "💰 Balance of <code>{}</code>: <b>{amount:.2} NSP</b>",
                html_escape::encode_text(&record.username)
            );
            send_message_resilient(&bot, msg.chat.id, text, Some(ParseMode::Html)).await?;
        }
        Err(e) => {
            error!("Balance lookup failed for user {user_id}: {e}");
            send_message_resilient(
                &bot,
                msg.chat.id,
                "⚠️ Could not fetch your balance. Try again later.",
                None,
            )
            .await?;
        }
    }
    Ok(())
}

/// Cancel handler: drops any in-progress dialogue.
///
/// # Errors
///
/// Returns an error if the dialogue state cannot be cleared or the
/// reply cannot be sent.
pub async fn cancel(
    bot: Bot,
    msg: Message,
    dialogue: Dialogue<State, InMemStorage<State>>,
) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    info!("User {user_id} canceled the current operation.");
    dialogue.exit().await.map_err(|e| anyhow!(e.to_string()))?;
    send_message_resilient(
        &bot,
        msg.chat.id,
        "Operation canceled. Send /create to start again.",
        None,
    )
    .await?;
    Ok(())
}

/// Help handler: lists the supported commands.
///
/// # Errors
///
/// Returns an error if the reply cannot be sent.
pub async fn help(bot: Bot, msg: Message) -> Result<()> {
    send_message_resilient(&bot, msg.chat.id, Command::descriptions().to_string(), None).await?;
    Ok(())
}

/// Fallback for plain text sent outside a dialogue.
///
/// # Errors
///
/// Returns an error if the reply cannot be sent.
pub async fn idle_hint(bot: Bot, msg: Message) -> Result<()> {
    send_message_resilient(
        &bot,
        msg.chat.id,
        "Send /create to provision a player account, or /help for the command list.",
        None,
    )
    .await?;
    Ok(())
}
