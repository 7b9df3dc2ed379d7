//! Shared helpers: credential generation, input validation, response
//! classification and Telegram retry plumbing.
//!
//! Validation patterns use the `lazy-regex` crate so they are checked at
//! compile time and initialized lazily on first use.

// Allow non_std_lazy_statics because the lazy_regex! macro uses once_cell internally
#![allow(clippy::non_std_lazy_statics)]

use anyhow::Result;
use lazy_regex::{lazy_regex, Lazy, Regex};
use rand::Rng;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::warn;

/// Match any character that is not allowed in a player username
static RE_USERNAME_FORBIDDEN: Lazy<Regex> = lazy_regex!(r"[^A-Za-z0-9_-]");

/// Minimum length of a sanitized username
pub const MIN_USERNAME_LEN: usize = 3;
/// Minimum length of a player password
pub const MIN_PASSWORD_LEN: usize = 8;

const LOWER_ALNUM: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const MIXED_ALNUM: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Strips everything but ASCII alphanumerics, `_` and `-` from a raw
/// username, trimming surrounding whitespace first.
///
/// # Examples
///
/// ```
/// use ichancy_agent_rs::utils::sanitize_username;
/// assert_eq!(sanitize_username("  bob the bettor!  "), "bobthebettor");
/// assert_eq!(sanitize_username("a_b-c"), "a_b-c");
/// ```
#[must_use]
pub fn sanitize_username(raw: &str) -> String {
    RE_USERNAME_FORBIDDEN.replace_all(raw.trim(), "").to_string()
}

/// Why a candidate password was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordIssue {
    /// Shorter than [`MIN_PASSWORD_LEN`]
    TooShort,
    /// Missing an uppercase or a lowercase letter
    MissingMixedCase,
    /// Missing a digit
    MissingDigit,
}

/// Checks a candidate password against the panel's rules: minimum length,
/// mixed case, and at least one digit. Returns `None` when it passes.
#[must_use]
pub fn check_password(password: &str) -> Option<PasswordIssue> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Some(PasswordIssue::TooShort);
    }
    let has_upper = password.chars().any(char::is_uppercase);
    let has_lower = password.chars().any(char::is_lowercase);
    if !has_upper || !has_lower {
        return Some(PasswordIssue::MissingMixedCase);
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Some(PasswordIssue::MissingDigit);
    }
    None
}

fn random_string(charset: &[u8], len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| charset[rng.random_range(0..charset.len())] as char)
        .collect()
}

/// Generates a throwaway `(login, password)` pair for anonymous player
/// registration: `u` plus seven lowercase alphanumerics, and a ten
/// character mixed-case password.
#[must_use]
pub fn generate_credentials() -> (String, String) {
    let login = format!("u{}", random_string(LOWER_ALNUM, 7));
    let password = random_string(MIXED_ALNUM, 10);
    (login, password)
}

/// Random lowercase-alphanumeric suffix used to de-collide usernames and
/// emails.
#[must_use]
pub fn random_suffix(len: usize) -> String {
    random_string(LOWER_ALNUM, len)
}

/// True if the text contains any of the given challenge-page markers,
/// case-insensitively. Markers are expected to be lowercase already.
#[must_use]
pub fn contains_challenge_marker(text: &str, markers: &[String]) -> bool {
    let lowered = text.to_lowercase();
    markers.iter().any(|marker| lowered.contains(marker.as_str()))
}

/// First human-readable message from a panel `notification` list, the
/// shape failure responses carry their reason in.
#[must_use]
pub fn panel_notification(data: &serde_json::Value) -> Option<String> {
    data.get("notification")?
        .get(0)?
        .get("content")?
        .as_str()
        .map(ToString::to_string)
}

/// Loose truthiness for JSON values, matching how the panel's `result`
/// field is interpreted: `null`, `false`, zero, and empty strings,
/// arrays or objects all count as false.
#[must_use]
pub fn value_is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
    }
}

/// Safely truncates a string to a maximum character length (not bytes).
///
/// This is UTF-8 safe and will not panic on multi-byte characters.
///
/// # Examples
///
/// ```
/// use ichancy_agent_rs::utils::truncate_str;
/// let s = "Привет, мир!";
/// assert_eq!(truncate_str(s, 6), "Привет");
/// ```
pub fn truncate_str(s: impl AsRef<str>, max_chars: usize) -> String {
    let s = s.as_ref();
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.char_indices()
        .nth(max_chars)
        .map_or_else(|| s.to_string(), |(pos, _)| s[..pos].to_string())
}

/// Retry a Telegram API operation with exponential backoff.
///
/// The retry strategy uses exponential backoff with jitter to avoid
/// thundering herd:
/// - Initial delay: 500ms
/// - Max delay: 4s
/// - Max attempts: 3 (configurable via constants in `config.rs`)
///
/// # Errors
///
/// Returns the last error if all attempts fail.
pub async fn retry_telegram_operation<F, Fut, T>(operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    use crate::config::{
        TELEGRAM_API_INITIAL_BACKOFF_MS, TELEGRAM_API_MAX_BACKOFF_MS, TELEGRAM_API_MAX_RETRIES,
    };

    let retry_strategy = ExponentialBackoff::from_millis(TELEGRAM_API_INITIAL_BACKOFF_MS)
        .max_delay(Duration::from_millis(TELEGRAM_API_MAX_BACKOFF_MS))
        .map(jitter)
        .take(TELEGRAM_API_MAX_RETRIES);

    Retry::spawn(retry_strategy, operation).await.map_err(|e| {
        warn!(
            "Telegram API operation failed after {} attempts: {}",
            TELEGRAM_API_MAX_RETRIES, e
        );
        e
    })
}
