//! Configuration and settings management
//!
//! Loads settings from environment variables and defines client constants.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    pub telegram_token: String,

    /// Agent account login for the panel
    pub agent_username: String,
    /// Agent account password for the panel
    pub agent_password: String,
    /// Parent account id that new players are registered under
    pub parent_id: String,

    /// Override for the panel origin (tests, staging mirrors)
    pub ichancy_origin: Option<String>,

    /// Comma-separated list of substrings that mark a challenge page
    #[serde(rename = "ichancy_challenge_markers")]
    pub challenge_markers_str: Option<String>,

    /// Redis host
    pub redis_host: Option<String>,
    /// Redis port
    pub redis_port: Option<String>,
    /// Redis password
    pub redis_password: Option<String>,
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use ichancy_agent_rs::config::Settings;
    ///
    /// let settings = Settings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails or a required value
    /// (bot token, agent credentials, parent id) is missing.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start off by merging in the "default" configuration file
            .add_source(File::with_name("config/default").required(false))
            // Add in the current environment file
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Add in a local configuration file
            // This file shouldn't be checked into git
            .add_source(File::with_name("config/local").required(false))
            // Add in settings from the environment (with a prefix of APP)
            .add_source(Environment::with_prefix("APP").separator("__"))
            // Also add settings from environment variables directly (without prefix)
            // Note: Environment::default() auto-converts UPPER_SNAKE_CASE to snake_case
            // ignore_empty treats empty env vars as unset
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;

        // Fallback: Check environment variables directly if config didn't pick them up
        // This handles cases where automatic mapping might fail or behavior differs
        if settings.ichancy_origin.is_none() {
            if let Ok(val) = std::env::var("ICHANCY_ORIGIN") {
                if !val.is_empty() {
                    settings.ichancy_origin = Some(val);
                }
            }
        }
        if settings.challenge_markers_str.is_none() {
            if let Ok(val) = std::env::var("ICHANCY_CHALLENGE_MARKERS") {
                if !val.is_empty() {
                    settings.challenge_markers_str = Some(val);
                }
            }
        }
        if settings.redis_host.is_none() {
            if let Ok(val) = std::env::var("REDIS_HOST") {
                if !val.is_empty() {
                    settings.redis_host = Some(val);
                }
            }
        }
        if settings.redis_password.is_none() {
            if let Ok(val) = std::env::var("REDIS_PASSWORD") {
                if !val.is_empty() {
                    settings.redis_password = Some(val);
                }
            }
        }

        Ok(settings)
    }

    /// Returns the panel origin, honoring the override if set
    #[must_use]
    pub fn origin(&self) -> String {
        self.ichancy_origin
            .clone()
            .unwrap_or_else(|| DEFAULT_ORIGIN.to_string())
    }

    /// Returns the lowercased challenge-page markers used by response
    /// classification, falling back to the built-in list
    #[must_use]
    pub fn challenge_markers(&self) -> Vec<String> {
        self.challenge_markers_str
            .as_ref()
            .map(|s| {
                s.split(',')
                    .map(|token| token.trim().to_lowercase())
                    .filter(|token| !token.is_empty())
                    .collect()
            })
            .filter(|markers: &Vec<String>| !markers.is_empty())
            .unwrap_or_else(|| {
                DEFAULT_CHALLENGE_MARKERS
                    .iter()
                    .map(|m| (*m).to_string())
                    .collect()
            })
    }

    /// Builds the Redis connection URL from host/port/password settings
    #[must_use]
    pub fn redis_url(&self) -> String {
        let host = self.redis_host.as_deref().unwrap_or("localhost");
        let port = self
            .redis_port
            .as_deref()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(6379);
        match self.redis_password.as_deref() {
            Some(pass) if !pass.is_empty() => format!("redis://:{pass}@{host}:{port}/"),
            _ => format!("redis://{host}:{port}/"),
        }
    }
}

/// Fixed panel origin
pub const DEFAULT_ORIGIN: &str = "https://agents.ichancy.com";

/// Player-facing login page included in the provisioning confirmation
pub const PLAYER_LOGIN_URL: &str = "https://www.ichancy.com/login";

/// Substrings (lowercase) that mark an anti-bot challenge page
pub const DEFAULT_CHALLENGE_MARKERS: &[&str] = &["captcha", "cloudflare"];

/// Default session validity window (minutes)
pub const SESSION_DURATION_MIN: i64 = 30;
/// Default maximum session age (hours); a session older than this is
/// re-established even if its expiry has not passed
pub const MAX_SESSION_AGE_HOURS: i64 = 2;

/// Get the session validity window (minutes) from env or default.
///
/// Environment variable: `ICHANCY_SESSION_MIN`.
#[must_use]
pub fn get_session_duration_min() -> i64 {
    std::env::var("ICHANCY_SESSION_MIN")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(SESSION_DURATION_MIN)
}

/// Get the maximum session age (hours) from env or default.
///
/// Environment variable: `ICHANCY_MAX_SESSION_HOURS`.
#[must_use]
pub fn get_max_session_age_hours() -> i64 {
    std::env::var("ICHANCY_MAX_SESSION_HOURS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(MAX_SESSION_AGE_HOURS)
}

/// Initial backoff delay for Telegram API retries (milliseconds)
pub const TELEGRAM_API_INITIAL_BACKOFF_MS: u64 = 500;
/// Maximum backoff delay for Telegram API retries (milliseconds)
pub const TELEGRAM_API_MAX_BACKOFF_MS: u64 = 4000;
/// Maximum retry attempts for Telegram API operations
pub const TELEGRAM_API_MAX_RETRIES: usize = 3;
