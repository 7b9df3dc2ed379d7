//! Redis-backed persistence for the agent's panel session.
//!
//! A session is stored as three plain keys: the cookie jar as a JSON
//! object, and two RFC 3339 timestamps for expiry and last login. Keys
//! carry no TTL; validity is decided by the reader so that a stale
//! record can still be inspected and discarded explicitly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use thiserror::Error;

/// Redis key holding the serialized cookie jar
const COOKIES_KEY: &str = "ichancy:cookies";
/// Redis key holding the session expiry timestamp
const SESSION_EXPIRY_KEY: &str = "ichancy:session_expiry";
/// Redis key holding the last successful login timestamp
const LAST_LOGIN_KEY: &str = "ichancy:last_login";

/// Errors from session persistence
#[derive(Error, Debug)]
pub enum StoreError {
    /// Redis operation failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Cookie jar could not be serialized or deserialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored timestamp was not valid RFC 3339
    #[error("Invalid stored timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),
}

/// A persisted panel session: cookie jar plus its validity timestamps.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    /// Cookie name to value map captured from the panel
    pub cookies: HashMap<String, String>,
    /// Moment the session stops being trusted
    pub expires_at: DateTime<Utc>,
    /// Moment the session was last established by a real login
    pub last_login_at: DateTime<Utc>,
}

impl SessionRecord {
    /// A record is usable only while `now` is before its expiry and the
    /// login is younger than `max_age`. Both bounds are strict.
    #[must_use]
    pub fn is_valid(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        now < self.expires_at && now - self.last_login_at < max_age
    }
}

/// Persistence seam for session records, so the login flow can be
/// exercised without a live Redis.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Loads the stored record, or `None` when any of its parts is
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns an error when Redis fails or the stored data does not
    /// decode.
    async fn load(&self) -> Result<Option<SessionRecord>, StoreError>;

    /// Writes all three parts of the record.
    ///
    /// # Errors
    ///
    /// Returns an error when Redis fails or the cookie jar does not
    /// serialize.
    async fn save(&self, record: &SessionRecord) -> Result<(), StoreError>;

    /// Deletes the stored record. Clearing an absent record is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns an error when Redis fails.
    async fn clear(&self) -> Result<(), StoreError>;
}

/// [`SessionStore`] over a shared Redis connection manager.
pub struct RedisSessionStore {
    conn: ConnectionManager,
}

impl RedisSessionStore {
    /// Creates a store over an established connection manager.
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn load(&self) -> Result<Option<SessionRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let cookies_json: Option<String> = conn.get(COOKIES_KEY).await?;
        let expiry_raw: Option<String> = conn.get(SESSION_EXPIRY_KEY).await?;
        let last_login_raw: Option<String> = conn.get(LAST_LOGIN_KEY).await?;

        let (Some(cookies_json), Some(expiry_raw), Some(last_login_raw)) =
            (cookies_json, expiry_raw, last_login_raw)
        else {
            return Ok(None);
        };

        let cookies: HashMap<String, String> = serde_json::from_str(&cookies_json)?;
        let expires_at = DateTime::parse_from_rfc3339(&expiry_raw)?.with_timezone(&Utc);
        let last_login_at = DateTime::parse_from_rfc3339(&last_login_raw)?.with_timezone(&Utc);

        Ok(Some(SessionRecord {
            cookies,
            expires_at,
            last_login_at,
        }))
    }

    async fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let cookies_json = serde_json::to_string(&record.cookies)?;
        conn.set::<_, _, ()>(COOKIES_KEY, cookies_json).await?;
        conn.set::<_, _, ()>(SESSION_EXPIRY_KEY, record.expires_at.to_rfc3339())
            .await?;
        conn.set::<_, _, ()>(LAST_LOGIN_KEY, record.last_login_at.to_rfc3339())
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(vec![COOKIES_KEY, SESSION_EXPIRY_KEY, LAST_LOGIN_KEY])
            .await?;
        Ok(())
    }
}
