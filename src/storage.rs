//! Storage layer for provisioned player identities
//!
//! Keeps one record per Telegram user in Redis so the bot can answer
//! balance queries and avoid losing credentials after a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during player storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Redis operation failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    /// Error during JSON serialization or deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The identity provisioned for a Telegram user
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PlayerRecord {
    /// Panel player id
    pub player_id: String,
    /// Panel login
    pub username: String,
    /// Registration email
    pub email: String,
    /// Panel password
    pub password: String,
    /// When the account was provisioned
    pub created_at: DateTime<Utc>,
}

/// Interface for player-record storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlayerStorage: Send + Sync {
    /// Save the identity provisioned for a Telegram user, overwriting
    /// any previous one
    async fn update_player_info(
        &self,
        user_id: i64,
        record: &PlayerRecord,
    ) -> Result<(), StorageError>;
    /// Load the identity provisioned for a Telegram user
    async fn get_player_info(&self, user_id: i64) -> Result<Option<PlayerRecord>, StorageError>;
}

/// Redis-backed player storage
pub struct RedisPlayerStore {
    conn: ConnectionManager,
}

impl RedisPlayerStore {
    /// Create a store over an established connection manager
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl PlayerStorage for RedisPlayerStore {
    /// Save the identity provisioned for a Telegram user
    async fn update_player_info(
        &self,
        user_id: i64,
        record: &PlayerRecord,
    ) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(record)?;
        conn.set::<_, _, ()>(player_key(user_id), json).await?;
        Ok(())
    }

    /// Load the identity provisioned for a Telegram user
    async fn get_player_info(&self, user_id: i64) -> Result<Option<PlayerRecord>, StorageError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(player_key(user_id)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

/// Returns the Redis key holding a user's provisioned player identity
#[must_use]
pub fn player_key(user_id: i64) -> String {
    format!("ichancy:player:{user_id}")
}
