#![deny(missing_docs)]
//! Ichancy agent panel client with a Telegram provisioning bot
//!
//! A session-managed HTTP client for the Ichancy agent panel: browser-like
//! requests, a Redis-backed session record shared across restarts, lazy
//! login, and a retry-once policy when the panel rejects a call. On top of
//! it, a Telegram dialogue that provisions player sub-accounts.

/// Remote operations against the agent panel
pub mod api;
/// Telegram bot implementation
pub mod bot;
/// Configuration management
pub mod config;
/// Panel session lifecycle and persistence
pub mod session;
/// Storage layer for provisioned players (Redis)
pub mod storage;
/// Credential generation, validation, and retry helpers
pub mod utils;
