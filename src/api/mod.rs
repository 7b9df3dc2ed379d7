//! Client for the agent panel's REST-like API.
//!
//! Every remote operation goes through one guarded path: ensure a valid
//! session, issue the call, classify the outcome, and on failure reset
//! the session and re-issue the call exactly once. The second outcome is
//! returned as-is, so a persistently broken panel or wrong credentials
//! cannot loop.

/// The fixed catalogue of panel operations.
pub mod ops;
/// HTTP plumbing under the client.
pub mod transport;

use crate::session::{SessionError, SessionManager};
use crate::utils::{contains_challenge_marker, truncate_str, value_is_truthy};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use transport::{RawResponse, Transport, TransportError};

/// Sign-in endpoint
pub const SIGN_IN_PATH: &str = "/global/api/User/signIn";
/// Player registration endpoint
pub const REGISTER_PLAYER_PATH: &str = "/global/api/Player/registerPlayer";
/// Paged player statistics endpoint; also serves id lookups and existence checks
pub const PLAYERS_STATISTICS_PATH: &str = "/global/api/Statistics/getPlayersStatisticsPro";
/// Deposit endpoint
pub const DEPOSIT_PATH: &str = "/global/api/Player/depositToPlayer";
/// Withdrawal endpoint
pub const WITHDRAW_PATH: &str = "/global/api/Player/withdrawFromPlayer";
/// Balance lookup endpoint
pub const PLAYER_BALANCE_PATH: &str = "/global/api/Player/getPlayerBalanceById";

/// Errors crossing the client boundary
#[derive(Error, Debug)]
pub enum ApiError {
    /// A panel session could not be established or re-established
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// The re-issued call itself failed in transit
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// No free email variant was found for a generated login
    #[error("no available email variant for login {0}")]
    EmailExhausted(String),
}

/// A panel response handed back to operation callers after the guarded
/// request path is done with it.
#[derive(Debug, Clone)]
pub struct PanelReply {
    /// HTTP status of the final attempt
    pub status: u16,
    /// Raw body of the final attempt
    pub body: String,
}

impl PanelReply {
    /// Decodes the body as JSON, `None` when it does not parse.
    #[must_use]
    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }

    /// True when the panel answered with the canonical success status.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

impl From<RawResponse> for PanelReply {
    fn from(raw: RawResponse) -> Self {
        Self {
            status: raw.status,
            body: raw.body,
        }
    }
}

/// Decides whether a panel response should trigger a session reset and
/// retry. Kept apart from the retry control flow so the heuristics can
/// change without touching it.
#[derive(Debug, Clone)]
pub struct ResponseClassifier {
    challenge_markers: Vec<String>,
}

impl ResponseClassifier {
    /// Builds a classifier around the given challenge-page markers
    /// (expected lowercase).
    #[must_use]
    pub fn new(challenge_markers: Vec<String>) -> Self {
        Self { challenge_markers }
    }

    /// A response is unusable when the status is not the canonical
    /// success code, the decoded body carries an explicitly falsy
    /// `result` flag, or the body text looks like a challenge page.
    /// Bodies that do not decode as JSON objects carry no flag to
    /// check and are judged on status and markers alone.
    #[must_use]
    pub fn is_failure(&self, response: &RawResponse) -> bool {
        response.status != 200
            || has_falsy_result_flag(&response.body)
            || contains_challenge_marker(&response.body, &self.challenge_markers)
    }
}

fn has_falsy_result_flag(body: &str) -> bool {
    let Ok(Value::Object(data)) = serde_json::from_str::<Value>(body) else {
        return false;
    };
    data.get("result").is_some_and(|flag| !value_is_truthy(flag))
}

/// Panel API client: owns the guarded request path and the operation
/// catalogue in [`ops`].
pub struct IchancyClient {
    transport: Arc<dyn Transport>,
    session: Arc<SessionManager>,
    classifier: ResponseClassifier,
    parent_id: String,
}

impl IchancyClient {
    /// Creates a client. `parent_id` is the agent account every new
    /// player is registered under.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        session: Arc<SessionManager>,
        classifier: ResponseClassifier,
        parent_id: String,
    ) -> Self {
        Self {
            transport,
            session,
            classifier,
            parent_id,
        }
    }

    /// The agent account id new players are registered under.
    #[must_use]
    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    /// One guarded panel call: ensure a session, invoke, and on an
    /// unusable outcome reset the session and invoke once more,
    /// returning that second outcome whatever it is.
    async fn request(&self, path: &str, payload: Value) -> Result<PanelReply, ApiError> {
        self.session.ensure().await?;
        match self.call(path, payload.clone()).await {
            Ok(response) if !self.classifier.is_failure(&response) => Ok(response.into()),
            first => {
                match &first {
                    Ok(response) => warn!(
                        status = response.status,
                        body_preview = %truncate_str(&response.body, 200),
                        "Panel call {path} classified as failed, resetting session and retrying"
                    ),
                    Err(e) => warn!(
                        "Panel call {path} failed in transit ({e}), resetting session and retrying"
                    ),
                }
                self.session.invalidate().await;
                self.session.ensure().await?;
                let second = self.call(path, payload).await?;
                Ok(second.into())
            }
        }
    }

    async fn call(&self, path: &str, payload: Value) -> Result<RawResponse, TransportError> {
        let cookies = self.session.cookies_snapshot().await;
        let response = self
            .transport
            .post_json(path.to_string(), payload, cookies)
            .await?;
        self.session.absorb_cookies(response.cookies.clone()).await;
        Ok(response)
    }
}
