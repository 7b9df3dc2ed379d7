//! Panel session lifecycle: restore from Redis on boot, lazy login,
//! validity tracking and explicit invalidation.
//!
//! The manager owns the cookie jar and serializes all session decisions
//! behind one async mutex, so concurrent API calls trigger at most one
//! login at a time.

/// Redis persistence of session records.
pub mod store;

use crate::api::transport::{Transport, TransportError};
use crate::api::SIGN_IN_PATH;
use crate::utils::{contains_challenge_marker, panel_notification, value_is_truthy};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use store::{SessionRecord, SessionStore};

/// Errors from establishing or refreshing a panel session
#[derive(Error, Debug)]
pub enum SessionError {
    /// The panel answered the sign-in request with a refusal
    #[error("login declined by panel: {0}")]
    LoginDeclined(String),

    /// The response body looked like an anti-bot challenge page
    #[error("challenge page detected instead of a panel response")]
    ChallengeDetected,

    /// The sign-in response was not decodable JSON
    #[error("panel returned a response that is not valid JSON")]
    InvalidResponse,

    /// The sign-in request itself failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Agent panel credentials used for the sign-in call.
#[derive(Debug, Clone)]
pub struct AgentCredentials {
    /// Panel account name
    pub username: String,
    /// Panel account password
    pub password: String,
}

/// How long a fresh session is trusted, and how old a login may get
/// before it is re-done regardless of the expiry stamp.
#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    /// Lifetime written into each new session record
    pub session_duration: chrono::Duration,
    /// Hard ceiling on the age of the last login
    pub max_session_age: chrono::Duration,
}

impl SessionPolicy {
    /// Builds the policy from the environment knobs, falling back to the
    /// compiled defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            session_duration: chrono::Duration::minutes(
                crate::config::get_session_duration_min(),
            ),
            max_session_age: chrono::Duration::hours(crate::config::get_max_session_age_hours()),
        }
    }
}

/// Where the manager currently stands with the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// Nothing attempted yet since boot
    #[default]
    NoSession,
    /// A session existed but is gone or untrusted
    Unauthenticated,
    /// A login or restored record is currently trusted
    Authenticated,
}

#[derive(Debug, Default)]
struct SessionState {
    phase: SessionPhase,
    cookies: HashMap<String, String>,
    expires_at: Option<DateTime<Utc>>,
    last_login_at: Option<DateTime<Utc>>,
}

/// Owns the panel session: cookie jar, validity window and the sign-in
/// flow. Shared across handlers behind an [`Arc`].
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    store: Arc<dyn SessionStore>,
    credentials: AgentCredentials,
    policy: SessionPolicy,
    challenge_markers: Vec<String>,
    state: Mutex<SessionState>,
}

impl SessionManager {
    /// Creates a manager in the [`SessionPhase::NoSession`] phase.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn SessionStore>,
        credentials: AgentCredentials,
        policy: SessionPolicy,
        challenge_markers: Vec<String>,
    ) -> Self {
        Self {
            transport,
            store,
            credentials,
            policy,
            challenge_markers,
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Current lifecycle phase.
    pub async fn phase(&self) -> SessionPhase {
        self.state.lock().await.phase
    }

    /// Snapshot of the cookie jar for an outgoing request.
    pub async fn cookies_snapshot(&self) -> HashMap<String, String> {
        self.state.lock().await.cookies.clone()
    }

    /// Merges cookies set by a panel response into the jar.
    pub async fn absorb_cookies(&self, cookies: HashMap<String, String>) {
        if cookies.is_empty() {
            return;
        }
        self.state.lock().await.cookies.extend(cookies);
    }

    /// Attempts to adopt the session stored in Redis. Cookies are always
    /// taken over so the next sign-in reuses them; the authenticated
    /// phase is entered only when the record is still inside its
    /// validity window. Returns whether a trusted session was adopted.
    pub async fn restore(&self) -> bool {
        let mut state = self.state.lock().await;
        match self.store.load().await {
            Ok(Some(record)) => {
                state.cookies = record.cookies.clone();
                if record.is_valid(Utc::now(), self.policy.max_session_age) {
                    state.phase = SessionPhase::Authenticated;
                    state.expires_at = Some(record.expires_at);
                    state.last_login_at = Some(record.last_login_at);
                    info!("Session restored from Redis, valid until {}", record.expires_at);
                    true
                } else {
                    state.phase = SessionPhase::Unauthenticated;
                    info!("Stored session is expired or too old, will re-login");
                    false
                }
            }
            Ok(None) => {
                state.phase = SessionPhase::Unauthenticated;
                info!("No stored session found");
                false
            }
            Err(e) => {
                state.phase = SessionPhase::Unauthenticated;
                warn!("Failed to restore session from Redis: {e}");
                false
            }
        }
    }

    /// Signs in to the panel unconditionally and persists the fresh
    /// session record.
    ///
    /// # Errors
    ///
    /// Returns an error when the request fails, the response is a
    /// challenge page or undecodable, or the panel declines the login.
    pub async fn login(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        self.login_locked(&mut state).await
    }

    /// Guarantees a trusted session: a no-op while the current one is
    /// authenticated and inside its validity window, a fresh login
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Propagates the login error when a re-login was needed and failed.
    pub async fn ensure(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        if state.phase == SessionPhase::Authenticated
            && self.memory_session_valid(&state, Utc::now())
        {
            return Ok(());
        }
        self.login_locked(&mut state).await
    }

    /// Drops the trusted session: clears the stored record and the
    /// in-memory validity stamps. The cookie jar is kept so the next
    /// sign-in presents whatever the panel set last. Safe to call when
    /// no session exists.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        if let Err(e) = self.store.clear().await {
            warn!("Failed to clear stored session: {e}");
        }
        state.phase = SessionPhase::Unauthenticated;
        state.expires_at = None;
        state.last_login_at = None;
        info!("Session invalidated");
    }

    async fn login_locked(&self, state: &mut SessionState) -> Result<(), SessionError> {
        info!("Signing in to the panel as {}", self.credentials.username);
        let payload = serde_json::json!({
            "username": self.credentials.username,
            "password": self.credentials.password,
        });
        let response = self
            .transport
            .post_json(SIGN_IN_PATH.to_string(), payload, state.cookies.clone())
            .await?;
        state.cookies.extend(response.cookies);

        // Challenge pages come back with arbitrary statuses and HTML bodies,
        // so this check runs before any JSON decoding.
        if contains_challenge_marker(&response.body, &self.challenge_markers) {
            error!("Sign-in blocked by an anti-bot challenge page");
            return Err(SessionError::ChallengeDetected);
        }

        let data: Value =
            serde_json::from_str(&response.body).map_err(|_| SessionError::InvalidResponse)?;
        if !data.get("result").is_some_and(value_is_truthy) {
            let message =
                panel_notification(&data).unwrap_or_else(|| "Login failed".to_string());
            warn!("Panel declined the sign-in: {message}");
            return Err(SessionError::LoginDeclined(message));
        }

        let now = Utc::now();
        let record = SessionRecord {
            cookies: state.cookies.clone(),
            expires_at: now + self.policy.session_duration,
            last_login_at: now,
        };
        if let Err(e) = self.store.save(&record).await {
            // The in-memory session stays usable; only the restart path loses out.
            warn!("Failed to persist session to Redis: {e}");
        }
        state.phase = SessionPhase::Authenticated;
        state.expires_at = Some(record.expires_at);
        state.last_login_at = Some(record.last_login_at);
        info!("Panel sign-in succeeded, session valid until {}", record.expires_at);
        Ok(())
    }

    fn memory_session_valid(&self, state: &SessionState, now: DateTime<Utc>) -> bool {
        let (Some(expires_at), Some(last_login_at)) = (state.expires_at, state.last_login_at)
        else {
            return false;
        };
        now < expires_at && now - last_login_at < self.policy.max_session_age
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::transport::{MockTransport, RawResponse};
    use store::MockSessionStore;

    fn credentials() -> AgentCredentials {
        AgentCredentials {
            username: "agent".to_string(),
            password: "secret".to_string(),
        }
    }

    fn policy() -> SessionPolicy {
        SessionPolicy {
            session_duration: chrono::Duration::minutes(30),
            max_session_age: chrono::Duration::hours(2),
        }
    }

    fn markers() -> Vec<String> {
        vec!["captcha".to_string(), "cloudflare".to_string()]
    }

    fn manager(transport: MockTransport, store: MockSessionStore) -> SessionManager {
        SessionManager::new(
            Arc::new(transport),
            Arc::new(store),
            credentials(),
            policy(),
            markers(),
        )
    }

    fn ok_login_response() -> RawResponse {
        RawResponse {
            status: 200,
            body: r#"{"result": true}"#.to_string(),
            cookies: HashMap::from([("sid".to_string(), "abc".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_login_persists_record_and_authenticates() {
        let mut transport = MockTransport::new();
        transport
            .expect_post_json()
            .times(1)
            .returning(|_, _, _| Ok(ok_login_response()));
        let mut store = MockSessionStore::new();
        store
            .expect_save()
            .times(1)
            .withf(|record| {
                record.cookies.get("sid").map(String::as_str) == Some("abc")
                    && record.expires_at - record.last_login_at == chrono::Duration::minutes(30)
            })
            .returning(|_| Ok(()));

        let manager = manager(transport, store);
        manager.login().await.expect("login should succeed");
        assert_eq!(manager.phase().await, SessionPhase::Authenticated);
        assert_eq!(
            manager.cookies_snapshot().await.get("sid").map(String::as_str),
            Some("abc")
        );
    }

    #[tokio::test]
    async fn test_ensure_skips_login_while_session_valid() {
        let mut transport = MockTransport::new();
        transport
            .expect_post_json()
            .times(1)
            .returning(|_, _, _| Ok(ok_login_response()));
        let mut store = MockSessionStore::new();
        store.expect_save().returning(|_| Ok(()));

        let manager = manager(transport, store);
        manager.ensure().await.expect("first ensure logs in");
        // Second ensure must not hit the transport again.
        manager.ensure().await.expect("second ensure is a no-op");
    }

    #[tokio::test]
    async fn test_ensure_relogs_in_once_the_session_expires() {
        let mut transport = MockTransport::new();
        transport
            .expect_post_json()
            .times(2)
            .returning(|_, _, _| Ok(ok_login_response()));
        let mut store = MockSessionStore::new();
        store.expect_save().times(2).returning(|_| Ok(()));

        // A zero validity window makes the session stale immediately.
        let manager = SessionManager::new(
            Arc::new(transport),
            Arc::new(store),
            credentials(),
            SessionPolicy {
                session_duration: chrono::Duration::zero(),
                max_session_age: chrono::Duration::hours(2),
            },
            markers(),
        );
        manager.ensure().await.expect("first ensure logs in");
        manager.ensure().await.expect("second ensure re-logs in");
    }

    #[tokio::test]
    async fn test_login_declined_carries_panel_message() {
        let mut transport = MockTransport::new();
        transport.expect_post_json().returning(|_, _, _| {
            Ok(RawResponse {
                status: 200,
                body: r#"{"result": false, "notification": [{"content": "Wrong password"}]}"#
                    .to_string(),
                cookies: HashMap::new(),
            })
        });
        let store = MockSessionStore::new();

        let manager = manager(transport, store);
        let err = manager.login().await.expect_err("login must fail");
        match err {
            SessionError::LoginDeclined(message) => assert_eq!(message, "Wrong password"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(manager.phase().await, SessionPhase::NoSession);
    }

    #[tokio::test]
    async fn test_challenge_page_rejected_before_json_parsing() {
        let mut transport = MockTransport::new();
        transport.expect_post_json().returning(|_, _, _| {
            Ok(RawResponse {
                status: 200,
                body: "<html>Cloudflare checking your browser</html>".to_string(),
                cookies: HashMap::new(),
            })
        });
        let manager = manager(transport, MockSessionStore::new());
        let err = manager.login().await.expect_err("login must fail");
        assert!(matches!(err, SessionError::ChallengeDetected));
    }

    #[tokio::test]
    async fn test_undecodable_login_response_is_an_error() {
        let mut transport = MockTransport::new();
        transport.expect_post_json().returning(|_, _, _| {
            Ok(RawResponse {
                status: 200,
                body: "not json at all".to_string(),
                cookies: HashMap::new(),
            })
        });
        let manager = manager(transport, MockSessionStore::new());
        let err = manager.login().await.expect_err("login must fail");
        assert!(matches!(err, SessionError::InvalidResponse));
    }

    #[tokio::test]
    async fn test_restore_adopts_valid_record() {
        let transport = MockTransport::new();
        let mut store = MockSessionStore::new();
        store.expect_load().returning(|| {
            let now = Utc::now();
            Ok(Some(SessionRecord {
                cookies: HashMap::from([("sid".to_string(), "stored".to_string())]),
                expires_at: now + chrono::Duration::minutes(20),
                last_login_at: now,
            }))
        });
        let manager = manager(transport, store);
        assert!(manager.restore().await);
        assert_eq!(manager.phase().await, SessionPhase::Authenticated);
    }

    #[tokio::test]
    async fn test_restore_keeps_cookies_of_expired_record() {
        let transport = MockTransport::new();
        let mut store = MockSessionStore::new();
        store.expect_load().returning(|| {
            let now = Utc::now();
            Ok(Some(SessionRecord {
                cookies: HashMap::from([("sid".to_string(), "stale".to_string())]),
                expires_at: now - chrono::Duration::minutes(1),
                last_login_at: now - chrono::Duration::hours(1),
            }))
        });
        let manager = manager(transport, store);
        assert!(!manager.restore().await);
        assert_eq!(manager.phase().await, SessionPhase::Unauthenticated);
        // Stale cookies stay in the jar for the next sign-in request.
        assert_eq!(
            manager.cookies_snapshot().await.get("sid").map(String::as_str),
            Some("stale")
        );
    }

    #[tokio::test]
    async fn test_restore_survives_store_errors() {
        let transport = MockTransport::new();
        let mut store = MockSessionStore::new();
        store.expect_load().returning(|| {
            let broken = serde_json::from_str::<Value>("{").expect_err("must not parse");
            Err(store::StoreError::Serialization(broken))
        });
        let manager = manager(transport, store);
        assert!(!manager.restore().await);
        assert_eq!(manager.phase().await, SessionPhase::Unauthenticated);
    }

    #[tokio::test]
    async fn test_invalidate_clears_store_but_keeps_cookies() {
        let mut transport = MockTransport::new();
        transport
            .expect_post_json()
            .returning(|_, _, _| Ok(ok_login_response()));
        let mut store = MockSessionStore::new();
        store.expect_save().returning(|_| Ok(()));
        store.expect_clear().times(1).returning(|| Ok(()));

        let manager = manager(transport, store);
        manager.login().await.expect("login should succeed");
        manager.invalidate().await;
        assert_eq!(manager.phase().await, SessionPhase::Unauthenticated);
        assert_eq!(
            manager.cookies_snapshot().await.get("sid").map(String::as_str),
            Some("abc")
        );
    }
}
