//! End-to-end provisioning tests against a fake panel: username probing,
//! email de-collision, registration, and the player-store write.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use ichancy_agent_rs::api::transport::{RawResponse, Transport, TransportError};
use ichancy_agent_rs::api::{
    ApiError, IchancyClient, ResponseClassifier, PLAYERS_STATISTICS_PATH, REGISTER_PLAYER_PATH,
    SIGN_IN_PATH,
};
use ichancy_agent_rs::bot::handlers::{
    complete_provisioning, resolve_free_username, ProvisionError,
};
use ichancy_agent_rs::session::store::{SessionRecord, SessionStore, StoreError};
use ichancy_agent_rs::session::{AgentCredentials, SessionManager, SessionPolicy};
use ichancy_agent_rs::storage::{PlayerRecord, PlayerStorage, StorageError};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A stateful fake of the agent panel: it tracks registered players and
/// taken emails, answers the statistics endpoint from that state, and
/// can be switched into failure modes.
struct FakePanel {
    players: Mutex<HashMap<String, i64>>,
    emails: Mutex<HashSet<String>>,
    registrations: Mutex<Vec<Value>>,
    reject_registrations: AtomicBool,
    all_logins_taken: AtomicBool,
    all_emails_taken: AtomicBool,
    login_checks: AtomicUsize,
    email_checks: AtomicUsize,
    next_id: AtomicUsize,
}

impl FakePanel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            players: Mutex::new(HashMap::new()),
            emails: Mutex::new(HashSet::new()),
            registrations: Mutex::new(Vec::new()),
            reject_registrations: AtomicBool::new(false),
            all_logins_taken: AtomicBool::new(false),
            all_emails_taken: AtomicBool::new(false),
            login_checks: AtomicUsize::new(0),
            email_checks: AtomicUsize::new(0),
            next_id: AtomicUsize::new(5_000_000),
        })
    }

    fn seed_login(&self, login: &str) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as i64;
        self.players
            .lock()
            .expect("players lock")
            .insert(login.to_string(), id);
    }

    fn seed_email(&self, email: &str) {
        self.emails
            .lock()
            .expect("emails lock")
            .insert(email.to_string());
    }

    fn registrations(&self) -> Vec<Value> {
        self.registrations
            .lock()
            .expect("registrations lock")
            .clone()
    }

    fn statistics_reply(&self, payload: &Value) -> RawResponse {
        let filter = payload.get("filter").cloned().unwrap_or_else(|| json!({}));

        if let Some(login) = filter.get("login").and_then(Value::as_str) {
            self.login_checks.fetch_add(1, Ordering::SeqCst);
            let players = self.players.lock().expect("players lock");
            let taken =
                self.all_logins_taken.load(Ordering::SeqCst) || players.contains_key(login);
            let id = players.get(login).copied().unwrap_or(1);
            drop(players);
            if taken {
                return ok_json(
                    &json!({"result": {"records": [{"username": login, "playerId": id}]}})
                        .to_string(),
                );
            }
            return ok_json(&json!({"result": {"records": []}}).to_string());
        }

        if let Some(email) = filter.get("email").and_then(Value::as_str) {
            self.email_checks.fetch_add(1, Ordering::SeqCst);
            let taken = self.all_emails_taken.load(Ordering::SeqCst)
                || self.emails.lock().expect("emails lock").contains(email);
            if taken {
                return ok_json(
                    &json!({"result": {"records": [{"email": email}]}}).to_string(),
                );
            }
            return ok_json(&json!({"result": {"records": []}}).to_string());
        }

        ok_json(&json!({"result": {"records": []}}).to_string())
    }

    fn register_reply(&self, payload: &Value) -> RawResponse {
        if self.reject_registrations.load(Ordering::SeqCst) {
            return ok_json(
                r#"{"result": false, "notification": [{"content": "Registration disabled"}]}"#,
            );
        }
        let player = payload.get("player").cloned().unwrap_or_else(|| json!({}));
        let login = player
            .get("login")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let email = player
            .get("email")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as i64;
        self.players.lock().expect("players lock").insert(login, id);
        self.emails.lock().expect("emails lock").insert(email);
        self.registrations
            .lock()
            .expect("registrations lock")
            .push(payload.clone());
        ok_json(r#"{"result": true}"#)
    }
}

#[async_trait]
impl Transport for FakePanel {
    async fn post_json(
        &self,
        path: String,
        payload: Value,
        _cookies: HashMap<String, String>,
    ) -> Result<RawResponse, TransportError> {
        Ok(match path.as_str() {
            SIGN_IN_PATH => ok_json(r#"{"result": true}"#),
            PLAYERS_STATISTICS_PATH => self.statistics_reply(&payload),
            REGISTER_PLAYER_PATH => self.register_reply(&payload),
            _ => ok_json(r#"{"result": true}"#),
        })
    }
}

fn ok_json(body: &str) -> RawResponse {
    RawResponse {
        status: 200,
        body: body.to_string(),
        cookies: HashMap::new(),
    }
}

struct NoopSessionStore;

#[async_trait]
impl SessionStore for NoopSessionStore {
    async fn load(&self) -> Result<Option<SessionRecord>, StoreError> {
        Ok(None)
    }

    async fn save(&self, _record: &SessionRecord) -> Result<(), StoreError> {
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Default)]
struct InMemoryPlayerStore {
    records: Mutex<HashMap<i64, PlayerRecord>>,
    write_count: AtomicUsize,
}

#[async_trait]
impl PlayerStorage for InMemoryPlayerStore {
    async fn update_player_info(
        &self,
        user_id: i64,
        record: &PlayerRecord,
    ) -> Result<(), StorageError> {
        self.write_count.fetch_add(1, Ordering::SeqCst);
        self.records
            .lock()
            .expect("records lock")
            .insert(user_id, record.clone());
        Ok(())
    }

    async fn get_player_info(&self, user_id: i64) -> Result<Option<PlayerRecord>, StorageError> {
        Ok(self.records.lock().expect("records lock").get(&user_id).cloned())
    }
}

fn build_client(panel: &Arc<FakePanel>) -> IchancyClient {
    let session = Arc::new(SessionManager::new(
        panel.clone(),
        Arc::new(NoopSessionStore),
        AgentCredentials {
            username: "agent@example.com".to_string(),
            password: "hunter22".to_string(),
        },
        SessionPolicy {
            session_duration: Duration::minutes(30),
            max_session_age: Duration::hours(2),
        },
        vec!["captcha".to_string()],
    ));
    IchancyClient::new(
        panel.clone(),
        session,
        ResponseClassifier::new(vec!["captcha".to_string()]),
        "2307000".to_string(),
    )
}

#[tokio::test]
async fn probe_accepts_the_bare_prefixed_username() {
    let panel = FakePanel::new();
    let client = build_client(&panel);

    let username = resolve_free_username(&client, "bob")
        .await
        .expect("probe completes");

    assert_eq!(username, Some("ZEUS_bob".to_string()));
    assert_eq!(panel.login_checks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn probe_falls_back_to_a_suffixed_variant() {
    let panel = FakePanel::new();
    panel.seed_login("ZEUS_bob");
    let client = build_client(&panel);

    let username = resolve_free_username(&client, "bob")
        .await
        .expect("probe completes")
        .expect("a variant should be free");

    let suffix = username
        .strip_prefix("ZEUS_bob_")
        .expect("variant keeps the base as prefix");
    assert_eq!(suffix.chars().count(), 3);
    assert!(suffix
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    assert_eq!(panel.login_checks.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn probe_gives_up_after_six_taken_candidates() {
    let panel = FakePanel::new();
    panel.all_logins_taken.store(true, Ordering::SeqCst);
    let client = build_client(&panel);

    let username = resolve_free_username(&client, "bob")
        .await
        .expect("probe completes");

    assert_eq!(username, None);
    assert_eq!(panel.login_checks.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn provisioning_registers_and_persists_the_player() {
    let panel = FakePanel::new();
    let client = build_client(&panel);
    let store = InMemoryPlayerStore::default();

    let account = complete_provisioning(&client, &store, 42, "ZEUS_bob", "Sw0rdfish")
        .await
        .expect("provisioning succeeds");

    assert_eq!(account.username, "ZEUS_bob");
    assert_eq!(account.password, "Sw0rdfish");
    assert_eq!(account.email, "ZEUS_bob@TSA.com");
    assert_eq!(account.player_id, "5000000");

    let registrations = panel.registrations();
    assert_eq!(registrations.len(), 1);
    let player = &registrations[0]["player"];
    assert_eq!(player["login"], "ZEUS_bob");
    assert_eq!(player["password"], "Sw0rdfish");
    assert_eq!(player["email"], "ZEUS_bob@TSA.com");
    assert_eq!(player["parentId"], "2307000");

    let record = store
        .get_player_info(42)
        .await
        .expect("store read")
        .expect("record was written");
    assert_eq!(record.player_id, "5000000");
    assert_eq!(record.username, "ZEUS_bob");
    assert!(record.created_at <= Utc::now());
    assert_eq!(store.write_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn provisioning_steps_the_email_when_taken() {
    let panel = FakePanel::new();
    panel.seed_email("ZEUS_bob@TSA.com");
    let client = build_client(&panel);
    let store = InMemoryPlayerStore::default();

    let account = complete_provisioning(&client, &store, 42, "ZEUS_bob", "Sw0rdfish")
        .await
        .expect("provisioning succeeds");

    let digits = account
        .email
        .strip_prefix("ZEUS_bob_")
        .and_then(|rest| rest.strip_suffix("@TSA.com"))
        .expect("email gets a numeric suffix");
    assert_eq!(digits.len(), 4);
    assert!(digits.chars().all(|c| c.is_ascii_digit()));
    assert_eq!(panel.email_checks.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn provisioning_stops_when_the_username_got_taken_mid_flow() {
    let panel = FakePanel::new();
    panel.seed_login("ZEUS_bob");
    let client = build_client(&panel);
    let store = InMemoryPlayerStore::default();

    let err = complete_provisioning(&client, &store, 42, "ZEUS_bob", "Sw0rdfish")
        .await
        .expect_err("taken username must be rejected");

    assert!(
        matches!(err, ProvisionError::UsernameTaken),
        "unexpected error: {err}"
    );
    assert!(panel.registrations().is_empty());
    assert_eq!(store.write_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn panel_rejection_surfaces_the_notification() {
    let panel = FakePanel::new();
    panel.reject_registrations.store(true, Ordering::SeqCst);
    let client = build_client(&panel);
    let store = InMemoryPlayerStore::default();

    let err = complete_provisioning(&client, &store, 42, "ZEUS_bob", "Sw0rdfish")
        .await
        .expect_err("rejection must surface");

    let ProvisionError::Rejected(reason) = err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(reason, "Registration disabled");
    assert_eq!(store.write_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn email_probing_gives_up_eventually() {
    let panel = FakePanel::new();
    panel.all_emails_taken.store(true, Ordering::SeqCst);
    let client = build_client(&panel);
    let store = InMemoryPlayerStore::default();

    let err = complete_provisioning(&client, &store, 42, "ZEUS_bob", "Sw0rdfish")
        .await
        .expect_err("exhausted email variants must surface");

    let ProvisionError::Api(ApiError::EmailExhausted(login)) = err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(login, "ZEUS_bob");
    // The base email plus ten generated variants are probed before giving up.
    assert_eq!(panel.email_checks.load(Ordering::SeqCst), 11);
    assert!(panel.registrations().is_empty());
}
