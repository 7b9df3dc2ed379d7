//! The fixed catalogue of panel operations.
//!
//! Every call runs through the client's guarded request path, and every
//! response is mined defensively: the panel is unreliable enough that a
//! malformed body degrades to a safe default (`false`, `None`, `0.0`,
//! empty) instead of an error.

use super::{
    ApiError, IchancyClient, PanelReply, DEPOSIT_PATH, PLAYERS_STATISTICS_PATH,
    PLAYER_BALANCE_PATH, REGISTER_PLAYER_PATH, WITHDRAW_PATH,
};
use crate::utils::generate_credentials;
use rand::Rng;
use serde_json::{json, Value};

/// Attempts at finding a free email variant before giving up
const MAX_EMAIL_ATTEMPTS: u32 = 10;

/// Outcome of a player-creation call.
#[derive(Debug, Clone)]
pub struct CreatedPlayer {
    /// Final reply of the registration call
    pub reply: PanelReply,
    /// Panel login the player was registered with
    pub login: String,
    /// Password the player was registered with
    pub password: String,
    /// Email the player was registered with
    pub email: String,
    /// Player id resolved by a follow-up lookup; absent when the lookup
    /// found nothing
    pub player_id: Option<String>,
}

impl IchancyClient {
    /// Registers a player under throwaway random credentials with an
    /// `@example.com` email.
    ///
    /// # Errors
    ///
    /// Returns an error when no session could be established or the
    /// re-issued registration call failed in transit.
    pub async fn create_player(&self) -> Result<CreatedPlayer, ApiError> {
        let (login, password) = generate_credentials();
        let email = format!("{login}@example.com");
        self.register_player(&login, &password, &email).await
    }

    /// Registers a player under the given credentials. The email is
    /// derived from the login and probed for uniqueness, retrying with
    /// a random numeric suffix a bounded number of times.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::EmailExhausted`] when no free email variant
    /// was found, and otherwise the same errors as
    /// [`IchancyClient::create_player`].
    pub async fn create_player_with_credentials(
        &self,
        login: &str,
        password: &str,
    ) -> Result<CreatedPlayer, ApiError> {
        let mut email = format!("{login}@TSA.com");
        let mut attempts = 0;
        while self.check_email_exists(&email).await? {
            attempts += 1;
            if attempts > MAX_EMAIL_ATTEMPTS {
                return Err(ApiError::EmailExhausted(login.to_string()));
            }
            let n: u32 = rand::rng().random_range(1000..=9999);
            email = format!("{login}_{n}@TSA.com");
        }
        self.register_player(login, password, &email).await
    }

    /// Resolves a player id by exact login match in the paged
    /// statistics listing. Absence is a valid outcome, not an error.
    ///
    /// # Errors
    ///
    /// Returns an error when no session could be established or the
    /// re-issued call failed in transit.
    pub async fn get_player_id_by_login(&self, login: &str) -> Result<Option<String>, ApiError> {
        let reply = self
            .request(PLAYERS_STATISTICS_PATH, statistics_payload(json!({"login": login})))
            .await?;
        Ok(records(&reply)
            .iter()
            .find(|record| record.get("username").and_then(Value::as_str) == Some(login))
            .and_then(|record| record.get("playerId"))
            .and_then(id_string))
    }

    /// Moves funds from the agent to a player. The caller inspects the
    /// reply body for domain-level success.
    ///
    /// # Errors
    ///
    /// Returns an error when no session could be established or the
    /// re-issued call failed in transit.
    pub async fn deposit_to_player(
        &self,
        player_id: &str,
        amount: f64,
    ) -> Result<PanelReply, ApiError> {
        self.request(DEPOSIT_PATH, transfer_payload(player_id, amount))
            .await
    }

    /// Moves funds from a player back to the agent.
    ///
    /// # Errors
    ///
    /// Returns an error when no session could be established or the
    /// re-issued call failed in transit.
    pub async fn withdraw_from_player(
        &self,
        player_id: &str,
        amount: f64,
    ) -> Result<PanelReply, ApiError> {
        self.request(WITHDRAW_PATH, transfer_payload(player_id, amount))
            .await
    }

    /// Fetches a player's balance, degrading to `0.0` when the reply
    /// carries no parseable balance.
    ///
    /// # Errors
    ///
    /// Returns an error when no session could be established or the
    /// re-issued call failed in transit.
    pub async fn get_player_balance(&self, player_id: &str) -> Result<f64, ApiError> {
        let reply = self
            .request(PLAYER_BALANCE_PATH, json!({"playerId": player_id}))
            .await?;
        Ok(extract_balance(&reply))
    }

    /// True when a player with exactly this login exists under the
    /// agent. `false` on any parse fault.
    ///
    /// # Errors
    ///
    /// Returns an error when no session could be established or the
    /// re-issued call failed in transit.
    pub async fn check_player_exists(&self, login: &str) -> Result<bool, ApiError> {
        let reply = self
            .request(PLAYERS_STATISTICS_PATH, statistics_payload(json!({"login": login})))
            .await?;
        Ok(any_record_matches(&reply, "username", login))
    }

    /// True when a player with exactly this email exists under the
    /// agent. `false` on any parse fault.
    ///
    /// # Errors
    ///
    /// Returns an error when no session could be established or the
    /// re-issued call failed in transit.
    pub async fn check_email_exists(&self, email: &str) -> Result<bool, ApiError> {
        let reply = self
            .request(PLAYERS_STATISTICS_PATH, statistics_payload(json!({"email": email})))
            .await?;
        Ok(any_record_matches(&reply, "email", email))
    }

    /// Lists the agent's players as raw record values, empty on any
    /// parse fault.
    ///
    /// # Errors
    ///
    /// Returns an error when no session could be established or the
    /// re-issued call failed in transit.
    pub async fn get_all_players(&self) -> Result<Vec<Value>, ApiError> {
        let reply = self
            .request(PLAYERS_STATISTICS_PATH, statistics_payload(json!({})))
            .await?;
        Ok(records(&reply))
    }

    async fn register_player(
        &self,
        login: &str,
        password: &str,
        email: &str,
    ) -> Result<CreatedPlayer, ApiError> {
        let payload = json!({
            "player": {
                "email": email,
                "password": password,
                "parentId": self.parent_id(),
                "login": login,
            }
        });
        let reply = self.request(REGISTER_PLAYER_PATH, payload).await?;
        let player_id = self.get_player_id_by_login(login).await?;
        Ok(CreatedPlayer {
            reply,
            login: login.to_string(),
            password: password.to_string(),
            email: email.to_string(),
            player_id,
        })
    }
}

fn statistics_payload(filter: Value) -> Value {
    json!({"page": 1, "pageSize": 100, "filter": filter})
}

fn transfer_payload(player_id: &str, amount: f64) -> Value {
    json!({
        "amount": amount,
        "comment": null,
        "playerId": player_id_value(player_id),
        "currencyCode": "NSP",
        "currency": "NSP",
        "moneyStatus": 5,
    })
}

// Player ids arrive as JSON numbers; send them back in the same form.
fn player_id_value(player_id: &str) -> Value {
    player_id
        .parse::<i64>()
        .map_or_else(|_| json!(player_id), |n| json!(n))
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn records(reply: &PanelReply) -> Vec<Value> {
    let Some(data) = reply.json() else {
        return Vec::new();
    };
    data.get("result")
        .and_then(|result| result.get("records"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn any_record_matches(reply: &PanelReply, field: &str, expected: &str) -> bool {
    records(reply)
        .iter()
        .any(|record| record.get(field).and_then(Value::as_str) == Some(expected))
}

fn extract_balance(reply: &PanelReply) -> f64 {
    let Some(data) = reply.json() else {
        return 0.0;
    };
    let Some(first) = data
        .get("result")
        .and_then(Value::as_array)
        .and_then(|list| list.first())
    else {
        return 0.0;
    };
    match first.get("balance") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}
