use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tracing::{info, warn};

use crate::core;
use crate::error::CoreError;
use crate::types::{AppState, ChannelKind};

type HmacSha256 = Hmac<Sha256>;

const GRAPH_API_BASE: &str = "https://graph.facebook.com/v20.0";

/// Outbound side of the WhatsApp Cloud API integration. Present on AppState
/// only when the env carries credentials; everything else degrades to web-only.
#[derive(Clone)]
pub struct WhatsappGateway {
    http: reqwest::Client,
    access_token: String,
    phone_number_id: String,
    app_secret: String,
    verify_token: String,
}

impl WhatsappGateway {
    pub fn from_env(http: reqwest::Client) -> Option<Self> {
        let access_token = std::env::var("WHATSAPP_ACCESS_TOKEN").unwrap_or_default();
        let phone_number_id = std::env::var("WHATSAPP_PHONE_NUMBER_ID").unwrap_or_default();
        if access_token.trim().is_empty() || phone_number_id.trim().is_empty() {
            return None;
        }
        Some(Self {
            http,
            access_token,
            phone_number_id,
            app_secret: std::env::var("WHATSAPP_APP_SECRET").unwrap_or_default(),
            verify_token: std::env::var("WHATSAPP_VERIFY_TOKEN").unwrap_or_default(),
        })
    }

    #[cfg(test)]
    pub fn for_tests(app_secret: &str, verify_token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            access_token: "token".to_string(),
            phone_number_id: "12345".to_string(),
            app_secret: app_secret.to_string(),
            verify_token: verify_token.to_string(),
        }
    }

    /// X-Hub-Signature-256 check: HMAC-SHA256 of the raw body keyed by the
    /// app secret, hex, prefixed with "sha256=". Skipped when no secret is
    /// configured (local development).
    pub fn verify_signature(&self, body: &[u8], header: Option<&str>) -> bool {
        if self.app_secret.trim().is_empty() {
            return true;
        }
        let Some(header) = header else {
            return false;
        };
        let Some(received_hex) = header.strip_prefix("sha256=") else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(self.app_secret.as_bytes()) else {
            return false;
        };
        mac.update(body);
        let expected = hex::encode(mac.finalize().into_bytes());
        // Same-length hex strings; compare without early exit.
        if expected.len() != received_hex.len() {
            return false;
        }
        expected
            .bytes()
            .zip(received_hex.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    pub fn verify_token_matches(&self, token: &str) -> bool {
        !self.verify_token.is_empty() && self.verify_token == token
    }

    pub async fn send_text(&self, to: &str, text: &str) -> Result<(), CoreError> {
        let url = format!("{GRAPH_API_BASE}/{}/messages", self.phone_number_id);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({
                "messaging_product": "whatsapp",
                "to": to,
                "type": "text",
                "text": { "body": text },
            }))
            .send()
            .await
            .map_err(|err| CoreError::Upstream(format!("whatsapp send failed: {err}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::Upstream(format!(
                "whatsapp send returned {status}: {body}"
            )));
        }
        Ok(())
    }
}

/// Relays an agent/bot turn back out to the phone bound to the session.
/// Best effort and off the caller's path: delivery failures are logged only.
pub fn relay_to_session_phone(state: Arc<AppState>, session_id: String, text: String) {
    tokio::spawn(async move {
        let Some(gateway) = state.whatsapp.clone() else {
            return;
        };
        let phone = {
            let index = state.wa_phone_to_session.lock().await;
            index
                .iter()
                .find(|(_, bound)| **bound == session_id)
                .map(|(phone, _)| phone.clone())
        };
        let Some(phone) = phone else {
            warn!(%session_id, "no phone bound to whatsapp session; dropping relay");
            return;
        };
        if let Err(err) = gateway.send_text(&phone, &text).await {
            warn!(%session_id, error = %err, "whatsapp relay failed");
        }
    });
}

/// GET webhook verification handshake (hub.mode / hub.verify_token /
/// hub.challenge).
pub async fn webhook_verify(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(gateway) = state.whatsapp.as_ref() else {
        return (StatusCode::NOT_FOUND, String::new());
    };
    let mode = params.get("hub.mode").map(String::as_str).unwrap_or("");
    let token = params.get("hub.verify_token").map(String::as_str).unwrap_or("");
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();
    if mode == "subscribe" && gateway.verify_token_matches(token) {
        (StatusCode::OK, challenge)
    } else {
        (StatusCode::FORBIDDEN, String::new())
    }
}

/// POST webhook: inbound messages. Signature-checked, then each text message
/// is routed through the same inbound path the web widget uses.
pub async fn webhook_receive(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let Some(gateway) = state.whatsapp.clone() else {
        return (StatusCode::NOT_FOUND, "");
    };
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|value| value.to_str().ok());
    if !gateway.verify_signature(&body, signature) {
        warn!("whatsapp webhook signature mismatch");
        return (StatusCode::UNAUTHORIZED, "");
    }

    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        return (StatusCode::OK, "EVENT_RECEIVED");
    };
    for (phone, profile_name, text) in extract_text_messages(&payload) {
        if let Err(err) = handle_inbound_text(&state, &phone, &profile_name, &text).await {
            warn!(%phone, error = %err, "whatsapp inbound message failed");
        }
    }
    (StatusCode::OK, "EVENT_RECEIVED")
}

/// Pulls (from, profile name, text body) triples out of the Cloud API
/// webhook payload shape (entry[].changes[].value.messages[]).
fn extract_text_messages(payload: &Value) -> Vec<(String, String, String)> {
    let mut out = Vec::new();
    let entries = payload.get("entry").and_then(Value::as_array);
    for entry in entries.into_iter().flatten() {
        let changes = entry.get("changes").and_then(Value::as_array);
        for change in changes.into_iter().flatten() {
            let Some(value) = change.get("value") else {
                continue;
            };
            let profile_name = value
                .get("contacts")
                .and_then(Value::as_array)
                .and_then(|contacts| contacts.first())
                .and_then(|contact| contact.pointer("/profile/name"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let messages = value.get("messages").and_then(Value::as_array);
            for message in messages.into_iter().flatten() {
                if message.get("type").and_then(Value::as_str) != Some("text") {
                    continue;
                }
                let Some(from) = message.get("from").and_then(Value::as_str) else {
                    continue;
                };
                let Some(text) = message.pointer("/text/body").and_then(Value::as_str) else {
                    continue;
                };
                out.push((from.to_string(), profile_name.clone(), text.to_string()));
            }
        }
    }
    out
}

/// Find-or-create the session bound to a phone number, then route the turn
/// through the shared inbound path. A closed session unbinds the phone and a
/// fresh message opens a new one.
async fn handle_inbound_text(
    state: &Arc<AppState>,
    phone: &str,
    profile_name: &str,
    text: &str,
) -> Result<(), CoreError> {
    let bound = {
        let index = state.wa_phone_to_session.lock().await;
        index.get(phone).cloned()
    };

    let session_id = match bound {
        Some(session_id) if !core::is_closed(state, &session_id).await.unwrap_or(true) => session_id,
        _ => {
            let display_name = if profile_name.trim().is_empty() {
                phone
            } else {
                profile_name
            };
            let session = core::create_session(state, ChannelKind::Whatsapp, display_name).await?;
            let mut index = state.wa_phone_to_session.lock().await;
            index.insert(phone.to_string(), session.id.clone());
            info!(phone, session_id = %session.id, "whatsapp session opened");
            session.id
        }
    };

    core::handle_user_message(state, &session_id, text).await?;
    Ok(())
}
