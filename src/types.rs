use std::{
    collections::HashMap,
    sync::{atomic::AtomicUsize, Arc},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::bot::Responder;
use crate::events::EventBus;
use crate::realtime::RealtimeState;
use crate::store::SessionStore;
use crate::whatsapp::WhatsappGateway;

pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Lifecycle of one conversation. Transitions are monotonic: a session never
/// returns to an earlier state, and `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    BotPending,
    QueuedForAgent,
    ActiveWithAgent,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::BotPending => "bot_pending",
            SessionStatus::QueuedForAgent => "queued_for_agent",
            SessionStatus::ActiveWithAgent => "active_with_agent",
            SessionStatus::Closed => "closed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "bot_pending" => Some(SessionStatus::BotPending),
            "queued_for_agent" => Some(SessionStatus::QueuedForAgent),
            "active_with_agent" => Some(SessionStatus::ActiveWithAgent),
            "closed" => Some(SessionStatus::Closed),
            _ => None,
        }
    }

    pub fn can_transition(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (BotPending, QueuedForAgent)
                | (QueuedForAgent, ActiveWithAgent)
                | (BotPending, Closed)
                | (QueuedForAgent, Closed)
                | (ActiveWithAgent, Closed)
        )
    }

    pub fn is_closed(self) -> bool {
        self == SessionStatus::Closed
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    User,
    Agent,
    System,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderType::User => "user",
            SenderType::Agent => "agent",
            SenderType::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(SenderType::User),
            "agent" => Some(SenderType::Agent),
            "system" => Some(SenderType::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Web,
    Whatsapp,
    Sms,
    Voice,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Web => "web",
            ChannelKind::Whatsapp => "whatsapp",
            ChannelKind::Sms => "sms",
            ChannelKind::Voice => "voice",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "web" => Some(ChannelKind::Web),
            "whatsapp" => Some(ChannelKind::Whatsapp),
            "sms" => Some(ChannelKind::Sms),
            "voice" => Some(ChannelKind::Voice),
            _ => None,
        }
    }
}

/// Which side of the conversation performed an action (end requests, close).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyRole {
    User,
    Agent,
}

impl PartyRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartyRole::User => "user",
            PartyRole::Agent => "agent",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(PartyRole::User),
            "agent" => Some(PartyRole::Agent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndRequestStatus {
    Pending,
    Accepted,
    Declined,
}

impl EndRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndRequestStatus::Pending => "pending",
            EndRequestStatus::Accepted => "accepted",
            EndRequestStatus::Declined => "declined",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(EndRequestStatus::Pending),
            "accepted" => Some(EndRequestStatus::Accepted),
            "declined" => Some(EndRequestStatus::Declined),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatUser {
    pub id: String,
    pub role: PartyRole,
    pub display_name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub channel: ChannelKind,
    pub status: SessionStatus,
    pub user_id: String,
    pub created_at: String,
    pub closed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub sender_type: SenderType,
    pub text: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffRequest {
    pub id: String,
    pub session_id: String,
    pub created_at: String,
    pub accepted_at: Option<String>,
    pub accepted_by_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentAssignment {
    pub id: String,
    pub agent_id: String,
    pub session_id: String,
    pub started_at: String,
    pub ended_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndChatRequest {
    pub id: String,
    pub session_id: String,
    pub requested_by: PartyRole,
    pub status: EndRequestStatus,
    pub created_at: String,
    pub accepted_at: Option<String>,
    pub declined_at: Option<String>,
    pub accepted_by_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub user_display_name: String,
    pub agent_display_name: String,
    pub summary: String,
    pub topics: Vec<String>,
    pub message_count: i64,
    pub started_at: String,
    pub ended_at: String,
    pub ended_by: PartyRole,
    pub end_requested_by: Option<PartyRole>,
}

/// In-memory projection of one queued handoff. Never authoritative: rebuilt
/// from open HandoffRequest rows on startup, invalidated by the winning claim.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub handoff_request_id: String,
    pub session_id: String,
    pub preview: Vec<ChatMessage>,
    pub channel: ChannelKind,
}

pub struct AppState {
    pub store: Arc<dyn SessionStore>,
    pub responder: Arc<dyn Responder>,
    pub events: EventBus,
    pub whatsapp: Option<WhatsappGateway>,
    pub realtime: Mutex<RealtimeState>,
    pub next_client_id: AtomicUsize,
    pub queue: Mutex<HashMap<String, QueueItem>>,
    pub wa_phone_to_session: Mutex<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceMessageBody {
    pub session_id: String,
    pub text: String,
    #[serde(default)]
    pub sender_type: Option<String>,
}
