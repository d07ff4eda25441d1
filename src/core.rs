use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bot::FALLBACK_REPLY;
use crate::error::CoreError;
use crate::events::{
    EventBus, TOPIC_ASSIGNMENTS, TOPIC_HANDOFFS, TOPIC_MESSAGES, TOPIC_SESSIONS, TOPIC_SUMMARIES,
};
use crate::realtime::{
    emit_to_admins, emit_to_client, emit_to_lobby, emit_to_room, join_session_room, ClientRole,
};
use crate::summary::summarize_conversation;
use crate::types::{
    now_iso, AgentAssignment, AppState, ChannelKind, ChatMessage, ChatUser, EndChatRequest,
    EndRequestStatus, HandoffRequest, PartyRole, QueueItem, SenderType, Session, SessionStatus,
    SessionSummary,
};
use crate::whatsapp;

const QUEUE_PREVIEW_LEN: usize = 5;
const HOLD_REPLY: &str = "Okay! Connecting you with a human agent. Please hold…";
const QUEUED_SYSTEM_NOTE: &str = "User requested a human. Queued for handoff.";

/// Default trigger vocabulary for the human-takeover detector. Policy, not
/// contract: override with HANDOFF_KEYWORDS (comma-separated).
const DEFAULT_HANDOFF_KEYWORDS: [&str; 6] =
    ["agent", "human", "support", "person", "representative", "help"];

/// An authenticated agent actor: the users-table id plus the display name
/// shown to the user-facing room.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub display_name: String,
}

/// Who is responding to / initiating an end-chat action.
#[derive(Debug, Clone)]
pub struct Party {
    pub role: PartyRole,
    pub actor_id: Option<String>,
    pub display_name: String,
}

#[derive(Debug)]
pub enum HandoffOutcome {
    Queued(HandoffRequest),
    AlreadyQueued(HandoffRequest),
}

#[derive(Debug)]
pub enum EndRequestOutcome {
    Requested(EndChatRequest),
    AlreadyPending(EndChatRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndDecision {
    Accept,
    Decline,
}

impl EndDecision {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "accept" => Some(EndDecision::Accept),
            "decline" => Some(EndDecision::Decline),
            _ => None,
        }
    }
}

fn handoff_keywords() -> Vec<String> {
    match std::env::var("HANDOFF_KEYWORDS") {
        Ok(raw) if !raw.trim().is_empty() => raw
            .split(',')
            .map(|term| term.trim().to_ascii_lowercase())
            .filter(|term| !term.is_empty())
            .collect(),
        _ => DEFAULT_HANDOFF_KEYWORDS.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn wants_human(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    handoff_keywords().iter().any(|needle| lower.contains(needle.as_str()))
}

pub async fn is_closed(state: &Arc<AppState>, session_id: &str) -> Result<bool, CoreError> {
    let session = state
        .store
        .get_session(session_id)
        .await?
        .ok_or(CoreError::NotFound("session"))?;
    Ok(session.status.is_closed())
}

pub async fn create_session(
    state: &Arc<AppState>,
    channel: ChannelKind,
    display_name: &str,
) -> Result<Session, CoreError> {
    let now = now_iso();
    let display_name = if display_name.trim().is_empty() {
        "Guest"
    } else {
        display_name.trim()
    };
    let user = ChatUser {
        id: Uuid::new_v4().to_string(),
        role: PartyRole::User,
        display_name: display_name.to_string(),
        created_at: now.clone(),
    };
    state.store.insert_user(&user).await?;

    let session = Session {
        id: Uuid::new_v4().to_string(),
        channel,
        status: SessionStatus::BotPending,
        user_id: user.id.clone(),
        created_at: now,
        closed_at: None,
    };
    state.store.insert_session(&session).await?;

    emit_to_admins(
        state,
        "admin:session:update",
        json!({
            "sessionId": &session.id,
            "status": session.status,
            "channel": session.channel,
            "createdAt": &session.created_at,
        }),
    )
    .await;
    state.events.publish(
        TOPIC_SESSIONS,
        "SessionStarted",
        &session.id,
        json!({ "channel": session.channel, "userDisplayName": user.display_name }),
    );
    info!(session_id = %session.id, channel = channel.as_str(), "session created");
    Ok(session)
}

/// Appends one turn. Fails only on unknown session or empty text; agent
/// turns on whatsapp sessions are relayed out-of-band to the gateway.
pub async fn record_message(
    state: &Arc<AppState>,
    session_id: &str,
    sender_type: SenderType,
    text: &str,
) -> Result<ChatMessage, CoreError> {
    let session = state
        .store
        .get_session(session_id)
        .await?
        .ok_or(CoreError::NotFound("session"))?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(CoreError::conflict("empty message"));
    }

    let message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        session_id: session_id.to_string(),
        sender_type,
        text: trimmed.to_string(),
        created_at: now_iso(),
    };
    state.store.insert_message(&message).await?;

    emit_to_room(state, session_id, "message:new", message.clone()).await;
    emit_to_admins(
        state,
        "admin:message:new",
        json!({ "sessionId": session_id, "message": &message }),
    )
    .await;
    state.events.publish(
        TOPIC_MESSAGES,
        "MessageCreated",
        session_id,
        json!({
            "messageId": &message.id,
            "senderType": message.sender_type,
            "text": &message.text,
            "createdAt": &message.created_at,
            "channel": session.channel,
        }),
    );

    if session.channel == ChannelKind::Whatsapp && sender_type == SenderType::Agent {
        whatsapp::relay_to_session_phone(state.clone(), session_id.to_string(), message.text.clone());
    }

    Ok(message)
}

/// Inbound user turn from any channel adapter: records it, then routes by
/// session status — human-request keywords enqueue a handoff, bot-owned
/// sessions get a synchronous bot reply (recorded as the agent speaking).
pub async fn handle_user_message(
    state: &Arc<AppState>,
    session_id: &str,
    text: &str,
) -> Result<ChatMessage, CoreError> {
    let session = state
        .store
        .get_session(session_id)
        .await?
        .ok_or(CoreError::NotFound("session"))?;
    if session.status.is_closed() {
        return Err(CoreError::conflict("session closed"));
    }

    let message = record_message(state, session_id, SenderType::User, text).await?;

    if session.status == SessionStatus::ActiveWithAgent {
        return Ok(message);
    }

    if wants_human(text) {
        if let HandoffOutcome::Queued(_) = request_handoff(state, session_id).await? {
            record_message(state, session_id, SenderType::System, QUEUED_SYSTEM_NOTE).await?;
            record_message(state, session_id, SenderType::Agent, HOLD_REPLY).await?;
        }
        return Ok(message);
    }

    if session.status == SessionStatus::BotPending {
        let history = state.store.messages_for_session(session_id).await?;
        let reply = match state.responder.respond(session_id, text, &history).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(session_id, error = %err, "bot responder failed; using fallback");
                FALLBACK_REPLY.to_string()
            }
        };
        record_message(state, session_id, SenderType::Agent, &reply).await?;
    }

    Ok(message)
}

/// Idempotent enqueue: while a HandoffRequest is outstanding for the session
/// no second one is created, and repeated triggers are success no-ops.
pub async fn request_handoff(
    state: &Arc<AppState>,
    session_id: &str,
) -> Result<HandoffOutcome, CoreError> {
    let session = state
        .store
        .get_session(session_id)
        .await?
        .ok_or(CoreError::NotFound("session"))?;
    if session.status.is_closed() {
        return Err(CoreError::conflict("session closed"));
    }
    if session.status == SessionStatus::ActiveWithAgent {
        return Err(CoreError::conflict("already with agent"));
    }

    if let Some(open) = state.store.open_handoff_request(session_id).await? {
        return Ok(HandoffOutcome::AlreadyQueued(open));
    }

    if session.status == SessionStatus::BotPending {
        state
            .store
            .set_session_status(session_id, SessionStatus::QueuedForAgent, None)
            .await?;
    }

    let request = HandoffRequest {
        id: Uuid::new_v4().to_string(),
        session_id: session_id.to_string(),
        created_at: now_iso(),
        accepted_at: None,
        accepted_by_id: None,
    };
    state.store.insert_handoff_request(&request).await?;

    let preview = state.store.recent_messages(session_id, QUEUE_PREVIEW_LEN).await?;
    let item = QueueItem {
        handoff_request_id: request.id.clone(),
        session_id: session_id.to_string(),
        preview,
        channel: session.channel,
    };
    state.queue.lock().await.insert(request.id.clone(), item.clone());

    emit_to_lobby(state, "queue:new", item).await;
    emit_to_room(
        state,
        session_id,
        "session:status",
        json!({ "sessionId": session_id, "status": SessionStatus::QueuedForAgent }),
    )
    .await;
    emit_to_admins(
        state,
        "admin:session:update",
        json!({ "sessionId": session_id, "status": SessionStatus::QueuedForAgent }),
    )
    .await;
    state.events.publish(
        TOPIC_HANDOFFS,
        "HandoffRequested",
        session_id,
        json!({ "handoffRequestId": &request.id }),
    );
    info!(session_id, handoff_request_id = %request.id, "queued for agent");
    Ok(HandoffOutcome::Queued(request))
}

/// Claim arbitration. The single conditional update in the store decides the
/// winner; all side effects run only on the winning branch, so losers leave
/// the queue untouched and just learn "already accepted".
pub async fn claim_handoff(
    state: &Arc<AppState>,
    handoff_request_id: &str,
    agent: &AgentIdentity,
    claimant_client: Option<usize>,
) -> Result<String, CoreError> {
    let now = now_iso();
    let affected = state
        .store
        .accept_handoff(handoff_request_id, &agent.agent_id, &now)
        .await?;
    if affected == 0 {
        return Err(CoreError::AlreadyAccepted);
    }

    let request = state
        .store
        .get_handoff_request(handoff_request_id)
        .await?
        .ok_or(CoreError::NotFound("handoff request"))?;
    let session = state
        .store
        .get_session(&request.session_id)
        .await?
        .ok_or(CoreError::NotFound("session"))?;

    if session.status.is_closed() {
        // Session was force-closed while queued: drop the stale entry.
        state.queue.lock().await.remove(handoff_request_id);
        emit_to_lobby(
            state,
            "queue:remove",
            json!({ "handoffRequestId": handoff_request_id }),
        )
        .await;
        return Err(CoreError::conflict("session closed"));
    }

    if session.status == SessionStatus::QueuedForAgent {
        state
            .store
            .set_session_status(&session.id, SessionStatus::ActiveWithAgent, None)
            .await?;
    }

    let assignment = AgentAssignment {
        id: Uuid::new_v4().to_string(),
        agent_id: agent.agent_id.clone(),
        session_id: session.id.clone(),
        started_at: now,
        ended_at: None,
    };
    state.store.insert_assignment(&assignment).await?;

    state.queue.lock().await.remove(handoff_request_id);
    emit_to_lobby(
        state,
        "queue:remove",
        json!({ "handoffRequestId": handoff_request_id }),
    )
    .await;

    if let Some(client_id) = claimant_client {
        join_session_room(state, client_id, &session.id).await;
        let history = state.store.messages_for_session(&session.id).await?;
        emit_to_client(
            state,
            client_id,
            "message:history",
            json!({ "sessionId": &session.id, "messages": history }),
        )
        .await;
    }

    emit_to_room(
        state,
        &session.id,
        "handoff:accepted",
        json!({ "sessionId": &session.id, "agentName": &agent.display_name }),
    )
    .await;
    emit_to_room(
        state,
        &session.id,
        "session:status",
        json!({ "sessionId": &session.id, "status": SessionStatus::ActiveWithAgent }),
    )
    .await;
    emit_to_admins(
        state,
        "admin:session:update",
        json!({
            "sessionId": &session.id,
            "status": SessionStatus::ActiveWithAgent,
            "agentId": &agent.agent_id,
        }),
    )
    .await;
    state.events.publish(
        TOPIC_ASSIGNMENTS,
        "AgentAssigned",
        &session.id,
        json!({ "agentId": &agent.agent_id }),
    );
    info!(session_id = %session.id, agent_id = %agent.agent_id, "handoff claimed");
    Ok(session.id)
}

/// Files an end-chat proposal. A second request while one is pending is a
/// success no-op carrying the existing request.
pub async fn request_end(
    state: &Arc<AppState>,
    session_id: &str,
    requested_by: PartyRole,
) -> Result<EndRequestOutcome, CoreError> {
    let session = state
        .store
        .get_session(session_id)
        .await?
        .ok_or(CoreError::NotFound("session"))?;
    if session.status.is_closed() {
        return Err(CoreError::conflict("session closed"));
    }

    if let Some(pending) = state.store.pending_end_request(session_id).await? {
        return Ok(EndRequestOutcome::AlreadyPending(pending));
    }

    let request = EndChatRequest {
        id: Uuid::new_v4().to_string(),
        session_id: session_id.to_string(),
        requested_by,
        status: EndRequestStatus::Pending,
        created_at: now_iso(),
        accepted_at: None,
        declined_at: None,
        accepted_by_id: None,
    };
    state.store.insert_end_request(&request).await?;

    emit_to_room(
        state,
        session_id,
        "session:end:requested",
        json!({
            "sessionId": session_id,
            "requestId": &request.id,
            "requestedBy": request.requested_by,
        }),
    )
    .await;
    Ok(EndRequestOutcome::Requested(request))
}

/// Accept or decline a pending end-chat request. Only the party that did not
/// file the request may respond to it.
pub async fn respond_end(
    state: &Arc<AppState>,
    request_id: &str,
    decision: EndDecision,
    responder: &Party,
) -> Result<(), CoreError> {
    let request = state
        .store
        .get_end_request(request_id)
        .await?
        .ok_or(CoreError::NotFound("end request"))?;
    if request.status != EndRequestStatus::Pending {
        return Err(CoreError::conflict("request not pending"));
    }
    if responder.role == request.requested_by {
        return Err(CoreError::Unauthorized);
    }
    if responder.role == PartyRole::Agent && responder.actor_id.is_none() {
        return Err(CoreError::Unauthorized);
    }
    let actor_id = responder.actor_id.clone().unwrap_or_default();
    let now = now_iso();

    match decision {
        EndDecision::Decline => {
            let resolved = state
                .store
                .resolve_end_request(request_id, EndRequestStatus::Declined, &now, &actor_id)
                .await?;
            if !resolved {
                return Err(CoreError::conflict("request not pending"));
            }
            emit_to_room(
                state,
                &request.session_id,
                "session:end:declined",
                json!({ "sessionId": &request.session_id }),
            )
            .await;
            Ok(())
        }
        EndDecision::Accept => {
            let resolved = state
                .store
                .resolve_end_request(request_id, EndRequestStatus::Accepted, &now, &actor_id)
                .await?;
            if !resolved {
                return Err(CoreError::conflict("request not pending"));
            }
            close_session(
                state,
                &request.session_id,
                responder.role,
                Some(request.requested_by),
            )
            .await?;
            Ok(())
        }
    }
}

/// Unilateral close by an agent, without end-confirmation.
pub async fn force_close(
    state: &Arc<AppState>,
    session_id: &str,
    caller: &Party,
) -> Result<(), CoreError> {
    if caller.role != PartyRole::Agent {
        return Err(CoreError::Unauthorized);
    }
    close_session(state, session_id, PartyRole::Agent, None).await?;
    Ok(())
}

/// The close sequence. Status write and summary upsert are the only steps
/// allowed to fail the operation; notification fan-out is best effort.
pub async fn close_session(
    state: &Arc<AppState>,
    session_id: &str,
    ended_by: PartyRole,
    end_requested_by: Option<PartyRole>,
) -> Result<SessionSummary, CoreError> {
    let session = state
        .store
        .get_session(session_id)
        .await?
        .ok_or(CoreError::NotFound("session"))?;

    let now = now_iso();
    // Retried closes keep the original closed_at so the summary stays stable.
    let closed_at = session.closed_at.clone().unwrap_or_else(|| now.clone());
    if !session.status.is_closed() {
        state
            .store
            .set_session_status(session_id, SessionStatus::Closed, Some(&closed_at))
            .await?;
    }

    let messages = state.store.messages_for_session(session_id).await?;
    let user_name = state
        .store
        .get_user(&session.user_id)
        .await?
        .map(|user| user.display_name)
        .unwrap_or_else(|| "User".to_string());
    let assignment = state.store.open_assignment(session_id).await?;
    let agent_name = match &assignment {
        Some(assignment) => state
            .store
            .get_user(&assignment.agent_id)
            .await?
            .map(|agent| agent.display_name)
            .unwrap_or_else(|| "Agent".to_string()),
        None => "Agent".to_string(),
    };

    let result = summarize_conversation(
        &messages,
        &user_name,
        Some(agent_name.as_str()),
        ended_by,
        end_requested_by,
        &session.created_at,
        &closed_at,
    );
    let summary = SessionSummary {
        session_id: session_id.to_string(),
        user_display_name: user_name,
        agent_display_name: agent_name,
        summary: result.summary,
        topics: result.topics,
        message_count: messages.len() as i64,
        started_at: session.created_at.clone(),
        ended_at: closed_at.clone(),
        ended_by,
        end_requested_by,
    };
    state.store.upsert_summary(&summary).await?;

    emit_to_room(
        state,
        session_id,
        "session:closed",
        json!({
            "sessionId": session_id,
            "endedBy": ended_by,
            "endRequestedBy": end_requested_by,
        }),
    )
    .await;
    emit_to_admins(
        state,
        "admin:session:update",
        json!({ "sessionId": session_id, "status": SessionStatus::Closed, "endedAt": closed_at }),
    )
    .await;
    emit_to_admins(
        state,
        "admin:summary:ready",
        json!({
            "sessionId": session_id,
            "summary": {
                "messageCount": summary.message_count,
                "summary": &summary.summary,
                "topics": &summary.topics,
            },
        }),
    )
    .await;
    state.events.publish(
        TOPIC_SESSIONS,
        "SessionEnded",
        session_id,
        json!({ "reason": if end_requested_by.is_some() { "polite" } else { "force" } }),
    );
    state.events.publish(
        TOPIC_SUMMARIES,
        "SummaryCreated",
        session_id,
        json!({ "messageCount": summary.message_count, "topics": &summary.topics }),
    );
    info!(session_id, ended_by = ended_by.as_str(), "session closed");
    Ok(summary)
}

/// Bootstrap view for a freshly connected agent: every outstanding,
/// unclaimed handoff with its preview.
pub async fn queue_snapshot(state: &Arc<AppState>) -> Vec<QueueItem> {
    let queue = state.queue.lock().await;
    let mut items = queue.values().cloned().collect::<Vec<_>>();
    items.sort_by(|a, b| a.handoff_request_id.cmp(&b.handoff_request_id));
    items
}

/// Rebuilds the queue projection from open HandoffRequest rows. The cache is
/// never authoritative, so starting from store state is always safe.
pub async fn rebuild_queue(state: &Arc<AppState>) -> Result<usize, CoreError> {
    let open = state.store.open_handoff_requests().await?;
    let mut rebuilt = Vec::new();
    for request in open {
        let Some(session) = state.store.get_session(&request.session_id).await? else {
            continue;
        };
        if session.status.is_closed() {
            continue;
        }
        let preview = state
            .store
            .recent_messages(&request.session_id, QUEUE_PREVIEW_LEN)
            .await?;
        rebuilt.push(QueueItem {
            handoff_request_id: request.id,
            session_id: request.session_id,
            preview,
            channel: session.channel,
        });
    }
    let mut queue = state.queue.lock().await;
    queue.clear();
    let count = rebuilt.len();
    for item in rebuilt {
        queue.insert(item.handoff_request_id.clone(), item);
    }
    Ok(count)
}

/// Resolves (lazily creating) the users-table row behind an agent
/// connection, and records the id back on the connection's identity.
pub async fn ensure_agent_user(
    state: &Arc<AppState>,
    client_id: usize,
) -> Result<AgentIdentity, CoreError> {
    let identity = {
        let rt = state.realtime.lock().await;
        rt.identities.get(&client_id).cloned()
    };
    let Some(identity) = identity else {
        return Err(CoreError::Unauthorized);
    };
    if identity.role != ClientRole::Agent {
        return Err(CoreError::Unauthorized);
    }
    if let Some(agent_id) = identity.agent_id {
        return Ok(AgentIdentity {
            agent_id,
            display_name: identity.display_name,
        });
    }

    let agent = ChatUser {
        id: Uuid::new_v4().to_string(),
        role: PartyRole::Agent,
        display_name: identity.display_name.clone(),
        created_at: now_iso(),
    };
    state.store.insert_user(&agent).await?;
    {
        let mut rt = state.realtime.lock().await;
        if let Some(entry) = rt.identities.get_mut(&client_id) {
            entry.agent_id = Some(agent.id.clone());
        }
    }
    Ok(AgentIdentity {
        agent_id: agent.id,
        display_name: identity.display_name,
    })
}

/// Convenience constructor for a default state around a store/responder pair;
/// used by the server bootstrap and the test suite.
pub fn app_state(
    store: Arc<dyn crate::store::SessionStore>,
    responder: Arc<dyn crate::bot::Responder>,
    events: EventBus,
    whatsapp: Option<crate::whatsapp::WhatsappGateway>,
) -> Arc<AppState> {
    Arc::new(AppState {
        store,
        responder,
        events,
        whatsapp,
        realtime: tokio::sync::Mutex::new(crate::realtime::RealtimeState::default()),
        next_client_id: std::sync::atomic::AtomicUsize::new(0),
        queue: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        wa_phone_to_session: tokio::sync::Mutex::new(std::collections::HashMap::new()),
    })
}
