use std::sync::{atomic::Ordering, Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::bot::OpenAiResponder;
use crate::core::{self, EndDecision, Party};
use crate::error::CoreError;
use crate::events::EventBus;
use crate::realtime::{client_identity, emit_to_client, join_session_room, ClientIdentity, ClientRole};
use crate::store::PgStore;
use crate::types::{
    AppState, ChannelKind, EventEnvelopeIn, PartyRole, SenderType, VoiceMessageBody,
};
use crate::whatsapp::{self, WhatsappGateway};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/api/sessions/{session_id}/messages", get(get_messages))
        .route("/api/sessions/{session_id}/summary", get(get_summary))
        .route("/api/voice/message", post(voice_message))
        .route(
            "/webhooks/whatsapp",
            get(whatsapp::webhook_verify).post(whatsapp::webhook_receive),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

fn error_response(err: CoreError) -> (StatusCode, Json<Value>) {
    let status = match &err {
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::Unauthorized => StatusCode::UNAUTHORIZED,
        CoreError::AlreadyAccepted | CoreError::Conflict(_) => StatusCode::CONFLICT,
        CoreError::Upstream(_) => StatusCode::BAD_GATEWAY,
        CoreError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() })))
}

async fn get_messages(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let exists = match state.store.get_session(&session_id).await {
        Ok(session) => session.is_some(),
        Err(err) => return error_response(err).into_response(),
    };
    if !exists {
        return error_response(CoreError::NotFound("session")).into_response();
    }
    match state.store.messages_for_session(&session_id).await {
        Ok(messages) => Json(json!({ "sessionId": session_id, "messages": messages })).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn get_summary(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_summary(&session_id).await {
        Ok(Some(summary)) => Json(summary).into_response(),
        Ok(None) => error_response(CoreError::NotFound("summary")).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

/// Voice-transcript ingestion: a transcribed turn lands on an existing
/// session and flows through the same routing as any other channel.
async fn voice_message(
    State(state): State<Arc<AppState>>,
    Json(body): Json<VoiceMessageBody>,
) -> impl IntoResponse {
    let sender = body
        .sender_type
        .as_deref()
        .and_then(SenderType::parse)
        .unwrap_or(SenderType::User);
    let result = match sender {
        SenderType::User => core::handle_user_message(&state, &body.session_id, &body.text).await,
        other => core::record_message(&state, &body.session_id, other, &body.text).await,
    };
    match result {
        Ok(message) => Json(message).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    {
        let mut rt = state.realtime.lock().await;
        rt.clients.insert(client_id, tx);
    }

    let (mut ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_tx.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            Message::Text(text) => {
                let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(text.as_str()) else {
                    send_ws_error(&state, client_id, "malformed event").await;
                    continue;
                };
                dispatch(&state, client_id, envelope).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    let mut rt = state.realtime.lock().await;
    rt.remove_client(client_id);
    info!(client_id, "client disconnected");
}

async fn send_ws_error(state: &Arc<AppState>, client_id: usize, message: &str) {
    emit_to_client(state, client_id, "error", json!({ "message": message })).await;
}

fn str_field<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

async fn dispatch(state: &Arc<AppState>, client_id: usize, envelope: EventEnvelopeIn) {
    let data = envelope.data;
    match envelope.event.as_str() {
        "hello" => handle_hello(state, client_id, &data).await,
        "session:create" => handle_session_create(state, client_id, &data).await,
        "session:join" => handle_session_join(state, client_id, &data).await,
        "message:send" => handle_message_send(state, client_id, &data).await,
        "handoff:request" => handle_handoff_request(state, client_id, &data).await,
        "agent:claim" => handle_agent_claim(state, client_id, &data).await,
        "session:end:request" => handle_end_request(state, client_id, &data).await,
        "session:end:accept" => handle_end_response(state, client_id, &data, EndDecision::Accept).await,
        "session:end:decline" => handle_end_response(state, client_id, &data, EndDecision::Decline).await,
        "session:close" => handle_session_close(state, client_id, &data).await,
        other => {
            warn!(client_id, event = other, "unknown event");
            send_ws_error(state, client_id, "unknown event").await;
        }
    }
}

/// First frame on every connection: declares the role and display name this
/// connection acts as. Agents land in the lobby and get the current queue;
/// a user reconnecting with a sessionId rejoins their room with history.
async fn handle_hello(state: &Arc<AppState>, client_id: usize, data: &Value) {
    let role = match str_field(data, "role") {
        Some("agent") => ClientRole::Agent,
        Some("admin") => ClientRole::Admin,
        _ => ClientRole::User,
    };
    let display_name = str_field(data, "displayName").unwrap_or("Guest").trim().to_string();
    let display_name = if display_name.is_empty() { "Guest".to_string() } else { display_name };

    {
        let mut rt = state.realtime.lock().await;
        rt.identities.insert(
            client_id,
            ClientIdentity {
                role,
                display_name,
                agent_id: None,
                user_id: None,
            },
        );
        match role {
            ClientRole::Agent => {
                rt.lobby.insert(client_id);
            }
            ClientRole::Admin => {
                rt.admins.insert(client_id);
            }
            ClientRole::User => {}
        }
    }

    if role == ClientRole::Agent {
        let items = core::queue_snapshot(state).await;
        emit_to_client(state, client_id, "queue:bootstrap", json!({ "items": items })).await;
    }
    if let Some(session_id) = str_field(data, "sessionId") {
        rejoin_session(state, client_id, session_id).await;
    }
    emit_to_client(state, client_id, "hello:ack", json!({ "clientId": client_id })).await;
}

async fn rejoin_session(state: &Arc<AppState>, client_id: usize, session_id: &str) {
    let session = match state.store.get_session(session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            send_ws_error(state, client_id, "session not found").await;
            return;
        }
        Err(err) => {
            send_ws_error(state, client_id, &err.to_string()).await;
            return;
        }
    };
    join_session_room(state, client_id, session_id).await;
    {
        let mut rt = state.realtime.lock().await;
        if let Some(identity) = rt.identities.get_mut(&client_id) {
            if identity.role == ClientRole::User {
                identity.user_id = Some(session.user_id.clone());
            }
        }
    }
    match state.store.messages_for_session(session_id).await {
        Ok(messages) => {
            emit_to_client(
                state,
                client_id,
                "message:history",
                json!({ "sessionId": session_id, "messages": messages, "status": session.status }),
            )
            .await;
        }
        Err(err) => send_ws_error(state, client_id, &err.to_string()).await,
    }
}

async fn handle_session_create(state: &Arc<AppState>, client_id: usize, data: &Value) {
    let display_name = str_field(data, "displayName").unwrap_or("Guest");
    let channel = str_field(data, "channel")
        .and_then(ChannelKind::parse)
        .unwrap_or(ChannelKind::Web);
    let session = match core::create_session(state, channel, display_name).await {
        Ok(session) => session,
        Err(err) => {
            send_ws_error(state, client_id, &err.to_string()).await;
            return;
        }
    };

    join_session_room(state, client_id, &session.id).await;
    {
        let mut rt = state.realtime.lock().await;
        if let Some(identity) = rt.identities.get_mut(&client_id) {
            identity.user_id = Some(session.user_id.clone());
        }
    }
    emit_to_client(state, client_id, "session:created", &session).await;

    let name = display_name.trim();
    let greeting = format!(
        "Hi {}! How can I help you today?",
        if name.is_empty() { "there" } else { name }
    );
    if let Err(err) = core::record_message(state, &session.id, SenderType::Agent, &greeting).await {
        warn!(session_id = %session.id, error = %err, "greeting failed");
    }
}

async fn handle_session_join(state: &Arc<AppState>, client_id: usize, data: &Value) {
    let Some(session_id) = str_field(data, "sessionId") else {
        send_ws_error(state, client_id, "sessionId required").await;
        return;
    };
    rejoin_session(state, client_id, session_id).await;
}

async fn handle_message_send(state: &Arc<AppState>, client_id: usize, data: &Value) {
    let (Some(session_id), Some(text)) = (str_field(data, "sessionId"), str_field(data, "text"))
    else {
        send_ws_error(state, client_id, "sessionId and text required").await;
        return;
    };
    let Some(identity) = client_identity(state, client_id).await else {
        send_ws_error(state, client_id, "say hello first").await;
        return;
    };

    let result = match identity.role {
        ClientRole::Agent | ClientRole::Admin => {
            core::record_message(state, session_id, SenderType::Agent, text).await
        }
        ClientRole::User => core::handle_user_message(state, session_id, text).await,
    };
    if let Err(err) = result {
        send_ws_error(state, client_id, &err.to_string()).await;
    }
}

async fn handle_handoff_request(state: &Arc<AppState>, client_id: usize, data: &Value) {
    let Some(session_id) = str_field(data, "sessionId") else {
        send_ws_error(state, client_id, "sessionId required").await;
        return;
    };
    if let Err(err) = core::request_handoff(state, session_id).await {
        send_ws_error(state, client_id, &err.to_string()).await;
    }
}

/// Claim races resolve in the store; the loser gets `claim:rejected` and the
/// queue entry disappears for everyone exactly once, driven by the winner.
async fn handle_agent_claim(state: &Arc<AppState>, client_id: usize, data: &Value) {
    let Some(request_id) = str_field(data, "handoffRequestId") else {
        send_ws_error(state, client_id, "handoffRequestId required").await;
        return;
    };
    let agent = match core::ensure_agent_user(state, client_id).await {
        Ok(agent) => agent,
        Err(_) => {
            send_ws_error(state, client_id, "agents only").await;
            return;
        }
    };
    match core::claim_handoff(state, request_id, &agent, Some(client_id)).await {
        Ok(session_id) => {
            emit_to_client(
                state,
                client_id,
                "claim:accepted",
                json!({ "handoffRequestId": request_id, "sessionId": session_id }),
            )
            .await;
        }
        Err(err @ (CoreError::AlreadyAccepted | CoreError::Conflict(_))) => {
            emit_to_client(
                state,
                client_id,
                "claim:rejected",
                json!({ "handoffRequestId": request_id, "reason": err.to_string() }),
            )
            .await;
        }
        Err(err) => send_ws_error(state, client_id, &err.to_string()).await,
    }
}

async fn handle_end_request(state: &Arc<AppState>, client_id: usize, data: &Value) {
    let Some(session_id) = str_field(data, "sessionId") else {
        send_ws_error(state, client_id, "sessionId required").await;
        return;
    };
    let Some(identity) = client_identity(state, client_id).await else {
        send_ws_error(state, client_id, "say hello first").await;
        return;
    };
    let requested_by = match identity.role {
        ClientRole::User => PartyRole::User,
        ClientRole::Agent | ClientRole::Admin => PartyRole::Agent,
    };
    if let Err(err) = core::request_end(state, session_id, requested_by).await {
        send_ws_error(state, client_id, &err.to_string()).await;
    }
}

async fn party_for(state: &Arc<AppState>, client_id: usize) -> Option<Party> {
    let identity = client_identity(state, client_id).await?;
    match identity.role {
        ClientRole::Agent => {
            let agent = core::ensure_agent_user(state, client_id).await.ok()?;
            Some(Party {
                role: PartyRole::Agent,
                actor_id: Some(agent.agent_id),
                display_name: agent.display_name,
            })
        }
        ClientRole::User => Some(Party {
            role: PartyRole::User,
            actor_id: identity.user_id.clone(),
            display_name: identity.display_name,
        }),
        ClientRole::Admin => Some(Party {
            role: PartyRole::Agent,
            actor_id: identity.agent_id.clone(),
            display_name: identity.display_name,
        }),
    }
}

async fn handle_end_response(
    state: &Arc<AppState>,
    client_id: usize,
    data: &Value,
    decision: EndDecision,
) {
    let Some(request_id) = str_field(data, "requestId") else {
        send_ws_error(state, client_id, "requestId required").await;
        return;
    };
    let Some(party) = party_for(state, client_id).await else {
        send_ws_error(state, client_id, "say hello first").await;
        return;
    };
    if let Err(err) = core::respond_end(state, request_id, decision, &party).await {
        send_ws_error(state, client_id, &err.to_string()).await;
    }
}

async fn handle_session_close(state: &Arc<AppState>, client_id: usize, data: &Value) {
    let Some(session_id) = str_field(data, "sessionId") else {
        send_ws_error(state, client_id, "sessionId required").await;
        return;
    };
    let Some(party) = party_for(state, client_id).await else {
        send_ws_error(state, client_id, "say hello first").await;
        return;
    };
    if let Err(err) = core::force_close(state, session_id, &party).await {
        send_ws_error(state, client_id, &err.to_string()).await;
    }
}

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let database_url = std::env::var("DATABASE_URL")?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let http = reqwest::Client::new();
    let store = Arc::new(PgStore::new(pool));
    let responder = Arc::new(OpenAiResponder::from_env(http.clone()));
    let events = EventBus::from_env(http.clone());
    let gateway = WhatsappGateway::from_env(http);
    if gateway.is_none() {
        info!("whatsapp gateway not configured; channel disabled");
    }
    let state = core::app_state(store, responder, events, gateway);

    let restored = core::rebuild_queue(&state).await?;
    info!(restored, "handoff queue rebuilt from store");

    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "relay server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
