use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::types::AppState;

/// Role a connection declared at `hello` time. Privileged operations
/// (claim, force-close, end-response) check this identity, never payload
/// fields supplied by the client on later frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    User,
    Agent,
    Admin,
}

#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub role: ClientRole,
    pub display_name: String,
    /// users-table id, lazily created for agents on their first claim.
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Default)]
pub struct RealtimeState {
    pub clients: HashMap<usize, mpsc::UnboundedSender<String>>,
    pub identities: HashMap<usize, ClientIdentity>,
    /// Agent clients eligible for queue broadcasts.
    pub lobby: HashSet<usize>,
    pub admins: HashSet<usize>,
    pub session_rooms: HashMap<String, HashSet<usize>>,
    pub rooms_by_client: HashMap<usize, HashSet<String>>,
}

impl RealtimeState {
    pub fn join_room(&mut self, client_id: usize, session_id: &str) {
        self.session_rooms
            .entry(session_id.to_string())
            .or_default()
            .insert(client_id);
        self.rooms_by_client
            .entry(client_id)
            .or_default()
            .insert(session_id.to_string());
    }

    pub fn remove_client(&mut self, client_id: usize) {
        self.clients.remove(&client_id);
        self.identities.remove(&client_id);
        self.lobby.remove(&client_id);
        self.admins.remove(&client_id);
        if let Some(rooms) = self.rooms_by_client.remove(&client_id) {
            for session_id in rooms {
                if let Some(members) = self.session_rooms.get_mut(&session_id) {
                    members.remove(&client_id);
                }
            }
        }
    }
}

pub fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

pub async fn emit_to_client<T: Serialize>(
    state: &Arc<AppState>,
    client_id: usize,
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };

    let tx = {
        let rt = state.realtime.lock().await;
        rt.clients.get(&client_id).cloned()
    };

    if let Some(sender) = tx {
        let _ = sender.send(payload);
    }
}

pub async fn emit_to_clients<T: Serialize + Clone>(
    state: &Arc<AppState>,
    client_ids: &[usize],
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };

    let senders = {
        let rt = state.realtime.lock().await;
        client_ids
            .iter()
            .filter_map(|id| rt.clients.get(id).cloned())
            .collect::<Vec<_>>()
    };

    for sender in senders {
        let _ = sender.send(payload.clone());
    }
}

pub async fn lobby_clients(state: &Arc<AppState>) -> Vec<usize> {
    let rt = state.realtime.lock().await;
    rt.lobby.iter().copied().collect()
}

pub async fn admin_clients(state: &Arc<AppState>) -> Vec<usize> {
    let rt = state.realtime.lock().await;
    rt.admins.iter().copied().collect()
}

pub async fn room_clients(state: &Arc<AppState>, session_id: &str) -> Vec<usize> {
    let rt = state.realtime.lock().await;
    rt.session_rooms
        .get(session_id)
        .map(|members| members.iter().copied().collect())
        .unwrap_or_default()
}

pub async fn join_session_room(state: &Arc<AppState>, client_id: usize, session_id: &str) {
    let mut rt = state.realtime.lock().await;
    rt.join_room(client_id, session_id);
}

pub async fn client_identity(state: &Arc<AppState>, client_id: usize) -> Option<ClientIdentity> {
    let rt = state.realtime.lock().await;
    rt.identities.get(&client_id).cloned()
}

pub async fn emit_to_room<T: Serialize + Clone>(
    state: &Arc<AppState>,
    session_id: &str,
    event: &str,
    data: T,
) {
    let recipients = room_clients(state, session_id).await;
    emit_to_clients(state, &recipients, event, data).await;
}

pub async fn emit_to_lobby<T: Serialize + Clone>(state: &Arc<AppState>, event: &str, data: T) {
    let recipients = lobby_clients(state).await;
    emit_to_clients(state, &recipients, event, data).await;
}

pub async fn emit_to_admins<T: Serialize + Clone>(state: &Arc<AppState>, event: &str, data: T) {
    let recipients = admin_clients(state).await;
    emit_to_clients(state, &recipients, event, data).await;
}
