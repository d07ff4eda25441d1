use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use relay_server::bot::Responder;
use relay_server::core::{
    self, AgentIdentity, EndDecision, EndRequestOutcome, HandoffOutcome, Party,
};
use relay_server::error::CoreError;
use relay_server::events::EventBus;
use relay_server::realtime::{join_session_room, ClientIdentity, ClientRole};
use relay_server::store::MemoryStore;
use relay_server::types::{
    now_iso, AppState, ChannelKind, ChatMessage, ChatUser, PartyRole, SenderType, SessionStatus,
};

struct ScriptedResponder(&'static str);

#[async_trait]
impl Responder for ScriptedResponder {
    async fn respond(
        &self,
        _session_id: &str,
        _text: &str,
        _history: &[ChatMessage],
    ) -> Result<String, CoreError> {
        Ok(self.0.to_string())
    }
}

struct FailingResponder;

#[async_trait]
impl Responder for FailingResponder {
    async fn respond(
        &self,
        _session_id: &str,
        _text: &str,
        _history: &[ChatMessage],
    ) -> Result<String, CoreError> {
        Err(CoreError::Upstream("scripted outage".to_string()))
    }
}

fn new_state() -> Arc<AppState> {
    core::app_state(
        Arc::new(MemoryStore::new()),
        Arc::new(ScriptedResponder("Happy to help!")),
        EventBus::disabled(),
        None,
    )
}

async fn attach(
    state: &Arc<AppState>,
    client_id: usize,
    role: ClientRole,
    name: &str,
) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut rt = state.realtime.lock().await;
    rt.clients.insert(client_id, tx);
    rt.identities.insert(
        client_id,
        ClientIdentity {
            role,
            display_name: name.to_string(),
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
    rx
}

fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(raw) = rx.try_recv() {
        frames.push(serde_json::from_str(&raw).expect("frames are json"));
    }
    frames
}

fn frames_named<'a>(frames: &'a [Value], event: &str) -> Vec<&'a Value> {
    frames
        .iter()
        .filter(|frame| frame["event"] == event)
        .collect()
}

async fn make_agent(state: &Arc<AppState>, name: &str) -> AgentIdentity {
    let agent = ChatUser {
        id: Uuid::new_v4().to_string(),
        role: PartyRole::Agent,
        display_name: name.to_string(),
        created_at: now_iso(),
    };
    state.store.insert_user(&agent).await.unwrap();
    AgentIdentity {
        agent_id: agent.id,
        display_name: name.to_string(),
    }
}

async fn queued_session(state: &Arc<AppState>) -> (String, String) {
    let session = core::create_session(state, ChannelKind::Web, "Ada")
        .await
        .unwrap();
    core::record_message(state, &session.id, SenderType::User, "my order is stuck")
        .await
        .unwrap();
    let outcome = core::request_handoff(state, &session.id).await.unwrap();
    let HandoffOutcome::Queued(request) = outcome else {
        panic!("fresh session should enqueue");
    };
    (session.id, request.id)
}

fn agent_party(agent: &AgentIdentity) -> Party {
    Party {
        role: PartyRole::Agent,
        actor_id: Some(agent.agent_id.clone()),
        display_name: agent.display_name.clone(),
    }
}

fn user_party(user_id: &str) -> Party {
    Party {
        role: PartyRole::User,
        actor_id: Some(user_id.to_string()),
        display_name: "Ada".to_string(),
    }
}

#[tokio::test]
async fn concurrent_claims_produce_exactly_one_assignment() {
    let state = new_state();
    let (session_id, request_id) = queued_session(&state).await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let state = state.clone();
        let request_id = request_id.clone();
        handles.push(tokio::spawn(async move {
            let agent = make_agent(&state, &format!("Agent {i}")).await;
            core::claim_handoff(&state, &request_id, &agent, None).await
        }));
    }

    let mut wins = 0;
    let mut rejections = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(won_session) => {
                assert_eq!(won_session, session_id);
                wins += 1;
            }
            Err(CoreError::AlreadyAccepted) => rejections += 1,
            Err(other) => panic!("unexpected claim error: {other}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(rejections, 7);

    let assignments = state
        .store
        .assignments_for_session(&session_id)
        .await
        .unwrap();
    assert_eq!(assignments.len(), 1);
    assert!(assignments[0].ended_at.is_none());

    let session = state.store.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::ActiveWithAgent);
}

#[tokio::test]
async fn enqueue_is_idempotent_while_a_request_is_outstanding() {
    let state = new_state();
    let (session_id, first_request) = queued_session(&state).await;

    let second = core::request_handoff(&state, &session_id).await.unwrap();
    let HandoffOutcome::AlreadyQueued(existing) = second else {
        panic!("second enqueue must be a no-op");
    };
    assert_eq!(existing.id, first_request);

    // Repeated keyword triggers from the user change nothing either.
    core::handle_user_message(&state, &session_id, "agent please")
        .await
        .unwrap();
    core::handle_user_message(&state, &session_id, "HUMAN. now.")
        .await
        .unwrap();

    let open = state.store.open_handoff_requests().await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(state.queue.lock().await.len(), 1);
}

#[tokio::test]
async fn keyword_message_queues_and_notifies_the_lobby() {
    let state = new_state();
    let mut lobby_rx = attach(&state, 1, ClientRole::Agent, "Sam").await;

    let session = core::create_session(&state, ChannelKind::Web, "Ada")
        .await
        .unwrap();
    core::handle_user_message(&state, &session.id, "I need help from a person")
        .await
        .unwrap();

    let session = state.store.get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::QueuedForAgent);

    let frames = drain(&mut lobby_rx);
    let queue_new = frames_named(&frames, "queue:new");
    assert_eq!(queue_new.len(), 1);
    let preview = queue_new[0]["data"]["preview"].as_array().unwrap();
    assert!(preview
        .iter()
        .any(|m| m["text"] == "I need help from a person"));
    assert_eq!(queue_new[0]["data"]["channel"], "web");
}

#[tokio::test]
async fn losing_claim_gets_already_accepted_and_queue_remove_fires_once() {
    let state = new_state();
    let mut lobby_rx = attach(&state, 1, ClientRole::Agent, "Watcher").await;
    let (session_id, request_id) = queued_session(&state).await;

    let first = make_agent(&state, "Sam").await;
    let second = make_agent(&state, "Alex").await;

    let won = core::claim_handoff(&state, &request_id, &first, None)
        .await
        .unwrap();
    assert_eq!(won, session_id);
    let err = core::claim_handoff(&state, &request_id, &second, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::AlreadyAccepted));

    let frames = drain(&mut lobby_rx);
    let removes = frames_named(&frames, "queue:remove");
    assert_eq!(removes.len(), 1);
    assert_eq!(removes[0]["data"]["handoffRequestId"], request_id.as_str());
    assert!(state.queue.lock().await.is_empty());
}

#[tokio::test]
async fn winner_joins_the_room_and_receives_history() {
    let state = new_state();
    let mut agent_rx = attach(&state, 7, ClientRole::Agent, "Sam").await;
    let (session_id, request_id) = queued_session(&state).await;
    drain(&mut agent_rx);

    let agent = make_agent(&state, "Sam").await;
    core::claim_handoff(&state, &request_id, &agent, Some(7))
        .await
        .unwrap();

    let frames = drain(&mut agent_rx);
    let history = frames_named(&frames, "message:history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["data"]["sessionId"], session_id.as_str());
    assert!(!history[0]["data"]["messages"].as_array().unwrap().is_empty());
    let accepted = frames_named(&frames, "handoff:accepted");
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0]["data"]["agentName"], "Sam");
}

#[tokio::test]
async fn claim_against_a_closed_session_drops_the_stale_entry() {
    let state = new_state();
    let mut lobby_rx = attach(&state, 1, ClientRole::Agent, "Watcher").await;
    let (session_id, request_id) = queued_session(&state).await;

    let closer = make_agent(&state, "Supervisor").await;
    core::force_close(&state, &session_id, &agent_party(&closer))
        .await
        .unwrap();

    let claimer = make_agent(&state, "Sam").await;
    let err = core::claim_handoff(&state, &request_id, &claimer, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    let frames = drain(&mut lobby_rx);
    assert_eq!(frames_named(&frames, "queue:remove").len(), 1);
    assert!(state.queue.lock().await.is_empty());
    // The losing claim left no assignment behind.
    let assignments = state
        .store
        .assignments_for_session(&session_id)
        .await
        .unwrap();
    assert!(assignments.is_empty());
}

#[tokio::test]
async fn end_requests_are_mutually_exclusive_while_pending() {
    let state = new_state();
    let (session_id, request_id) = queued_session(&state).await;
    let agent = make_agent(&state, "Sam").await;
    core::claim_handoff(&state, &request_id, &agent, None)
        .await
        .unwrap();

    let first = core::request_end(&state, &session_id, PartyRole::User)
        .await
        .unwrap();
    let EndRequestOutcome::Requested(pending) = first else {
        panic!("first end request should be created");
    };

    // Second request from either side is a no-op carrying the pending one.
    let repeat = core::request_end(&state, &session_id, PartyRole::Agent)
        .await
        .unwrap();
    let EndRequestOutcome::AlreadyPending(existing) = repeat else {
        panic!("second end request must not create a row");
    };
    assert_eq!(existing.id, pending.id);
}

#[tokio::test]
async fn only_the_other_party_may_respond_to_an_end_request() {
    let state = new_state();
    let (session_id, request_id) = queued_session(&state).await;
    let agent = make_agent(&state, "Sam").await;
    core::claim_handoff(&state, &request_id, &agent, None)
        .await
        .unwrap();
    let session = state.store.get_session(&session_id).await.unwrap().unwrap();

    let EndRequestOutcome::Requested(pending) =
        core::request_end(&state, &session_id, PartyRole::User)
            .await
            .unwrap()
    else {
        panic!("end request should be created");
    };

    let err = core::respond_end(
        &state,
        &pending.id,
        EndDecision::Accept,
        &user_party(&session.user_id),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CoreError::Unauthorized));

    core::respond_end(&state, &pending.id, EndDecision::Accept, &agent_party(&agent))
        .await
        .unwrap();
    let session = state.store.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Closed);
    assert!(session.closed_at.is_some());
}

#[tokio::test]
async fn declined_end_request_allows_a_fresh_one() {
    let state = new_state();
    let (session_id, request_id) = queued_session(&state).await;
    let agent = make_agent(&state, "Sam").await;
    core::claim_handoff(&state, &request_id, &agent, None)
        .await
        .unwrap();

    let EndRequestOutcome::Requested(first) =
        core::request_end(&state, &session_id, PartyRole::User)
            .await
            .unwrap()
    else {
        panic!("end request should be created");
    };
    core::respond_end(&state, &first.id, EndDecision::Decline, &agent_party(&agent))
        .await
        .unwrap();

    let session = state.store.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::ActiveWithAgent);

    let EndRequestOutcome::Requested(second) =
        core::request_end(&state, &session_id, PartyRole::User)
            .await
            .unwrap()
    else {
        panic!("a declined request must not block a new one");
    };
    assert_ne!(second.id, first.id);

    // The resolved request cannot be re-resolved.
    let err = core::respond_end(&state, &first.id, EndDecision::Accept, &agent_party(&agent))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));
}

#[tokio::test]
async fn close_is_idempotent_and_upserts_one_summary() {
    let state = new_state();
    let (session_id, request_id) = queued_session(&state).await;
    let agent = make_agent(&state, "Sam").await;
    core::claim_handoff(&state, &request_id, &agent, None)
        .await
        .unwrap();
    core::record_message(&state, &session_id, SenderType::Agent, "Looking into it now")
        .await
        .unwrap();

    let first = core::close_session(&state, &session_id, PartyRole::Agent, Some(PartyRole::User))
        .await
        .unwrap();
    let second = core::close_session(&state, &session_id, PartyRole::Agent, Some(PartyRole::User))
        .await
        .unwrap();
    assert_eq!(first.ended_at, second.ended_at);

    let summary = state
        .store
        .get_summary(&session_id)
        .await
        .unwrap()
        .expect("summary must exist after close");
    assert_eq!(summary.agent_display_name, "Sam");
    assert_eq!(summary.user_display_name, "Ada");
    assert!(summary.summary.contains("ended by agent"));
    assert!(summary.summary.contains("requested by user"));
    assert!(summary.topics.iter().any(|topic| topic == "order"));
}

#[tokio::test]
async fn closed_sessions_reject_further_traffic() {
    let state = new_state();
    let session = core::create_session(&state, ChannelKind::Web, "Ada")
        .await
        .unwrap();
    let closer = make_agent(&state, "Sam").await;
    core::force_close(&state, &session.id, &agent_party(&closer))
        .await
        .unwrap();

    let err = core::handle_user_message(&state, &session.id, "hello?")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));
    let err = core::request_handoff(&state, &session.id).await.unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));
    let err = core::request_end(&state, &session.id, PartyRole::User)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));
}

#[tokio::test]
async fn force_close_requires_an_agent() {
    let state = new_state();
    let session = core::create_session(&state, ChannelKind::Web, "Ada")
        .await
        .unwrap();
    let err = core::force_close(&state, &session.id, &user_party(&session.user_id))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Unauthorized));
}

#[tokio::test]
async fn bot_answers_while_session_is_bot_pending() {
    let state = new_state();
    let session = core::create_session(&state, ChannelKind::Web, "Ada")
        .await
        .unwrap();
    core::handle_user_message(&state, &session.id, "where is my order")
        .await
        .unwrap();

    let messages = state.store.messages_for_session(&session.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].sender_type, SenderType::Agent);
    assert_eq!(messages[1].text, "Happy to help!");

    // Status unchanged: still bot-owned.
    let session = state.store.get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::BotPending);
}

#[tokio::test]
async fn responder_outage_degrades_to_the_fallback_reply() {
    let state = core::app_state(
        Arc::new(MemoryStore::new()),
        Arc::new(FailingResponder),
        EventBus::disabled(),
        None,
    );
    let session = core::create_session(&state, ChannelKind::Web, "Ada")
        .await
        .unwrap();
    core::handle_user_message(&state, &session.id, "where is my order")
        .await
        .unwrap();

    let messages = state.store.messages_for_session(&session.id).await.unwrap();
    assert_eq!(messages.last().unwrap().text, relay_server::bot::FALLBACK_REPLY);
}

#[tokio::test]
async fn bot_stays_out_of_agent_owned_sessions() {
    let state = new_state();
    let (session_id, request_id) = queued_session(&state).await;
    let agent = make_agent(&state, "Sam").await;
    core::claim_handoff(&state, &request_id, &agent, None)
        .await
        .unwrap();

    let before = state
        .store
        .messages_for_session(&session_id)
        .await
        .unwrap()
        .len();
    core::handle_user_message(&state, &session_id, "are you there?")
        .await
        .unwrap();
    let messages = state.store.messages_for_session(&session_id).await.unwrap();
    // Exactly the user turn was added; no bot reply, no re-queue.
    assert_eq!(messages.len(), before + 1);
    assert!(state.queue.lock().await.is_empty());
}

#[tokio::test]
async fn queue_rebuild_restores_unclaimed_requests_only() {
    let state = new_state();
    let (open_session, open_request) = queued_session(&state).await;
    let (claimed_session, claimed_request) = queued_session(&state).await;
    let (closed_session, _closed_request) = queued_session(&state).await;

    let agent = make_agent(&state, "Sam").await;
    core::claim_handoff(&state, &claimed_request, &agent, None)
        .await
        .unwrap();
    core::force_close(&state, &closed_session, &agent_party(&agent))
        .await
        .unwrap();

    // Simulate a restart losing the in-memory projection.
    state.queue.lock().await.clear();
    let restored = core::rebuild_queue(&state).await.unwrap();
    assert_eq!(restored, 1);

    let items = core::queue_snapshot(&state).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].handoff_request_id, open_request);
    assert_eq!(items[0].session_id, open_session);
    assert!(items.iter().all(|item| item.session_id != claimed_session));
}

#[tokio::test]
async fn room_members_see_messages_and_close_notifications() {
    let state = new_state();
    let session = core::create_session(&state, ChannelKind::Web, "Ada")
        .await
        .unwrap();
    let mut user_rx = attach(&state, 3, ClientRole::User, "Ada").await;
    join_session_room(&state, 3, &session.id).await;

    core::record_message(&state, &session.id, SenderType::Agent, "One moment")
        .await
        .unwrap();
    let closer = make_agent(&state, "Sam").await;
    core::force_close(&state, &session.id, &agent_party(&closer))
        .await
        .unwrap();

    let frames = drain(&mut user_rx);
    assert_eq!(frames_named(&frames, "message:new").len(), 1);
    let closed = frames_named(&frames, "session:closed");
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0]["data"]["endedBy"], "agent");
}
