use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::now_iso;

pub const TOPIC_SESSIONS: &str = "chat.sessions";
pub const TOPIC_MESSAGES: &str = "chat.messages";
pub const TOPIC_HANDOFFS: &str = "chat.handoffs";
pub const TOPIC_ASSIGNMENTS: &str = "chat.assignments";
pub const TOPIC_SUMMARIES: &str = "chat.summaries";

/// Breaker for the sink. One failed delivery trips it to Disabled for the
/// rest of the process lifetime; a restart is the re-enable path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Disabled,
    Connecting,
    Enabled,
}

struct BusInner {
    endpoint: Option<String>,
    http: reqwest::Client,
    state: Mutex<BusState>,
}

/// Fire-and-forget publisher of domain events. Publication failures are
/// logged and swallowed; the caller's control flow never depends on the bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(endpoint: Option<String>, http: reqwest::Client) -> Self {
        let endpoint = endpoint.filter(|url| !url.trim().is_empty());
        let state = if endpoint.is_some() {
            BusState::Connecting
        } else {
            BusState::Disabled
        };
        Self {
            inner: Arc::new(BusInner {
                endpoint,
                http,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn from_env(http: reqwest::Client) -> Self {
        Self::new(std::env::var("EVENT_BUS_URL").ok(), http)
    }

    pub fn disabled() -> Self {
        Self::new(None, reqwest::Client::new())
    }

    pub async fn state(&self) -> BusState {
        *self.inner.state.lock().await
    }

    pub fn envelope(event_type: &str, session_id: &str, data: Value) -> Value {
        json!({
            "eventId": Uuid::new_v4().to_string(),
            "eventType": event_type,
            "occurredAt": now_iso(),
            "sessionId": session_id,
            "data": data,
        })
    }

    /// Publish off the caller's path. Never blocks, never fails the caller.
    pub fn publish(&self, topic: &'static str, event_type: &'static str, session_id: &str, data: Value) {
        let bus = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            bus.publish_now(topic, event_type, &session_id, data).await;
        });
    }

    /// Awaitable variant of `publish`; still swallows every failure.
    pub async fn publish_now(
        &self,
        topic: &str,
        event_type: &str,
        session_id: &str,
        data: Value,
    ) {
        {
            let state = self.inner.state.lock().await;
            if *state == BusState::Disabled {
                return;
            }
        }
        let Some(endpoint) = self.inner.endpoint.as_deref() else {
            return;
        };

        let body = json!({
            "topic": topic,
            "key": session_id,
            "envelope": Self::envelope(event_type, session_id, data),
        });
        let result = self.inner.http.post(endpoint).json(&body).send().await;

        let mut state = self.inner.state.lock().await;
        match result {
            Ok(response) if response.status().is_success() => {
                *state = BusState::Enabled;
                debug!(topic, event_type, "event published");
            }
            Ok(response) => {
                warn!(topic, status = %response.status(), "event bus rejected publish; disabling");
                *state = BusState::Disabled;
            }
            Err(err) => {
                warn!(topic, error = %err, "event bus unreachable; disabling");
                *state = BusState::Disabled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_endpoint_means_disabled() {
        let bus = EventBus::new(None, reqwest::Client::new());
        assert_eq!(bus.state().await, BusState::Disabled);
        // Publishing while disabled is a silent no-op.
        bus.publish_now(TOPIC_SESSIONS, "SessionStarted", "s1", json!({})).await;
        assert_eq!(bus.state().await, BusState::Disabled);
    }

    #[tokio::test]
    async fn failed_delivery_trips_the_breaker_without_erroring() {
        // Port 9 (discard) is not listening; connect fails fast.
        let bus = EventBus::new(
            Some("http://127.0.0.1:9/events".to_string()),
            reqwest::Client::new(),
        );
        assert_eq!(bus.state().await, BusState::Connecting);
        bus.publish_now(TOPIC_MESSAGES, "MessageCreated", "s1", json!({"text": "hello"}))
            .await;
        assert_eq!(bus.state().await, BusState::Disabled);
        // Later publishes are skipped entirely.
        bus.publish_now(TOPIC_MESSAGES, "MessageCreated", "s1", json!({})).await;
        assert_eq!(bus.state().await, BusState::Disabled);
    }

    #[test]
    fn envelope_carries_required_fields() {
        let envelope = EventBus::envelope("SessionEnded", "s42", json!({"reason": "force"}));
        assert_eq!(envelope["eventType"], "SessionEnded");
        assert_eq!(envelope["sessionId"], "s42");
        assert!(envelope["eventId"].as_str().is_some_and(|id| !id.is_empty()));
        assert!(envelope["occurredAt"].as_str().is_some());
        assert_eq!(envelope["data"]["reason"], "force");
    }
}
