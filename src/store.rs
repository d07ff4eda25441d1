use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};

use crate::error::CoreError;
use crate::types::{
    AgentAssignment, ChannelKind, ChatMessage, ChatUser, EndChatRequest, EndRequestStatus,
    HandoffRequest, PartyRole, SenderType, Session, SessionStatus, SessionSummary,
};

/// The session store. Everything the handoff/queue engine persists goes
/// through here; the only concurrency-critical member is `accept_handoff`,
/// which must be a single atomic conditional update (never read-then-write).
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_user(&self, user: &ChatUser) -> Result<(), CoreError>;
    async fn get_user(&self, user_id: &str) -> Result<Option<ChatUser>, CoreError>;

    async fn insert_session(&self, session: &Session) -> Result<(), CoreError>;
    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, CoreError>;
    async fn set_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        closed_at: Option<&str>,
    ) -> Result<(), CoreError>;

    async fn insert_message(&self, message: &ChatMessage) -> Result<(), CoreError>;
    async fn messages_for_session(&self, session_id: &str) -> Result<Vec<ChatMessage>, CoreError>;
    async fn recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, CoreError>;

    async fn insert_handoff_request(&self, request: &HandoffRequest) -> Result<(), CoreError>;
    async fn get_handoff_request(
        &self,
        request_id: &str,
    ) -> Result<Option<HandoffRequest>, CoreError>;
    async fn open_handoff_request(
        &self,
        session_id: &str,
    ) -> Result<Option<HandoffRequest>, CoreError>;
    async fn open_handoff_requests(&self) -> Result<Vec<HandoffRequest>, CoreError>;
    /// Set accepted_at/accepted_by_id only while accepted_at is still null.
    /// Returns the number of rows affected: 1 for the winner, 0 for everyone else.
    async fn accept_handoff(
        &self,
        request_id: &str,
        agent_id: &str,
        accepted_at: &str,
    ) -> Result<u64, CoreError>;

    async fn insert_assignment(&self, assignment: &AgentAssignment) -> Result<(), CoreError>;
    async fn open_assignment(
        &self,
        session_id: &str,
    ) -> Result<Option<AgentAssignment>, CoreError>;
    async fn assignments_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<AgentAssignment>, CoreError>;

    async fn insert_end_request(&self, request: &EndChatRequest) -> Result<(), CoreError>;
    async fn get_end_request(&self, request_id: &str)
        -> Result<Option<EndChatRequest>, CoreError>;
    async fn pending_end_request(
        &self,
        session_id: &str,
    ) -> Result<Option<EndChatRequest>, CoreError>;
    /// Conditional: resolves the request only while it is still pending.
    async fn resolve_end_request(
        &self,
        request_id: &str,
        status: EndRequestStatus,
        resolved_at: &str,
        responded_by: &str,
    ) -> Result<bool, CoreError>;

    async fn upsert_summary(&self, summary: &SessionSummary) -> Result<(), CoreError>;
    async fn get_summary(&self, session_id: &str) -> Result<Option<SessionSummary>, CoreError>;
}

// ---------------- Postgres ----------------

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn bad_row(what: &'static str) -> CoreError {
    CoreError::Store(format!("malformed {what} row"))
}

fn parse_session_row(row: &PgRow) -> Result<Session, CoreError> {
    let channel_raw: String = row.get("channel");
    let status_raw: String = row.get("status");
    Ok(Session {
        id: row.get("id"),
        channel: ChannelKind::parse(&channel_raw).ok_or_else(|| bad_row("session"))?,
        status: SessionStatus::parse(&status_raw).ok_or_else(|| bad_row("session"))?,
        user_id: row.get("user_id"),
        created_at: row.get("created_at"),
        closed_at: row.get("closed_at"),
    })
}

fn parse_message_row(row: &PgRow) -> Result<ChatMessage, CoreError> {
    let sender_raw: String = row.get("sender_type");
    Ok(ChatMessage {
        id: row.get("id"),
        session_id: row.get("session_id"),
        sender_type: SenderType::parse(&sender_raw).ok_or_else(|| bad_row("message"))?,
        text: row.get("text"),
        created_at: row.get("created_at"),
    })
}

fn parse_handoff_row(row: &PgRow) -> HandoffRequest {
    HandoffRequest {
        id: row.get("id"),
        session_id: row.get("session_id"),
        created_at: row.get("created_at"),
        accepted_at: row.get("accepted_at"),
        accepted_by_id: row.get("accepted_by_id"),
    }
}

fn parse_assignment_row(row: &PgRow) -> AgentAssignment {
    AgentAssignment {
        id: row.get("id"),
        agent_id: row.get("agent_id"),
        session_id: row.get("session_id"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
    }
}

fn parse_end_request_row(row: &PgRow) -> Result<EndChatRequest, CoreError> {
    let requested_by_raw: String = row.get("requested_by");
    let status_raw: String = row.get("status");
    Ok(EndChatRequest {
        id: row.get("id"),
        session_id: row.get("session_id"),
        requested_by: PartyRole::parse(&requested_by_raw).ok_or_else(|| bad_row("end request"))?,
        status: EndRequestStatus::parse(&status_raw).ok_or_else(|| bad_row("end request"))?,
        created_at: row.get("created_at"),
        accepted_at: row.get("accepted_at"),
        declined_at: row.get("declined_at"),
        accepted_by_id: row.get("accepted_by_id"),
    })
}

#[async_trait]
impl SessionStore for PgStore {
    async fn insert_user(&self, user: &ChatUser) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO users (id, role, display_name, created_at) VALUES ($1,$2,$3,$4)",
        )
        .bind(&user.id)
        .bind(user.role.as_str())
        .bind(&user.display_name)
        .bind(&user.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<ChatUser>, CoreError> {
        let row = sqlx::query("SELECT id, role, display_name, created_at FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let role_raw: String = row.get("role");
            Ok(ChatUser {
                id: row.get("id"),
                role: PartyRole::parse(&role_raw).ok_or_else(|| bad_row("user"))?,
                display_name: row.get("display_name"),
                created_at: row.get("created_at"),
            })
        })
        .transpose()
    }

    async fn insert_session(&self, session: &Session) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO sessions (id, channel, status, user_id, created_at, closed_at) \
             VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(&session.id)
        .bind(session.channel.as_str())
        .bind(session.status.as_str())
        .bind(&session.user_id)
        .bind(&session.created_at)
        .bind(&session.closed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, CoreError> {
        let row = sqlx::query(
            "SELECT id, channel, status, user_id, created_at, closed_at FROM sessions WHERE id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_session_row).transpose()
    }

    async fn set_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        closed_at: Option<&str>,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE sessions SET status = $1, closed_at = COALESCE($2, closed_at) WHERE id = $3")
            .bind(status.as_str())
            .bind(closed_at)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_message(&self, message: &ChatMessage) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO messages (id, session_id, sender_type, text, created_at) \
             VALUES ($1,$2,$3,$4,$5) ON CONFLICT (id) DO NOTHING",
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(message.sender_type.as_str())
        .bind(&message.text)
        .bind(&message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn messages_for_session(&self, session_id: &str) -> Result<Vec<ChatMessage>, CoreError> {
        let rows = sqlx::query(
            "SELECT id, session_id, sender_type, text, created_at FROM messages \
             WHERE session_id = $1 ORDER BY created_at ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_message_row).collect()
    }

    async fn recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, CoreError> {
        let rows = sqlx::query(
            "SELECT id, session_id, sender_type, text, created_at FROM messages \
             WHERE session_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut messages = rows
            .iter()
            .map(parse_message_row)
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn insert_handoff_request(&self, request: &HandoffRequest) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO handoff_requests (id, session_id, created_at, accepted_at, accepted_by_id) \
             VALUES ($1,$2,$3,$4,$5)",
        )
        .bind(&request.id)
        .bind(&request.session_id)
        .bind(&request.created_at)
        .bind(&request.accepted_at)
        .bind(&request.accepted_by_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_handoff_request(
        &self,
        request_id: &str,
    ) -> Result<Option<HandoffRequest>, CoreError> {
        let row = sqlx::query(
            "SELECT id, session_id, created_at, accepted_at, accepted_by_id \
             FROM handoff_requests WHERE id = $1",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(parse_handoff_row))
    }

    async fn open_handoff_request(
        &self,
        session_id: &str,
    ) -> Result<Option<HandoffRequest>, CoreError> {
        let row = sqlx::query(
            "SELECT id, session_id, created_at, accepted_at, accepted_by_id \
             FROM handoff_requests WHERE session_id = $1 AND accepted_at IS NULL \
             ORDER BY created_at ASC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(parse_handoff_row))
    }

    async fn open_handoff_requests(&self) -> Result<Vec<HandoffRequest>, CoreError> {
        let rows = sqlx::query(
            "SELECT id, session_id, created_at, accepted_at, accepted_by_id \
             FROM handoff_requests WHERE accepted_at IS NULL ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(parse_handoff_row).collect())
    }

    async fn accept_handoff(
        &self,
        request_id: &str,
        agent_id: &str,
        accepted_at: &str,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "UPDATE handoff_requests SET accepted_at = $1, accepted_by_id = $2 \
             WHERE id = $3 AND accepted_at IS NULL",
        )
        .bind(accepted_at)
        .bind(agent_id)
        .bind(request_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_assignment(&self, assignment: &AgentAssignment) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO agent_assignments (id, agent_id, session_id, started_at, ended_at) \
             VALUES ($1,$2,$3,$4,$5)",
        )
        .bind(&assignment.id)
        .bind(&assignment.agent_id)
        .bind(&assignment.session_id)
        .bind(&assignment.started_at)
        .bind(&assignment.ended_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn open_assignment(
        &self,
        session_id: &str,
    ) -> Result<Option<AgentAssignment>, CoreError> {
        let row = sqlx::query(
            "SELECT id, agent_id, session_id, started_at, ended_at FROM agent_assignments \
             WHERE session_id = $1 AND ended_at IS NULL ORDER BY started_at DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(parse_assignment_row))
    }

    async fn assignments_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<AgentAssignment>, CoreError> {
        let rows = sqlx::query(
            "SELECT id, agent_id, session_id, started_at, ended_at FROM agent_assignments \
             WHERE session_id = $1 ORDER BY started_at ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(parse_assignment_row).collect())
    }

    async fn insert_end_request(&self, request: &EndChatRequest) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO end_chat_requests \
             (id, session_id, requested_by, status, created_at, accepted_at, declined_at, accepted_by_id) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
        )
        .bind(&request.id)
        .bind(&request.session_id)
        .bind(request.requested_by.as_str())
        .bind(request.status.as_str())
        .bind(&request.created_at)
        .bind(&request.accepted_at)
        .bind(&request.declined_at)
        .bind(&request.accepted_by_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_end_request(
        &self,
        request_id: &str,
    ) -> Result<Option<EndChatRequest>, CoreError> {
        let row = sqlx::query(
            "SELECT id, session_id, requested_by, status, created_at, accepted_at, declined_at, accepted_by_id \
             FROM end_chat_requests WHERE id = $1",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_end_request_row).transpose()
    }

    async fn pending_end_request(
        &self,
        session_id: &str,
    ) -> Result<Option<EndChatRequest>, CoreError> {
        let row = sqlx::query(
            "SELECT id, session_id, requested_by, status, created_at, accepted_at, declined_at, accepted_by_id \
             FROM end_chat_requests WHERE session_id = $1 AND status = 'pending' \
             ORDER BY created_at ASC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_end_request_row).transpose()
    }

    async fn resolve_end_request(
        &self,
        request_id: &str,
        status: EndRequestStatus,
        resolved_at: &str,
        responded_by: &str,
    ) -> Result<bool, CoreError> {
        let (accepted_at, declined_at) = match status {
            EndRequestStatus::Accepted => (Some(resolved_at), None),
            EndRequestStatus::Declined => (None, Some(resolved_at)),
            EndRequestStatus::Pending => (None, None),
        };
        let result = sqlx::query(
            "UPDATE end_chat_requests \
             SET status = $1, accepted_at = $2, declined_at = $3, accepted_by_id = $4 \
             WHERE id = $5 AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(accepted_at)
        .bind(declined_at)
        .bind(responded_by)
        .bind(request_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_summary(&self, summary: &SessionSummary) -> Result<(), CoreError> {
        let topics = serde_json::to_string(&summary.topics).unwrap_or_else(|_| "[]".to_string());
        sqlx::query(
            r#"
            INSERT INTO session_summaries (
                session_id, user_display_name, agent_display_name, summary, topics,
                message_count, started_at, ended_at, ended_by, end_requested_by
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            ON CONFLICT (session_id) DO UPDATE SET
                user_display_name = EXCLUDED.user_display_name,
                agent_display_name = EXCLUDED.agent_display_name,
                summary = EXCLUDED.summary,
                topics = EXCLUDED.topics,
                message_count = EXCLUDED.message_count,
                started_at = EXCLUDED.started_at,
                ended_at = EXCLUDED.ended_at,
                ended_by = EXCLUDED.ended_by,
                end_requested_by = EXCLUDED.end_requested_by
            "#,
        )
        .bind(&summary.session_id)
        .bind(&summary.user_display_name)
        .bind(&summary.agent_display_name)
        .bind(&summary.summary)
        .bind(topics)
        .bind(summary.message_count)
        .bind(&summary.started_at)
        .bind(&summary.ended_at)
        .bind(summary.ended_by.as_str())
        .bind(summary.end_requested_by.map(|role| role.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_summary(&self, session_id: &str) -> Result<Option<SessionSummary>, CoreError> {
        let row = sqlx::query(
            "SELECT session_id, user_display_name, agent_display_name, summary, topics, \
                    message_count, started_at, ended_at, ended_by, end_requested_by \
             FROM session_summaries WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            let topics_raw: String = row.get("topics");
            let ended_by_raw: String = row.get("ended_by");
            let end_requested_by_raw: Option<String> = row.get("end_requested_by");
            Ok(SessionSummary {
                session_id: row.get("session_id"),
                user_display_name: row.get("user_display_name"),
                agent_display_name: row.get("agent_display_name"),
                summary: row.get("summary"),
                topics: serde_json::from_str(&topics_raw).unwrap_or_default(),
                message_count: row.get("message_count"),
                started_at: row.get("started_at"),
                ended_at: row.get("ended_at"),
                ended_by: PartyRole::parse(&ended_by_raw).ok_or_else(|| bad_row("summary"))?,
                end_requested_by: end_requested_by_raw.as_deref().and_then(PartyRole::parse),
            })
        })
        .transpose()
    }
}

// ---------------- In-memory ----------------

/// Store backed by process memory. Used by the test suite and as a dev
/// fallback when no DATABASE_URL is configured; the conditional accept is
/// made atomic by performing it under the single inner lock.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    users: HashMap<String, ChatUser>,
    sessions: HashMap<String, Session>,
    messages: Vec<ChatMessage>,
    handoff_requests: Vec<HandoffRequest>,
    assignments: Vec<AgentAssignment>,
    end_requests: Vec<EndChatRequest>,
    summaries: HashMap<String, SessionSummary>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_user(&self, user: &ChatUser) -> Result<(), CoreError> {
        self.lock().users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<ChatUser>, CoreError> {
        Ok(self.lock().users.get(user_id).cloned())
    }

    async fn insert_session(&self, session: &Session) -> Result<(), CoreError> {
        self.lock().sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, CoreError> {
        Ok(self.lock().sessions.get(session_id).cloned())
    }

    async fn set_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        closed_at: Option<&str>,
    ) -> Result<(), CoreError> {
        let mut inner = self.lock();
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.status = status;
            if let Some(at) = closed_at {
                session.closed_at = Some(at.to_string());
            }
        }
        Ok(())
    }

    async fn insert_message(&self, message: &ChatMessage) -> Result<(), CoreError> {
        self.lock().messages.push(message.clone());
        Ok(())
    }

    async fn messages_for_session(&self, session_id: &str) -> Result<Vec<ChatMessage>, CoreError> {
        let mut messages = self
            .lock()
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect::<Vec<_>>();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }

    async fn recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, CoreError> {
        let messages = self.messages_for_session(session_id).await?;
        let start = messages.len().saturating_sub(limit);
        Ok(messages[start..].to_vec())
    }

    async fn insert_handoff_request(&self, request: &HandoffRequest) -> Result<(), CoreError> {
        self.lock().handoff_requests.push(request.clone());
        Ok(())
    }

    async fn get_handoff_request(
        &self,
        request_id: &str,
    ) -> Result<Option<HandoffRequest>, CoreError> {
        Ok(self
            .lock()
            .handoff_requests
            .iter()
            .find(|r| r.id == request_id)
            .cloned())
    }

    async fn open_handoff_request(
        &self,
        session_id: &str,
    ) -> Result<Option<HandoffRequest>, CoreError> {
        Ok(self
            .lock()
            .handoff_requests
            .iter()
            .find(|r| r.session_id == session_id && r.accepted_at.is_none())
            .cloned())
    }

    async fn open_handoff_requests(&self) -> Result<Vec<HandoffRequest>, CoreError> {
        Ok(self
            .lock()
            .handoff_requests
            .iter()
            .filter(|r| r.accepted_at.is_none())
            .cloned()
            .collect())
    }

    async fn accept_handoff(
        &self,
        request_id: &str,
        agent_id: &str,
        accepted_at: &str,
    ) -> Result<u64, CoreError> {
        let mut inner = self.lock();
        match inner
            .handoff_requests
            .iter_mut()
            .find(|r| r.id == request_id && r.accepted_at.is_none())
        {
            Some(request) => {
                request.accepted_at = Some(accepted_at.to_string());
                request.accepted_by_id = Some(agent_id.to_string());
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn insert_assignment(&self, assignment: &AgentAssignment) -> Result<(), CoreError> {
        self.lock().assignments.push(assignment.clone());
        Ok(())
    }

    async fn open_assignment(
        &self,
        session_id: &str,
    ) -> Result<Option<AgentAssignment>, CoreError> {
        Ok(self
            .lock()
            .assignments
            .iter()
            .filter(|a| a.session_id == session_id && a.ended_at.is_none())
            .last()
            .cloned())
    }

    async fn assignments_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<AgentAssignment>, CoreError> {
        Ok(self
            .lock()
            .assignments
            .iter()
            .filter(|a| a.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn insert_end_request(&self, request: &EndChatRequest) -> Result<(), CoreError> {
        self.lock().end_requests.push(request.clone());
        Ok(())
    }

    async fn get_end_request(
        &self,
        request_id: &str,
    ) -> Result<Option<EndChatRequest>, CoreError> {
        Ok(self
            .lock()
            .end_requests
            .iter()
            .find(|r| r.id == request_id)
            .cloned())
    }

    async fn pending_end_request(
        &self,
        session_id: &str,
    ) -> Result<Option<EndChatRequest>, CoreError> {
        Ok(self
            .lock()
            .end_requests
            .iter()
            .find(|r| r.session_id == session_id && r.status == EndRequestStatus::Pending)
            .cloned())
    }

    async fn resolve_end_request(
        &self,
        request_id: &str,
        status: EndRequestStatus,
        resolved_at: &str,
        responded_by: &str,
    ) -> Result<bool, CoreError> {
        let mut inner = self.lock();
        match inner
            .end_requests
            .iter_mut()
            .find(|r| r.id == request_id && r.status == EndRequestStatus::Pending)
        {
            Some(request) => {
                request.status = status;
                request.accepted_by_id = Some(responded_by.to_string());
                match status {
                    EndRequestStatus::Accepted => {
                        request.accepted_at = Some(resolved_at.to_string())
                    }
                    EndRequestStatus::Declined => {
                        request.declined_at = Some(resolved_at.to_string())
                    }
                    EndRequestStatus::Pending => {}
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn upsert_summary(&self, summary: &SessionSummary) -> Result<(), CoreError> {
        self.lock()
            .summaries
            .insert(summary.session_id.clone(), summary.clone());
        Ok(())
    }

    async fn get_summary(&self, session_id: &str) -> Result<Option<SessionSummary>, CoreError> {
        Ok(self.lock().summaries.get(session_id).cloned())
    }
}
