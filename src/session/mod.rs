// Session Store - ordered conversation history and fixed metadata per session
//
// A session's working directory and permitted capability set are a security
// boundary: both are fixed at creation. History is an append-only log;
// concurrent writers serialize through the map's exclusive entry access, so
// messages land in strict invocation order even when tasks share a session.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::CoreError;
use crate::gateway::{Capability, TokenUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Caller,
    Assistant,
}

/// One history entry. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Tier that actually produced this message (fallback may differ from
    /// the session's primary tier).
    pub tier: String,
    pub usage: TokenUsage,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: &str, tier: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
            tier: tier.to_string(),
            usage: TokenUsage::default(),
            duration_ms: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub name: Option<String>,
    pub working_dir: PathBuf,
    pub capabilities: Vec<Capability>,
    pub primary_tier: String,
    pub fallback_tier: Option<String>,
    /// The tool's own conversation id, captured from the first response and
    /// passed back on subsequent invocations to resume context.
    pub native_id: Option<String>,
    pub history: Vec<Message>,
    pub usage: TokenUsage,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

/// Serializable view of a session without its full history.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub name: Option<String>,
    pub working_dir: PathBuf,
    pub capabilities: Vec<Capability>,
    pub primary_tier: String,
    pub fallback_tier: Option<String>,
    pub message_count: usize,
    pub usage: TokenUsage,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl Session {
    pub fn to_summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            name: self.name.clone(),
            working_dir: self.working_dir.clone(),
            capabilities: self.capabilities.clone(),
            primary_tier: self.primary_tier.clone(),
            fallback_tier: self.fallback_tier.clone(),
            message_count: self.history.len(),
            usage: self.usage,
            created_at: self.created_at,
            last_accessed: self.last_accessed,
        }
    }
}

/// In-memory session table. The durable backend behind this contract is an
/// external collaborator; the core only needs ordering guarantees.
pub struct SessionStore {
    sessions: DashMap<Uuid, Session>,
    /// Sessions currently bound to a running evolution task (session -> task).
    busy: DashMap<Uuid, Uuid>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            busy: DashMap::new(),
        }
    }

    pub fn create(
        &self,
        name: Option<String>,
        working_dir: PathBuf,
        capabilities: Vec<Capability>,
        primary_tier: String,
        fallback_tier: Option<String>,
    ) -> Session {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            name,
            working_dir,
            capabilities,
            primary_tier,
            fallback_tier,
            native_id: None,
            history: Vec::new(),
            usage: TokenUsage::default(),
            created_at: now,
            last_accessed: now,
        };
        tracing::info!(session_id = %session.id, working_dir = %session.working_dir.display(), "session created");
        self.sessions.insert(session.id, session.clone());
        session
    }

    pub fn get(&self, id: Uuid) -> Option<Session> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    /// Most recently accessed first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| entry.to_summary())
            .collect();
        summaries.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
        summaries
    }

    /// Append one message. Appends to the same session serialize through the
    /// exclusive entry lock, preserving strict invocation order.
    pub fn append(&self, id: Uuid, message: Message) -> Result<(), CoreError> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or(CoreError::SessionNotFound(id))?;
        session.usage.accumulate(&message.usage);
        session.history.push(message);
        session.last_accessed = Utc::now();
        Ok(())
    }

    /// Snapshot of the full history at call time.
    pub fn history(&self, id: Uuid) -> Result<Vec<Message>, CoreError> {
        self.sessions
            .get(&id)
            .map(|s| s.history.clone())
            .ok_or(CoreError::SessionNotFound(id))
    }

    pub fn record_native_id(&self, id: Uuid, native_id: String) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.native_id = Some(native_id);
        }
    }

    /// Reject any request that would widen the session's fixed capability set.
    pub fn check_no_widening(
        &self,
        id: Uuid,
        requested: &[Capability],
    ) -> Result<(), CoreError> {
        let session = self
            .sessions
            .get(&id)
            .ok_or(CoreError::SessionNotFound(id))?;
        for capability in requested {
            if !session.capabilities.contains(capability) {
                return Err(CoreError::CapabilityViolation(format!(
                    "session {} does not permit '{}'",
                    id,
                    capability.as_str()
                )));
            }
        }
        Ok(())
    }

    /// Bind the session to a running task; a bound session cannot be deleted.
    pub fn mark_busy(&self, id: Uuid, task_id: Uuid) {
        self.busy.insert(id, task_id);
    }

    pub fn release(&self, id: Uuid) {
        self.busy.remove(&id);
    }

    pub fn delete(&self, id: Uuid) -> Result<(), CoreError> {
        if self.busy.contains_key(&id) {
            return Err(CoreError::SessionBusy(id));
        }
        self.sessions
            .remove(&id)
            .map(|_| tracing::info!(session_id = %id, "session deleted"))
            .ok_or(CoreError::SessionNotFound(id))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
