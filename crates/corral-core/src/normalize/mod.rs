//! Canonical session/event schema.
//!
//! Every backend speaks its own raw shape; the adapters convert all of them
//! into `NormalizedSession` and `NormalizedEvent` so the façade only ever
//! sees one schema. Validation returns a list of error strings (empty means
//! valid) so callers can log everything wrong with a payload at once instead
//! of failing on the first field.

pub mod filters;

pub use filters::{session_matches_filters, SessionFilters};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─── Capability Matrix ──────────────────────────────────────────────────

/// Per-adapter boolean record declaring which operations are actually
/// implemented. A `true` flag for an unimplemented operation is a contract
/// violation, so adapters construct this once and never mutate it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Capabilities {
    pub list_sessions: bool,
    pub open_session: bool,
    pub send_prompt: bool,
    pub streaming: bool,
    pub attachments: bool,
    pub approvals: bool,
    pub multi_turn: bool,
    pub filtering: bool,
    pub pagination: bool,
}

// ─── Session ────────────────────────────────────────────────────────────

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Active,
    Completed,
    Error,
    Interrupted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Interrupted => "interrupted",
        }
    }
}

/// A provider session in the canonical shape.
///
/// Created on list/open, mutated only via [`merge_session_update`], never
/// persisted by this subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedSession {
    pub provider: String,
    pub session_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    /// Optional plain key→value record. Arrays, null, and non-object JSON
    /// are rejected at the boundary — see [`is_plain_record`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    pub capabilities: Capabilities,
    /// Raw provider payload this session was normalized from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl NormalizedSession {
    /// Build a session with required fields defaulted: status idle, both
    /// timestamps set to now, title falling back to the session id.
    pub fn new(provider: &str, session_id: &str) -> Self {
        let now = Utc::now();
        Self {
            provider: provider.to_string(),
            session_id: session_id.to_string(),
            title: session_id.to_string(),
            project: None,
            repo: None,
            status: SessionStatus::Idle,
            created_at: now,
            updated_at: now,
            preview: None,
            metadata: None,
            capabilities: Capabilities::default(),
            raw: None,
        }
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    pub fn with_project(mut self, project: &str) -> Self {
        self.project = Some(project.to_string());
        self
    }

    pub fn with_repo(mut self, repo: &str) -> Self {
        self.repo = Some(repo.to_string());
        self
    }

    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_preview(mut self, preview: &str) -> Self {
        self.preview = Some(preview.to_string());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = Some(raw);
        self
    }
}

// ─── Event ──────────────────────────────────────────────────────────────

/// Category of an emitted unit of provider activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    AgentMessage,
    LifecycleStatus,
    ApprovalRequest,
    Metadata,
    ToolCall,
    Error,
}

/// One event per emitted unit of provider activity. Ephemeral: handed to a
/// subscriber callback and then discarded by this layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    pub provider: String,
    pub session_id: String,
    pub event_id: String,
    pub category: EventCategory,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<crate::usage::TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl NormalizedEvent {
    /// Build an event with required fields defaulted: fresh event id and a
    /// timestamp of now.
    pub fn new(provider: &str, session_id: &str, category: EventCategory) -> Self {
        Self {
            provider: provider.to_string(),
            session_id: session_id.to_string(),
            event_id: uuid::Uuid::new_v4().to_string(),
            category,
            timestamp: Utc::now(),
            text: None,
            payload: None,
            token_usage: None,
            raw: None,
        }
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_token_usage(mut self, usage: crate::usage::TokenUsage) -> Self {
        self.token_usage = Some(usage);
        self
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = Some(raw);
        self
    }
}

// ─── Plain-record guard ─────────────────────────────────────────────────

/// Whether a raw JSON value is a plain key→value record.
///
/// Rejects arrays, null, and any non-object JSON so malformed or hostile
/// provider payloads cannot masquerade as metadata. Absent values are
/// handled at the `Option` level by callers and are always accepted.
pub fn is_plain_record(value: &Value) -> bool {
    value.is_object()
}

/// Lift a raw JSON value into a metadata map, or `None` if it is not a
/// plain record.
pub fn as_plain_record(value: &Value) -> Option<Map<String, Value>> {
    value.as_object().cloned()
}

// ─── Validation ─────────────────────────────────────────────────────────

/// Validate a session; returns a list of error strings (empty ⇒ valid).
pub fn validate_normalized_session(session: &NormalizedSession) -> Vec<String> {
    let mut errors = Vec::new();
    if session.provider.trim().is_empty() {
        errors.push("provider must not be empty".to_string());
    }
    if session.session_id.trim().is_empty() {
        errors.push("sessionId must not be empty".to_string());
    }
    if session.updated_at < session.created_at {
        errors.push("updatedAt must not precede createdAt".to_string());
    }
    errors
}

/// Validate an event; returns a list of error strings (empty ⇒ valid).
pub fn validate_normalized_event(event: &NormalizedEvent) -> Vec<String> {
    let mut errors = Vec::new();
    if event.provider.trim().is_empty() {
        errors.push("provider must not be empty".to_string());
    }
    if event.session_id.trim().is_empty() {
        errors.push("sessionId must not be empty".to_string());
    }
    if event.event_id.trim().is_empty() {
        errors.push("eventId must not be empty".to_string());
    }
    errors
}

// ─── Merge ──────────────────────────────────────────────────────────────

/// Partial update applied to an existing session.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    pub title: Option<String>,
    pub project: Option<String>,
    pub repo: Option<String>,
    pub status: Option<SessionStatus>,
    pub preview: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

/// Shallow-merge a partial update into a session.
///
/// `metadata` is merged key-by-key — existing keys survive unless
/// explicitly overwritten — never replaced wholesale. `updatedAt` is bumped
/// to now, preserving the updatedAt ≥ createdAt invariant.
pub fn merge_session_update(session: &mut NormalizedSession, update: SessionUpdate) {
    if let Some(title) = update.title {
        session.title = title;
    }
    if let Some(project) = update.project {
        session.project = Some(project);
    }
    if let Some(repo) = update.repo {
        session.repo = Some(repo);
    }
    if let Some(status) = update.status {
        session.status = status;
    }
    if let Some(preview) = update.preview {
        session.preview = Some(preview);
    }
    if let Some(patch) = update.metadata {
        let merged = session.metadata.get_or_insert_with(Map::new);
        for (k, v) in patch {
            merged.insert(k, v);
        }
    }
    session.updated_at = Utc::now();
}
