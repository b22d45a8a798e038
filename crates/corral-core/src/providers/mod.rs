//! Provider adapters.
//!
//! One trait, five backends. Each adapter exclusively owns its own
//! subprocess or connection (if any) and converts that backend's raw
//! session/event shapes into the canonical schema in `normalize`.

pub mod claude;
pub mod claude_mcp;
pub mod codex;
pub mod copilot;
pub mod opencode;

pub use claude::{ClaudeAdapter, ClaudeConfig};
pub use claude_mcp::{ClaudeMcpAdapter, ClaudeMcpConfig};
pub use codex::CodexAdapter;
pub use copilot::{CopilotAdapter, CopilotConfig};
pub use opencode::{OpenCodeAdapter, OpenCodeConfig};

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::approvals::{ApprovalBroker, ApprovalOutcome};
use crate::error::AdapterError;
use crate::normalize::{Capabilities, NormalizedEvent, NormalizedSession, SessionFilters};

/// Maximum extra attempts after a transient prompt-send failure
/// (3 attempts total).
pub const PROMPT_MAX_RETRIES: usize = 2;

// ─── Shared Types ───────────────────────────────────────────────────────

/// The adapter variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Codex,
    CopilotAcp,
    Claude,
    ClaudeMcp,
    OpenCode,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::CopilotAcp => "copilot_acp",
            Self::Claude => "claude",
            Self::ClaudeMcp => "claude_mcp",
            Self::OpenCode => "opencode",
        }
    }
}

/// Health of one provider. Always one of these four — never absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    /// Reachable but suboptimal (missing executable, slow response).
    Degraded,
    /// Broken or unreachable.
    Unhealthy,
    Disabled,
}

/// Health report returned by `health()` and `health_all()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            status: HealthState::Healthy,
            message: None,
            latency_ms: None,
        }
    }

    pub fn degraded(message: &str) -> Self {
        Self {
            status: HealthState::Degraded,
            message: Some(message.to_string()),
            latency_ms: None,
        }
    }

    pub fn unhealthy(message: &str) -> Self {
        Self {
            status: HealthState::Unhealthy,
            message: Some(message.to_string()),
            latency_ms: None,
        }
    }

    pub fn disabled() -> Self {
        Self {
            status: HealthState::Disabled,
            message: None,
            latency_ms: None,
        }
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

/// One page of sessions from `list_sessions`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPage {
    pub sessions: Vec<NormalizedSession>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// An attachment sent alongside prompt text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub mime_type: String,
    /// Base64-encoded content.
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// User input for `send_prompt`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptInput {
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Per-call prompt options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptOptions {
    pub model: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// Callback invoked with each normalized event for a subscribed session.
pub type EventCallback = Arc<dyn Fn(NormalizedEvent) + Send + Sync>;

/// Cancellation handle returned by `subscribe`.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub provider_id: String,
    pub session_id: String,
    pub token: u64,
}

// ─── Adapter Contract ───────────────────────────────────────────────────

/// The common contract every backend implements. This method set, plus the
/// capability record, is the entire surface the façade may call.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Unique id within the registry.
    fn id(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// Immutable capability matrix. A `true` flag for an unimplemented
    /// operation is a contract violation.
    fn capabilities(&self) -> Capabilities;

    /// Start the adapter. Transport failures degrade health instead of
    /// returning an error, so one broken backend never blocks the rest.
    async fn start(&self) -> Result<(), AdapterError>;

    async fn stop(&self) -> Result<(), AdapterError>;

    async fn health(&self) -> Result<HealthReport, AdapterError>;

    async fn list_sessions(
        &self,
        cursor: Option<String>,
        filters: Option<SessionFilters>,
    ) -> Result<SessionPage, AdapterError>;

    async fn open_session(&self, session_id: &str) -> Result<NormalizedSession, AdapterError>;

    async fn send_prompt(
        &self,
        session_id: &str,
        input: PromptInput,
        options: Option<PromptOptions>,
    ) -> Result<(), AdapterError>;

    async fn subscribe(
        &self,
        session_id: &str,
        callback: EventCallback,
    ) -> Result<Subscription, AdapterError>;

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), AdapterError>;

    /// Convert one raw provider payload into the canonical event shape.
    /// Returns `None` for payloads that carry nothing worth emitting.
    fn normalize_event(&self, raw: &Value) -> Option<NormalizedEvent>;

    /// Resolve a pending approval. Only adapters with `approvals: true`
    /// implement this.
    async fn resolve_approval(
        &self,
        _rpc_id: &str,
        _outcome: ApprovalOutcome,
    ) -> Result<(), AdapterError> {
        Err(AdapterError::NotImplemented {
            method: "resolveApproval".to_string(),
            phase: "no approval support".to_string(),
        })
    }

    /// The approval broker backing this adapter, for the authorization
    /// gate. `None` when the adapter never emits approvals.
    fn approval_broker(&self) -> Option<ApprovalBroker> {
        None
    }
}

// ─── Subscriber Set ─────────────────────────────────────────────────────

/// Per-session listener set shared by all adapters.
///
/// Session isolation lives here: `emit` only invokes callbacks registered
/// for that exact session, so there is no global event bus to leak across.
#[derive(Default)]
pub(crate) struct SubscriberSet {
    inner: Mutex<HashMap<String, Vec<(u64, EventCallback)>>>,
    next_token: AtomicU64,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, session_id: &str, callback: EventCallback) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.inner
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push((token, callback));
        token
    }

    /// Remove one subscription; returns whether the session now has no
    /// subscribers left (its entry is pruned).
    pub async fn remove(&self, session_id: &str, token: u64) -> bool {
        let mut inner = self.inner.lock().await;
        if let Some(list) = inner.get_mut(session_id) {
            list.retain(|(t, _)| *t != token);
            if list.is_empty() {
                inner.remove(session_id);
                return true;
            }
        }
        false
    }

    pub async fn emit(&self, session_id: &str, event: NormalizedEvent) {
        let callbacks: Vec<EventCallback> = {
            let inner = self.inner.lock().await;
            inner
                .get(session_id)
                .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default()
        };
        for cb in callbacks {
            cb(event.clone());
        }
    }
}

// ─── Retry Helper ───────────────────────────────────────────────────────

/// Run `attempt` up to `1 + max_retries` times, retrying immediately (no
/// backoff) on transient errors only. Validation and application errors
/// are never retried.
pub(crate) async fn retry_transient<'a, T>(
    op: &str,
    max_retries: usize,
    mut attempt: impl FnMut() -> Pin<Box<dyn Future<Output = Result<T, AdapterError>> + Send + 'a>>,
) -> Result<T, AdapterError> {
    let mut tries = 0;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && tries < max_retries => {
                tries += 1;
                tracing::warn!(
                    "[providers] Transient failure in '{}' (attempt {}/{}): {}",
                    op,
                    tries,
                    max_retries + 1,
                    e
                );
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::EventCategory;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn test_subscriber_set_isolates_sessions() {
        let set = SubscriberSet::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let seen_a = seen.clone();
        set.add(
            "a",
            Arc::new(move |e| seen_a.lock().unwrap().push(e.session_id.clone())),
        )
        .await;

        set.emit("a", NormalizedEvent::new("p", "a", EventCategory::AgentMessage))
            .await;
        set.emit("b", NormalizedEvent::new("p", "b", EventCategory::AgentMessage))
            .await;

        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_subscriber_removal_prunes_session() {
        let set = SubscriberSet::new();
        let t1 = set.add("a", Arc::new(|_| {})).await;
        let t2 = set.add("a", Arc::new(|_| {})).await;
        assert!(!set.remove("a", t1).await);
        assert!(set.remove("a", t2).await);
    }

    #[tokio::test]
    async fn test_retry_transient_retries_then_succeeds() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = attempts.clone();
        let result = retry_transient("op", PROMPT_MAX_RETRIES, move || {
            let a = a.clone();
            Box::pin(async move {
                if a.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AdapterError::Transport("flaky".into()))
                } else {
                    Ok(7)
                }
            })
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_transient_gives_up_after_three_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = attempts.clone();
        let result: Result<(), _> = retry_transient("op", PROMPT_MAX_RETRIES, move || {
            let a = a.clone();
            Box::pin(async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(AdapterError::Transport("down".into()))
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_transient_never_retries_application_errors() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = attempts.clone();
        let result: Result<(), _> = retry_transient("op", PROMPT_MAX_RETRIES, move || {
            let a = a.clone();
            Box::pin(async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(AdapterError::Application {
                    code: -32600,
                    message: "invalid request".into(),
                })
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
