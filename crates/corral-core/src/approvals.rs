//! Human-in-the-loop tool-approval broker and authorization gate.
//!
//! When an agent asks permission to run a tool, the adapter parks the
//! server-initiated request in an [`ApprovalBroker`] and waits for a human
//! decision. The gate guarantees that only a client subscribed to the
//! approval's thread may resolve it, that each approval resolves exactly
//! once, and that an abandoned approval auto-cancels after 60 seconds so
//! tool execution is never blocked indefinitely.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};

/// How long an unanswered approval waits before auto-cancelling.
pub const APPROVAL_TIMEOUT_MS: u64 = 60_000;

/// Outcome of an approval decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalOutcome {
    Approved,
    Denied,
    Cancelled,
}

impl ApprovalOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Public context for one outstanding approval, keyed by the JSON-RPC id of
/// the server-initiated permission request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalContext {
    pub session_id: String,
    pub thread_id: String,
    pub provider_id: String,
    pub created_at: DateTime<Utc>,
}

struct PendingApproval {
    ctx: ApprovalContext,
    tx: oneshot::Sender<ApprovalOutcome>,
    timer: tokio::task::JoinHandle<()>,
}

/// Tracks outstanding approvals. Cloneable; clones share state.
#[derive(Clone, Default)]
pub struct ApprovalBroker {
    pending: Arc<Mutex<HashMap<String, PendingApproval>>>,
}

impl ApprovalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new approval and return the receiver the adapter awaits.
    ///
    /// A 60-second timer auto-resolves the approval with
    /// [`ApprovalOutcome::Cancelled`] and removes its context if nobody
    /// answers first.
    pub async fn register(
        &self,
        rpc_id: &str,
        ctx: ApprovalContext,
    ) -> oneshot::Receiver<ApprovalOutcome> {
        let (tx, rx) = oneshot::channel();

        let broker = self.clone();
        let timer_id = rpc_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(APPROVAL_TIMEOUT_MS)).await;
            if broker.resolve(&timer_id, ApprovalOutcome::Cancelled).await {
                tracing::warn!("[Approvals] Approval {} timed out, auto-cancelled", timer_id);
            }
        });

        let mut pending = self.pending.lock().await;
        if let Some(previous) = pending.insert(
            rpc_id.to_string(),
            PendingApproval { ctx, tx, timer },
        ) {
            // Should not happen: JSON-RPC ids are unique per connection.
            previous.timer.abort();
            tracing::warn!("[Approvals] Replaced duplicate approval id {}", rpc_id);
        }
        rx
    }

    /// Resolve an approval exactly once.
    ///
    /// The context is removed atomically; any call after the first for the
    /// same `rpc_id` is a silent no-op. Returns whether this call was the
    /// resolving one.
    pub async fn resolve(&self, rpc_id: &str, outcome: ApprovalOutcome) -> bool {
        let entry = self.pending.lock().await.remove(rpc_id);
        match entry {
            Some(entry) => {
                entry.timer.abort();
                // The awaiting adapter may itself have gone away; that is fine.
                let _ = entry.tx.send(outcome);
                tracing::info!("[Approvals] Approval {} resolved: {}", rpc_id, outcome.as_str());
                true
            }
            None => false,
        }
    }

    /// Fetch the context for an outstanding approval.
    pub async fn context(&self, rpc_id: &str) -> Option<ApprovalContext> {
        self.pending.lock().await.get(rpc_id).map(|p| p.ctx.clone())
    }
}

// ─── Subscriber Index ───────────────────────────────────────────────────

/// Which client connections are subscribed to which threads. Maintained by
/// the façade as clients attach and detach.
#[derive(Clone, Default)]
pub struct SubscriberIndex {
    inner: Arc<Mutex<HashMap<String, HashSet<String>>>>,
}

impl SubscriberIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, thread_id: &str, connection_id: &str) {
        self.inner
            .lock()
            .await
            .entry(thread_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
    }

    pub async fn unsubscribe(&self, thread_id: &str, connection_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(set) = inner.get_mut(thread_id) {
            set.remove(connection_id);
            if set.is_empty() {
                inner.remove(thread_id);
            }
        }
    }

    pub async fn is_subscribed(&self, thread_id: &str, connection_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .get(thread_id)
            .map(|set| set.contains(connection_id))
            .unwrap_or(false)
    }
}

// ─── Authorization Gate ─────────────────────────────────────────────────

/// Result of an authorization check.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationDecision {
    pub authorized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuthorizationDecision {
    fn allow() -> Self {
        Self {
            authorized: true,
            reason: None,
        }
    }

    fn deny(reason: &str) -> Self {
        Self {
            authorized: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Check whether `connection_id` may resolve the approval `rpc_id`.
///
/// The connection must be subscribed to the thread the approval belongs to.
/// Only on an authorized decision may the caller invoke
/// [`ApprovalBroker::resolve`]. Denials are logged as a security signal.
pub async fn validate_approval_decision(
    rpc_id: &str,
    connection_id: &str,
    broker: &ApprovalBroker,
    subscribers: &SubscriberIndex,
) -> AuthorizationDecision {
    let Some(ctx) = broker.context(rpc_id).await else {
        return AuthorizationDecision::deny("Unknown or expired approval");
    };

    if !subscribers.is_subscribed(&ctx.thread_id, connection_id).await {
        tracing::warn!(
            "[Approvals] Connection {} denied approval {} (not subscribed to thread {})",
            connection_id,
            rpc_id,
            ctx.thread_id
        );
        return AuthorizationDecision::deny("Client not subscribed to approval thread");
    }

    AuthorizationDecision::allow()
}
