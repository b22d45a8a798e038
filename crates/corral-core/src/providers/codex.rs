//! Codex placeholder adapter.
//!
//! Reserved for the Codex backend integration. `list_sessions` returns an
//! empty page; every mutating operation fails with `NotImplemented` naming
//! the method and phase, and the capability matrix advertises nothing it
//! cannot do.

use async_trait::async_trait;
use serde_json::Value;

use super::{
    EventCallback, HealthReport, PromptInput, PromptOptions, ProviderAdapter, ProviderKind,
    SessionPage, Subscription,
};
use crate::error::AdapterError;
use crate::normalize::{Capabilities, NormalizedEvent, NormalizedSession, SessionFilters};

const PHASE: &str = "phase-2";

pub struct CodexAdapter {
    id: String,
}

impl CodexAdapter {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }

    fn not_implemented(method: &str) -> AdapterError {
        AdapterError::NotImplemented {
            method: method.to_string(),
            phase: PHASE.to_string(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for CodexAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Codex
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            list_sessions: true,
            ..Capabilities::default()
        }
    }

    async fn start(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn health(&self) -> Result<HealthReport, AdapterError> {
        // The placeholder is reachable by definition.
        Ok(HealthReport {
            message: Some("placeholder backend".to_string()),
            ..HealthReport::healthy()
        })
    }

    async fn list_sessions(
        &self,
        _cursor: Option<String>,
        _filters: Option<SessionFilters>,
    ) -> Result<SessionPage, AdapterError> {
        Ok(SessionPage {
            sessions: Vec::new(),
            next_cursor: None,
        })
    }

    async fn open_session(&self, _session_id: &str) -> Result<NormalizedSession, AdapterError> {
        Err(Self::not_implemented("openSession"))
    }

    async fn send_prompt(
        &self,
        _session_id: &str,
        _input: PromptInput,
        _options: Option<PromptOptions>,
    ) -> Result<(), AdapterError> {
        Err(Self::not_implemented("sendPrompt"))
    }

    async fn subscribe(
        &self,
        _session_id: &str,
        _callback: EventCallback,
    ) -> Result<Subscription, AdapterError> {
        Err(Self::not_implemented("subscribe"))
    }

    async fn unsubscribe(&self, _subscription: &Subscription) -> Result<(), AdapterError> {
        Err(Self::not_implemented("unsubscribe"))
    }

    fn normalize_event(&self, _raw: &Value) -> Option<NormalizedEvent> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_is_empty_and_mutations_name_method_and_phase() {
        let adapter = CodexAdapter::new("codex");
        assert!(adapter
            .list_sessions(None, None)
            .await
            .unwrap()
            .sessions
            .is_empty());

        let err = adapter
            .send_prompt("s", PromptInput::default(), None)
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("sendPrompt"));
        assert!(text.contains("phase-2"));

        // Capability matrix stays truthful.
        let caps = adapter.capabilities();
        assert!(caps.list_sessions);
        assert!(!caps.send_prompt);
        assert!(!caps.approvals);
    }
}
