//! Copilot adapter — ACP over a spawned `copilot --acp` subprocess.
//!
//! Discovery falls back from `copilot` to `gh copilot`, and the resolution
//! is cached for the adapter's lifetime. Prompts are sent as a multimodal
//! content array first and retried text-only if the agent rejects that
//! shape. Permission requests arrive as server-initiated `session/request_permission`
//! requests and are parked in the approval broker until a human (or the
//! 60-second auto-cancel) decides.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use super::{
    retry_transient, EventCallback, HealthReport, PromptInput, PromptOptions, ProviderAdapter,
    ProviderKind, SessionPage, Subscription, SubscriberSet, PROMPT_MAX_RETRIES,
};
use crate::acp::{AcpClient, RpcError, PROMPT_TIMEOUT_MS};
use crate::approvals::{ApprovalBroker, ApprovalContext, ApprovalOutcome};
use crate::error::AdapterError;
use crate::normalize::{
    is_plain_record, Capabilities, EventCategory, NormalizedEvent, NormalizedSession,
    SessionFilters, SessionStatus,
};
use crate::shell_env;

/// Configuration for the Copilot adapter.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CopilotConfig {
    /// Explicit command override; when unset, discovery falls back
    /// `copilot` → `gh`.
    pub command: Option<String>,
    pub cwd: String,
    /// When true, every tool request is auto-approved and the adapter
    /// stops advertising approval support.
    pub allow_all_tools: bool,
}

impl Default for CopilotConfig {
    fn default() -> Self {
        Self {
            command: None,
            cwd: ".".to_string(),
            allow_all_tools: false,
        }
    }
}

pub struct CopilotAdapter {
    id: String,
    config: CopilotConfig,
    capabilities: Capabilities,
    client: Mutex<Option<Arc<AcpClient>>>,
    sessions: Mutex<std::collections::HashMap<String, NormalizedSession>>,
    /// Session id → client-side handler token, for pruning on last unsubscribe.
    event_tokens: Mutex<std::collections::HashMap<String, u64>>,
    subscribers: Arc<SubscriberSet>,
    approvals: ApprovalBroker,
    /// Cached (command, args) resolution, discovered once per lifetime.
    resolved: Mutex<Option<(String, Vec<String>)>>,
    degraded: Mutex<Option<String>>,
}

impl CopilotAdapter {
    pub fn new(id: &str, config: CopilotConfig) -> Self {
        let capabilities = Capabilities {
            list_sessions: true,
            open_session: true,
            send_prompt: true,
            streaming: true,
            attachments: true,
            // Auto-approval mode means the approval flow never surfaces.
            approvals: !config.allow_all_tools,
            multi_turn: true,
            filtering: true,
            pagination: false,
        };
        Self {
            id: id.to_string(),
            config,
            capabilities,
            client: Mutex::new(None),
            sessions: Mutex::new(std::collections::HashMap::new()),
            event_tokens: Mutex::new(std::collections::HashMap::new()),
            subscribers: Arc::new(SubscriberSet::new()),
            approvals: ApprovalBroker::new(),
            resolved: Mutex::new(None),
            degraded: Mutex::new(None),
        }
    }

    /// Resolve the agent command, caching the result for this adapter's
    /// lifetime. Falls back `copilot --acp` → `gh copilot --acp`.
    async fn resolve_command(&self) -> Option<(String, Vec<String>)> {
        let mut cached = self.resolved.lock().await;
        if cached.is_none() {
            *cached = if let Some(ref cmd) = self.config.command {
                Some((cmd.clone(), vec!["--acp".to_string()]))
            } else if shell_env::which("copilot").is_some() {
                Some(("copilot".to_string(), vec!["--acp".to_string()]))
            } else if shell_env::which("gh").is_some() {
                Some((
                    "gh".to_string(),
                    vec!["copilot".to_string(), "--acp".to_string()],
                ))
            } else {
                None
            };
        }
        cached.clone()
    }

    async fn client(&self) -> Result<Arc<AcpClient>, AdapterError> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or_else(|| AdapterError::Transport(format!("{} is not started", self.id)))
    }

    /// Register the permission-request handler on a fresh client.
    async fn install_approval_handler(&self, client: &AcpClient) {
        let broker = self.approvals.clone();
        let subscribers = self.subscribers.clone();
        let provider_id = self.id.to_string();
        let allow_all = self.config.allow_all_tools;

        client
            .on_request(
                "session/request_permission",
                Arc::new(move |rpc_id, params| {
                    let broker = broker.clone();
                    let subscribers = subscribers.clone();
                    let provider_id = provider_id.clone();
                    Box::pin(async move {
                        if allow_all {
                            return Ok(json!({ "outcome": { "outcome": "approved" } }));
                        }

                        let session_id = params
                            .get("sessionId")
                            .and_then(|s| s.as_str())
                            .ok_or_else(|| RpcError {
                                code: -32602,
                                message: "session/request_permission without sessionId".into(),
                            })?
                            .to_string();

                        // The façade's thread maps 1:1 onto the session.
                        let rx = broker
                            .register(
                                &rpc_id,
                                ApprovalContext {
                                    session_id: session_id.clone(),
                                    thread_id: session_id.clone(),
                                    provider_id: provider_id.clone(),
                                    created_at: chrono::Utc::now(),
                                },
                            )
                            .await;

                        let mut payload = Map::new();
                        payload.insert("rpcId".to_string(), json!(rpc_id));
                        if let Some(tool_call) = params.get("toolCall") {
                            if is_plain_record(tool_call) {
                                payload.insert("toolCall".to_string(), tool_call.clone());
                            }
                        }
                        subscribers
                            .emit(
                                &session_id,
                                NormalizedEvent::new(
                                    &provider_id,
                                    &session_id,
                                    EventCategory::ApprovalRequest,
                                )
                                .with_payload(payload)
                                .with_raw(params.clone()),
                            )
                            .await;

                        // The broker's 60s auto-cancel guarantees this resolves.
                        let outcome = rx.await.unwrap_or(ApprovalOutcome::Cancelled);
                        Ok(json!({ "outcome": { "outcome": outcome.as_str() } }))
                    })
                }),
            )
            .await;
    }

    fn session_from_agent_id(&self, agent_session_id: &str) -> NormalizedSession {
        NormalizedSession::new(self.kind().as_str(), agent_session_id)
            .with_project(&self.config.cwd)
            .with_capabilities(self.capabilities)
    }
}

/// Map one ACP `update` params payload into the canonical event shape.
fn normalize_update(provider: &str, params: &Value) -> Option<NormalizedEvent> {
    let session_id = params.get("sessionId")?.as_str()?;
    let update = params.get("update")?;
    let kind = update.get("sessionUpdate").and_then(|v| v.as_str())?;

    let text = update
        .get("content")
        .and_then(|c| c.get("text"))
        .and_then(|t| t.as_str());

    let category = match kind {
        "agent_message" | "agent_message_chunk" => EventCategory::AgentMessage,
        "agent_thought_chunk" | "plan" => EventCategory::Metadata,
        "tool_call" | "tool_call_update" => EventCategory::ToolCall,
        "turn_complete" | "stop" => EventCategory::LifecycleStatus,
        _ => EventCategory::Metadata,
    };

    let mut event = NormalizedEvent::new(provider, session_id, category).with_raw(params.clone());
    if let Some(text) = text {
        event = event.with_text(text);
    }
    if let Some(obj) = update.as_object() {
        event = event.with_payload(obj.clone());
    }
    if let Some(usage) = crate::usage::extract_token_usage(update, provider, None) {
        event = event.with_token_usage(usage);
    }
    Some(event)
}

#[async_trait]
impl ProviderAdapter for CopilotAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::CopilotAcp
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn start(&self) -> Result<(), AdapterError> {
        if self.client.lock().await.is_some() {
            return Ok(());
        }

        let Some((command, args)) = self.resolve_command().await else {
            let msg = "copilot executable not found (tried 'copilot' and 'gh')";
            tracing::warn!("[Copilot:{}] {}", self.id, msg);
            *self.degraded.lock().await = Some(msg.to_string());
            return Ok(());
        };

        let client = match AcpClient::spawn(&command, &args, &self.config.cwd, &self.id).await {
            Ok(client) => Arc::new(client),
            Err(e) => {
                tracing::warn!("[Copilot:{}] Spawn failed: {}", self.id, e);
                *self.degraded.lock().await = Some(e.to_string());
                return Ok(());
            }
        };

        self.install_approval_handler(&client).await;

        if let Err(e) = client
            .send_request(
                "initialize",
                json!({
                    "protocolVersion": 1,
                    "clientInfo": { "name": "corral", "version": env!("CARGO_PKG_VERSION") },
                }),
                None,
            )
            .await
        {
            tracing::warn!("[Copilot:{}] initialize failed: {}", self.id, e);
            client.kill().await;
            *self.degraded.lock().await = Some(format!("initialize failed: {}", e));
            return Ok(());
        }

        *self.degraded.lock().await = None;
        *self.client.lock().await = Some(client);
        tracing::info!("[Copilot:{}] Started ({} {})", self.id, command, args.join(" "));
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        if let Some(client) = self.client.lock().await.take() {
            client.kill().await;
        }
        self.event_tokens.lock().await.clear();
        Ok(())
    }

    async fn health(&self) -> Result<HealthReport, AdapterError> {
        let client = self.client.lock().await.clone();
        match client {
            Some(client) if client.is_alive() => Ok(HealthReport::healthy()),
            Some(_) => Ok(HealthReport::unhealthy("agent process exited")),
            None => {
                let reason = self.degraded.lock().await.clone();
                Ok(HealthReport::degraded(
                    reason.as_deref().unwrap_or("not started"),
                ))
            }
        }
    }

    async fn list_sessions(
        &self,
        _cursor: Option<String>,
        filters: Option<SessionFilters>,
    ) -> Result<SessionPage, AdapterError> {
        let filters = filters.unwrap_or_default();
        let sessions = self.sessions.lock().await;
        let mut matched: Vec<NormalizedSession> = sessions
            .values()
            .filter(|s| crate::normalize::session_matches_filters(s, &filters))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(SessionPage {
            sessions: matched,
            next_cursor: None,
        })
    }

    async fn open_session(&self, session_id: &str) -> Result<NormalizedSession, AdapterError> {
        if let Some(session) = self.sessions.lock().await.get(session_id) {
            return Ok(session.clone());
        }

        let client = self.client().await?;

        // Try resuming first; agents without persistence reject session/load
        // and we fall back to a fresh session.
        let agent_session_id = match client
            .send_request("session/load", json!({ "sessionId": session_id }), None)
            .await
        {
            Ok(_) => session_id.to_string(),
            Err(AdapterError::Application { .. }) => {
                let result = client
                    .send_request(
                        "session/new",
                        json!({ "cwd": self.config.cwd, "mcpServers": [] }),
                        None,
                    )
                    .await?;
                result
                    .get("sessionId")
                    .and_then(|s| s.as_str())
                    .ok_or_else(|| {
                        AdapterError::Protocol("No sessionId in session/new response".to_string())
                    })?
                    .to_string()
            }
            Err(e) => return Err(e),
        };

        let session = self.session_from_agent_id(&agent_session_id);
        self.sessions
            .lock()
            .await
            .insert(agent_session_id, session.clone());
        Ok(session)
    }

    async fn send_prompt(
        &self,
        session_id: &str,
        input: PromptInput,
        options: Option<PromptOptions>,
    ) -> Result<(), AdapterError> {
        if input.text.trim().is_empty() {
            return Err(AdapterError::Validation("prompt text must not be empty".into()));
        }
        if !self.sessions.lock().await.contains_key(session_id) {
            return Err(AdapterError::NotFound(format!("session {}", session_id)));
        }
        let client = self.client().await?;
        let timeout = options
            .as_ref()
            .and_then(|o| o.timeout_ms)
            .unwrap_or(PROMPT_TIMEOUT_MS);

        let mut multimodal = vec![json!({ "type": "text", "text": input.text })];
        for attachment in &input.attachments {
            multimodal.push(json!({
                "type": "content",
                "mimeType": attachment.mime_type,
                "data": attachment.data,
                "name": attachment.name,
            }));
        }
        let text_only = vec![json!({ "type": "text", "text": input.text })];
        let has_attachments = !input.attachments.is_empty();

        let session = session_id.to_string();
        retry_transient("session/prompt", PROMPT_MAX_RETRIES, move || {
            let client = client.clone();
            let session = session.clone();
            let multimodal = multimodal.clone();
            let text_only = text_only.clone();
            Box::pin(async move {
                let first = client
                    .send_request(
                        "session/prompt",
                        json!({ "sessionId": session, "prompt": multimodal }),
                        Some(timeout),
                    )
                    .await;
                match first {
                    // Agent rejected the multimodal shape: retry text-only.
                    Err(AdapterError::Application { code, message }) if has_attachments => {
                        tracing::info!(
                            "[Copilot] Multimodal prompt rejected [{}: {}], retrying text-only",
                            code,
                            message
                        );
                        client
                            .send_request(
                                "session/prompt",
                                json!({ "sessionId": session, "prompt": text_only }),
                                Some(timeout),
                            )
                            .await
                    }
                    other => other,
                }
            })
        })
        .await?;

        if let Some(session) = self.sessions.lock().await.get_mut(session_id) {
            session.status = SessionStatus::Active;
            session.preview = Some(input.text.chars().take(200).collect());
            session.updated_at = chrono::Utc::now();
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        session_id: &str,
        callback: EventCallback,
    ) -> Result<Subscription, AdapterError> {
        let client = self.client().await?;
        let token = self.subscribers.add(session_id, callback).await;

        // First subscriber for this session: wire up the client routing.
        let mut tokens = self.event_tokens.lock().await;
        if !tokens.contains_key(session_id) {
            let subscribers = self.subscribers.clone();
            let provider = self.kind().as_str().to_string();
            let session = session_id.to_string();
            let client_token = client
                .on_session_event(
                    session_id,
                    Arc::new(move |params| {
                        if let Some(event) = normalize_update(&provider, &params) {
                            let subscribers = subscribers.clone();
                            let session = session.clone();
                            tokio::spawn(async move {
                                subscribers.emit(&session, event).await;
                            });
                        }
                    }),
                )
                .await;
            tokens.insert(session_id.to_string(), client_token);
        }

        Ok(Subscription {
            provider_id: self.id.clone(),
            session_id: session_id.to_string(),
            token,
        })
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), AdapterError> {
        let was_last = self
            .subscribers
            .remove(&subscription.session_id, subscription.token)
            .await;
        if was_last {
            if let Some(client_token) = self
                .event_tokens
                .lock()
                .await
                .remove(&subscription.session_id)
            {
                if let Ok(client) = self.client().await {
                    client
                        .off_session_event(&subscription.session_id, client_token)
                        .await;
                }
            }
        }
        Ok(())
    }

    fn normalize_event(&self, raw: &Value) -> Option<NormalizedEvent> {
        normalize_update(self.kind().as_str(), raw)
    }

    async fn resolve_approval(
        &self,
        rpc_id: &str,
        outcome: ApprovalOutcome,
    ) -> Result<(), AdapterError> {
        // Exactly-once by construction; a second call is a silent no-op.
        self.approvals.resolve(rpc_id, outcome).await;
        Ok(())
    }

    fn approval_broker(&self) -> Option<ApprovalBroker> {
        Some(self.approvals.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_allow_all_tools_forces_approvals_off() {
        let strict = CopilotAdapter::new("copilot", CopilotConfig::default());
        assert!(strict.capabilities().approvals);

        let permissive = CopilotAdapter::new(
            "copilot",
            CopilotConfig {
                allow_all_tools: true,
                ..CopilotConfig::default()
            },
        );
        assert!(!permissive.capabilities().approvals);
    }

    #[test]
    fn test_normalize_update_maps_categories() {
        let params = json!({
            "sessionId": "s1",
            "update": {
                "sessionUpdate": "agent_message_chunk",
                "content": { "text": "hello" }
            }
        });
        let event = normalize_update("copilot_acp", &params).unwrap();
        assert_eq!(event.category, EventCategory::AgentMessage);
        assert_eq!(event.session_id, "s1");
        assert_eq!(event.text.as_deref(), Some("hello"));

        let tool = json!({
            "sessionId": "s1",
            "update": { "sessionUpdate": "tool_call", "toolCallId": "t1" }
        });
        assert_eq!(
            normalize_update("copilot_acp", &tool).unwrap().category,
            EventCategory::ToolCall
        );

        // No update payload carries nothing worth emitting.
        assert!(normalize_update("copilot_acp", &json!({"sessionId": "s1"})).is_none());
    }

    #[tokio::test]
    async fn test_prompt_rejects_empty_text_and_unknown_session() {
        let adapter = CopilotAdapter::new("copilot", CopilotConfig::default());
        let err = adapter
            .send_prompt("s1", PromptInput::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Validation(_)));

        let err = adapter
            .send_prompt(
                "s1",
                PromptInput {
                    text: "hi".into(),
                    attachments: vec![],
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unstarted_adapter_reports_degraded() {
        let adapter = CopilotAdapter::new("copilot", CopilotConfig::default());
        let report = adapter.health().await.unwrap();
        assert_eq!(report.status, super::super::HealthState::Degraded);
    }
}
