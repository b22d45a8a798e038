//! Claude adapter — hosted Messages API over HTTPS.
//!
//! The hosted API has no server-side sessions, so a local in-memory
//! conversation-history map stands in for one. `send_prompt` always
//! streams: incremental text-delta events are emitted to subscribers as
//! they arrive, followed by one completion event carrying token usage.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tokio_stream::StreamExt;

use super::{
    retry_transient, EventCallback, HealthReport, PromptInput, PromptOptions, ProviderAdapter,
    ProviderKind, SessionPage, Subscription, SubscriberSet, PROMPT_MAX_RETRIES,
};
use crate::error::AdapterError;
use crate::normalize::{
    Capabilities, EventCategory, NormalizedEvent, NormalizedSession, SessionFilters,
    SessionStatus,
};
use crate::usage::{extract_token_usage, TokenUsage};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Configuration for the hosted Claude adapter.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClaudeConfig {
    /// Falls back to `ANTHROPIC_API_KEY` when unset.
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.anthropic.com".to_string(),
            model: "claude-3-5-sonnet-20241022".to_string(),
            max_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

pub struct ClaudeAdapter {
    id: String,
    config: ClaudeConfig,
    api_key: Option<String>,
    http: reqwest::Client,
    capabilities: Capabilities,
    sessions: Mutex<HashMap<String, NormalizedSession>>,
    histories: Mutex<HashMap<String, Vec<ChatMessage>>>,
    subscribers: Arc<SubscriberSet>,
}

impl ClaudeAdapter {
    pub fn new(id: &str, config: ClaudeConfig) -> Self {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok());
        Self {
            id: id.to_string(),
            api_key,
            http: reqwest::Client::new(),
            capabilities: Capabilities {
                list_sessions: true,
                open_session: true,
                send_prompt: true,
                streaming: true,
                attachments: false,
                approvals: false,
                multi_turn: true,
                filtering: true,
                pagination: false,
            },
            config,
            sessions: Mutex::new(HashMap::new()),
            histories: Mutex::new(HashMap::new()),
            subscribers: Arc::new(SubscriberSet::new()),
        }
    }

    fn provider(&self) -> &'static str {
        self.kind().as_str()
    }

    /// POST the full local history with streaming enabled. This is the only
    /// retryable step of a prompt: once the body starts draining, deltas
    /// have been emitted and a replay would duplicate output.
    async fn connect_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<reqwest::Response, AdapterError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| AdapterError::Validation("no API key configured".to_string()))?;

        let response = self
            .http
            .post(format!("{}/v1/messages", self.config.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&json!({
                "model": model,
                "max_tokens": self.config.max_tokens,
                "messages": messages,
                "stream": true,
            }))
            .send()
            .await
            .map_err(|e| AdapterError::Transport(format!("POST /v1/messages: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::Application {
                code: status.as_u16() as i64,
                message: format!("messages API: {}", truncate(&body, 300)),
            });
        }
        Ok(response)
    }

    /// Drain the SSE body, emitting one text-delta event per chunk.
    /// Returns the assistant text and usage.
    async fn drain_stream(
        &self,
        session_id: &str,
        model: &str,
        response: reqwest::Response,
    ) -> Result<(String, Option<TokenUsage>), AdapterError> {
        let mut full_text = String::new();
        let mut input_tokens: Option<u64> = None;
        let mut output_tokens: Option<u64> = None;

        let mut buffer = String::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| AdapterError::Transport(format!("stream read: {}", e)))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // SSE frames are newline-delimited; data lines carry JSON.
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let Ok(event) = serde_json::from_str::<Value>(data.trim()) else {
                    tracing::debug!("[Claude:{}] Skipping malformed SSE data line", self.id);
                    continue;
                };

                match event.get("type").and_then(|t| t.as_str()) {
                    Some("message_start") => {
                        if let Some(usage) = event
                            .get("message")
                            .and_then(|m| m.get("usage"))
                            .and_then(|u| u.get("input_tokens"))
                            .and_then(|v| v.as_u64())
                        {
                            input_tokens = Some(usage);
                        }
                    }
                    Some("content_block_delta") => {
                        if let Some(text) = event
                            .get("delta")
                            .and_then(|d| d.get("text"))
                            .and_then(|t| t.as_str())
                        {
                            full_text.push_str(text);
                            self.subscribers
                                .emit(
                                    session_id,
                                    NormalizedEvent::new(
                                        self.provider(),
                                        session_id,
                                        EventCategory::AgentMessage,
                                    )
                                    .with_text(text)
                                    .with_raw(event.clone()),
                                )
                                .await;
                        }
                    }
                    Some("message_delta") => {
                        if let Some(out) = event
                            .get("usage")
                            .and_then(|u| u.get("output_tokens"))
                            .and_then(|v| v.as_u64())
                        {
                            output_tokens = Some(out);
                        }
                    }
                    _ => {}
                }
            }
        }

        let usage = match (input_tokens, output_tokens) {
            (Some(input), Some(output)) => extract_token_usage(
                &json!({ "usage": { "input_tokens": input, "output_tokens": output } }),
                self.provider(),
                Some(model),
            ),
            _ => None,
        };

        Ok((full_text, usage))
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

#[async_trait]
impl ProviderAdapter for ClaudeAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Claude
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn start(&self) -> Result<(), AdapterError> {
        if self.api_key.is_none() {
            tracing::warn!("[Claude:{}] No API key configured; health degraded", self.id);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn health(&self) -> Result<HealthReport, AdapterError> {
        match self.api_key {
            Some(_) => Ok(HealthReport::healthy()),
            None => Ok(HealthReport::degraded("no API key configured")),
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

    /// Sessions are purely local; opening an unknown id creates it.
    async fn open_session(&self, session_id: &str) -> Result<NormalizedSession, AdapterError> {
        if session_id.trim().is_empty() {
            return Err(AdapterError::Validation("sessionId must not be empty".into()));
        }
        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(session_id.to_string()).or_insert_with(|| {
            let mut metadata = Map::new();
            metadata.insert("model".to_string(), json!(self.config.model));
            NormalizedSession::new(self.kind().as_str(), session_id)
                .with_capabilities(self.capabilities)
                .with_metadata(metadata)
        });
        Ok(session.clone())
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

        let model = options
            .and_then(|o| o.model)
            .unwrap_or_else(|| self.config.model.clone());

        // Append the user turn, then snapshot the history for the request.
        let messages: Vec<ChatMessage> = {
            let mut histories = self.histories.lock().await;
            let history = histories.entry(session_id.to_string()).or_default();
            history.push(ChatMessage {
                role: "user",
                content: input.text.clone(),
            });
            history.clone()
        };

        if let Some(session) = self.sessions.lock().await.get_mut(session_id) {
            session.status = SessionStatus::Active;
            session.updated_at = chrono::Utc::now();
        }

        // Retry only the initial connection; once the body is draining,
        // deltas have been emitted and a replay would duplicate output.
        let response = retry_transient("messages", PROMPT_MAX_RETRIES, || {
            let messages = messages.clone();
            let model = model.clone();
            Box::pin(async move { self.connect_stream(&model, &messages).await })
        })
        .await?;
        let (text, usage) = self.drain_stream(session_id, &model, response).await?;

        self.histories
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(ChatMessage {
                role: "assistant",
                content: text.clone(),
            });

        let mut completion = NormalizedEvent::new(
            self.provider(),
            session_id,
            EventCategory::LifecycleStatus,
        )
        .with_text("completed");
        if let Some(usage) = usage {
            completion = completion.with_token_usage(usage);
        }
        self.subscribers.emit(session_id, completion).await;

        if let Some(session) = self.sessions.lock().await.get_mut(session_id) {
            session.status = SessionStatus::Idle;
            session.preview = Some(text.chars().take(200).collect());
            session.updated_at = chrono::Utc::now();
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        session_id: &str,
        callback: EventCallback,
    ) -> Result<Subscription, AdapterError> {
        let token = self.subscribers.add(session_id, callback).await;
        Ok(Subscription {
            provider_id: self.id.clone(),
            session_id: session_id.to_string(),
            token,
        })
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), AdapterError> {
        self.subscribers
            .remove(&subscription.session_id, subscription.token)
            .await;
        Ok(())
    }

    fn normalize_event(&self, raw: &Value) -> Option<NormalizedEvent> {
        let session_id = raw.get("sessionId").and_then(|s| s.as_str())?;
        match raw.get("type").and_then(|t| t.as_str())? {
            "content_block_delta" => {
                let text = raw.get("delta")?.get("text")?.as_str()?;
                Some(
                    NormalizedEvent::new(self.provider(), session_id, EventCategory::AgentMessage)
                        .with_text(text)
                        .with_raw(raw.clone()),
                )
            }
            "message_stop" | "message_delta" => {
                let mut event = NormalizedEvent::new(
                    self.provider(),
                    session_id,
                    EventCategory::LifecycleStatus,
                )
                .with_raw(raw.clone());
                if let Some(usage) = extract_token_usage(raw, self.provider(), None) {
                    event = event.with_token_usage(usage);
                }
                Some(event)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_session_creates_local_session() {
        let adapter = ClaudeAdapter::new("claude", ClaudeConfig::default());
        let session = adapter.open_session("sess-1").await.unwrap();
        assert_eq!(session.provider, "claude");
        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(
            session.metadata.unwrap()["model"],
            json!("claude-3-5-sonnet-20241022")
        );

        // Second open returns the same session, not a fresh one.
        let again = adapter.open_session("sess-1").await.unwrap();
        assert_eq!(again.created_at, session.created_at);

        let page = adapter.list_sessions(None, None).await.unwrap();
        assert_eq!(page.sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_open_session_rejects_empty_id() {
        let adapter = ClaudeAdapter::new("claude", ClaudeConfig::default());
        assert!(matches!(
            adapter.open_session("  ").await.unwrap_err(),
            AdapterError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_health_degrades_without_api_key() {
        let adapter = ClaudeAdapter::new(
            "claude",
            ClaudeConfig {
                api_key: None,
                ..ClaudeConfig::default()
            },
        );
        // Only degraded when the env var is also absent.
        if std::env::var("ANTHROPIC_API_KEY").is_err() {
            let report = adapter.health().await.unwrap();
            assert_eq!(report.status, super::super::HealthState::Degraded);
        }
    }

    #[tokio::test]
    async fn test_mid_stream_failure_is_not_replayed() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Serves one text delta, then drops the connection mid-chunk so the
        // body read fails after output has already been emitted.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let conn_count = connections.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                conn_count.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let delta = "data: {\"type\":\"content_block_delta\",\
                    \"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n\n";
                let head = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\
                     transfer-encoding: chunked\r\n\r\n{:x}\r\n{}\r\n",
                    delta.len(),
                    delta
                );
                let _ = socket.write_all(head.as_bytes()).await;
                // Promise another chunk, then hang up mid-frame.
                let _ = socket.write_all(b"1f\r\n").await;
                let _ = socket.flush().await;
            }
        });

        let adapter = ClaudeAdapter::new(
            "claude",
            ClaudeConfig {
                api_key: Some("test-key".into()),
                base_url: format!("http://{}", addr),
                ..ClaudeConfig::default()
            },
        );
        adapter.open_session("s1").await.unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        adapter
            .subscribe(
                "s1",
                Arc::new(move |e| {
                    if let Some(text) = e.text {
                        sink.lock().unwrap().push(text);
                    }
                }),
            )
            .await
            .unwrap();

        let err = adapter
            .send_prompt(
                "s1",
                PromptInput {
                    text: "hello".into(),
                    attachments: vec![],
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Transport(_)), "{err}");

        // The delta reached subscribers exactly once, and the failed body
        // read was not replayed as a fresh request.
        assert_eq!(*seen.lock().unwrap(), vec!["hi".to_string()]);
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_normalize_event_maps_deltas() {
        let adapter = ClaudeAdapter::new("claude", ClaudeConfig::default());
        let raw = json!({
            "sessionId": "s1",
            "type": "content_block_delta",
            "delta": { "type": "text_delta", "text": "hi" }
        });
        let event = adapter.normalize_event(&raw).unwrap();
        assert_eq!(event.category, EventCategory::AgentMessage);
        assert_eq!(event.text.as_deref(), Some("hi"));

        let stop = json!({
            "sessionId": "s1",
            "type": "message_delta",
            "usage": { "input_tokens": 10, "output_tokens": 5 }
        });
        let event = adapter.normalize_event(&stop).unwrap();
        assert_eq!(event.category, EventCategory::LifecycleStatus);
        assert_eq!(event.token_usage.unwrap().total_tokens, 15);
    }
}
