//! Claude MCP adapter — local `claude` CLI over stream-json.
//!
//! The CLI speaks JSON lines on stdin/stdout with its own message types
//! (system, assistant, user, result, stream_event). One subprocess serves
//! the whole adapter; sessions are purely local (fresh ids, lost on
//! restart) and the CLI's own session id is rewritten to the local one
//! before anything leaves this module.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{oneshot, Mutex};

use super::{
    retry_transient, EventCallback, HealthReport, PromptInput, PromptOptions, ProviderAdapter,
    ProviderKind, SessionPage, Subscription, SubscriberSet, PROMPT_MAX_RETRIES,
};
use crate::acp::PROMPT_TIMEOUT_MS;
use crate::error::AdapterError;
use crate::normalize::{
    Capabilities, EventCategory, NormalizedEvent, NormalizedSession, SessionFilters,
    SessionStatus,
};
use crate::proc;
use crate::shell_env;
use crate::usage::{extract_token_usage, TokenUsage};

// ─── Wire Types ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct StreamDelta {
    #[serde(rename = "type", default)]
    delta_type: String,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type", default)]
    event_type: String,
    delta: Option<StreamDelta>,
}

#[derive(Debug, Clone, Deserialize)]
struct ContentItem {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
    id: Option<String>,
    name: Option<String>,
    input: Option<Value>,
    tool_use_id: Option<String>,
    is_error: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
struct CliMessage {
    content: Vec<ContentItem>,
}

/// One JSON line from the CLI's stdout.
#[derive(Debug, Clone, Deserialize)]
struct CliOutput {
    #[serde(rename = "type")]
    msg_type: String,
    subtype: Option<String>,
    session_id: Option<String>,
    message: Option<CliMessage>,
    event: Option<StreamEvent>,
    result: Option<String>,
    is_error: Option<bool>,
    usage: Option<Value>,
}

// ─── Config ─────────────────────────────────────────────────────────────

/// Configuration for the Claude MCP adapter.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClaudeMcpConfig {
    /// Executable override; discovered on PATH when unset.
    pub command: Option<String>,
    pub cwd: String,
    pub model: Option<String>,
}

impl Default for ClaudeMcpConfig {
    fn default() -> Self {
        Self {
            command: None,
            cwd: ".".to_string(),
            model: None,
        }
    }
}

// ─── Adapter ────────────────────────────────────────────────────────────

struct PromptDone {
    stop_reason: String,
    is_error: bool,
    usage: Option<TokenUsage>,
}

/// Shared between the adapter and its stdout reader task.
struct McpShared {
    id: String,
    /// Local session id the current prompt streams into.
    active_session: Mutex<Option<String>>,
    /// CLI-reported session id → local session id.
    native_to_local: Mutex<HashMap<String, String>>,
    subscribers: Arc<SubscriberSet>,
    prompt_done: Mutex<Option<oneshot::Sender<PromptDone>>>,
    model: Option<String>,
}

pub struct ClaudeMcpAdapter {
    id: String,
    config: ClaudeMcpConfig,
    capabilities: Capabilities,
    shared: Arc<McpShared>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    sessions: Mutex<HashMap<String, NormalizedSession>>,
    /// Consecutive prompt failures; reset on success.
    failures: AtomicU32,
    degraded: Mutex<Option<String>>,
    /// One CLI turn at a time: held for the whole prompt so concurrent
    /// callers cannot clobber the active session or completion slot.
    prompt_gate: Mutex<()>,
}

impl ClaudeMcpAdapter {
    pub fn new(id: &str, config: ClaudeMcpConfig) -> Self {
        Self {
            id: id.to_string(),
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
            shared: Arc::new(McpShared {
                id: id.to_string(),
                active_session: Mutex::new(None),
                native_to_local: Mutex::new(HashMap::new()),
                subscribers: Arc::new(SubscriberSet::new()),
                prompt_done: Mutex::new(None),
                model: config.model.clone(),
            }),
            config,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
            failures: AtomicU32::new(0),
            degraded: Mutex::new(None),
            prompt_gate: Mutex::new(()),
        }
    }

    fn provider(&self) -> &'static str {
        self.kind().as_str()
    }

    fn cli_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-p",
            "--output-format",
            "stream-json",
            "--input-format",
            "stream-json",
            "--include-partial-messages",
            "--verbose",
            "--dangerously-skip-permissions",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if let Some(model) = &self.config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args
    }

    async fn degrade(&self, reason: String) {
        tracing::warn!("[ClaudeMcp:{}] Degraded: {}", self.id, reason);
        *self.degraded.lock().await = Some(reason);
    }
}

// ─── Reader ─────────────────────────────────────────────────────────────

impl McpShared {
    /// Translate and emit one stdout line. Sends the prompt-completion
    /// signal on `result` messages.
    async fn process_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() || !line.starts_with('{') {
            return;
        }
        let msg: CliOutput = match serde_json::from_str(line) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(
                    "[ClaudeMcp:{}] Failed to parse: {} - {}",
                    self.id,
                    e,
                    &line[..line.len().min(100)]
                );
                return;
            }
        };

        // The CLI invents its own session id on init; remember which local
        // session it stands for so every emitted event carries local ids.
        if msg.msg_type == "system" && msg.subtype.as_deref() == Some("init") {
            if let Some(native) = &msg.session_id {
                if let Some(local) = self.active_session.lock().await.clone() {
                    self.native_to_local
                        .lock()
                        .await
                        .insert(native.clone(), local);
                }
            }
            return;
        }

        let Some(local) = self.active_session.lock().await.clone() else {
            return;
        };

        if msg.msg_type == "result" {
            let usage = msg
                .usage
                .as_ref()
                .and_then(|u| {
                    extract_token_usage(
                        &json!({ "usage": u }),
                        "claude_mcp",
                        self.model.as_deref(),
                    )
                });
            if let Some(tx) = self.prompt_done.lock().await.take() {
                let _ = tx.send(PromptDone {
                    stop_reason: msg.subtype.clone().unwrap_or_else(|| "end_turn".to_string()),
                    is_error: msg.is_error.unwrap_or(false),
                    usage: usage.clone(),
                });
            }
            let mut done = NormalizedEvent::new("claude_mcp", &local, EventCategory::LifecycleStatus)
                .with_text(msg.result.as_deref().unwrap_or("completed"));
            if let Some(usage) = usage {
                done = done.with_token_usage(usage);
            }
            self.subscribers.emit(&local, done).await;
            return;
        }

        if let Some(event) = normalize_cli_message(&local, &msg) {
            self.subscribers.emit(&local, event).await;
        }
    }
}

/// Map one CLI message to the canonical event shape. Messages that carry
/// nothing worth emitting map to `None`.
fn normalize_cli_message(session_id: &str, msg: &CliOutput) -> Option<NormalizedEvent> {
    match msg.msg_type.as_str() {
        "stream_event" => {
            let event = msg.event.as_ref()?;
            if event.event_type != "content_block_delta" {
                return None;
            }
            let delta = event.delta.as_ref()?;
            if delta.delta_type != "text_delta" {
                return None;
            }
            let text = delta.text.as_deref()?;
            Some(
                NormalizedEvent::new("claude_mcp", session_id, EventCategory::AgentMessage)
                    .with_text(text),
            )
        }
        "assistant" => {
            let message = msg.message.as_ref()?;
            let tool = message
                .content
                .iter()
                .find(|c| c.content_type == "tool_use")?;
            let mut payload = Map::new();
            payload.insert(
                "toolCallId".to_string(),
                json!(tool.id.clone().unwrap_or_default()),
            );
            payload.insert(
                "title".to_string(),
                json!(tool.name.clone().unwrap_or_else(|| "unknown".to_string())),
            );
            payload.insert("status".to_string(), json!("running"));
            if let Some(input) = &tool.input {
                payload.insert("rawInput".to_string(), input.clone());
            }
            Some(
                NormalizedEvent::new("claude_mcp", session_id, EventCategory::ToolCall)
                    .with_payload(payload),
            )
        }
        "user" => {
            let message = msg.message.as_ref()?;
            let result = message
                .content
                .iter()
                .find(|c| c.content_type == "tool_result")?;
            let status = if result.is_error.unwrap_or(false) {
                "failed"
            } else {
                "completed"
            };
            let mut payload = Map::new();
            payload.insert(
                "toolCallId".to_string(),
                json!(result.tool_use_id.clone().unwrap_or_default()),
            );
            payload.insert("status".to_string(), json!(status));
            if let Some(text) = &result.text {
                payload.insert("rawOutput".to_string(), json!(text));
            }
            Some(
                NormalizedEvent::new("claude_mcp", session_id, EventCategory::ToolCall)
                    .with_payload(payload),
            )
        }
        _ => None,
    }
}

// ─── Trait Impl ─────────────────────────────────────────────────────────

#[async_trait]
impl ProviderAdapter for ClaudeMcpAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::ClaudeMcp
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Spawn the CLI in stream-json mode. A missing or unspawnable
    /// executable degrades health instead of failing the start.
    async fn start(&self) -> Result<(), AdapterError> {
        if self.child.lock().await.is_some() {
            return Ok(());
        }

        let command = match &self.config.command {
            Some(cmd) => cmd.clone(),
            None => match shell_env::which("claude") {
                Some(path) => path,
                None => {
                    self.degrade("'claude' executable not found on PATH".to_string())
                        .await;
                    return Ok(());
                }
            },
        };

        let args = self.cli_args();
        tracing::info!(
            "[ClaudeMcp:{}] Spawning: {} {} (cwd: {})",
            self.id,
            command,
            args.join(" "),
            self.config.cwd
        );
        let mut child = match proc::spawn_agent(&command, &args, &self.config.cwd) {
            Ok(child) => child,
            Err(e) => {
                self.degrade(e.to_string()).await;
                return Ok(());
            }
        };

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AdapterError::Transport("failed to take child stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AdapterError::Transport("failed to take child stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let name = self.id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        tracing::warn!("[ClaudeMcp:{} stderr] {}", name, line);
                    }
                }
            });
        }

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                shared.process_line(&line).await;
            }
            // EOF: a prompt awaiting completion must not hang forever.
            drop(shared.prompt_done.lock().await.take());
            tracing::info!("[ClaudeMcp:{}] stdout reader exited", shared.id);
        });

        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);
        *self.degraded.lock().await = None;
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        drop(self.stdin.lock().await.take());
        if let Some(mut child) = self.child.lock().await.take() {
            proc::graceful_kill(&mut child, proc::KILL_GRACE).await;
        }
        Ok(())
    }

    async fn health(&self) -> Result<HealthReport, AdapterError> {
        if let Some(reason) = self.degraded.lock().await.clone() {
            return Ok(HealthReport::degraded(&reason));
        }
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return Ok(HealthReport::degraded("not started"));
        };
        if !proc::is_alive(child) {
            return Ok(HealthReport::unhealthy("claude process exited"));
        }
        match self.failures.load(Ordering::SeqCst) {
            0 => Ok(HealthReport::healthy()),
            n if n < 3 => Ok(HealthReport::degraded(&format!(
                "{} consecutive prompt failure(s)",
                n
            ))),
            n => Ok(HealthReport::unhealthy(&format!(
                "{} consecutive prompt failures",
                n
            ))),
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

    /// Sessions live only in this process; opening an unknown id creates it.
    async fn open_session(&self, session_id: &str) -> Result<NormalizedSession, AdapterError> {
        if session_id.trim().is_empty() {
            return Err(AdapterError::Validation("sessionId must not be empty".into()));
        }
        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(session_id.to_string()).or_insert_with(|| {
            NormalizedSession::new(self.kind().as_str(), session_id)
                .with_project(&self.config.cwd)
                .with_capabilities(self.capabilities)
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
        if self.child.lock().await.is_none() {
            return Err(AdapterError::Transport(
                "claude process is not running".to_string(),
            ));
        }

        // The CLI handles one turn at a time; queue concurrent prompts.
        let _turn = self.prompt_gate.lock().await;

        *self.shared.active_session.lock().await = Some(session_id.to_string());
        let (tx, rx) = oneshot::channel();
        *self.shared.prompt_done.lock().await = Some(tx);

        // Rewrite back to the CLI's own session id when continuing a turn.
        let native: Option<String> = {
            let map = self.shared.native_to_local.lock().await;
            map.iter()
                .find(|(_, local)| local.as_str() == session_id)
                .map(|(native, _)| native.clone())
        };
        let user_line = json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{ "type": "text", "text": input.text }]
            },
            "session_id": native
        });

        if let Some(session) = self.sessions.lock().await.get_mut(session_id) {
            session.status = SessionStatus::Active;
            session.updated_at = chrono::Utc::now();
        }

        // Only the stdin write is retried; once the CLI has started
        // streaming, a replay would duplicate output.
        let payload = format!("{}\n", user_line);
        retry_transient("stdinWrite", PROMPT_MAX_RETRIES, || {
            let payload = payload.clone();
            Box::pin(async move {
                let mut guard = self.stdin.lock().await;
                let stdin = guard.as_mut().ok_or_else(|| {
                    AdapterError::Transport("claude stdin is not available".to_string())
                })?;
                stdin
                    .write_all(payload.as_bytes())
                    .await
                    .map_err(|e| AdapterError::Transport(format!("stdin write: {}", e)))?;
                stdin
                    .flush()
                    .await
                    .map_err(|e| AdapterError::Transport(format!("stdin flush: {}", e)))
            })
        })
        .await?;

        let timeout_ms = options
            .and_then(|o| o.timeout_ms)
            .unwrap_or(PROMPT_TIMEOUT_MS);
        let done = match tokio::time::timeout(
            std::time::Duration::from_millis(timeout_ms),
            rx,
        )
        .await
        {
            Ok(Ok(done)) => done,
            Ok(Err(_)) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                return Err(AdapterError::Transport(
                    "claude exited before completing the prompt".to_string(),
                ));
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                drop(self.shared.prompt_done.lock().await.take());
                return Err(AdapterError::Timeout {
                    method: "sendPrompt".to_string(),
                    timeout_ms,
                });
            }
        };

        if done.is_error {
            self.failures.fetch_add(1, Ordering::SeqCst);
            if let Some(session) = self.sessions.lock().await.get_mut(session_id) {
                session.status = SessionStatus::Error;
                session.updated_at = chrono::Utc::now();
            }
            return Err(AdapterError::Application {
                code: -1,
                message: format!("prompt failed: {}", done.stop_reason),
            });
        }

        self.failures.store(0, Ordering::SeqCst);
        if let Some(session) = self.sessions.lock().await.get_mut(session_id) {
            session.status = SessionStatus::Idle;
            session.preview = Some(input.text.chars().take(200).collect());
            session.updated_at = chrono::Utc::now();
        }
        if let Some(usage) = &done.usage {
            tracing::info!(
                "[ClaudeMcp:{}] Prompt complete ({}): {} tokens",
                self.id,
                done.stop_reason,
                usage.total_tokens
            );
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        session_id: &str,
        callback: EventCallback,
    ) -> Result<Subscription, AdapterError> {
        let token = self.shared.subscribers.add(session_id, callback).await;
        Ok(Subscription {
            provider_id: self.id.clone(),
            session_id: session_id.to_string(),
            token,
        })
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), AdapterError> {
        self.shared
            .subscribers
            .remove(&subscription.session_id, subscription.token)
            .await;
        Ok(())
    }

    fn normalize_event(&self, raw: &Value) -> Option<NormalizedEvent> {
        let msg: CliOutput = serde_json::from_value(raw.clone()).ok()?;
        let session_id = msg.session_id.clone()?;
        normalize_cli_message(&session_id, &msg).map(|e| e.with_raw(raw.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: Value) -> CliOutput {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn test_normalize_text_delta() {
        let msg = parse(json!({
            "type": "stream_event",
            "event": {
                "type": "content_block_delta",
                "delta": { "type": "text_delta", "text": "hello" }
            }
        }));
        let event = normalize_cli_message("s1", &msg).unwrap();
        assert_eq!(event.category, EventCategory::AgentMessage);
        assert_eq!(event.text.as_deref(), Some("hello"));
        assert_eq!(event.session_id, "s1");
        assert_eq!(event.provider, "claude_mcp");
    }

    #[test]
    fn test_normalize_tool_use_and_result() {
        let start = parse(json!({
            "type": "assistant",
            "message": {
                "role": "assistant",
                "content": [{
                    "type": "tool_use", "id": "t1", "name": "Bash",
                    "input": { "command": "ls" }
                }]
            }
        }));
        let event = normalize_cli_message("s1", &start).unwrap();
        assert_eq!(event.category, EventCategory::ToolCall);
        let payload = event.payload.unwrap();
        assert_eq!(payload["toolCallId"], json!("t1"));
        assert_eq!(payload["status"], json!("running"));

        let done = parse(json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{
                    "type": "tool_result", "tool_use_id": "t1",
                    "is_error": true, "text": "boom"
                }]
            }
        }));
        let event = normalize_cli_message("s1", &done).unwrap();
        assert_eq!(event.payload.unwrap()["status"], json!("failed"));
    }

    #[test]
    fn test_normalize_skips_thinking_and_unknown() {
        let thinking = parse(json!({
            "type": "stream_event",
            "event": {
                "type": "content_block_delta",
                "delta": { "type": "thinking_delta", "thinking": "hmm" }
            }
        }));
        assert!(normalize_cli_message("s1", &thinking).is_none());

        let unknown = parse(json!({ "type": "ping" }));
        assert!(normalize_cli_message("s1", &unknown).is_none());
    }

    #[tokio::test]
    async fn test_unstarted_adapter_is_degraded_and_rejects_prompts() {
        let adapter = ClaudeMcpAdapter::new("claude_mcp", ClaudeMcpConfig::default());
        let report = adapter.health().await.unwrap();
        assert_eq!(report.status, super::super::HealthState::Degraded);

        adapter.open_session("s1").await.unwrap();
        let err = adapter
            .send_prompt(
                "s1",
                PromptInput {
                    text: "hi".into(),
                    attachments: Vec::new(),
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Transport(_)));
    }

    #[tokio::test]
    async fn test_prompt_validation() {
        let adapter = ClaudeMcpAdapter::new("claude_mcp", ClaudeMcpConfig::default());
        let err = adapter
            .send_prompt("s1", PromptInput::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Validation(_)));

        let err = adapter
            .send_prompt(
                "missing",
                PromptInput {
                    text: "hi".into(),
                    attachments: Vec::new(),
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_prompts_are_serialized() {
        let adapter = Arc::new(ClaudeMcpAdapter::new("claude_mcp", ClaudeMcpConfig::default()));
        adapter.open_session("a").await.unwrap();
        adapter.open_session("b").await.unwrap();

        // Fake a running CLI: liveness from a sleeping child, a writable
        // stdin from cat. Completions are delivered by hand below.
        let child = tokio::process::Command::new("sleep")
            .arg("5")
            .stdin(std::process::Stdio::null())
            .spawn()
            .unwrap();
        *adapter.child.lock().await = Some(child);
        let mut sink = proc::spawn_agent("cat", &[], ".").unwrap();
        *adapter.stdin.lock().await = Some(sink.stdin.take().unwrap());

        fn input(text: &str) -> PromptInput {
            PromptInput {
                text: text.to_string(),
                attachments: Vec::new(),
            }
        }
        fn options() -> Option<PromptOptions> {
            Some(PromptOptions {
                model: None,
                timeout_ms: Some(5_000),
            })
        }

        let a = adapter.clone();
        let first =
            tokio::spawn(async move { a.send_prompt("a", input("one"), options()).await });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let b = adapter.clone();
        let second =
            tokio::spawn(async move { b.send_prompt("b", input("two"), options()).await });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // The second prompt queues behind the turn gate: the first still
        // owns the active session and the completion slot.
        assert_eq!(
            adapter.shared.active_session.lock().await.as_deref(),
            Some("a")
        );
        let tx = adapter.shared.prompt_done.lock().await.take().unwrap();
        assert!(tx
            .send(PromptDone {
                stop_reason: "end_turn".to_string(),
                is_error: false,
                usage: None,
            })
            .is_ok());
        first.await.unwrap().unwrap();

        // Now the second turn starts, with its own completion slot.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(
            adapter.shared.active_session.lock().await.as_deref(),
            Some("b")
        );
        let tx = adapter.shared.prompt_done.lock().await.take().unwrap();
        assert!(tx
            .send(PromptDone {
                stop_reason: "end_turn".to_string(),
                is_error: false,
                usage: None,
            })
            .is_ok());
        second.await.unwrap().unwrap();

        adapter.stop().await.unwrap();
        let _ = sink.kill().await;
    }

    #[tokio::test]
    async fn test_failure_counter_drives_health() {
        let adapter = ClaudeMcpAdapter::new("claude_mcp", ClaudeMcpConfig::default());
        // Fake a running child so health reads the counter.
        let child = tokio::process::Command::new("sleep")
            .arg("5")
            .stdin(std::process::Stdio::null())
            .spawn()
            .unwrap();
        *adapter.child.lock().await = Some(child);

        assert_eq!(
            adapter.health().await.unwrap().status,
            super::super::HealthState::Healthy
        );

        adapter.failures.store(2, Ordering::SeqCst);
        assert_eq!(
            adapter.health().await.unwrap().status,
            super::super::HealthState::Degraded
        );

        adapter.failures.store(3, Ordering::SeqCst);
        assert_eq!(
            adapter.health().await.unwrap().status,
            super::super::HealthState::Unhealthy
        );

        adapter.failures.store(0, Ordering::SeqCst);
        assert_eq!(
            adapter.health().await.unwrap().status,
            super::super::HealthState::Healthy
        );
        adapter.stop().await.unwrap();
    }
}
