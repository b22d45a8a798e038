//! OpenCode adapter — HTTP client for a locally running opencode server.
//!
//! The server is expected on loopback only; any configured URL that points
//! elsewhere is rejected at construction. Credentials come from config or,
//! when absent, from scanning the local process table for the environment
//! the server was started with.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;
use tokio::sync::Mutex;

use super::{
    retry_transient, EventCallback, HealthReport, PromptInput, PromptOptions, ProviderAdapter,
    ProviderKind, SessionPage, Subscription, SubscriberSet, PROMPT_MAX_RETRIES,
};
use crate::error::AdapterError;
use crate::normalize::{
    as_plain_record, Capabilities, EventCategory, NormalizedEvent, NormalizedSession,
    SessionFilters, SessionStatus,
};
use crate::usage::extract_token_usage;

/// Configuration for the OpenCode adapter.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OpenCodeConfig {
    /// Must be a loopback URL; anything else is rejected.
    pub server_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for OpenCodeConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:4096".to_string(),
            username: None,
            password: None,
        }
    }
}

/// Reject any server URL that is not plain-host loopback.
///
/// Only `127.0.0.1`, `localhost`, and `[::1]` are accepted as hosts, and
/// only `http`/`https` as schemes. Anything else — a remote host, a
/// userinfo trick like `http://127.0.0.1@evil.com`, a bare path — fails.
pub fn validate_loopback_url(url: &str) -> Result<(), AdapterError> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .ok_or_else(|| {
            AdapterError::Validation(format!("server URL must be http(s): {}", url))
        })?;

    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    if authority.contains('@') {
        return Err(AdapterError::Validation(format!(
            "server URL must not carry userinfo: {}",
            url
        )));
    }

    let host = if let Some(v6) = authority.strip_prefix('[') {
        // Bracketed IPv6: host ends at the closing bracket.
        let end = v6.find(']').ok_or_else(|| {
            AdapterError::Validation(format!("malformed IPv6 server URL: {}", url))
        })?;
        format!("[{}]", &v6[..end])
    } else {
        authority.split(':').next().unwrap_or("").to_string()
    };

    match host.as_str() {
        "127.0.0.1" | "localhost" | "[::1]" => Ok(()),
        _ => Err(AdapterError::Validation(format!(
            "server URL must be loopback (127.0.0.1, localhost, or [::1]): {}",
            url
        ))),
    }
}

/// Scan the local process table for the credentials the opencode server was
/// started with. First match wins.
async fn detect_credentials() -> Option<(String, String)> {
    let output = Command::new("ps").args(["eww"]).output().await.ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    for line in text.lines() {
        let username = extract_env_var(line, "OPENCODE_SERVER_USERNAME");
        let password = extract_env_var(line, "OPENCODE_SERVER_PASSWORD");
        if let (Some(username), Some(password)) = (username, password) {
            tracing::info!("[OpenCode] Detected server credentials from process table");
            return Some((username, password));
        }
    }
    None
}

fn extract_env_var(line: &str, name: &str) -> Option<String> {
    let start = line.find(&format!("{}=", name))? + name.len() + 1;
    let rest = &line[start..];
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    let value = &rest[..end];
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

pub struct OpenCodeAdapter {
    id: String,
    config: OpenCodeConfig,
    http: reqwest::Client,
    capabilities: Capabilities,
    credentials: Mutex<Option<(String, String)>>,
    sessions: Mutex<HashMap<String, NormalizedSession>>,
    subscribers: Arc<SubscriberSet>,
}

impl OpenCodeAdapter {
    /// Build the adapter, rejecting non-loopback server URLs up front.
    pub fn new(id: &str, config: OpenCodeConfig) -> Result<Self, AdapterError> {
        validate_loopback_url(&config.server_url)?;
        let credentials = match (&config.username, &config.password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        };
        Ok(Self {
            id: id.to_string(),
            http: reqwest::Client::new(),
            capabilities: Capabilities {
                list_sessions: true,
                open_session: true,
                send_prompt: true,
                streaming: false,
                attachments: false,
                approvals: false,
                multi_turn: true,
                filtering: true,
                pagination: false,
            },
            config,
            credentials: Mutex::new(credentials),
            sessions: Mutex::new(HashMap::new()),
            subscribers: Arc::new(SubscriberSet::new()),
        })
    }

    fn provider(&self) -> &'static str {
        self.kind().as_str()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.server_url.trim_end_matches('/'), path)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, AdapterError> {
        let response = self.request_once(method.clone(), path, body).await?;

        // A 401 with no configured credentials may just mean the server was
        // started after us; scan the process table for them. The scan runs
        // again on later 401s until credentials are found.
        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            && self.credentials.lock().await.is_none()
        {
            if let Some(found) = detect_credentials().await {
                *self.credentials.lock().await = Some(found);
                let retried = self.request_once(method, path, body).await?;
                return Self::read_json(retried).await;
            }
        }

        Self::read_json(response).await
    }

    async fn request_once(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, AdapterError> {
        let mut builder = self.http.request(method, self.url(path));
        if let Some((username, password)) = self.credentials.lock().await.clone() {
            builder = builder.basic_auth(username, Some(password));
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        builder
            .send()
            .await
            .map_err(|e| AdapterError::Transport(format!("{}: {}", path, e)))
    }

    async fn read_json(response: reqwest::Response) -> Result<Value, AdapterError> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AdapterError::Authorization(
                "opencode server rejected credentials".to_string(),
            ));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::Application {
                code: status.as_u16() as i64,
                message: format!(
                    "opencode server: {}",
                    body.chars().take(300).collect::<String>()
                ),
            });
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        response
            .json()
            .await
            .map_err(|e| AdapterError::Protocol(format!("invalid JSON response: {}", e)))
    }

    /// Map one raw server session record into the canonical shape.
    fn normalize_session(&self, raw: &Value) -> Option<NormalizedSession> {
        let session_id = raw
            .get("id")
            .or_else(|| raw.get("sessionId"))
            .and_then(|v| v.as_str())?;
        let mut session = NormalizedSession::new(self.provider(), session_id)
            .with_capabilities(self.capabilities)
            .with_raw(raw.clone());
        if let Some(title) = raw.get("title").and_then(|v| v.as_str()) {
            session = session.with_title(title);
        }
        if let Some(dir) = raw
            .get("directory")
            .or_else(|| raw.get("projectID"))
            .and_then(|v| v.as_str())
        {
            session = session.with_project(dir);
        }
        if let Some(metadata) = raw.get("metadata").and_then(as_plain_record) {
            session = session.with_metadata(metadata);
        }
        Some(session)
    }
}

#[async_trait]
impl ProviderAdapter for OpenCodeAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenCode
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Nothing to spawn; the server runs on its own. A failed check only
    /// shows up in `health()`.
    async fn start(&self) -> Result<(), AdapterError> {
        match self.health().await {
            Ok(report) => {
                tracing::info!("[OpenCode:{}] Server health: {:?}", self.id, report.status);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("[OpenCode:{}] Server health check failed: {}", self.id, e);
                Ok(())
            }
        }
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn health(&self) -> Result<HealthReport, AdapterError> {
        let started = Instant::now();
        match self
            .request(reqwest::Method::GET, "/global/health", None)
            .await
        {
            Ok(_) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                Ok(HealthReport::healthy().with_latency(latency_ms))
            }
            Err(AdapterError::Authorization(message)) => {
                Ok(HealthReport::degraded(&message))
            }
            Err(e) => Ok(HealthReport::unhealthy(&e.to_string())),
        }
    }

    async fn list_sessions(
        &self,
        _cursor: Option<String>,
        filters: Option<SessionFilters>,
    ) -> Result<SessionPage, AdapterError> {
        let raw = self.request(reqwest::Method::GET, "/session", None).await?;
        let items = raw
            .as_array()
            .ok_or_else(|| AdapterError::Protocol("session list is not an array".to_string()))?;

        let filters = filters.unwrap_or_default();
        let mut sessions: Vec<NormalizedSession> = items
            .iter()
            .filter_map(|item| self.normalize_session(item))
            .filter(|s| crate::normalize::session_matches_filters(s, &filters))
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        let mut cache = self.sessions.lock().await;
        for session in &sessions {
            cache.insert(session.session_id.clone(), session.clone());
        }

        Ok(SessionPage {
            sessions,
            next_cursor: None,
        })
    }

    async fn open_session(&self, session_id: &str) -> Result<NormalizedSession, AdapterError> {
        if session_id.trim().is_empty() {
            return Err(AdapterError::Validation("sessionId must not be empty".into()));
        }
        // Fetch, or create when the server does not know the id.
        let raw = match self
            .request(
                reqwest::Method::GET,
                &format!("/session/{}", session_id),
                None,
            )
            .await
        {
            Ok(raw) => raw,
            Err(AdapterError::Application { code: 404, .. }) => {
                self.request(reqwest::Method::POST, "/session", Some(&json!({})))
                    .await?
            }
            Err(e) => return Err(e),
        };
        let session = self
            .normalize_session(&raw)
            .ok_or_else(|| AdapterError::NotFound(format!("session {}", session_id)))?;
        self.sessions
            .lock()
            .await
            .insert(session.session_id.clone(), session.clone());
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

        let model = options.and_then(|o| o.model);
        let mut body = json!({
            "parts": [{ "type": "text", "text": input.text }]
        });
        if let Some(model) = &model {
            body["modelID"] = json!(model);
        }

        let path = format!("/session/{}/message", session_id);
        let raw = retry_transient("sendMessage", PROMPT_MAX_RETRIES, || {
            let path = path.clone();
            let body = body.clone();
            Box::pin(async move {
                self.request(reqwest::Method::POST, &path, Some(&body)).await
            })
        })
        .await?;

        if let Some(session) = self.sessions.lock().await.get_mut(session_id) {
            session.status = SessionStatus::Idle;
            session.updated_at = chrono::Utc::now();
        }

        // The server answers with the full assistant message; no streaming.
        if let Some(event) = self.normalize_event(&json!({
            "sessionId": session_id,
            "message": raw,
        })) {
            self.subscribers.emit(session_id, event).await;
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
        let session_id = raw.get("sessionId").and_then(|v| v.as_str())?;
        let message = raw.get("message")?;

        // Assistant text lives in parts; concatenate text parts in order.
        let text: String = message
            .get("parts")
            .and_then(|p| p.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect()
            })
            .unwrap_or_default();
        if text.is_empty() {
            return None;
        }

        let model = message.get("modelID").and_then(|m| m.as_str());
        let mut event =
            NormalizedEvent::new(self.provider(), session_id, EventCategory::AgentMessage)
                .with_text(&text)
                .with_raw(raw.clone());
        if let Some(usage) = extract_token_usage(message, self.provider(), model) {
            event = event.with_token_usage(usage);
        }
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_url_matrix() {
        for good in [
            "http://127.0.0.1:4096",
            "http://localhost:4096",
            "https://localhost",
            "http://[::1]:4096",
            "http://127.0.0.1:4096/base/path",
        ] {
            assert!(validate_loopback_url(good).is_ok(), "{good}");
        }

        for bad in [
            "http://evil.com:4096",
            "http://192.168.1.5:4096",
            "ftp://127.0.0.1",
            "127.0.0.1:4096",
            "http://127.0.0.1@evil.com:4096",
            "http://localhost.evil.com",
            "http://[::2]:4096",
        ] {
            assert!(validate_loopback_url(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_constructor_rejects_remote_urls() {
        let err = OpenCodeAdapter::new(
            "opencode",
            OpenCodeConfig {
                server_url: "http://evil.com:4096".to_string(),
                ..OpenCodeConfig::default()
            },
        )
        .err()
        .unwrap();
        assert!(matches!(err, AdapterError::Validation(_)));

        assert!(OpenCodeAdapter::new("opencode", OpenCodeConfig::default()).is_ok());
    }

    #[test]
    fn test_extract_env_var_from_ps_line() {
        let line = "1234 ?  Sl  0:01 opencode serve OPENCODE_SERVER_USERNAME=oc \
                    OPENCODE_SERVER_PASSWORD=s3cret PATH=/usr/bin";
        assert_eq!(
            extract_env_var(line, "OPENCODE_SERVER_USERNAME").as_deref(),
            Some("oc")
        );
        assert_eq!(
            extract_env_var(line, "OPENCODE_SERVER_PASSWORD").as_deref(),
            Some("s3cret")
        );
        assert_eq!(extract_env_var(line, "OPENCODE_MISSING"), None);
    }

    #[test]
    fn test_normalize_session_and_event() {
        let adapter = OpenCodeAdapter::new("opencode", OpenCodeConfig::default()).unwrap();
        let session = adapter
            .normalize_session(&json!({
                "id": "sess-1",
                "title": "refactor parser",
                "directory": "/work/parser",
                "metadata": { "version": "0.6" }
            }))
            .unwrap();
        assert_eq!(session.session_id, "sess-1");
        assert_eq!(session.title, "refactor parser");
        assert_eq!(session.project.as_deref(), Some("/work/parser"));

        // Arrays never become metadata.
        let no_meta = adapter
            .normalize_session(&json!({ "id": "s2", "metadata": [1, 2] }))
            .unwrap();
        assert!(no_meta.metadata.is_none());

        let event = adapter
            .normalize_event(&json!({
                "sessionId": "sess-1",
                "message": {
                    "modelID": "gpt-4o",
                    "parts": [
                        { "type": "text", "text": "done. " },
                        { "type": "tool", "tool": "bash" },
                        { "type": "text", "text": "anything else?" }
                    ],
                    "usage": { "prompt_tokens": 100, "completion_tokens": 50 }
                }
            }))
            .unwrap();
        assert_eq!(event.category, EventCategory::AgentMessage);
        assert_eq!(event.text.as_deref(), Some("done. anything else?"));
        let usage = event.token_usage.unwrap();
        assert_eq!(usage.total_tokens, 150);
        assert!(usage.cost_usd.is_some());
    }

    #[test]
    fn test_normalize_event_skips_empty_messages() {
        let adapter = OpenCodeAdapter::new("opencode", OpenCodeConfig::default()).unwrap();
        assert!(adapter
            .normalize_event(&json!({ "sessionId": "s", "message": { "parts": [] } }))
            .is_none());
        assert!(adapter.normalize_event(&json!({ "message": {} })).is_none());
    }
}
