//! AcpClient — JSON-RPC 2.0 over NDJSON on a child process's stdio.
//!
//! Incoming line classification:
//!   - `id` and `method`  → server-initiated request, needs a reply
//!   - `id` only          → response to one of our pending requests
//!   - `method` only      → notification
//!
//! Responses may arrive in any order; each resolves exactly the caller
//! whose id matches. `update` notifications carrying `params.sessionId`
//! are delivered only to handlers registered for that exact session.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{oneshot, Mutex};

use crate::error::AdapterError;
use crate::proc;

/// Default timeout for a request/response round trip.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Timeout adapters use for `session/prompt` sends.
pub const PROMPT_TIMEOUT_MS: u64 = 30_000;

/// JSON-RPC error object sent back for a failed server-initiated request.
#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// Handler for a server-initiated request. Receives the stringified
/// JSON-RPC id (useful for approval correlation) and the params.
pub type RequestHandler = Arc<
    dyn Fn(String, Value) -> Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>
        + Send
        + Sync,
>;

/// Global notification handler: `(method, params)`.
pub type NotificationHandler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Per-session event handler for `update` notifications.
pub type SessionHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// An in-flight request awaiting a correlated response.
struct Pending {
    tx: oneshot::Sender<Result<Value, AdapterError>>,
    method: String,
    #[allow(dead_code)]
    started: Instant,
}

/// State shared between the public client and the stdout reader task.
struct ClientShared {
    stdin: Mutex<Option<ChildStdin>>,
    pending: Mutex<HashMap<u64, Pending>>,
    request_handlers: Mutex<HashMap<String, RequestHandler>>,
    notification_handlers: Mutex<Vec<NotificationHandler>>,
    session_handlers: Mutex<HashMap<String, Vec<(u64, SessionHandler)>>>,
    alive: AtomicBool,
    display_name: String,
}

/// A bidirectional JSON-RPC client bound to one agent subprocess.
pub struct AcpClient {
    shared: Arc<ClientShared>,
    child: Mutex<Option<Child>>,
    next_id: AtomicU64,
    next_handler_id: AtomicU64,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AcpClient {
    /// Spawn the agent process and start the background stdout reader.
    pub async fn spawn(
        command: &str,
        args: &[String],
        cwd: &str,
        display_name: &str,
    ) -> Result<Self, AdapterError> {
        tracing::info!(
            "[AcpClient:{}] Spawning: {} {} (cwd: {})",
            display_name,
            command,
            args.join(" "),
            cwd,
        );

        let mut child = proc::spawn_agent(command, args, cwd)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AdapterError::Transport("No stdin on child process".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AdapterError::Transport("No stdout on child process".to_string()))?;
        let stderr = child.stderr.take();

        let shared = Arc::new(ClientShared {
            stdin: Mutex::new(Some(stdin)),
            pending: Mutex::new(HashMap::new()),
            request_handlers: Mutex::new(HashMap::new()),
            notification_handlers: Mutex::new(Vec::new()),
            session_handlers: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
            display_name: display_name.to_string(),
        });

        // Drain stderr in the background so the child never blocks on it.
        if let Some(stderr) = stderr {
            let name = display_name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        tracing::debug!("[AcpClient:{} stderr] {}", name, line);
                    }
                }
            });
        }

        let reader_shared = shared.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                reader_shared.process_line(line).await;
            }
            // Child stdout closed — the process exited. Same cleanup as close().
            reader_shared.shutdown().await;
            tracing::info!(
                "[AcpClient:{}] stdout reader finished",
                reader_shared.display_name
            );
        });

        Ok(Self {
            shared,
            child: Mutex::new(Some(child)),
            next_id: AtomicU64::new(1),
            next_handler_id: AtomicU64::new(1),
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Whether the subprocess is still connected.
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// Send a JSON-RPC request and wait for its correlated response.
    ///
    /// Assigns a monotonically increasing id. On timeout (default 5000ms,
    /// overridable per call) the pending entry is removed and the caller is
    /// rejected with an error naming the method and the configured timeout;
    /// the subprocess is left running. A late response for a timed-out id
    /// is dropped as unknown.
    pub async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout_ms: Option<u64>,
    ) -> Result<Value, AdapterError> {
        if !self.is_alive() {
            return Err(AdapterError::Transport(format!(
                "{} process is not alive",
                self.shared.display_name
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        self.shared.pending.lock().await.insert(
            id,
            Pending {
                tx,
                method: method.to_string(),
                started: Instant::now(),
            },
        );

        let msg = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(e) = self.shared.write_line(&msg).await {
            self.shared.pending.lock().await.remove(&id);
            return Err(e);
        }

        let timeout_ms = timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);
        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AdapterError::Transport(format!(
                "Response channel closed for '{}' (id={})",
                method, id
            ))),
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                Err(AdapterError::Timeout {
                    method: method.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    /// Send a fire-and-forget notification (no id, no response).
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), AdapterError> {
        let msg = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.shared.write_line(&msg).await
    }

    /// Register a handler for a server-initiated request method.
    pub async fn on_request(&self, method: &str, handler: RequestHandler) {
        self.shared
            .request_handlers
            .lock()
            .await
            .insert(method.to_string(), handler);
    }

    /// Register a global notification handler; fires for every notification.
    pub async fn on_notification(&self, handler: NotificationHandler) {
        self.shared.notification_handlers.lock().await.push(handler);
    }

    /// Register a handler for `update` notifications belonging to exactly
    /// `session_id`. Returns a token for `off_session_event`.
    pub async fn on_session_event(&self, session_id: &str, handler: SessionHandler) -> u64 {
        let token = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.shared
            .session_handlers
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push((token, handler));
        token
    }

    /// Remove a session handler. Removing the last handler for a session
    /// prunes the session's handler list.
    pub async fn off_session_event(&self, session_id: &str, token: u64) {
        let mut handlers = self.shared.session_handlers.lock().await;
        if let Some(list) = handlers.get_mut(session_id) {
            list.retain(|(t, _)| *t != token);
            if list.is_empty() {
                handlers.remove(session_id);
            }
        }
    }

    /// Stop line parsing, end stdin, and reject every pending request with
    /// an "exited" error. Idempotent; the same cleanup runs automatically
    /// when the subprocess exits on its own.
    pub async fn close(&self) {
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        self.shared.shutdown().await;
    }

    /// Close the protocol, then terminate the subprocess (graceful, then
    /// SIGKILL after the grace window).
    pub async fn kill(&self) {
        self.close().await;
        if let Some(mut child) = self.child.lock().await.take() {
            tracing::info!("[AcpClient:{}] Killing process", self.shared.display_name);
            proc::graceful_kill(&mut child, proc::KILL_GRACE).await;
        }
    }
}

impl ClientShared {
    /// Serialize and write one NDJSON line to the child's stdin.
    async fn write_line(&self, msg: &Value) -> Result<(), AdapterError> {
        let data = format!("{}\n", msg);
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| {
            AdapterError::Transport(format!("{} stdin is closed", self.display_name))
        })?;
        stdin
            .write_all(data.as_bytes())
            .await
            .map_err(|e| AdapterError::Transport(format!("Write to agent: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| AdapterError::Transport(format!("Flush to agent: {}", e)))?;
        Ok(())
    }

    /// Classify and dispatch one incoming line.
    async fn process_line(self: &Arc<Self>, line: &str) {
        let msg: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                // Malformed line: log and skip, never crash the client.
                tracing::debug!(
                    "[AcpClient:{}] Non-JSON stdout: {}",
                    self.display_name,
                    &line[..line.len().min(200)]
                );
                return;
            }
        };

        let has_id = msg.get("id").map(|v| !v.is_null()).unwrap_or(false);
        let has_method = msg.get("method").and_then(|m| m.as_str()).is_some();

        match (has_id, has_method) {
            // Server-initiated request: needs a reply from us.
            (true, true) => self.dispatch_request(msg).await,
            // Response to one of our pending requests.
            (true, false) => self.dispatch_response(msg).await,
            // Notification.
            (false, true) => self.dispatch_notification(&msg).await,
            (false, false) => {
                tracing::debug!(
                    "[AcpClient:{}] Unclassifiable message: {}",
                    self.display_name,
                    &line[..line.len().min(200)]
                );
            }
        }
    }

    /// Resolve the pending request whose id matches, if any.
    async fn dispatch_response(&self, msg: Value) {
        let id = match msg.get("id").and_then(|v| v.as_u64()) {
            Some(id) => id,
            None => {
                tracing::debug!(
                    "[AcpClient:{}] Response with non-numeric id dropped",
                    self.display_name
                );
                return;
            }
        };

        let entry = self.pending.lock().await.remove(&id);
        let Some(entry) = entry else {
            // Late response for a timed-out or unknown id.
            tracing::debug!(
                "[AcpClient:{}] Dropping response for unknown id {}",
                self.display_name,
                id
            );
            return;
        };

        let outcome = if let Some(error) = msg.get("error") {
            Err(AdapterError::Application {
                code: error.get("code").and_then(|c| c.as_i64()).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error")
                    .to_string(),
            })
        } else {
            Ok(msg.get("result").cloned().unwrap_or(Value::Null))
        };

        if entry.tx.send(outcome).is_err() {
            tracing::debug!(
                "[AcpClient:{}] Caller for '{}' (id={}) went away",
                self.display_name,
                entry.method,
                id
            );
        }
    }

    /// Run the registered handler for a server-initiated request in its own
    /// task (an approval handler may take up to a minute) and write back
    /// `{id, result}` or `{id, error}`.
    async fn dispatch_request(self: &Arc<Self>, msg: Value) {
        let method = msg
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        let id = msg.get("id").cloned().unwrap_or(Value::Null);
        let params = msg.get("params").cloned().unwrap_or(Value::Null);

        tracing::info!(
            "[AcpClient:{}] Agent request: {} (id={})",
            self.display_name,
            method,
            id
        );

        let handler = self.request_handlers.lock().await.get(&method).cloned();
        let shared = self.clone();
        tokio::spawn(async move {
            let reply = match handler {
                Some(handler) => {
                    let rpc_id = match &id {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    match handler(rpc_id, params).await {
                        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                        Err(e) => json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": { "code": e.code, "message": e.message },
                        }),
                    }
                }
                None => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32601, "message": format!("Method not found: {}", method) },
                }),
            };
            if let Err(e) = shared.write_line(&reply).await {
                tracing::warn!(
                    "[AcpClient:{}] Failed to reply to agent request '{}': {}",
                    shared.display_name,
                    method,
                    e
                );
            }
        });
    }

    /// Fire global notification handlers, then route `update` notifications
    /// to the handlers registered for the exact session they belong to.
    async fn dispatch_notification(&self, msg: &Value) {
        let method = msg
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or_default();
        let params = msg.get("params").cloned().unwrap_or(Value::Null);

        let global = self.notification_handlers.lock().await.clone();
        for handler in global {
            handler(method, &params);
        }

        if method == "update" {
            if let Some(session_id) = params.get("sessionId").and_then(|s| s.as_str()) {
                let handlers: Vec<SessionHandler> = {
                    let map = self.session_handlers.lock().await;
                    map.get(session_id)
                        .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                        .unwrap_or_default()
                };
                for handler in handlers {
                    handler(params.clone());
                }
            }
        }
    }

    /// Mark dead, end stdin, and reject all pending requests. Idempotent.
    async fn shutdown(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stdin.lock().await.take();
        let mut pending = self.pending.lock().await;
        for (_, entry) in pending.drain() {
            let _ = entry.tx.send(Err(AdapterError::Transport(format!(
                "{} exited before responding to '{}'",
                self.display_name, entry.method
            ))));
        }
    }
}
