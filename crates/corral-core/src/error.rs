//! Core error type for the adapter runtime.
//!
//! `AdapterError` is used throughout the runtime (ACP client, adapters,
//! registry, approval gate). Variants map to the failure kinds the registry
//! and retry policy care about: transport and timeout failures are transient
//! and retryable, everything else is not.

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout waiting for '{method}' after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A JSON-RPC error object returned by the peer, surfaced verbatim.
    #[error("RPC error [{code}]: {message}")]
    Application { code: i64, message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("'{method}' is not implemented ({phase})")]
    NotImplemented { method: String, phase: String },
}

impl AdapterError {
    /// Whether the prompt-send retry policy may retry after this error.
    ///
    /// Only transport-level failures qualify; validation and application
    /// errors would fail identically on a second attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdapterError::Transport(_) | AdapterError::Timeout { .. }
        )
    }
}
