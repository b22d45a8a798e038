//! ACP (Agent Client Protocol) integration.
//!
//! Bidirectional JSON-RPC 2.0 over newline-delimited JSON on a child
//! process's stdin/stdout. The client correlates responses to callers by
//! id regardless of arrival order, dispatches server-initiated requests to
//! registered handlers, and routes `update` notifications only to handlers
//! registered for the exact session they belong to.

pub mod client;

pub use client::{AcpClient, RpcError, DEFAULT_TIMEOUT_MS, PROMPT_TIMEOUT_MS};
