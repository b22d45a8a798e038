//! Corral Core — provider adapter runtime for the Corral control plane.
//!
//! One client UI drives several heterogeneous AI-agent backends through a
//! single uniform contract. This crate is the part that makes that possible:
//!
//! - `acp`        — bidirectional JSON-RPC 2.0 over a child process's stdio
//! - `providers`  — the `ProviderAdapter` trait and its five implementations
//! - `registry`   — lifecycle coordination (register/start/stop/health)
//! - `normalize`  — the canonical session/event schema all backends map into
//! - `approvals`  — human-in-the-loop tool-approval broker + authorization gate
//! - `usage`      — token-count extraction and static-table cost calculation
//!
//! The WebSocket/HTTP façade that exposes these adapters to phone clients is
//! a separate crate; everything here is transport-agnostic.

pub mod acp;
pub mod approvals;
pub mod error;
pub mod normalize;
pub mod proc;
pub mod providers;
pub mod registry;
pub mod shell_env;
pub mod usage;

// Convenience re-exports
pub use approvals::{ApprovalBroker, ApprovalOutcome, SubscriberIndex};
pub use error::AdapterError;
pub use normalize::{Capabilities, NormalizedEvent, NormalizedSession};
pub use providers::ProviderAdapter;
pub use registry::ProviderRegistry;
