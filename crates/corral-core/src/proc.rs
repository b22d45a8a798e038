//! Child-process helpers shared by the subprocess-backed adapters.
//!
//! Covers the small lifecycle surface every spawned agent needs: spawn with
//! piped stdio and the full shell PATH, a liveness check, and a graceful
//! kill that gives the agent a window to exit on its own before SIGKILL.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::error::AdapterError;
use crate::shell_env;

/// How long `graceful_kill` waits for a voluntary exit before killing.
pub const KILL_GRACE: Duration = Duration::from_millis(2_000);

/// Spawn an agent process with piped stdio, resolving `command` against the
/// full shell PATH first.
pub fn spawn_agent(command: &str, args: &[String], cwd: &str) -> Result<Child, AdapterError> {
    let resolved = shell_env::which(command).unwrap_or_else(|| command.to_string());

    Command::new(&resolved)
        .args(args)
        .current_dir(cwd)
        .env("PATH", shell_env::full_path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            AdapterError::Transport(format!(
                "Failed to spawn '{}' (resolved: '{}'): {}. Is it installed and in PATH?",
                command, resolved, e
            ))
        })
}

/// Whether the child is still running.
pub fn is_alive(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

/// Close stdin, wait up to `grace` for the child to exit, then kill it.
pub async fn graceful_kill(child: &mut Child, grace: Duration) {
    if let Some(stdin) = child.stdin.take() {
        drop(stdin);
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            let _ = child.kill().await;
        }
    }
}
