//! ACP agent process spawner.
//!
//! Spawns one agent process per workspace with:
//! - `kill_on_drop(true)` so a leaked handle never leaves an orphan.
//! - `env_clear()` plus an allowlist, so the host's secrets never reach the
//!   child; only the configured credential is injected explicitly.
//! - All three standard streams piped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::info;

use crate::acp::codec::{MAX_LINE_BYTES, READ_BUFFER_BYTES};
use crate::{AppError, Result};

/// Environment variables inherited by the spawned agent process.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Variable carrying the workspace path into the child.
pub const WORKSPACE_ENV_VAR: &str = "CONDUCTOR_WORKSPACE";

/// Default time to wait for the child to exit after its stdin closes.
pub const DEFAULT_PROCESS_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for spawning an ACP agent process.
#[derive(Clone)]
pub struct SpawnConfig {
    /// Agent binary.
    pub program: String,
    /// Arguments passed before any workspace-specific value.
    pub args: Vec<String>,
    /// Extra variables injected after the allowlist (credential, etc.).
    pub env: Vec<(String, String)>,
    /// Grace period for the child to exit on close before it is killed.
    pub process_exit_timeout: Duration,
    /// Hard cap on a single response line.
    pub max_line_bytes: usize,
    /// Initial capacity of the response read buffer.
    pub read_buffer_bytes: usize,
}

impl SpawnConfig {
    /// Configuration with default limits and no extra environment.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
            process_exit_timeout: DEFAULT_PROCESS_EXIT_TIMEOUT,
            max_line_bytes: MAX_LINE_BYTES,
            read_buffer_bytes: READ_BUFFER_BYTES,
        }
    }
}

// Env values may hold the credential; keep them out of logs.
impl std::fmt::Debug for SpawnConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let env_keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("SpawnConfig")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env_keys", &env_keys)
            .field("process_exit_timeout", &self.process_exit_timeout)
            .field("max_line_bytes", &self.max_line_bytes)
            .field("read_buffer_bytes", &self.read_buffer_bytes)
            .finish()
    }
}

/// A freshly spawned agent process with its stdio captured.
#[derive(Debug)]
pub struct AgentProcess {
    /// Workspace the process was launched in.
    pub workspace: PathBuf,
    /// Child handle; `kill_on_drop` is set.
    pub child: Child,
    /// Request channel.
    pub stdin: ChildStdin,
    /// Response channel.
    pub stdout: ChildStdout,
    /// Diagnostic channel.
    pub stderr: ChildStderr,
}

/// Spawn the agent process for `workspace`.
///
/// # Errors
///
/// - `AppError::Spawn("failed to spawn agent: …")` on OS spawn failure.
/// - `AppError::Spawn("failed to capture …")` if a pipe is missing.
pub fn spawn_agent_process(config: &SpawnConfig, workspace: &Path) -> Result<AgentProcess> {
    let mut cmd = Command::new(&config.program);
    cmd.args(&config.args);

    // Strip inherited environment, then inject only the safe allowlist.
    cmd.env_clear();
    for &key in ALLOWED_ENV_VARS {
        if let Ok(val) = std::env::var(key) {
            cmd.env(key, val);
        }
    }
    for (key, val) in &config.env {
        cmd.env(key, val);
    }
    cmd.env(WORKSPACE_ENV_VAR, workspace);

    cmd.current_dir(workspace)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Spawn(format!("failed to spawn agent: {err}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stderr".into()))?;

    info!(
        pid = child.id().unwrap_or(0),
        program = config.program,
        workspace = %workspace.display(),
        "agent process spawned"
    );

    Ok(AgentProcess {
        workspace: workspace.to_path_buf(),
        child,
        stdin,
        stdout,
        stderr,
    })
}
