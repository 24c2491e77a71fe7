//! Agent subprocess supervision.
//!
//! Spawns the agent with piped stdio and `kill_on_drop(true)`, forwards its
//! stderr to the log sink (stderr is diagnostics-only, never parsed as
//! protocol), and monitors exit through a cancellation-aware task. Exit and
//! stream-EOF paths both funnel into the same idempotent teardown owned by
//! the session coordinator.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{AppError, Result};

/// How to launch the agent subprocess.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Agent executable.
    pub command: String,
    /// Argument vector.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Environment overlay applied on top of the inherited environment.
    pub env: HashMap<String, String>,
}

/// Captured stdio of a freshly spawned agent process.
#[derive(Debug)]
pub struct AgentIo {
    /// Child handle; kept alive so `kill_on_drop` works.
    pub child: Child,
    /// Agent stdin for outbound NDJSON frames.
    pub stdin: ChildStdin,
    /// Agent stdout for inbound NDJSON frames.
    pub stdout: ChildStdout,
}

/// How the agent process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, absent when signal-terminated.
    pub exit_code: Option<i32>,
    /// Terminating signal name, unix only.
    pub signal: Option<String>,
}

/// Spawn the agent subprocess with piped stdio.
///
/// Standard error is consumed by a background logger task so the pipe never
/// fills; it is forwarded line-by-line to `tracing` at debug level.
///
/// # Errors
///
/// Returns [`AppError::Spawn`] when the command is empty, the executable
/// cannot be launched, or a stdio handle cannot be captured.
pub fn spawn_agent(spec: &LaunchSpec) -> Result<AgentIo> {
    if spec.command.trim().is_empty() {
        return Err(AppError::Spawn("agent command must not be empty".into()));
    }

    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .current_dir(&spec.cwd)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
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

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "agent_stderr", "{line}");
            }
        });
    }

    info!(command = %spec.command, cwd = %spec.cwd.display(), "agent process spawned");
    Ok(AgentIo {
        child,
        stdin,
        stdout,
    })
}

/// Spawn a background task that awaits agent exit and reports it.
///
/// When `cancel` fires first (explicit stop or teardown already in
/// progress), the task issues a best-effort kill and exits without
/// reporting; killing an already-exited process is a no-op.
#[must_use]
pub fn monitor_exit(
    mut child: Child,
    exit_tx: mpsc::Sender<ExitReport>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            result = child.wait() => {
                let report = match result {
                    Ok(status) => exit_report(status),
                    Err(err) => {
                        warn!(%err, "error waiting for agent process");
                        ExitReport { exit_code: None, signal: None }
                    }
                };
                if exit_tx.send(report).await.is_err() {
                    debug!("exit channel closed before agent exit could be delivered");
                }
            }
            () = cancel.cancelled() => {
                child.start_kill().ok();
                child.wait().await.ok();
                debug!("agent process stopped on cancellation");
            }
        }
    })
}

/// Split an [`ExitStatus`] into exit code and signal name.
#[must_use]
pub fn exit_report(status: ExitStatus) -> ExitReport {
    ExitReport {
        exit_code: status.code(),
        signal: termination_signal(status),
    }
}

#[cfg(unix)]
fn termination_signal(status: ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(signal_name)
}

#[cfg(not(unix))]
fn termination_signal(_status: ExitStatus) -> Option<String> {
    None
}

/// Map a raw unix signal number to its name (`SIGTERM`, …).
#[cfg(unix)]
#[must_use]
pub fn signal_name(raw: i32) -> String {
    nix::sys::signal::Signal::try_from(raw)
        .map_or_else(|_| format!("SIG{raw}"), |sig| sig.as_str().to_owned())
}
