//! Proxied terminal processes requested by the agent.
//!
//! The registry is an owning table (`terminal id → entry`) with no
//! back-pointers: each entry holds the combined output buffer, an exit
//! watch channel, and a kill token. The child handle itself lives inside
//! the entry's wait task, so teardown is a single drain of the table.
//!
//! Asymmetric unknown-id semantics are deliberate and load-bearing:
//! `output`/`wait_for_exit` fail with `NotFound`, while `kill`/`release`
//! succeed as no-ops.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::process::exit_report;
use crate::proto::wire::{CreateTerminalParams, TerminalExit, TerminalOutputResult};
use crate::{AppError, Result};

// ── Output buffer ────────────────────────────────────────────────────────────

/// Combined stdout/stderr buffer with size-bounded front truncation.
///
/// With a byte limit set, the buffer never exceeds it after an append.
/// Overflow trims from the front; the cut offset is advanced to the next
/// UTF-8 character boundary, so the buffer may undershoot the limit by up
/// to three bytes but never splits a scalar value. `truncated` is
/// monotonic: once set it stays set for the buffer's lifetime.
#[derive(Debug)]
pub struct OutputBuffer {
    data: String,
    limit: Option<usize>,
    truncated: bool,
}

impl OutputBuffer {
    /// Create a buffer with an optional byte limit.
    #[must_use]
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            data: String::new(),
            limit,
            truncated: false,
        }
    }

    /// Append a chunk, trimming from the front if the limit is exceeded.
    pub fn append(&mut self, chunk: &str) {
        self.data.push_str(chunk);
        if let Some(limit) = self.limit {
            if self.data.len() > limit {
                let mut cut = self.data.len() - limit;
                while !self.data.is_char_boundary(cut) {
                    cut += 1;
                }
                self.data.drain(..cut);
                self.truncated = true;
            }
        }
    }

    /// Current buffer content.
    #[must_use]
    pub fn contents(&self) -> &str {
        &self.data
    }

    /// Whether front-truncation has ever occurred.
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// One live proxied terminal.
#[derive(Debug)]
struct TerminalEntry {
    buffer: Arc<Mutex<OutputBuffer>>,
    exit_rx: watch::Receiver<Option<TerminalExit>>,
    kill: CancellationToken,
}

/// Owning table of agent-requested terminal processes.
#[derive(Debug)]
pub struct TerminalRegistry {
    workspace_root: PathBuf,
    default_output_limit: usize,
    entries: Mutex<HashMap<String, TerminalEntry>>,
}

impl TerminalRegistry {
    /// Create an empty registry.
    ///
    /// `workspace_root` is the fallback working directory; terminals created
    /// without an explicit `outputByteLimit` get `default_output_limit`.
    #[must_use]
    pub fn new(workspace_root: PathBuf, default_output_limit: usize) -> Self {
        Self {
            workspace_root,
            default_output_limit,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a terminal process and register it under a fresh id.
    ///
    /// stdout and stderr are pumped concurrently into one combined buffer in
    /// arrival order; a wait task owns the child and records its exit status
    /// into the entry's watch channel.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`] when the command is empty or the OS
    /// refuses to launch it.
    pub fn create(&self, params: &CreateTerminalParams) -> Result<String> {
        if params.command.trim().is_empty() {
            return Err(AppError::Spawn("terminal command must not be empty".into()));
        }

        let cwd = params
            .cwd
            .as_ref()
            .map_or_else(|| self.workspace_root.clone(), PathBuf::from);

        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args)
            .current_dir(cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for var in &params.env {
            cmd.env(&var.name, &var.value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Spawn(format!("failed to spawn terminal: {err}")))?;

        let limit = params.output_byte_limit.or(Some(self.default_output_limit));
        let buffer = Arc::new(Mutex::new(OutputBuffer::new(limit)));

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_stream(stdout, Arc::clone(&buffer)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_stream(stderr, Arc::clone(&buffer)));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        let kill_task = kill.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                result = child.wait() => result,
                () = kill_task.cancelled() => {
                    child.start_kill().ok();
                    child.wait().await
                }
            };
            let exit = match status {
                Ok(status) => {
                    let report = exit_report(status);
                    TerminalExit {
                        exit_code: report.exit_code,
                        signal: report.signal,
                    }
                }
                Err(err) => {
                    warn!(%err, "error waiting for terminal process");
                    TerminalExit {
                        exit_code: None,
                        signal: None,
                    }
                }
            };
            // Receivers may already be gone after release; that is fine.
            let _ = exit_tx.send(Some(exit));
        });

        let id = format!("term-{}", Uuid::new_v4());
        self.lock_entries().insert(
            id.clone(),
            TerminalEntry {
                buffer,
                exit_rx,
                kill,
            },
        );

        debug!(terminal_id = %id, command = %params.command, "terminal created");
        Ok(id)
    }

    /// Snapshot the terminal's buffer, truncation flag, and exit status.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] for an unknown id.
    pub fn output(&self, id: &str) -> Result<TerminalOutputResult> {
        let entries = self.lock_entries();
        let entry = entries
            .get(id)
            .ok_or_else(|| AppError::NotFound(format!("unknown terminal '{id}'")))?;

        let (output, truncated) = {
            let buffer = lock_buffer(&entry.buffer);
            (buffer.contents().to_owned(), buffer.truncated())
        };
        let exit_status = entry.exit_rx.borrow().clone();

        Ok(TerminalOutputResult {
            output,
            truncated,
            exit_status,
        })
    }

    /// Wait until the terminal exits; resolves immediately when it already
    /// has. Concurrent waiters all observe the identical exit status.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] for an unknown id.
    pub async fn wait_for_exit(&self, id: &str) -> Result<TerminalExit> {
        let mut exit_rx = {
            let entries = self.lock_entries();
            entries
                .get(id)
                .ok_or_else(|| AppError::NotFound(format!("unknown terminal '{id}'")))?
                .exit_rx
                .clone()
        };

        let value = exit_rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| AppError::Session(format!("terminal '{id}' wait task gone")))?;
        value
            .clone()
            .ok_or_else(|| AppError::Session(format!("terminal '{id}' exit status missing")))
    }

    /// Send a termination signal. Idempotent; success as a no-op for an
    /// unknown id.
    pub fn kill(&self, id: &str) {
        if let Some(entry) = self.lock_entries().get(id) {
            entry.kill.cancel();
            debug!(terminal_id = %id, "terminal kill requested");
        }
    }

    /// Kill if still running and remove the id from the registry. Success
    /// as a no-op for an unknown id; afterwards all other operations on the
    /// id see "unknown id".
    pub fn release(&self, id: &str) {
        if let Some(entry) = self.lock_entries().remove(id) {
            entry.kill.cancel();
            debug!(terminal_id = %id, "terminal released");
        }
    }

    /// Kill and remove every terminal (teardown path). Safe to call twice.
    pub fn clear_all(&self) {
        let drained: Vec<(String, TerminalEntry)> = self.lock_entries().drain().collect();
        for (id, entry) in drained {
            entry.kill.cancel();
            debug!(terminal_id = %id, "terminal cleared on teardown");
        }
    }

    /// Number of live terminals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// Whether the registry holds no terminals.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, TerminalEntry>> {
        // Buffer and table locks are only held for short, await-free
        // sections; a poisoned lock means a panicked task and is propagated.
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn lock_buffer(buffer: &Mutex<OutputBuffer>) -> std::sync::MutexGuard<'_, OutputBuffer> {
    match buffer.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Pump one child stream into the combined buffer until EOF.
///
/// Reads deliver arbitrary byte chunks; a multi-byte character split across
/// two reads is held back until its remaining bytes arrive, so the buffer
/// only ever sees whole scalar values.
async fn pump_stream<R>(mut stream: R, buffer: Arc<Mutex<OutputBuffer>>)
where
    R: AsyncReadExt + Unpin + Send,
{
    let mut chunk = [0_u8; 8192];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&chunk[..n]);
                flush_complete_utf8(&mut pending, &buffer);
            }
            Err(err) => {
                debug!(%err, "terminal stream read failed");
                break;
            }
        }
    }
    if !pending.is_empty() {
        // EOF mid-character; nothing more is coming.
        lock_buffer(&buffer).append(&String::from_utf8_lossy(&pending));
    }
}

/// Append every complete UTF-8 sequence in `pending`, keeping an incomplete
/// trailing sequence for the next read. Genuinely invalid bytes are replaced
/// rather than held forever.
fn flush_complete_utf8(pending: &mut Vec<u8>, buffer: &Arc<Mutex<OutputBuffer>>) {
    loop {
        match std::str::from_utf8(pending) {
            Ok(text) => {
                if !text.is_empty() {
                    lock_buffer(buffer).append(text);
                }
                pending.clear();
                return;
            }
            Err(err) => {
                let valid = err.valid_up_to();
                if valid > 0 {
                    lock_buffer(buffer).append(&String::from_utf8_lossy(&pending[..valid]));
                }
                match err.error_len() {
                    Some(bad) => {
                        lock_buffer(buffer).append("\u{FFFD}");
                        pending.drain(..valid + bad);
                    }
                    None => {
                        pending.drain(..valid);
                        return;
                    }
                }
            }
        }
    }
}
