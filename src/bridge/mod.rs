//! Protocol bridge: outbound request correlation and the writer task.
//!
//! [`RpcBridge`] assigns strictly increasing ids to outbound requests and
//! parks each caller on a oneshot channel until the matching response frame
//! arrives. When the connection closes, every still-pending entry is failed
//! with `ConnectionClosed`. Inbound traffic is handled by [`reader`].

pub mod dispatch;
pub mod reader;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::proto::wire::{self, RpcError, SessionNotification};
use crate::{AppError, Result};

/// Events surfaced by the bridge tasks to the session coordinator.
#[derive(Debug)]
pub enum BridgeEvent {
    /// A `session/update` notification arrived.
    Update(SessionNotification),
    /// The connection is gone (stream EOF/error or process exit).
    Closed {
        /// Human-readable cause.
        reason: String,
    },
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>;

/// Correlates outbound requests to responses over the writer channel.
#[derive(Debug)]
pub struct RpcBridge {
    outbound_tx: mpsc::Sender<Value>,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl RpcBridge {
    /// Create a bridge writing frames through `outbound_tx`.
    #[must_use]
    pub fn new(outbound_tx: mpsc::Sender<Value>) -> Self {
        Self {
            outbound_tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Send an outbound request and suspend until its response arrives.
    ///
    /// The responder is registered before the frame is written, so a reply
    /// can never race past its pending entry. Ids are unique and
    /// monotonically increasing for the lifetime of the connection.
    ///
    /// # Errors
    ///
    /// - [`AppError::ConnectionClosed`] when the stream is gone before the
    ///   response arrives.
    /// - [`AppError::Protocol`] when the agent answers with an error frame.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id, tx);

        // Teardown sets `closed` before draining the map; re-checking after
        // the insert means an entry registered behind the drain is rejected
        // here instead of pending forever.
        if self.closed.load(Ordering::SeqCst) {
            self.lock_pending().remove(&id);
            return Err(AppError::ConnectionClosed(format!(
                "connection closed before '{method}' could be sent"
            )));
        }

        debug!(id, method, "sending request");
        let frame = wire::request_frame(id, method, params);
        if self.outbound_tx.send(frame).await.is_err() {
            self.lock_pending().remove(&id);
            return Err(AppError::ConnectionClosed(format!(
                "stream closed before '{method}' could be sent"
            )));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(AppError::ConnectionClosed(format!(
                "connection closed while awaiting '{method}'"
            ))),
        }
    }

    /// Send a one-way notification frame (no id, no response).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ConnectionClosed`] when the stream is gone.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let frame = wire::notification_frame(method, params);
        self.outbound_tx.send(frame).await.map_err(|_| {
            AppError::ConnectionClosed(format!("stream closed before '{method}' could be sent"))
        })
    }

    /// Write a raw pre-built frame (used for inbound-call responses).
    pub(crate) async fn send_frame(&self, frame: Value) {
        if self.outbound_tx.send(frame).await.is_err() {
            debug!("dropping frame: writer channel closed");
        }
    }

    /// Resolve the pending request with the given id.
    pub(crate) fn resolve(&self, id: u64, result: Result<Value>) {
        let Some(tx) = self.lock_pending().remove(&id) else {
            warn!(id, "response for unknown or already-resolved request");
            return;
        };
        // The caller may have given up; a dead receiver is fine.
        let _ = tx.send(result);
    }

    /// Mark the bridge closed and fail every still-pending outbound request
    /// with `ConnectionClosed`. Requests issued after this point are
    /// rejected immediately.
    ///
    /// Called exactly once in effect during teardown; calling it again when
    /// the map is already empty is a no-op.
    pub fn fail_all_pending(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<(u64, oneshot::Sender<Result<Value>>)> =
            self.lock_pending().drain().collect();
        for (id, tx) in drained {
            debug!(id, "failing pending request on connection close");
            let _ = tx.send(Err(AppError::ConnectionClosed(
                "connection closed with request in flight".into(),
            )));
        }
    }

    /// Number of requests currently awaiting a response.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<Value>>>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Map an agent error frame to the client-side error type.
pub(crate) fn agent_error(method_hint: &str, error: &RpcError) -> AppError {
    AppError::Protocol(format!(
        "agent error on {method_hint}: {} (code {})",
        error.message, error.code
    ))
}

/// Writer task: serialises outbound frames and writes NDJSON lines.
///
/// Receives [`serde_json::Value`] frames from `frame_rx`, serialises each to
/// a compact single-line JSON string terminated by `\n`, and writes the
/// bytes to the agent's stdin (or any duplex write half).
///
/// Exits cleanly when `cancel` fires or all senders drop; a failed write is
/// logged and ends the task (teardown follows from the reader side).
pub async fn run_writer<W>(
    mut sink: W,
    mut frame_rx: mpsc::Receiver<Value>,
    cancel: CancellationToken,
) where
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("writer: cancellation received, stopping");
                break;
            }

            frame = frame_rx.recv() => {
                let Some(frame) = frame else {
                    debug!("writer: frame channel closed, stopping");
                    break;
                };
                let mut bytes = match serde_json::to_vec(&frame) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(%err, "writer: failed to serialise outbound frame");
                        continue;
                    }
                };
                bytes.push(b'\n');
                if let Err(err) = sink.write_all(&bytes).await {
                    warn!(%err, "writer: write to agent stdin failed, stopping");
                    break;
                }
            }
        }
    }
}
