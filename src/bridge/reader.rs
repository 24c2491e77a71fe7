//! Reader task: frames the inbound stream and routes each message.
//!
//! Reads NDJSON lines through [`WireCodec`], classifies each into a
//! [`Frame`], and routes it:
//!
//! | Frame            | Routed to                                        |
//! |------------------|--------------------------------------------------|
//! | `Response`       | the pending outbound request with that id        |
//! | `ErrorResponse`  | same, as an error                                |
//! | `Notification`   | `session/update` → coordinator event channel     |
//! | `Request`        | [`InboundServices`], one spawned task per call   |
//!
//! Each inbound capability call runs in its own task, so a slow handler
//! (an interactive permission prompt) never delays notification delivery.
//! Malformed lines are logged and skipped; only EOF or an I/O error ends
//! the reader, which then emits [`BridgeEvent::Closed`].

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bridge::dispatch::InboundServices;
use crate::bridge::{agent_error, BridgeEvent, RpcBridge};
use crate::proto::codec::WireCodec;
use crate::proto::wire::{self, Frame};
use crate::AppError;

/// Drive the inbound side of the connection until EOF or cancellation.
pub async fn run_reader<R>(
    source: R,
    bridge: Arc<RpcBridge>,
    services: Arc<InboundServices>,
    event_tx: mpsc::Sender<BridgeEvent>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(source, WireCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!("reader: EOF on agent stream");
                        send_closed(&event_tx, "agent stream closed").await;
                        break;
                    }
                    Some(Err(AppError::Protocol(msg))) => {
                        // Framing error (line too long), skip the line.
                        warn!(error = %msg, "reader: framing error, skipping line");
                    }
                    Some(Err(err)) => {
                        warn!(%err, "reader: stream error, stopping");
                        send_closed(&event_tx, &format!("stream error: {err}")).await;
                        break;
                    }
                    Some(Ok(line)) => {
                        route_line(&line, &bridge, &services, &event_tx);
                    }
                }
            }
        }
    }
}

/// Classify one line and hand it to the right consumer.
fn route_line(
    line: &str,
    bridge: &Arc<RpcBridge>,
    services: &Arc<InboundServices>,
    event_tx: &mpsc::Sender<BridgeEvent>,
) {
    if line.trim().is_empty() {
        return;
    }

    let frame = match Frame::parse(line) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(%err, raw_line = %line, "reader: unparseable frame, skipping");
            return;
        }
    };

    match frame {
        Frame::Response { id, result } => bridge.resolve(id, Ok(result)),
        Frame::ErrorResponse { id, error } => {
            bridge.resolve(id, Err(agent_error("request", &error)));
        }
        Frame::Notification { method, params } => {
            if method == wire::METHOD_SESSION_UPDATE {
                match wire::parse_session_notification(&params) {
                    Ok(notification) => {
                        let event_tx = event_tx.clone();
                        tokio::spawn(async move {
                            if event_tx.send(BridgeEvent::Update(notification)).await.is_err() {
                                debug!("reader: event channel closed, update dropped");
                            }
                        });
                    }
                    Err(err) => warn!(%err, "reader: bad session/update, skipping"),
                }
            } else {
                debug!(method = %method, "reader: skipping unknown notification");
            }
        }
        Frame::Request { id, method, params } => {
            // One task per inbound call: a blocked handler must not stall
            // unrelated traffic.
            let bridge = Arc::clone(bridge);
            let services = Arc::clone(services);
            tokio::spawn(async move {
                let frame = match services.handle(&method, params).await {
                    Ok(result) => wire::response_frame(&id, result),
                    Err(error) => {
                        debug!(method = %method, code = error.code, "inbound call failed");
                        wire::error_frame(&id, &error)
                    }
                };
                bridge.send_frame(frame).await;
            });
        }
    }
}

async fn send_closed(event_tx: &mpsc::Sender<BridgeEvent>, reason: &str) {
    let event = BridgeEvent::Closed {
        reason: reason.to_owned(),
    };
    if event_tx.send(event).await.is_err() {
        debug!("reader: event channel closed before Closed could be delivered");
    }
}
