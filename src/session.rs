//! Connection and session state coordination.
//!
//! [`AgentConnection`] owns the connection state machine, the active
//! session's metadata, and the observer list. It wires the process
//! supervisor, the protocol bridge, and the inbound handler collaborators
//! together, consumes bridge events, and re-emits immutable snapshots to
//! UI subscribers.
//!
//! State machine:
//!
//! ```text
//! disconnected --connect()--> connecting --handshake ok--> connected
//!      ^                                                        |
//!      +--------- process exit / stream error / disconnect -----+
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::dispatch::InboundServices;
use crate::bridge::{reader, run_writer, BridgeEvent, RpcBridge};
use crate::config::ConduitConfig;
use crate::files::FileAccessProxy;
use crate::permission::{PermissionChooser, PermissionMediator};
use crate::process::{self, LaunchSpec};
use crate::proto::wire::{
    self, AvailableCommand, ClientCapabilities, ClientInfo, ContentBlock, InitializeParams,
    InitializeResult, NewSessionParams, NewSessionResult, PromptParams, PromptResult,
    SessionIdParams, SessionModel, SessionMode, SessionNotification, SessionUpdate,
    PROTOCOL_VERSION,
};
use crate::terminal::TerminalRegistry;
use crate::{AppError, Result};

/// Connection lifecycle state, owned exclusively by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No agent process / stream.
    Disconnected,
    /// Connect attempt in flight (spawn + handshake).
    Connecting,
    /// Handshake and session establishment completed.
    Connected,
}

/// Immutable snapshot of the active session's metadata.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    /// Session identifier from `session/new`.
    pub session_id: String,
    /// Selectable modes.
    pub available_modes: Vec<SessionMode>,
    /// Currently selected mode.
    pub current_mode_id: Option<String>,
    /// Selectable models; empty when the agent does not advertise model
    /// selection.
    pub available_models: Vec<SessionModel>,
    /// Currently selected model.
    pub current_model_id: Option<String>,
    /// Agent-advertised slash commands.
    pub available_commands: Vec<AvailableCommand>,
    /// Agent-defined configuration options, loosely typed.
    pub config_options: Option<Value>,
}

impl SessionMeta {
    fn from_new_session(result: NewSessionResult) -> Self {
        let (current_mode_id, available_modes) = match result.modes {
            Some(modes) => (Some(modes.current_mode_id), modes.available_modes),
            None => (None, Vec::new()),
        };
        let (current_model_id, available_models) = match result.models {
            Some(models) => (Some(models.current_model_id), models.available_models),
            None => (None, Vec::new()),
        };
        Self {
            session_id: result.session_id,
            available_modes,
            current_mode_id,
            available_models,
            current_model_id,
            available_commands: result.available_commands,
            config_options: result.config_options,
        }
    }
}

/// UI collaborator notified of connection activity.
///
/// All methods receive immutable snapshots; default implementations ignore
/// the event so a sink only overrides what it cares about.
pub trait UiSink: Send + Sync {
    /// Connection state changed.
    fn on_state_change(&self, _state: ConnectionState) {}
    /// A session update streamed in (forwarded verbatim).
    fn on_session_update(&self, _notification: &SessionNotification) {}
    /// Session metadata changed (full snapshot, never a partial patch).
    fn on_metadata_change(&self, _meta: &SessionMeta) {}
}

/// Live per-connection resources; replaced wholesale on each connect.
struct ConnectionRuntime {
    bridge: Arc<RpcBridge>,
    cancel: CancellationToken,
}

/// The agent-process bridge: one connection, one agent subprocess, zero or
/// more proxied terminals.
pub struct AgentConnection {
    config: ConduitConfig,
    state: Mutex<ConnectionState>,
    session: Mutex<Option<SessionMeta>>,
    sinks: Mutex<Vec<Arc<dyn UiSink>>>,
    terminals: Arc<TerminalRegistry>,
    permissions: Arc<PermissionMediator>,
    runtime: Mutex<Option<ConnectionRuntime>>,
}

impl AgentConnection {
    /// Create a disconnected connection with the given permission chooser.
    #[must_use]
    pub fn new(config: ConduitConfig, chooser: Arc<dyn PermissionChooser>) -> Arc<Self> {
        let terminals = Arc::new(TerminalRegistry::new(
            config.workspace_root.clone(),
            config.terminal_output_limit,
        ));
        let permissions = Arc::new(PermissionMediator::new(config.permission_policy, chooser));
        Arc::new(Self {
            config,
            state: Mutex::new(ConnectionState::Disconnected),
            session: Mutex::new(None),
            sinks: Mutex::new(Vec::new()),
            terminals,
            permissions,
            runtime: Mutex::new(None),
        })
    }

    /// Register a UI subscriber. Lifetime is tied to this connection
    /// instance, not the whole process.
    pub fn subscribe(&self, sink: Arc<dyn UiSink>) {
        lock(&self.sinks).push(sink);
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Snapshot of the active session's metadata, if any.
    #[must_use]
    pub fn metadata(&self) -> Option<SessionMeta> {
        lock(&self.session).clone()
    }

    /// Terminal registry owned by this connection.
    #[must_use]
    pub fn terminals(&self) -> &Arc<TerminalRegistry> {
        &self.terminals
    }

    // ── Connect / disconnect ─────────────────────────────────────────────

    /// Spawn the configured agent process and establish a session.
    ///
    /// No-op when already connected. Fails with `AlreadyConnecting` when an
    /// attempt is in flight; any spawn/handshake failure resets the state
    /// to disconnected.
    ///
    /// # Errors
    ///
    /// [`AppError::AlreadyConnecting`], [`AppError::Spawn`], or
    /// [`AppError::Protocol`].
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if !self.begin_connect()? {
            return Ok(());
        }

        let spec = LaunchSpec {
            command: self.config.command.clone(),
            args: self.config.args.clone(),
            cwd: self.config.workspace_root.clone(),
            env: self.config.resolved_env(),
        };
        let io = match process::spawn_agent(&spec) {
            Ok(io) => io,
            Err(err) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(err);
            }
        };

        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel(256);

        // Route process exit into the same closed-path as stream EOF.
        let (exit_tx, mut exit_rx) = mpsc::channel(1);
        let _monitor = process::monitor_exit(io.child, exit_tx, cancel.clone());
        let closed_tx = event_tx.clone();
        tokio::spawn(async move {
            if let Some(report) = exit_rx.recv().await {
                let reason = match (report.exit_code, report.signal) {
                    (Some(code), _) => format!("agent exited with code {code}"),
                    (None, Some(signal)) => format!("agent terminated by {signal}"),
                    (None, None) => "agent exited".to_owned(),
                };
                let _ = closed_tx.send(BridgeEvent::Closed { reason }).await;
            }
        });

        self.establish(io.stdout, io.stdin, cancel, event_tx, event_rx)
            .await
    }

    /// Attach to an already-running agent over arbitrary duplex streams.
    ///
    /// Same state machine as [`connect`](Self::connect), without spawning a
    /// subprocess; teardown is driven by stream EOF or explicit disconnect.
    ///
    /// # Errors
    ///
    /// [`AppError::AlreadyConnecting`] or [`AppError::Protocol`].
    pub async fn connect_over<R, W>(self: &Arc<Self>, read: R, write: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if !self.begin_connect()? {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel(256);
        self.establish(read, write, cancel, event_tx, event_rx).await
    }

    /// Tear the connection down explicitly.
    pub fn disconnect(&self) {
        self.teardown("client disconnect");
    }

    // ── Outbound session operations ──────────────────────────────────────

    /// Run one prompt turn and await its stop reason.
    ///
    /// # Errors
    ///
    /// [`AppError::Session`] with no active session, plus the bridge's
    /// request errors.
    pub async fn prompt(&self, text: &str) -> Result<PromptResult> {
        let (bridge, session_id) = self.active()?;
        let params = PromptParams {
            session_id,
            prompt: vec![ContentBlock::text(text)],
        };
        let value = bridge
            .request(wire::METHOD_SESSION_PROMPT, encode_params(&params)?)
            .await?;
        serde_json::from_value(value)
            .map_err(|e| AppError::Protocol(format!("unexpected prompt response shape: {e}")))
    }

    /// Ask the agent to abort the in-flight prompt turn.
    ///
    /// This is an awaited round trip; the original `prompt` call still
    /// resolves on its own with a cancellation stop reason.
    ///
    /// # Errors
    ///
    /// [`AppError::Session`] with no active session, plus request errors.
    pub async fn cancel(&self) -> Result<()> {
        let (bridge, session_id) = self.active()?;
        let params = SessionIdParams {
            session_id,
            mode_id: None,
            model_id: None,
        };
        bridge
            .request(wire::METHOD_SESSION_CANCEL, encode_params(&params)?)
            .await?;
        Ok(())
    }

    /// Select a session mode.
    ///
    /// Metadata is not patched here; the agent confirms the switch with a
    /// `current_mode_update` notification, which is the single writer of
    /// that field.
    ///
    /// # Errors
    ///
    /// [`AppError::Session`] with no active session, plus request errors.
    pub async fn set_mode(&self, mode_id: &str) -> Result<()> {
        let (bridge, session_id) = self.active()?;
        let params = SessionIdParams {
            session_id,
            mode_id: Some(mode_id.to_owned()),
            model_id: None,
        };
        bridge
            .request(wire::METHOD_SESSION_SET_MODE, encode_params(&params)?)
            .await?;
        Ok(())
    }

    /// Select a session model.
    ///
    /// When the agent advertised no model list in `session/new` the
    /// capability is absent and this is a silent no-op: no request is sent
    /// and `Ok(())` is returned. As with modes, the switch lands in the
    /// metadata via the agent's `current_model_update` notification.
    ///
    /// # Errors
    ///
    /// [`AppError::Session`] with no active session, plus request errors.
    pub async fn set_model(&self, model_id: &str) -> Result<()> {
        let (bridge, session_id) = self.active()?;
        let has_models = lock(&self.session)
            .as_ref()
            .is_some_and(|meta| !meta.available_models.is_empty());
        if !has_models {
            debug!(model_id, "set_model: capability not advertised, no-op");
            return Ok(());
        }
        let params = SessionIdParams {
            session_id,
            mode_id: None,
            model_id: Some(model_id.to_owned()),
        };
        bridge
            .request(wire::METHOD_SESSION_SET_MODEL, encode_params(&params)?)
            .await?;
        Ok(())
    }

    // ── Internal plumbing ────────────────────────────────────────────────

    /// Enter `Connecting`, or report why not.
    ///
    /// Returns `Ok(false)` for the connected no-op case.
    fn begin_connect(&self) -> Result<bool> {
        {
            let mut state = lock(&self.state);
            match *state {
                ConnectionState::Connected => return Ok(false),
                ConnectionState::Connecting => {
                    return Err(AppError::AlreadyConnecting(
                        "a connection attempt is already in flight".into(),
                    ))
                }
                ConnectionState::Disconnected => *state = ConnectionState::Connecting,
            }
        }
        self.emit_state(ConnectionState::Connecting);
        Ok(true)
    }

    /// Wire bridge tasks over the given streams, then run the handshake.
    async fn establish<R, W>(
        self: &Arc<Self>,
        read: R,
        write: W,
        cancel: CancellationToken,
        event_tx: mpsc::Sender<BridgeEvent>,
        mut event_rx: mpsc::Receiver<BridgeEvent>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (frame_tx, frame_rx) = mpsc::channel(256);
        let bridge = Arc::new(RpcBridge::new(frame_tx));
        let services = Arc::new(InboundServices {
            terminals: Arc::clone(&self.terminals),
            permissions: Arc::clone(&self.permissions),
            files: FileAccessProxy::new(self.config.workspace_root.clone()),
        });

        tokio::spawn(run_writer(write, frame_rx, cancel.clone()));
        tokio::spawn(reader::run_reader(
            read,
            Arc::clone(&bridge),
            services,
            event_tx,
            cancel.clone(),
        ));

        *lock(&self.runtime) = Some(ConnectionRuntime {
            bridge: Arc::clone(&bridge),
            cancel,
        });

        let conn = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    BridgeEvent::Update(notification) => conn.apply_update(&notification),
                    BridgeEvent::Closed { reason } => {
                        conn.teardown(&reason);
                        break;
                    }
                }
            }
        });

        match self.handshake(&bridge).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.teardown("handshake failed");
                Err(err)
            }
        }
    }

    /// `initialize` + `session/new`, then preferred-model resolution.
    async fn handshake(&self, bridge: &Arc<RpcBridge>) -> Result<()> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION,
            client_info: ClientInfo {
                name: env!("CARGO_PKG_NAME").to_owned(),
                version: env!("CARGO_PKG_VERSION").to_owned(),
            },
            client_capabilities: ClientCapabilities::default(),
        };
        let value = bridge
            .request(wire::METHOD_INITIALIZE, encode_params(&params)?)
            .await?;
        let init: InitializeResult = serde_json::from_value(value).map_err(|e| {
            AppError::Protocol(format!("unexpected initialize response shape: {e}"))
        })?;
        if init.protocol_version != PROTOCOL_VERSION {
            return Err(AppError::Protocol(format!(
                "protocol version mismatch: agent speaks {}, client speaks {PROTOCOL_VERSION}",
                init.protocol_version
            )));
        }
        info!("handshake completed");

        let params = NewSessionParams {
            cwd: self.config.workspace_root.to_string_lossy().into_owned(),
            mcp_servers: Vec::new(),
        };
        let value = bridge
            .request(wire::METHOD_SESSION_NEW, encode_params(&params)?)
            .await?;
        let result: NewSessionResult = serde_json::from_value(value).map_err(|e| {
            AppError::Protocol(format!("unexpected session/new response shape: {e}"))
        })?;

        let meta = SessionMeta::from_new_session(result);
        info!(session_id = %meta.session_id, "session established");
        *lock(&self.session) = Some(meta);
        self.set_state(ConnectionState::Connected);
        self.emit_metadata();

        self.apply_preferred_model(bridge).await;
        Ok(())
    }

    /// Issue `session/set_model` for the configured preferred model.
    ///
    /// Best-effort: resolution misses and request failures are logged and
    /// leave the agent's default model active.
    async fn apply_preferred_model(&self, bridge: &Arc<RpcBridge>) {
        let Some(query) = self.config.preferred_model.clone() else {
            return;
        };
        let (session_id, current, models) = {
            let session = lock(&self.session);
            let Some(meta) = session.as_ref() else { return };
            (
                meta.session_id.clone(),
                meta.current_model_id.clone(),
                meta.available_models.clone(),
            )
        };
        if models.is_empty() {
            debug!(query, "preferred model: agent advertises no models");
            return;
        }
        let Some(target) = resolve_model(&models, &query) else {
            warn!(query, "preferred model matched nothing, keeping default");
            return;
        };
        if current.as_deref() == Some(target.as_str()) {
            return;
        }

        let params = SessionIdParams {
            session_id,
            mode_id: None,
            model_id: Some(target.clone()),
        };
        let request = async {
            bridge
                .request(wire::METHOD_SESSION_SET_MODEL, encode_params(&params)?)
                .await
        };
        match request.await {
            Ok(_) => {
                info!(model_id = %target, "preferred model applied");
            }
            Err(err) => {
                warn!(%err, "applying preferred model failed, keeping agent default");
            }
        }
    }

    /// Consume one inbound session update: forward verbatim, then patch the
    /// addressed metadata sub-field and re-emit the whole snapshot.
    fn apply_update(&self, notification: &SessionNotification) {
        for sink in self.sink_snapshot() {
            sink.on_session_update(notification);
        }

        match &notification.update {
            SessionUpdate::CurrentModeUpdate { current_mode_id } => {
                self.patch_session(|meta| meta.current_mode_id = Some(current_mode_id.clone()));
            }
            SessionUpdate::CurrentModelUpdate { current_model_id } => {
                self.patch_session(|meta| meta.current_model_id = Some(current_model_id.clone()));
            }
            SessionUpdate::AvailableCommandsUpdate { available_commands } => {
                self.patch_session(|meta| {
                    meta.available_commands = available_commands.clone();
                });
            }
            _ => {}
        }
    }

    /// Idempotent teardown: safe to invoke from process exit, stream error,
    /// and explicit disconnect in any combination.
    fn teardown(&self, reason: &str) {
        let Some(runtime) = lock(&self.runtime).take() else {
            debug!(reason, "teardown: already torn down");
            return;
        };
        info!(reason, "connection teardown");
        runtime.bridge.fail_all_pending();
        runtime.cancel.cancel();
        self.terminals.clear_all();
        *lock(&self.session) = None;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Current bridge + session id, or `Session` error.
    fn active(&self) -> Result<(Arc<RpcBridge>, String)> {
        let bridge = lock(&self.runtime)
            .as_ref()
            .map(|rt| Arc::clone(&rt.bridge))
            .ok_or_else(|| AppError::Session("not connected".into()))?;
        let session_id = lock(&self.session)
            .as_ref()
            .map(|meta| meta.session_id.clone())
            .ok_or_else(|| AppError::Session("no active session".into()))?;
        Ok((bridge, session_id))
    }

    /// Apply a metadata patch and re-emit the full snapshot.
    fn patch_session(&self, patch: impl FnOnce(&mut SessionMeta)) {
        {
            let mut session = lock(&self.session);
            let Some(meta) = session.as_mut() else { return };
            patch(meta);
        }
        self.emit_metadata();
    }

    fn set_state(&self, new: ConnectionState) {
        {
            let mut state = lock(&self.state);
            if *state == new {
                return;
            }
            *state = new;
        }
        self.emit_state(new);
    }

    fn emit_state(&self, state: ConnectionState) {
        for sink in self.sink_snapshot() {
            sink.on_state_change(state);
        }
    }

    fn emit_metadata(&self) {
        let Some(meta) = lock(&self.session).clone() else {
            return;
        };
        for sink in self.sink_snapshot() {
            sink.on_metadata_change(&meta);
        }
    }

    fn sink_snapshot(&self) -> Vec<Arc<dyn UiSink>> {
        lock(&self.sinks).clone()
    }
}

/// Resolve a preferred-model query against the advertised models: exact
/// id/name match first, else case-insensitive substring.
fn resolve_model(models: &[SessionModel], query: &str) -> Option<String> {
    let exact = models
        .iter()
        .find(|m| m.model_id == query || m.name.as_deref() == Some(query));
    if let Some(model) = exact {
        return Some(model.model_id.clone());
    }

    let needle = query.to_lowercase();
    models
        .iter()
        .find(|m| {
            m.model_id.to_lowercase().contains(&needle)
                || m.name
                    .as_deref()
                    .is_some_and(|name| name.to_lowercase().contains(&needle))
        })
        .map(|m| m.model_id.clone())
}

fn encode_params<T: Serialize>(params: &T) -> Result<Value> {
    serde_json::to_value(params)
        .map_err(|e| AppError::Protocol(format!("failed to encode params: {e}")))
}

/// Lock a mutex, recovering from poisoning (a panicked task must not wedge
/// the coordinator).
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
