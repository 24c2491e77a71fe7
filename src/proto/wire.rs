//! JSON-RPC 2.0 frame classification and typed ACP payloads.
//!
//! Every line on the agent stream is one self-contained JSON value. A frame
//! is one of four shapes:
//!
//! | Shape                       | Classified as             |
//! |-----------------------------|---------------------------|
//! | `method` + `id`             | [`Frame::Request`]        |
//! | `method`, no `id`           | [`Frame::Notification`]   |
//! | `id` + `result`             | [`Frame::Response`]       |
//! | `id` + `error`              | [`Frame::ErrorResponse`]  |
//!
//! Anything else is a protocol error. Inbound request ids are echoed back
//! verbatim; outbound ids are always `u64`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{AppError, Result};

/// Protocol version this client speaks and validates during the handshake.
pub const PROTOCOL_VERSION: u16 = 1;

// ── Method names ─────────────────────────────────────────────────────────────

/// Outbound: handshake request, must be the first call on a connection.
pub const METHOD_INITIALIZE: &str = "initialize";
/// Outbound: establish a session.
pub const METHOD_SESSION_NEW: &str = "session/new";
/// Outbound: start a prompt turn.
pub const METHOD_SESSION_PROMPT: &str = "session/prompt";
/// Outbound: ask the agent to abort the in-flight turn.
pub const METHOD_SESSION_CANCEL: &str = "session/cancel";
/// Outbound: select a session mode.
pub const METHOD_SESSION_SET_MODE: &str = "session/set_mode";
/// Outbound: select a session model (optional/unstable capability).
pub const METHOD_SESSION_SET_MODEL: &str = "session/set_model";

/// Inbound notification: streamed session update.
pub const METHOD_SESSION_UPDATE: &str = "session/update";
/// Inbound request: interactive permission decision.
pub const METHOD_REQUEST_PERMISSION: &str = "session/request_permission";
/// Inbound request: read a text file.
pub const METHOD_FS_READ: &str = "fs/read_text_file";
/// Inbound request: write a text file.
pub const METHOD_FS_WRITE: &str = "fs/write_text_file";
/// Inbound request: spawn a proxied terminal.
pub const METHOD_TERMINAL_CREATE: &str = "terminal/create";
/// Inbound request: snapshot a terminal's buffered output.
pub const METHOD_TERMINAL_OUTPUT: &str = "terminal/output";
/// Inbound request: wait for a terminal to exit.
pub const METHOD_TERMINAL_WAIT: &str = "terminal/wait_for_exit";
/// Inbound request: kill a terminal (idempotent).
pub const METHOD_TERMINAL_KILL: &str = "terminal/kill";
/// Inbound request: kill and forget a terminal (idempotent).
pub const METHOD_TERMINAL_RELEASE: &str = "terminal/release";

// ── Error codes ──────────────────────────────────────────────────────────────

/// JSON-RPC: invalid JSON was received.
pub const CODE_PARSE_ERROR: i64 = -32700;
/// JSON-RPC: the method does not exist / is not available.
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC: invalid method parameters.
pub const CODE_INVALID_PARAMS: i64 = -32602;
/// JSON-RPC: internal error while servicing the call.
pub const CODE_INTERNAL_ERROR: i64 = -32603;

/// Protocol-level error carried in an error response frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcError {
    /// JSON-RPC error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// `-32601` for an unrecognized inbound method.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: CODE_METHOD_NOT_FOUND,
            message: format!("method not supported: {method}"),
            data: None,
        }
    }

    /// `-32602` for parameters that failed to deserialize.
    #[must_use]
    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self {
            code: CODE_INVALID_PARAMS,
            message: format!("invalid params: {}", detail.into()),
            data: None,
        }
    }

    /// `-32603` for a handler failure local to one call.
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self {
            code: CODE_INTERNAL_ERROR,
            message: detail.into(),
            data: None,
        }
    }
}

// ── Frame classification ─────────────────────────────────────────────────────

/// One classified protocol frame.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Inbound capability call awaiting a response. The id is echoed back
    /// verbatim in the response frame.
    Request {
        /// Correlation id as sent by the agent.
        id: Value,
        /// Wire method name.
        method: String,
        /// Method parameters (`Null` when absent).
        params: Value,
    },
    /// One-way message with no id.
    Notification {
        /// Wire method name.
        method: String,
        /// Method parameters (`Null` when absent).
        params: Value,
    },
    /// Successful reply to one of our outbound requests.
    Response {
        /// Our request id.
        id: u64,
        /// Result payload.
        result: Value,
    },
    /// Error reply to one of our outbound requests.
    ErrorResponse {
        /// Our request id.
        id: u64,
        /// Error payload.
        error: RpcError,
    },
}

impl Frame {
    /// Classify one NDJSON line.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] if the line is not valid JSON, is not
    /// an object, or fits none of the four frame shapes.
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| AppError::Protocol(format!("malformed json: {e}")))?;

        let Value::Object(ref obj) = value else {
            return Err(AppError::Protocol("frame is not a JSON object".into()));
        };

        let id = obj.get("id").cloned();
        let method = obj.get("method").and_then(Value::as_str).map(str::to_owned);
        let params = obj.get("params").cloned().unwrap_or(Value::Null);

        if let Some(method) = method {
            return Ok(match id {
                Some(id) if !id.is_null() => Self::Request { id, method, params },
                _ => Self::Notification { method, params },
            });
        }

        let Some(id) = id.as_ref().and_then(Value::as_u64) else {
            return Err(AppError::Protocol(
                "frame has neither method nor a numeric id".into(),
            ));
        };

        if let Some(error) = obj.get("error") {
            let error: RpcError = serde_json::from_value(error.clone())
                .map_err(|e| AppError::Protocol(format!("malformed error payload: {e}")))?;
            return Ok(Self::ErrorResponse { id, error });
        }

        match obj.get("result") {
            Some(result) => Ok(Self::Response {
                id,
                result: result.clone(),
            }),
            None => Err(AppError::Protocol(
                "response frame carries neither result nor error".into(),
            )),
        }
    }
}

/// Build an outbound request frame.
#[must_use]
pub fn request_frame(id: u64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

/// Build an outbound notification frame (no id).
#[must_use]
pub fn notification_frame(method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "method": method, "params": params })
}

/// Build a success response to an inbound request, echoing its id.
#[must_use]
pub fn response_frame(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Build an error response to an inbound request, echoing its id.
#[must_use]
pub fn error_frame(id: &Value, error: &RpcError) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

// ── Handshake & session payloads ─────────────────────────────────────────────

/// Client identity advertised during `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    /// Client name.
    pub name: String,
    /// Client version.
    pub version: String,
}

/// File-system capabilities advertised during `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsCapabilities {
    /// Client services `fs/read_text_file`.
    pub read_text_file: bool,
    /// Client services `fs/write_text_file`.
    pub write_text_file: bool,
}

/// Capabilities advertised during `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    /// File-system capability block.
    pub fs: FsCapabilities,
    /// Client services the `terminal/*` method family.
    pub terminal: bool,
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        Self {
            fs: FsCapabilities {
                read_text_file: true,
                write_text_file: true,
            },
            terminal: true,
        }
    }
}

/// `initialize` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Protocol version the client speaks.
    pub protocol_version: u16,
    /// Client identity.
    pub client_info: ClientInfo,
    /// Client capabilities.
    pub client_capabilities: ClientCapabilities,
}

/// `initialize` response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Negotiated protocol version; must equal [`PROTOCOL_VERSION`].
    pub protocol_version: u16,
    /// Agent capability block, kept loosely typed.
    #[serde(default)]
    pub agent_capabilities: Option<Value>,
}

/// A named session mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionMode {
    /// Mode identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Mode state returned by `session/new`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModeState {
    /// Currently selected mode.
    pub current_mode_id: String,
    /// Selectable modes.
    #[serde(default)]
    pub available_modes: Vec<SessionMode>,
}

/// A named session model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionModel {
    /// Model identifier.
    pub model_id: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Model state returned by `session/new`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelState {
    /// Currently selected model.
    pub current_model_id: String,
    /// Selectable models.
    #[serde(default)]
    pub available_models: Vec<SessionModel>,
}

/// A slash-command advertised by the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AvailableCommand {
    /// Command name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// `session/new` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionParams {
    /// Working directory for the session.
    pub cwd: String,
    /// MCP server configurations (none are passed by this bridge).
    #[serde(default)]
    pub mcp_servers: Vec<Value>,
}

/// `session/new` response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResult {
    /// Fresh session identifier.
    pub session_id: String,
    /// Initial mode state, when the agent supports modes.
    #[serde(default)]
    pub modes: Option<ModeState>,
    /// Initial model state, when the agent supports model selection.
    #[serde(default)]
    pub models: Option<ModelState>,
    /// Initial command list, when advertised up front.
    #[serde(default)]
    pub available_commands: Vec<AvailableCommand>,
    /// Agent-defined configuration options, kept loosely typed.
    #[serde(default)]
    pub config_options: Option<Value>,
}

/// One block of prompt content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text payload.
        text: String,
    },
}

impl ContentBlock {
    /// Build a text block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// `session/prompt` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptParams {
    /// Target session.
    pub session_id: String,
    /// Prompt content blocks.
    pub prompt: Vec<ContentBlock>,
}

/// `session/prompt` response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResult {
    /// Why the turn ended (`end_turn`, `cancelled`, …).
    pub stop_reason: String,
}

/// Parameters for `session/cancel`, `session/set_mode`, `session/set_model`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdParams {
    /// Target session.
    pub session_id: String,
    /// Mode id for `session/set_mode`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode_id: Option<String>,
    /// Model id for `session/set_model`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

// ── Permission payloads ──────────────────────────────────────────────────────

/// Kind flag on a permission option.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOptionKind {
    /// Allow this one invocation.
    AllowOnce,
    /// Allow this and future invocations.
    AllowAlways,
    /// Reject this one invocation.
    RejectOnce,
    /// Reject this and future invocations.
    RejectAlways,
    /// Forward-compatible fallback.
    #[serde(other)]
    Other,
}

/// One selectable permission option.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    /// Identifier echoed back in the outcome.
    pub option_id: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Behavior classification.
    pub kind: PermissionOptionKind,
}

/// `session/request_permission` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPermissionParams {
    /// Session the request belongs to.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Tool call being gated, kept loosely typed for display.
    #[serde(default)]
    pub tool_call: Value,
    /// Selectable options.
    pub options: Vec<PermissionOption>,
}

/// The client's decision on a permission request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PermissionOutcome {
    /// Exactly one option was chosen.
    Selected {
        /// The chosen option id.
        #[serde(rename = "optionId")]
        option_id: String,
    },
    /// No selection was made.
    Cancelled,
}

/// `session/request_permission` response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPermissionResult {
    /// The decision.
    pub outcome: PermissionOutcome,
}

// ── File-system payloads ─────────────────────────────────────────────────────

/// `fs/read_text_file` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadTextFileParams {
    /// Session the request belongs to.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Target path.
    pub path: String,
    /// 0-indexed first line of the requested window.
    #[serde(default)]
    pub line: Option<usize>,
    /// Maximum number of lines in the window.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `fs/read_text_file` response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadTextFileResult {
    /// File content (possibly windowed).
    pub content: String,
}

/// `fs/write_text_file` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteTextFileParams {
    /// Session the request belongs to.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Target path.
    pub path: String,
    /// Full replacement content.
    pub content: String,
}

// ── Terminal payloads ────────────────────────────────────────────────────────

/// One environment variable for a terminal spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVariable {
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: String,
}

/// `terminal/create` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminalParams {
    /// Session the terminal belongs to.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Executable to run.
    pub command: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory (workspace root when absent).
    #[serde(default)]
    pub cwd: Option<String>,
    /// Environment overlay.
    #[serde(default)]
    pub env: Vec<EnvVariable>,
    /// Combined-output byte cap; the registry falls back to its configured
    /// default when absent.
    #[serde(default)]
    pub output_byte_limit: Option<usize>,
}

/// `terminal/create` response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminalResult {
    /// Fresh terminal id, unique for the connection's lifetime.
    pub terminal_id: String,
}

/// Parameters addressing an existing terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalIdParams {
    /// Session the terminal belongs to.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Target terminal.
    pub terminal_id: String,
}

/// How a terminal process ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TerminalExit {
    /// Process exit code, absent when signal-terminated.
    pub exit_code: Option<i32>,
    /// Terminating signal name, unix only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

/// `terminal/output` response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalOutputResult {
    /// Combined stdout/stderr buffer.
    pub output: String,
    /// Whether front-truncation has ever occurred.
    pub truncated: bool,
    /// `None` while the process is still running.
    pub exit_status: Option<TerminalExit>,
}

// ── Session updates ──────────────────────────────────────────────────────────

/// One streamed `session/update` notification.
#[derive(Debug, Clone)]
pub struct SessionNotification {
    /// Session the update belongs to.
    pub session_id: String,
    /// The update payload.
    pub update: SessionUpdate,
}

/// Tagged union of session update kinds, keyed by the `sessionUpdate`
/// discriminant. Kinds this bridge does not model are preserved verbatim in
/// [`SessionUpdate::Other`] and still forwarded to subscribers.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum SessionUpdate {
    /// A chunk of the agent's visible reply.
    AgentMessageChunk {
        /// Content block, loosely typed.
        content: Value,
    },
    /// A chunk of the agent's reasoning.
    AgentThoughtChunk {
        /// Content block, loosely typed.
        content: Value,
    },
    /// Echo of user prompt content.
    UserMessageChunk {
        /// Content block, loosely typed.
        content: Value,
    },
    /// A tool call started.
    ToolCall {
        /// Variant-specific fields, forwarded verbatim.
        #[serde(flatten)]
        body: Value,
    },
    /// A tool call progressed or finished.
    ToolCallUpdate {
        /// Variant-specific fields, forwarded verbatim.
        #[serde(flatten)]
        body: Value,
    },
    /// The agent published or revised its plan.
    Plan {
        /// Variant-specific fields, forwarded verbatim.
        #[serde(flatten)]
        body: Value,
    },
    /// The command list changed; patches session metadata.
    AvailableCommandsUpdate {
        /// Replacement command list.
        #[serde(rename = "availableCommands")]
        available_commands: Vec<AvailableCommand>,
    },
    /// The current mode changed; patches session metadata.
    CurrentModeUpdate {
        /// New mode id.
        #[serde(rename = "currentModeId")]
        current_mode_id: String,
    },
    /// The current model changed; patches session metadata.
    CurrentModelUpdate {
        /// New model id.
        #[serde(rename = "currentModelId")]
        current_model_id: String,
    },
    /// Unrecognized update kind, preserved verbatim.
    #[serde(skip)]
    Other(Value),
}

/// Parse `session/update` notification params.
///
/// Unknown update kinds degrade to [`SessionUpdate::Other`] rather than
/// failing, so a newer agent never breaks the stream.
///
/// # Errors
///
/// Returns [`AppError::Protocol`] when `params` lacks a `sessionId` or an
/// `update` object.
pub fn parse_session_notification(params: &Value) -> Result<SessionNotification> {
    let session_id = params
        .get("sessionId")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Protocol("session/update missing sessionId".into()))?
        .to_owned();

    let update_value = params
        .get("update")
        .cloned()
        .ok_or_else(|| AppError::Protocol("session/update missing update".into()))?;

    let update = serde_json::from_value::<SessionUpdate>(update_value.clone())
        .unwrap_or(SessionUpdate::Other(update_value));

    Ok(SessionNotification { session_id, update })
}
