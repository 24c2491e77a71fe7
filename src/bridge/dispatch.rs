//! Typed dispatch of inbound capability calls.
//!
//! Maps each inbound method name to its handler collaborator. A failure
//! inside one handler becomes a protocol-level error response for that call
//! only; it never terminates the connection. Unrecognized methods are
//! answered with a "method not supported" error rather than dropped.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::files::FileAccessProxy;
use crate::permission::PermissionMediator;
use crate::proto::wire::{
    self, CreateTerminalResult, ReadTextFileParams, ReadTextFileResult, RequestPermissionParams,
    RequestPermissionResult, RpcError, TerminalIdParams, WriteTextFileParams,
};
use crate::terminal::TerminalRegistry;
use crate::AppError;

/// Handler collaborators for inbound capability calls.
pub struct InboundServices {
    /// Terminal proxy subsystem.
    pub terminals: Arc<TerminalRegistry>,
    /// Permission mediation.
    pub permissions: Arc<PermissionMediator>,
    /// Host filesystem access.
    pub files: FileAccessProxy,
}

impl InboundServices {
    /// Service one inbound capability call.
    ///
    /// # Errors
    ///
    /// Returns the protocol-level error to send back for this call.
    pub async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            wire::METHOD_REQUEST_PERMISSION => {
                let p: RequestPermissionParams = parse(params)?;
                let outcome = self.permissions.decide(&p.tool_call, &p.options).await;
                encode(&RequestPermissionResult { outcome })
            }
            wire::METHOD_FS_READ => {
                let p: ReadTextFileParams = parse(params)?;
                let content = self
                    .files
                    .read_text_file(&p.path, p.line, p.limit)
                    .await
                    .map_err(into_rpc_error)?;
                encode(&ReadTextFileResult { content })
            }
            wire::METHOD_FS_WRITE => {
                let p: WriteTextFileParams = parse(params)?;
                self.files
                    .write_text_file(&p.path, &p.content)
                    .await
                    .map_err(into_rpc_error)?;
                Ok(Value::Null)
            }
            wire::METHOD_TERMINAL_CREATE => {
                let p = parse(params)?;
                let terminal_id = self.terminals.create(&p).map_err(into_rpc_error)?;
                encode(&CreateTerminalResult { terminal_id })
            }
            wire::METHOD_TERMINAL_OUTPUT => {
                let p: TerminalIdParams = parse(params)?;
                let result = self.terminals.output(&p.terminal_id).map_err(into_rpc_error)?;
                encode(&result)
            }
            wire::METHOD_TERMINAL_WAIT => {
                let p: TerminalIdParams = parse(params)?;
                let exit = self
                    .terminals
                    .wait_for_exit(&p.terminal_id)
                    .await
                    .map_err(into_rpc_error)?;
                encode(&exit)
            }
            wire::METHOD_TERMINAL_KILL => {
                let p: TerminalIdParams = parse(params)?;
                self.terminals.kill(&p.terminal_id);
                Ok(Value::Null)
            }
            wire::METHOD_TERMINAL_RELEASE => {
                let p: TerminalIdParams = parse(params)?;
                self.terminals.release(&p.terminal_id);
                Ok(Value::Null)
            }
            other => Err(RpcError::method_not_found(other)),
        }
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError::invalid_params(e.to_string()))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::internal(e.to_string()))
}

fn into_rpc_error(err: AppError) -> RpcError {
    RpcError::internal(err.to_string())
}
