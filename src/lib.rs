#![forbid(unsafe_code)]

//! `acp-conduit` — client-side bridge to an ACP agent subprocess.
//!
//! Spawns an agent process, speaks newline-delimited JSON-RPC over its
//! stdio, and exposes the session to a UI layer: prompt turns, streamed
//! updates, permission mediation, proxied terminals, and file access.

pub mod bridge;
pub mod config;
pub mod errors;
pub mod files;
pub mod permission;
pub mod process;
pub mod proto;
pub mod session;
pub mod terminal;

pub use config::ConduitConfig;
pub use errors::{AppError, Result};
pub use session::{AgentConnection, ConnectionState, SessionMeta, UiSink};
