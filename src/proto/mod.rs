//! Wire protocol: NDJSON framing and JSON-RPC message types.

pub mod codec;
pub mod wire;
