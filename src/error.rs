use thiserror::Error;

/// The broker's closed set of typed errors — the ones that need to become a
/// specific JSON-RPC error code or WebSocket close code rather than just a
/// log line. Everything else is plumbed as `anyhow::Error` with `.context(..)`.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bad token")]
    BadToken,

    #[error("slot registry is full")]
    RegistryFull,

    #[error("slot not found: {0}")]
    SlotNotFound(String),

    #[error("missing parameters for method {method}")]
    MissingParams { method: String },

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("request timed out")]
    Timeout,

    #[error("broker is shutting down")]
    ShuttingDown,

    #[error("subprocess spawn failed: {0}")]
    SpawnFailed(#[source] std::io::Error),
}

/// JSON-RPC 2.0 error codes used by the broker. Named rather than inlined so
/// every call site states which class of failure it means.
pub mod rpc_code {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SHELL_TIMEOUT: i64 = -1;
}

impl BridgeError {
    /// Maps a bridge-internal error to the JSON-RPC error code it should
    /// surface as, when it occurs on a request the client is waiting on.
    pub fn rpc_code(&self) -> i64 {
        match self {
            BridgeError::MissingParams { .. } => rpc_code::INVALID_PARAMS,
            BridgeError::UnknownMethod(_) => rpc_code::METHOD_NOT_FOUND,
            BridgeError::Timeout => rpc_code::SHELL_TIMEOUT,
            _ => rpc_code::INTERNAL_ERROR,
        }
    }
}

/// WebSocket close codes the broker uses beyond the standard ones.
pub mod close_code {
    pub const BAD_TOKEN: u16 = 4001;
    pub const SUBPROCESS_DIED: u16 = 4100;
    pub const CLEAN: u16 = 1000;
    pub const SHUTDOWN: u16 = 1001;
    pub const INTERNAL_ERROR: u16 = 1011;
}
