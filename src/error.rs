use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by the bridge core.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("unknown module {0}")]
    UnknownModule(u32),
    #[error("unknown method {method_id} on module {module}")]
    UnknownMethod { module: String, method_id: u32 },
    #[error("{module}.{method} failed: {reason}")]
    InvocationFailure {
        module: String,
        method: String,
        reason: String,
    },
    #[error("script executor error: {0}")]
    Executor(#[from] anyhow::Error),
    #[error("queue {0} is closed")]
    QueueClosed(String),
    #[error("failed to spawn queue {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("blocking call on queue {0} from its own thread")]
    WouldDeadlock(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
