use super::id::CorrelationId;

/// Result type for RPC operations
pub type RpcResult<T> = Result<T, RpcError>;

/// RPC error types
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Correlation id {0} is already open")]
    DuplicateId(CorrelationId),

    #[error("Process terminated")]
    ProcessTerminated,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
