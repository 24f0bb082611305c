//! Error types for queue operations.

use resq_redis::RedisError;
use std::error::Error as _;
use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-specific errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] RedisError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Job arguments are not a sequence or mapping
    #[error("Invalid job arguments: {0}")]
    InvalidArguments(String),

    /// No handler registered for job class
    #[error("Could not find job class {0}.")]
    HandlerNotFound(String),

    /// Handler registered without a perform step
    #[error("Job class {0} does not contain a perform() method.")]
    Contract(String),

    /// Job execution failed
    #[error("{0}")]
    ExecutionFailed(String),

    /// The isolated execution unit terminated abnormally
    #[error("{0}")]
    DirtyExit(String),

    /// The queue did not grow after a push
    #[error("Job could not be enqueued onto {0}")]
    EnqueueFailed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("Queue error: {0}")]
    Other(String),
}

impl QueueError {
    /// A dirty exit with the default message.
    pub fn dirty_exit() -> Self {
        Self::DirtyExit("Job exited abnormally".to_string())
    }

    /// Stable type name, recorded as the `exception` of a failure record.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store(_) => "StoreError",
            Self::Serialization(_) => "SerializationError",
            Self::Deserialization(_) => "DeserializationError",
            Self::InvalidArguments(_) => "InvalidArguments",
            Self::HandlerNotFound(_) => "HandlerNotFound",
            Self::Contract(_) => "ContractError",
            Self::ExecutionFailed(_) => "ExecutionFailed",
            Self::DirtyExit(_) => "DirtyExit",
            Self::EnqueueFailed(_) => "EnqueueFailed",
            Self::Config(_) => "ConfigError",
            Self::Other(_) => "Error",
        }
    }

    /// The error followed by each of its causes, one per line.
    pub fn backtrace_lines(&self) -> Vec<String> {
        let mut lines = vec![format!("#0 {}", self)];
        let mut source = self.source();
        while let Some(cause) = source {
            lines.push(format!("#{} {}", lines.len(), cause));
            source = cause.source();
        }
        lines
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::Deserialization(err.to_string())
        } else {
            Self::Serialization(err.to_string())
        }
    }
}
