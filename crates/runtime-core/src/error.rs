//! Error types for the distributed training strategy

use thiserror::Error;

/// Result type alias using the runtime Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the distributed training strategy
#[derive(Error, Debug)]
pub enum Error {
    // Argument errors
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Distributed state not initialized: call setup_distributed before {operation}")]
    NotInitialized { operation: String },

    // Collective errors
    #[error("Collective timeout: {operation} on rank {rank} (waited {timeout_ms}ms)")]
    CollectiveTimeout {
        operation: String,
        rank: usize,
        timeout_ms: u64,
    },

    #[error("Collective failure: {message}")]
    Collective { message: String },

    // Parameter errors
    #[error("Parameter not materialized: {name}")]
    ParameterNotMaterialized { name: String },

    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("State dict mismatch: missing {missing:?}, unexpected {unexpected:?}")]
    StateDictMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    // Engine errors
    #[error("Engine error: {message}")]
    Engine { message: String },

    // Checkpoint errors
    #[error("Checkpoint not found: {path}")]
    CheckpointNotFound { path: String },

    #[error("Checkpoint corrupted: {path} - {reason}")]
    CheckpointCorrupted { path: String, reason: String },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Shorthand for an [`Error::InvalidArgument`]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    /// Returns true if the caller may retry the whole operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Storage { .. } | Error::Io(_) | Error::CheckpointNotFound { .. }
        )
    }

    /// Returns true if this error leaves the process group in an indeterminate state
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CollectiveTimeout { .. }
                | Error::Collective { .. }
                | Error::CheckpointCorrupted { .. }
                | Error::InvalidConfig { .. }
                | Error::Internal { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let err = Error::Storage {
            message: "disk full".to_string(),
        };
        assert!(err.is_retryable());

        let err = Error::invalid_argument("bad tuple");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_fatal() {
        let err = Error::CollectiveTimeout {
            operation: "all_reduce".to_string(),
            rank: 1,
            timeout_ms: 5000,
        };
        assert!(err.is_fatal());

        let err = Error::Storage {
            message: "write failed".to_string(),
        };
        assert!(!err.is_fatal());
    }
}
