//! Engine error types.
//!
//! The variants fall into the classes the engine treats differently:
//! preconditions (never retried, resource marked failed), conflicts
//! (re-read and retry a bounded number of times), transient backend errors
//! (retried on the next poll tick) and cooperative cancellation.

use thiserror::Error;

use fabrik_network::NetworkError;
use fabrik_state::StateError;

/// Errors raised while claiming, executing or polling resources.
#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid resource options for {key}: {message}")]
    InvalidOptions { key: String, message: String },

    #[error("network planning error: {0}")]
    Network(#[from] NetworkError),

    #[error("deployment {instance_id} is locked for {operation} by {holder}")]
    DeploymentLocked {
        instance_id: String,
        operation: String,
        holder: String,
    },

    #[error("no free network segment (capacity {0})")]
    NoSegmentAvailable(u32),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("conflict persisted after retries on {0}")]
    Conflict(String),

    #[error("{backend} backend error: {message}")]
    Backend { backend: String, message: String },

    #[error("cancelled: {0}")]
    Cancelled(String),
}

pub type OperatorResult<T> = Result<T, OperatorError>;

impl OperatorError {
    pub fn backend(backend: impl ToString, message: impl Into<String>) -> Self {
        OperatorError::Backend {
            backend: backend.to_string(),
            message: message.into(),
        }
    }

    /// Misconfiguration or bad input: retrying cannot help.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            OperatorError::UnknownTaskType(_)
                | OperatorError::Config(_)
                | OperatorError::InvalidOptions { .. }
                | OperatorError::Network(_)
                | OperatorError::DeploymentLocked { .. }
                | OperatorError::NoSegmentAvailable(_)
        )
    }

    /// Worth another attempt on the next poll tick.
    pub fn is_retryable(&self) -> bool {
        match self {
            OperatorError::Backend { .. } | OperatorError::Conflict(_) => true,
            OperatorError::State(e) => e.is_conflict(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, OperatorError::Cancelled(_))
    }
}
