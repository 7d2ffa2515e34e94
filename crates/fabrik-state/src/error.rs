//! Error types for the Fabrik resource store.

use thiserror::Error;

use crate::types::ResourceState;

/// Result type alias for resource store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during resource store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic write against a stale `resource_version`.
    #[error("conflict on {key}: expected version {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("invalid state transition on {key}: {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: ResourceState,
        to: ResourceState,
    },

    #[error("invalid label selector: {0}")]
    InvalidSelector(String),

    /// The requested watch bookmark is older than the retained history.
    #[error("watch bookmark {since} expired (oldest retained revision is {oldest})")]
    Expired { since: u64, oldest: u64 },
}

impl StateError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StateError::AlreadyExists(_))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, StateError::Expired { .. })
    }
}
