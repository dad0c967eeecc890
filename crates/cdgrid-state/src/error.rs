//! Error types for the cdgrid state store.

use thiserror::Error;

use crate::types::JobStatus;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
///
/// The first group are store-level failures (the database itself is
/// unusable). The second group are domain outcomes that callers are
/// expected to handle.
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

    /// Unknown app id or wrong secret. Both cases share this variant and
    /// message so callers cannot tell them apart.
    #[error("app not found")]
    AuthFailed,

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job {job_id} is already {status}, write rejected")]
    TerminalWriteRejected { job_id: String, status: JobStatus },

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("invalid registration: {0}")]
    InvalidRegistration(String),
}

impl StateError {
    /// True when the store itself failed, as opposed to a domain outcome.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            StateError::Open(_)
                | StateError::Transaction(_)
                | StateError::Table(_)
                | StateError::Read(_)
                | StateError::Write(_)
                | StateError::Serialize(_)
                | StateError::Deserialize(_)
        )
    }
}
