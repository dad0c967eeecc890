//! Executor error types.

use thiserror::Error;

/// Errors reported by an [`crate::Executor`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    /// The action could not be started (runtime unreachable, registry
    /// login or image pull failed, container refused to start).
    #[error("executor launch failed: {0}")]
    Launch(String),

    /// Reading container state failed. Usually transient.
    #[error("executor inspect failed: {0}")]
    Inspect(String),

    /// The handle does not name a container any more.
    #[error("executor container not found: {0}")]
    NotFound(String),

    #[error("executor terminate failed: {0}")]
    Terminate(String),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
