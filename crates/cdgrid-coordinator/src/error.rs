//! Coordinator error types.

use thiserror::Error;

use cdgrid_state::StateError;

/// Errors surfaced to request-driven callers.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Unknown app id or wrong secret.
    #[error("app not found")]
    Auth,

    /// Unknown job id, or a job belonging to another target.
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("invalid windows: {0}")]
    InvalidWindows(String),

    /// The store itself failed.
    #[error("state store error: {0}")]
    State(StateError),
}

impl From<StateError> for CoordinatorError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::AuthFailed => CoordinatorError::Auth,
            StateError::JobNotFound(id) => CoordinatorError::JobNotFound(id),
            StateError::InvalidRegistration(msg) => CoordinatorError::InvalidRegistration(msg),
            other => CoordinatorError::State(other),
        }
    }
}

impl CoordinatorError {
    /// True when the persistence layer is unavailable.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, CoordinatorError::State(e) if e.is_store_failure())
    }
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_are_unwrapped() {
        assert!(matches!(
            CoordinatorError::from(StateError::AuthFailed),
            CoordinatorError::Auth
        ));
        assert!(matches!(
            CoordinatorError::from(StateError::JobNotFound("j".into())),
            CoordinatorError::JobNotFound(_)
        ));
    }

    #[test]
    fn store_errors_stay_wrapped() {
        let err = CoordinatorError::from(StateError::Transaction("disk full".into()));
        assert!(err.is_store_failure());
        assert!(!CoordinatorError::Auth.is_store_failure());
    }
}
