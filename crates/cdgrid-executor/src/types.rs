//! Values exchanged with the executor.

use std::fmt;

/// Last line the automation image prints when its run returned 0.
pub const SUCCESS_SENTINEL: &str = "Process terminated with return code: 0";

/// Opaque container handle (the container id for docker).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutorHandle(String);

impl ExecutorHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, as `docker ps` shows them.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for ExecutorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the executor is asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchAction {
    /// Deploy `target`, tagging the run with the coordinator's job id.
    Deploy { target: String, job_id: String },
    /// The coordinator's own maintenance run. Takes no parameters; the job
    /// id is only used for labelling.
    AnnounceApps { job_id: String },
}

impl LaunchAction {
    pub fn job_id(&self) -> &str {
        match self {
            LaunchAction::Deploy { job_id, .. } | LaunchAction::AnnounceApps { job_id } => job_id,
        }
    }
}

/// Coarse container liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited { exit_code: Option<i64> },
}

/// One inspection of a launched container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inspection {
    pub state: ContainerState,
    /// Cumulative output since the container started, standard output and
    /// standard error interleaved in the order they were written.
    pub logs: String,
}

impl Inspection {
    pub fn running(logs: &str) -> Self {
        Self {
            state: ContainerState::Running,
            logs: logs.to_string(),
        }
    }

    pub fn exited(logs: &str, exit_code: i64) -> Self {
        Self {
            state: ContainerState::Exited {
                exit_code: Some(exit_code),
            },
            logs: logs.to_string(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }
}
