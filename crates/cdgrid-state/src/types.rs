//! Domain types for the cdgrid state store.
//!
//! These types represent the persisted app registrations and deployment
//! jobs. All types are serializable to/from JSON for storage in redb tables.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Unique identifier for a deployment job (UUID v4).
pub type JobId = String;

// ── Registration ──────────────────────────────────────────────────

/// An application allowed to request deployment of its target.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppRegistration {
    #[serde(alias = "deployment_id")]
    pub id: String,
    #[serde(alias = "deployment_secret")]
    pub secret: String,
    /// Inventory the deployment acts upon.
    #[serde(alias = "inventory")]
    pub target: String,
}

impl AppRegistration {
    pub fn new(id: &str, secret: &str, target: &str) -> Self {
        Self {
            id: id.to_string(),
            secret: secret.to_string(),
            target: target.to_string(),
        }
    }
}

impl fmt::Debug for AppRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppRegistration")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .field("target", &self.target)
            .finish()
    }
}

// ── Job ───────────────────────────────────────────────────────────

/// Lifecycle status of a deployment job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Starting,
    Running,
    Success,
    Error,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Starting,
        JobStatus::Running,
        JobStatus::Success,
        JobStatus::Error,
    ];

    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Starting => "starting",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        match self {
            JobStatus::Success | JobStatus::Error => true,
            JobStatus::Starting | JobStatus::Running => false,
        }
    }

    /// Whether a write of `next` is allowed from this status.
    ///
    /// Same-status writes of a non-terminal status are output refreshes.
    pub fn permits(self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Success | JobStatus::Error, _) => false,
            (JobStatus::Running, JobStatus::Starting) => false,
            (JobStatus::Starting, _) => true,
            (JobStatus::Running, JobStatus::Running | JobStatus::Success | JobStatus::Error) => {
                true
            }
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One deployment attempt against a target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentJob {
    pub job_id: JobId,
    pub target: String,
    pub status: JobStatus,
    /// Unix timestamp (seconds) when the job was created.
    pub started_at: u64,
    /// Unix timestamp of the last write.
    pub updated_at: u64,
    /// Unix timestamp after which the record is considered gone.
    pub expires_at: u64,
    /// Cumulative executor output. Only ever appended to.
    pub output: String,
    /// Executor container handle, once launched.
    pub executor_handle: Option<String>,
}

impl DeploymentJob {
    /// A fresh job in `Starting` with no output and no handle.
    pub fn starting(target: &str, now: u64, retention_secs: u64) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            target: target.to_string(),
            status: JobStatus::Starting,
            started_at: now,
            updated_at: now,
            expires_at: now.saturating_add(retention_secs),
            output: String::new(),
            executor_handle: None,
        }
    }

    /// Starting or Running.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Refresh the sliding expiry window.
    pub fn touch(&mut self, now: u64, retention_secs: u64) {
        self.updated_at = now;
        self.expires_at = now.saturating_add(retention_secs);
    }

    /// Apply a status write: append `delta` and move to `next`.
    ///
    /// Leaves the job untouched and returns an error when the write is not
    /// permitted from the current status.
    pub fn apply_status(
        &mut self,
        next: JobStatus,
        delta: &str,
        now: u64,
        retention_secs: u64,
    ) -> StateResult<()> {
        if self.status.is_terminal() {
            return Err(StateError::TerminalWriteRejected {
                job_id: self.job_id.clone(),
                status: self.status,
            });
        }
        if !self.status.permits(next) {
            return Err(StateError::InvalidTransition {
                job_id: self.job_id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.output.push_str(delta);
        self.status = next;
        self.touch(now, retention_secs);
        Ok(())
    }
}
