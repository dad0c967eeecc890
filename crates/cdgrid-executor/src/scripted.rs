//! In-process executor that replays a fixed script of inspections.
//!
//! Every launch gets its own copy of the script. Each `inspect` consumes
//! one step; once the script is exhausted the last step repeats, so an
//! exited container stays exited.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::error::{ExecutorError, ExecutorResult};
use crate::types::{ExecutorHandle, Inspection, LaunchAction, SUCCESS_SENTINEL};
use crate::{ExecFuture, Executor};

/// One scripted answer to `inspect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    /// Container still running with this cumulative log.
    Running(String),
    /// Container stopped with this cumulative log.
    Exited(String),
    /// Handle no longer known.
    NotFound,
    /// Transient inspection failure.
    InspectError(String),
}

impl ScriptStep {
    fn to_result(&self, handle: &ExecutorHandle) -> ExecutorResult<Inspection> {
        match self {
            ScriptStep::Running(logs) => Ok(Inspection::running(logs)),
            ScriptStep::Exited(logs) => Ok(Inspection::exited(logs, 0)),
            ScriptStep::NotFound => Err(ExecutorError::NotFound(handle.to_string())),
            ScriptStep::InspectError(msg) => Err(ExecutorError::Inspect(msg.clone())),
        }
    }
}

#[derive(Default)]
struct Recorded {
    launches: Vec<LaunchAction>,
    terminated: Vec<ExecutorHandle>,
    scripts: HashMap<ExecutorHandle, VecDeque<ScriptStep>>,
}

/// Scripted [`Executor`].
pub struct ScriptedExecutor {
    script: Vec<ScriptStep>,
    launch_failure: Option<String>,
    launch_delay: Duration,
    next_id: AtomicU64,
    inspections: AtomicUsize,
    recorded: Mutex<Recorded>,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedExecutor {
    /// An executor whose containers finish successfully on first inspection.
    pub fn new() -> Self {
        Self {
            script: vec![ScriptStep::Exited(format!("{SUCCESS_SENTINEL}\n"))],
            launch_failure: None,
            launch_delay: Duration::ZERO,
            next_id: AtomicU64::new(1),
            inspections: AtomicUsize::new(0),
            recorded: Mutex::new(Recorded::default()),
        }
    }

    /// Replace the per-launch inspection script. An empty script is
    /// treated as a single `NotFound`.
    pub fn with_script(mut self, steps: Vec<ScriptStep>) -> Self {
        self.script = if steps.is_empty() {
            vec![ScriptStep::NotFound]
        } else {
            steps
        };
        self
    }

    /// Make every launch fail with `message`.
    pub fn failing_launch(mut self, message: &str) -> Self {
        self.launch_failure = Some(message.to_string());
        self
    }

    /// Hold each launch for `delay` before answering.
    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    /// Actions launched so far, in order.
    pub fn launches(&self) -> Vec<LaunchAction> {
        self.lock().launches.clone()
    }

    /// Handles passed to `terminate`.
    pub fn terminated(&self) -> Vec<ExecutorHandle> {
        self.lock().terminated.clone()
    }

    /// Total `inspect` calls across all handles.
    pub fn inspections(&self) -> usize {
        self.inspections.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.recorded.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Executor for ScriptedExecutor {
    fn launch<'a>(&'a self, action: &'a LaunchAction) -> ExecFuture<'a, ExecutorHandle> {
        Box::pin(async move {
            if !self.launch_delay.is_zero() {
                tokio::time::sleep(self.launch_delay).await;
            }
            let mut recorded = self.lock();
            recorded.launches.push(action.clone());
            if let Some(message) = &self.launch_failure {
                return Err(ExecutorError::Launch(message.clone()));
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let handle = ExecutorHandle::new(format!("scripted-{id}"));
            recorded
                .scripts
                .insert(handle.clone(), self.script.iter().cloned().collect());
            debug!(job_id = %action.job_id(), %handle, "scripted launch");
            Ok(handle)
        })
    }

    fn inspect<'a>(&'a self, handle: &'a ExecutorHandle) -> ExecFuture<'a, Inspection> {
        Box::pin(async move {
            self.inspections.fetch_add(1, Ordering::SeqCst);
            let mut recorded = self.lock();
            let Some(steps) = recorded.scripts.get_mut(handle) else {
                return Err(ExecutorError::NotFound(handle.to_string()));
            };
            let step = if steps.len() > 1 {
                steps.pop_front()
            } else {
                steps.front().cloned()
            };
            match step {
                Some(step) => step.to_result(handle),
                None => Err(ExecutorError::NotFound(handle.to_string())),
            }
        })
    }

    fn terminate<'a>(&'a self, handle: &'a ExecutorHandle) -> ExecFuture<'a, ()> {
        Box::pin(async move {
            let mut recorded = self.lock();
            if recorded.scripts.remove(handle).is_none() {
                return Err(ExecutorError::NotFound(handle.to_string()));
            }
            recorded.terminated.push(handle.clone());
            Ok(())
        })
    }
}
