//! Request-facing deploy and job-status operations.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use cdgrid_executor::{Executor, LaunchAction};
use cdgrid_state::{DeploymentJob, JobStatus, StateStore};

use crate::error::CoordinatorResult;
use crate::poller::Poller;

/// Target name that runs the app announcement instead of a deploy.
pub const DEFAULT_SELF_TARGET: &str = "self";

/// Attempts at recording a failed launch before the job is left to
/// startup recovery.
const FAILURE_WRITE_ATTEMPTS: u32 = 5;
const FAILURE_WRITE_DELAY: Duration = Duration::from_secs(1);

/// Job fields returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobView {
    pub status: JobStatus,
    pub job_id: String,
    pub output: String,
}

impl From<&DeploymentJob> for JobView {
    fn from(job: &DeploymentJob) -> Self {
        Self {
            status: job.status,
            job_id: job.job_id.clone(),
            output: job.output.clone(),
        }
    }
}

/// Authenticates callers, creates or reuses jobs, and launches executors.
#[derive(Clone)]
pub struct Dispatcher {
    store: StateStore,
    executor: Arc<dyn Executor>,
    poller: Poller,
    self_target: Arc<str>,
    write_attempts: u32,
    write_delay: Duration,
}

impl Dispatcher {
    pub fn new(store: StateStore, executor: Arc<dyn Executor>, poller: Poller) -> Self {
        Self {
            store,
            executor,
            poller,
            self_target: Arc::from(DEFAULT_SELF_TARGET),
            write_attempts: FAILURE_WRITE_ATTEMPTS,
            write_delay: FAILURE_WRITE_DELAY,
        }
    }

    pub fn with_self_target(mut self, target: &str) -> Self {
        self.self_target = Arc::from(target);
        self
    }

    /// How often, and how far apart, a launch failure is written before
    /// giving up.
    pub fn with_write_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.write_attempts = attempts.max(1);
        self.write_delay = delay;
        self
    }

    /// Start a deployment of the caller's target, or join the active one.
    ///
    /// Returns as soon as the job exists. The launch runs in the background,
    /// so this must be called from within a Tokio runtime.
    pub fn deploy(&self, id: &str, secret: &str) -> CoordinatorResult<JobView> {
        let target = self.store.authenticate(id, secret)?;
        let (job, created) = self.store.get_or_create_active(&target)?;
        if created {
            info!(job_id = %job.job_id, %target, "deployment requested");
            self.spawn_launch(&job);
        } else {
            info!(job_id = %job.job_id, %target, status = %job.status, "deployment already in progress");
        }
        Ok(JobView::from(&job))
    }

    /// Current state of one of the caller's jobs.
    pub fn job_status(&self, id: &str, secret: &str, job_id: &str) -> CoordinatorResult<JobView> {
        let target = self.store.authenticate(id, secret)?;
        let job = self.store.get_job(&target, job_id)?;
        Ok(JobView::from(&job))
    }

    fn action_for(&self, job: &DeploymentJob) -> LaunchAction {
        if job.target == *self.self_target {
            LaunchAction::AnnounceApps {
                job_id: job.job_id.clone(),
            }
        } else {
            LaunchAction::Deploy {
                target: job.target.clone(),
                job_id: job.job_id.clone(),
            }
        }
    }

    fn spawn_launch(&self, job: &DeploymentJob) {
        let action = self.action_for(job);
        let this = self.clone();
        tokio::spawn(async move {
            this.launch(action).await;
        });
    }

    async fn launch(&self, action: LaunchAction) {
        let job_id = action.job_id();
        let handle = match self.executor.launch(&action).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(%job_id, error = %e, "executor launch failed");
                self.fail_job(job_id, &format!("{e}\n")).await;
                return;
            }
        };

        if let Err(e) = self.store.record_executor_handle(job_id, handle.as_str()) {
            error!(%job_id, container = %handle.short(), error = %e, "failed to record container, removing it");
            if let Err(e) = self.executor.terminate(&handle).await {
                warn!(%job_id, error = %e, "failed to remove untracked container");
            }
            self.fail_job(job_id, &format!("failed to record executor container: {e}\n"))
                .await;
            return;
        }
        self.poller.track(job_id, handle).await;
    }

    /// Move a job that never got a container to `error`, retrying while the
    /// store refuses the write.
    async fn fail_job(&self, job_id: &str, diag: &str) {
        for attempt in 1..=self.write_attempts {
            match self.store.append_status(job_id, JobStatus::Error, diag) {
                Ok(_) => return,
                Err(e) if !e.is_store_failure() => {
                    warn!(%job_id, error = %e, "launch failure not recorded");
                    return;
                }
                Err(e) if attempt < self.write_attempts => {
                    warn!(%job_id, attempt, error = %e, "failed to record launch failure, retrying");
                    tokio::time::sleep(self.write_delay).await;
                }
                Err(e) => {
                    error!(%job_id, attempts = attempt, error = %e, "failed to record launch failure, job stays active until restart");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use cdgrid_executor::{ScriptStep, ScriptedExecutor, SUCCESS_SENTINEL};
    use cdgrid_state::AppRegistration;

    use crate::error::CoordinatorError;
    use crate::poller::PollerConfig;

    fn setup(executor: ScriptedExecutor) -> (StateStore, Arc<ScriptedExecutor>, Dispatcher) {
        let store = StateStore::open_in_memory().unwrap();
        store
            .replace_apps(&[
                AppRegistration::new("app-1", "s3cret", "t1"),
                AppRegistration::new("app-2", "other", "t2"),
                AppRegistration::new("cd", "cd-secret", DEFAULT_SELF_TARGET),
            ])
            .unwrap();
        let executor = Arc::new(executor);
        let poller = Poller::with_interval(
            store.clone(),
            executor.clone(),
            &PollerConfig::default(),
            Duration::from_millis(10),
        );
        let dispatcher = Dispatcher::new(store.clone(), executor.clone(), poller);
        (store, executor, dispatcher)
    }

    async fn wait_status(dispatcher: &Dispatcher, job_id: &str, status: JobStatus) -> JobView {
        for _ in 0..400 {
            let view = dispatcher.job_status("app-1", "s3cret", job_id).unwrap();
            if view.status == status {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never reached {status}");
    }

    #[tokio::test]
    async fn deploy_runs_to_success() {
        let (_, executor, dispatcher) = setup(ScriptedExecutor::new().with_script(vec![
            ScriptStep::Running("PLAY [all]\n".into()),
            ScriptStep::Exited(format!("PLAY [all]\n{SUCCESS_SENTINEL}\n")),
        ]));

        let view = dispatcher.deploy("app-1", "s3cret").unwrap();
        assert_eq!(view.status, JobStatus::Starting);
        assert!(view.output.is_empty());

        let done = wait_status(&dispatcher, &view.job_id, JobStatus::Success).await;
        assert_eq!(done.output, format!("PLAY [all]\n{SUCCESS_SENTINEL}\n"));
        assert_eq!(
            executor.launches(),
            vec![LaunchAction::Deploy {
                target: "t1".into(),
                job_id: view.job_id,
            }]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deploys_share_one_job() {
        let (_, executor, dispatcher) = setup(
            ScriptedExecutor::new()
                .with_script(vec![ScriptStep::Running("working\n".into())])
                .with_launch_delay(Duration::from_millis(20)),
        );

        let mut calls = Vec::new();
        for _ in 0..8 {
            let d = dispatcher.clone();
            calls.push(tokio::spawn(async move { d.deploy("app-1", "s3cret") }));
        }
        let mut ids = Vec::new();
        for call in calls {
            ids.push(call.await.unwrap().unwrap().job_id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(executor.launches().len(), 1);
    }

    #[tokio::test]
    async fn launch_failure_fails_job() {
        let (_, _, dispatcher) =
            setup(ScriptedExecutor::new().failing_launch("pull access denied for image"));

        let view = dispatcher.deploy("app-1", "s3cret").unwrap();
        assert_eq!(view.status, JobStatus::Starting);

        let failed = wait_status(&dispatcher, &view.job_id, JobStatus::Error).await;
        assert!(failed.output.contains("pull access denied"));

        // The slot is free again.
        let retry = dispatcher.deploy("app-1", "s3cret").unwrap();
        assert_ne!(retry.job_id, view.job_id);
    }

    #[tokio::test]
    async fn launch_failure_write_is_retried() {
        let (store, _, dispatcher) = setup(
            ScriptedExecutor::new()
                .failing_launch("pull access denied for image")
                .with_launch_delay(Duration::from_millis(20)),
        );
        let dispatcher = dispatcher.with_write_retry(100, Duration::from_millis(10));

        let view = dispatcher.deploy("app-1", "s3cret").unwrap();
        store.fail_writes(true);
        tokio::time::sleep(Duration::from_millis(80)).await;
        let pending = store.get_job_by_id(&view.job_id).unwrap().unwrap();
        assert_eq!(pending.status, JobStatus::Starting);

        store.fail_writes(false);
        let failed = wait_status(&dispatcher, &view.job_id, JobStatus::Error).await;
        assert!(failed.output.contains("pull access denied"));
    }

    #[tokio::test]
    async fn self_target_announces_apps() {
        let (_, executor, dispatcher) = setup(ScriptedExecutor::new());

        let view = dispatcher.deploy("cd", "cd-secret").unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(
            executor.launches(),
            vec![LaunchAction::AnnounceApps { job_id: view.job_id }]
        );
    }

    #[tokio::test]
    async fn auth_failures_are_indistinguishable() {
        let (_, executor, dispatcher) = setup(ScriptedExecutor::new());

        let unknown = dispatcher.deploy("nope", "s3cret").unwrap_err();
        let wrong = dispatcher.deploy("app-1", "wrong").unwrap_err();
        assert!(matches!(unknown, CoordinatorError::Auth));
        assert!(matches!(wrong, CoordinatorError::Auth));
        assert_eq!(unknown.to_string(), wrong.to_string());
        assert!(executor.launches().is_empty());
    }

    #[tokio::test]
    async fn jobs_are_scoped_to_their_target() {
        let (_, _, dispatcher) = setup(ScriptedExecutor::new());

        let view = dispatcher.deploy("app-1", "s3cret").unwrap();
        let err = dispatcher
            .job_status("app-2", "other", &view.job_id)
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn finished_job_rejects_late_writes() {
        let (store, _, dispatcher) = setup(ScriptedExecutor::new());

        let view = dispatcher.deploy("app-1", "s3cret").unwrap();
        let done = wait_status(&dispatcher, &view.job_id, JobStatus::Success).await;

        assert!(store
            .append_status(&view.job_id, JobStatus::Running, "late\n")
            .is_err());
        let after = dispatcher.job_status("app-1", "s3cret", &view.job_id).unwrap();
        assert_eq!(after, done);
    }
}
