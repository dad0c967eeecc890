//! Executor poller: one background task per launched job.
//!
//! Each task inspects its container immediately, then every
//! `interval`, and merges the log delta into the job record. While the
//! container runs only complete lines are merged; the unterminated tail
//! follows with the final status. A task ends as soon as the job is
//! terminal, whichever side made it so. A terminal status the store failed
//! to record is retried on the next tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use cdgrid_executor::{Executor, ExecutorError, ExecutorHandle, Inspection, SUCCESS_SENTINEL};
use cdgrid_state::{JobStatus, StateError, StateStore};

/// Poller tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Seconds between inspections of the same container.
    pub interval_secs: u64,
    /// Consecutive failed inspections tolerated before the job is failed.
    pub max_inspect_failures: u32,
    /// Remove the container once its job is terminal.
    pub remove_finished: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            max_inspect_failures: 3,
            remove_finished: false,
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// What a single poll decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Finished,
}

/// Result of writing a status to the store.
enum WriteOutcome {
    Applied,
    Rejected,
    Failed(StateError),
}

struct Inner {
    store: StateStore,
    executor: Arc<dyn Executor>,
    interval: Duration,
    max_inspect_failures: u32,
    remove_finished: bool,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Tracks launched jobs until they reach a terminal status.
#[derive(Clone)]
pub struct Poller {
    inner: Arc<Inner>,
}

impl Poller {
    pub fn new(store: StateStore, executor: Arc<dyn Executor>, config: &PollerConfig) -> Self {
        Self::with_interval(store, executor, config, config.interval())
    }

    /// Like [`Poller::new`] with a sub-second interval.
    pub fn with_interval(
        store: StateStore,
        executor: Arc<dyn Executor>,
        config: &PollerConfig,
        interval: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store,
                executor,
                interval,
                max_inspect_failures: config.max_inspect_failures.max(1),
                remove_finished: config.remove_finished,
                tasks: Mutex::new(HashMap::new()),
                shutdown_tx,
            }),
        }
    }

    /// Start polling `handle` on behalf of `job_id`.
    ///
    /// Returns `false` when the job is already tracked.
    pub async fn track(&self, job_id: &str, handle: ExecutorHandle) -> bool {
        self.track_from(job_id, handle, 0).await
    }

    async fn track_from(&self, job_id: &str, handle: ExecutorHandle, seen: usize) -> bool {
        if *self.inner.shutdown_tx.borrow() {
            debug!(%job_id, "poller stopped, not tracking");
            return false;
        }
        // The task removes itself on exit; holding the lock across the spawn
        // keeps that removal ordered after this insert.
        let mut tasks = self.inner.tasks.lock().await;
        if tasks.contains_key(job_id) {
            debug!(%job_id, "job already tracked");
            return false;
        }

        let poller = self.clone();
        let owned_id = job_id.to_string();
        let shutdown = self.inner.shutdown_tx.subscribe();
        info!(%job_id, container = %handle.short(), "polling executor");
        let task = tokio::spawn(async move {
            poller.run(&owned_id, &handle, seen, shutdown).await;
            poller.inner.tasks.lock().await.remove(&owned_id);
        });
        tasks.insert(job_id.to_string(), task);
        true
    }

    /// Re-attach to every active job after a restart.
    ///
    /// Jobs that never recorded a container handle died mid-launch and are
    /// failed. Must run before requests are served. Returns the number of
    /// jobs re-tracked.
    pub async fn resume(&self) -> Result<usize, StateError> {
        let mut resumed = 0;
        for job in self.inner.store.list_jobs()? {
            if !job.is_active() {
                continue;
            }
            match job.executor_handle {
                Some(ref handle) => {
                    let seen = job.output.len();
                    if self
                        .track_from(&job.job_id, ExecutorHandle::new(handle.as_str()), seen)
                        .await
                    {
                        resumed += 1;
                    }
                }
                None => {
                    warn!(job_id = %job.job_id, target = %job.target, "job has no container, failing it");
                    self.inner.store.append_status(
                        &job.job_id,
                        JobStatus::Error,
                        "coordinator restarted before the executor launch completed\n",
                    )?;
                }
            }
        }
        if resumed > 0 {
            info!(resumed, "resumed polling of active jobs");
        }
        Ok(resumed)
    }

    /// Stop every polling task (graceful shutdown).
    pub async fn stop_all(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let mut tasks = self.inner.tasks.lock().await;
        for (job_id, task) in tasks.drain() {
            task.abort();
            debug!(%job_id, "polling stopped");
        }
        info!("all pollers stopped");
    }

    /// Number of jobs currently polled.
    pub async fn active_count(&self) -> usize {
        self.inner.tasks.lock().await.len()
    }

    pub async fn is_tracking(&self, job_id: &str) -> bool {
        self.inner.tasks.lock().await.contains_key(job_id)
    }

    async fn run(
        &self,
        job_id: &str,
        handle: &ExecutorHandle,
        mut seen: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut failures = 0u32;
        loop {
            if self.poll_once(job_id, handle, &mut seen, &mut failures).await == Step::Finished {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.inner.interval) => {}
                _ = shutdown.changed() => {
                    debug!(%job_id, "poll loop shutting down");
                    return;
                }
            }
        }

        if self.inner.remove_finished {
            match self.inner.executor.terminate(handle).await {
                Ok(()) => debug!(%job_id, container = %handle.short(), "container removed"),
                Err(e) => warn!(%job_id, container = %handle.short(), error = %e, "failed to remove container"),
            }
        }
        debug!(%job_id, "poll loop finished");
    }

    async fn poll_once(
        &self,
        job_id: &str,
        handle: &ExecutorHandle,
        seen: &mut usize,
        failures: &mut u32,
    ) -> Step {
        match self.inner.store.get_job_by_id(job_id) {
            Ok(Some(job)) if job.is_active() => {}
            Ok(Some(job)) => {
                debug!(%job_id, status = %job.status, "job already terminal");
                return Step::Finished;
            }
            Ok(None) => {
                warn!(%job_id, "job vanished while polling");
                return Step::Finished;
            }
            Err(e) => return self.failed(job_id, failures, &e.to_string()),
        }

        let inspection = match self.inner.executor.inspect(handle).await {
            Ok(inspection) => inspection,
            Err(ExecutorError::NotFound(_)) => {
                let diag = format!("executor container {} not found\n", handle.short());
                return self.finish(job_id, JobStatus::Error, &diag, failures);
            }
            Err(e) => return self.failed(job_id, failures, &e.to_string()),
        };

        if inspection.is_running() {
            let delta = complete_lines(&inspection.logs, *seen);
            return match self.write(job_id, JobStatus::Running, delta) {
                WriteOutcome::Applied => {
                    *failures = 0;
                    *seen += delta.len();
                    Step::Continue
                }
                WriteOutcome::Rejected => Step::Finished,
                WriteOutcome::Failed(e) => self.failed(job_id, failures, &e.to_string()),
            };
        }

        let delta = inspection.logs.get(*seen..).unwrap_or_default();
        self.finish(job_id, classify(&inspection), delta, failures)
    }

    /// Record a terminal status. Polling ends once the store has it.
    fn finish(&self, job_id: &str, status: JobStatus, delta: &str, failures: &mut u32) -> Step {
        match self.write(job_id, status, delta) {
            WriteOutcome::Applied | WriteOutcome::Rejected => Step::Finished,
            WriteOutcome::Failed(e) => self.failed(job_id, failures, &e.to_string()),
        }
    }

    fn write(&self, job_id: &str, status: JobStatus, delta: &str) -> WriteOutcome {
        match self.inner.store.append_status(job_id, status, delta) {
            Ok(_) => WriteOutcome::Applied,
            Err(e) if e.is_store_failure() => {
                error!(%job_id, %status, error = %e, "failed to record job status");
                WriteOutcome::Failed(e)
            }
            Err(e) => {
                warn!(%job_id, %status, error = %e, "status write refused, polling stops");
                WriteOutcome::Rejected
            }
        }
    }

    /// Count a transient failure. Fails the job once the bound is reached;
    /// keeps polling while the store cannot take that write either.
    fn failed(&self, job_id: &str, failures: &mut u32, reason: &str) -> Step {
        *failures += 1;
        if *failures < self.inner.max_inspect_failures {
            warn!(%job_id, attempt = *failures, error = %reason, "poll failed, retrying");
            return Step::Continue;
        }
        error!(%job_id, attempts = *failures, error = %reason, "giving up on job");
        let diag = format!("lost track of executor after {failures} failed inspections: {reason}\n");
        match self.write(job_id, JobStatus::Error, &diag) {
            WriteOutcome::Applied | WriteOutcome::Rejected => Step::Finished,
            WriteOutcome::Failed(_) => {
                warn!(%job_id, "job left active, retrying on next poll");
                Step::Continue
            }
        }
    }
}

/// The newline-terminated part of `logs` past byte `seen`.
fn complete_lines(logs: &str, seen: usize) -> &str {
    let rest = logs.get(seen..).unwrap_or_default();
    rest.rfind('\n').map_or("", |end| &rest[..=end])
}

/// Success iff the last non-empty log line is the success sentinel.
pub fn classify(inspection: &Inspection) -> JobStatus {
    let last = inspection.logs.trim_end().lines().last().map(str::trim);
    if last == Some(SUCCESS_SENTINEL) {
        JobStatus::Success
    } else {
        JobStatus::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use cdgrid_executor::{LaunchAction, ScriptStep, ScriptedExecutor, merge_log_streams};
    use cdgrid_state::DeploymentJob;

    const TICK: Duration = Duration::from_millis(10);

    fn config(max_inspect_failures: u32, remove_finished: bool) -> PollerConfig {
        PollerConfig {
            interval_secs: 0,
            max_inspect_failures,
            remove_finished,
        }
    }

    async fn setup(
        script: Vec<ScriptStep>,
        config: PollerConfig,
    ) -> (StateStore, Arc<ScriptedExecutor>, Poller, String, ExecutorHandle) {
        let store = StateStore::open_in_memory().unwrap();
        let executor = Arc::new(ScriptedExecutor::new().with_script(script));
        let poller = Poller::with_interval(store.clone(), executor.clone(), &config, TICK);
        let (job, _) = store.get_or_create_active("t1").unwrap();
        let handle = executor
            .launch(&LaunchAction::Deploy {
                target: "t1".into(),
                job_id: job.job_id.clone(),
            })
            .await
            .unwrap();
        store
            .record_executor_handle(&job.job_id, handle.as_str())
            .unwrap();
        (store, executor, poller, job.job_id, handle)
    }

    async fn wait_idle(poller: &Poller) {
        for _ in 0..400 {
            if poller.active_count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("poller never went idle");
    }

    fn job(store: &StateStore, job_id: &str) -> DeploymentJob {
        store.get_job_by_id(job_id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn deltas_concatenate_to_full_log() {
        let full = format!("a\nb\n{SUCCESS_SENTINEL}\n");
        let (store, _, poller, job_id, handle) = setup(
            vec![
                ScriptStep::Running("a\n".into()),
                ScriptStep::Running("a\n".into()),
                ScriptStep::Running("a\nb\n".into()),
                ScriptStep::Exited(full.clone()),
            ],
            config(3, false),
        )
        .await;

        assert!(poller.track(&job_id, handle).await);
        wait_idle(&poller).await;

        let job = job(&store, &job_id);
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.output, full);
    }

    #[tokio::test]
    async fn exit_without_sentinel_is_error() {
        let (store, _, poller, job_id, handle) = setup(
            vec![ScriptStep::Exited("fatal: unreachable host\n".into())],
            config(3, false),
        )
        .await;

        poller.track(&job_id, handle).await;
        wait_idle(&poller).await;

        let job = job(&store, &job_id);
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.output, "fatal: unreachable host\n");
    }

    #[tokio::test]
    async fn missing_container_fails_job() {
        let (store, _, poller, job_id, handle) =
            setup(vec![ScriptStep::NotFound], config(3, false)).await;

        poller.track(&job_id, handle).await;
        wait_idle(&poller).await;

        let job = job(&store, &job_id);
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.output.contains("not found"));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (store, _, poller, job_id, handle) = setup(
            vec![
                ScriptStep::InspectError("daemon busy".into()),
                ScriptStep::InspectError("daemon busy".into()),
                ScriptStep::Exited(format!("{SUCCESS_SENTINEL}\n")),
            ],
            config(3, false),
        )
        .await;

        poller.track(&job_id, handle).await;
        wait_idle(&poller).await;

        assert_eq!(job(&store, &job_id).status, JobStatus::Success);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let (store, executor, poller, job_id, handle) = setup(
            vec![ScriptStep::InspectError("daemon down".into())],
            config(3, false),
        )
        .await;

        poller.track(&job_id, handle).await;
        wait_idle(&poller).await;

        let job = job(&store, &job_id);
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.output.contains("daemon down"));
        assert_eq!(executor.inspections(), 3);

        tokio::time::sleep(TICK * 5).await;
        assert_eq!(executor.inspections(), 3);
    }

    #[tokio::test]
    async fn stops_once_job_is_terminal() {
        let (store, executor, poller, job_id, handle) =
            setup(vec![ScriptStep::Running("still going\n".into())], config(3, false)).await;

        poller.track(&job_id, handle).await;
        tokio::time::sleep(TICK * 3).await;
        store
            .append_status(&job_id, JobStatus::Error, "cancelled\n")
            .unwrap();
        wait_idle(&poller).await;

        let seen = executor.inspections();
        tokio::time::sleep(TICK * 5).await;
        assert_eq!(executor.inspections(), seen);
        assert_eq!(job(&store, &job_id).status, JobStatus::Error);
    }

    #[tokio::test]
    async fn tracking_is_deduplicated() {
        let (_, _, poller, job_id, handle) =
            setup(vec![ScriptStep::Running(String::new())], config(3, false)).await;

        assert!(poller.track(&job_id, handle.clone()).await);
        assert!(!poller.track(&job_id, handle).await);
        assert_eq!(poller.active_count().await, 1);
        assert!(poller.is_tracking(&job_id).await);

        poller.stop_all().await;
        assert_eq!(poller.active_count().await, 0);
    }

    #[tokio::test]
    async fn finished_containers_are_removed_when_configured() {
        let (_, executor, poller, job_id, handle) = setup(
            vec![ScriptStep::Exited(format!("{SUCCESS_SENTINEL}\n"))],
            config(3, true),
        )
        .await;

        poller.track(&job_id, handle.clone()).await;
        wait_idle(&poller).await;

        assert_eq!(executor.terminated(), vec![handle]);
    }

    #[tokio::test]
    async fn resume_reattaches_and_fails_orphans() {
        let store = StateStore::open_in_memory().unwrap();
        let executor = Arc::new(ScriptedExecutor::new());
        let poller = Poller::with_interval(store.clone(), executor.clone(), &config(3, false), TICK);

        let (launched, _) = store.get_or_create_active("t1").unwrap();
        let handle = executor
            .launch(&LaunchAction::Deploy {
                target: "t1".into(),
                job_id: launched.job_id.clone(),
            })
            .await
            .unwrap();
        store
            .record_executor_handle(&launched.job_id, handle.as_str())
            .unwrap();
        let (orphan, _) = store.get_or_create_active("t2").unwrap();

        assert_eq!(poller.resume().await.unwrap(), 1);
        wait_idle(&poller).await;

        assert_eq!(job(&store, &launched.job_id).status, JobStatus::Success);
        let orphan = job(&store, &orphan.job_id);
        assert_eq!(orphan.status, JobStatus::Error);
        assert!(orphan.output.contains("restarted"));
    }

    #[tokio::test]
    async fn partial_lines_wait_for_their_newline() {
        let full = format!("ab\ncafé\n{SUCCESS_SENTINEL}\n");
        let (store, _, poller, job_id, handle) = setup(
            vec![
                // A read that ended inside a multi-byte character.
                ScriptStep::Running("ab\ncaf\u{FFFD}".into()),
                ScriptStep::Running("ab\ncafé\n".into()),
                ScriptStep::Exited(full.clone()),
            ],
            config(3, false),
        )
        .await;

        poller.track(&job_id, handle).await;
        wait_idle(&poller).await;

        let job = job(&store, &job_id);
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.output, full);
    }

    #[tokio::test]
    async fn unterminated_tail_arrives_with_final_status() {
        let (store, _, poller, job_id, handle) = setup(
            vec![
                ScriptStep::Running("one\ntw".into()),
                ScriptStep::Exited("one\ntwo".into()),
            ],
            config(3, false),
        )
        .await;

        poller.track(&job_id, handle).await;
        wait_idle(&poller).await;

        let job = job(&store, &job_id);
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.output, "one\ntwo");
    }

    #[tokio::test]
    async fn missing_container_is_recorded_once_store_recovers() {
        let (store, executor, poller, job_id, handle) =
            setup(vec![ScriptStep::NotFound], config(2, false)).await;

        store.fail_writes(true);
        poller.track(&job_id, handle).await;
        tokio::time::sleep(TICK * 6).await;

        // Past the failure bound, still tracked and still active.
        assert!(executor.inspections() > 2);
        assert!(poller.is_tracking(&job_id).await);
        assert!(job(&store, &job_id).is_active());

        store.fail_writes(false);
        wait_idle(&poller).await;

        let job = job(&store, &job_id);
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.output.contains("not found") || job.output.contains("lost track"));
    }

    #[tokio::test]
    async fn final_status_survives_failed_write() {
        let full = format!("a\n{SUCCESS_SENTINEL}\n");
        let (store, _, poller, job_id, handle) =
            setup(vec![ScriptStep::Exited(full.clone())], config(10, false)).await;

        store.fail_writes(true);
        poller.track(&job_id, handle).await;
        tokio::time::sleep(TICK * 2).await;
        assert!(poller.is_tracking(&job_id).await);

        store.fail_writes(false);
        wait_idle(&poller).await;

        let job = job(&store, &job_id);
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.output, full);
    }

    #[test]
    fn sentinel_on_stderr_counts() {
        let stdout = "2024-05-01T10:00:00.000000001Z PLAY [deploy]\n";
        let stderr = format!("2024-05-01T10:00:04.000000000Z {SUCCESS_SENTINEL}\n");
        let logs = merge_log_streams(stdout, &stderr);
        assert_eq!(classify(&Inspection::exited(&logs, 0)), JobStatus::Success);

        // A later stdout line still decides.
        let stdout = format!("{stdout}2024-05-01T10:00:05.000000000Z fatal: handler failed\n");
        let logs = merge_log_streams(&stdout, &stderr);
        assert_eq!(classify(&Inspection::exited(&logs, 0)), JobStatus::Error);
    }

    #[test]
    fn complete_lines_stop_at_last_newline() {
        assert_eq!(complete_lines("a\nb\nc", 0), "a\nb\n");
        assert_eq!(complete_lines("a\nb\nc", 2), "b\n");
        assert_eq!(complete_lines("a\nb", 2), "");
        assert_eq!(complete_lines("a\n", 9), "");
    }

    #[test]
    fn sentinel_must_be_last_line() {
        assert_eq!(
            classify(&Inspection::exited(&format!("ok\n{SUCCESS_SENTINEL}\n\n"), 0)),
            JobStatus::Success
        );
        assert_eq!(
            classify(&Inspection::exited(&format!("{SUCCESS_SENTINEL}\nthen failed\n"), 0)),
            JobStatus::Error
        );
        assert_eq!(classify(&Inspection::exited("", 0)), JobStatus::Error);
    }
}
