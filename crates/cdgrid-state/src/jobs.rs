//! Deployment job records and the per-target active-job index.
//!
//! Every mutation runs inside a single redb write transaction, and the
//! `active_jobs` index is updated in the same transaction as the job record
//! it points to. Rejected writes abort the transaction, leaving the record
//! byte-for-byte unchanged.

use redb::{ReadableDatabase, ReadableTable};
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, encode, read_all, read_record};
use crate::tables::{ACTIVE_JOBS, JOBS};
use crate::types::{DeploymentJob, JobStatus};

impl StateStore {
    /// Return the target's active job, or create one.
    ///
    /// The boolean is `true` when the job was created by this call and the
    /// caller is responsible for launching the executor. Concurrent callers
    /// for the same target are serialized by redb's single-writer
    /// transaction, so exactly one of them observes `true`.
    pub fn get_or_create_active(&self, target: &str) -> StateResult<(DeploymentJob, bool)> {
        let now = self.clock.now();
        let txn = self.begin_write()?;
        let (job, created) = {
            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let mut active = txn.open_table(ACTIVE_JOBS).map_err(map_err!(Table))?;

            let indexed = active
                .get(target)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_string());
            let existing = match indexed {
                Some(job_id) => read_record::<DeploymentJob, _>(&jobs, &job_id)?
                    .filter(|job| job.is_active() && !job.is_expired(now)),
                None => None,
            };

            match existing {
                Some(job) => (job, false),
                None => {
                    let job = DeploymentJob::starting(target, now, self.retention_secs);
                    let value = encode(&job)?;
                    jobs.insert(job.job_id.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                    active
                        .insert(target, job.job_id.as_str())
                        .map_err(map_err!(Write))?;
                    (job, true)
                }
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;

        if created {
            info!(job_id = %job.job_id, %target, "deployment job created");
        } else {
            debug!(job_id = %job.job_id, %target, status = %job.status, "deployment job already active");
        }
        Ok((job, created))
    }

    /// Attach the executor handle to a job.
    pub fn record_executor_handle(&self, job_id: &str, handle: &str) -> StateResult<DeploymentJob> {
        let now = self.clock.now();
        let txn = self.begin_write()?;
        let job = {
            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let mut job = live_job(&jobs, job_id, now)?;
            job.executor_handle = Some(handle.to_string());
            job.touch(now, self.retention_secs);
            let value = encode(&job)?;
            jobs.insert(job_id, value.as_slice())
                .map_err(map_err!(Write))?;
            job
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%job_id, %handle, "executor handle recorded");
        Ok(job)
    }

    /// Append `delta` to the job's output and move it to `status`.
    ///
    /// Writes against a terminal job fail with
    /// [`StateError::TerminalWriteRejected`] and change nothing. Reaching a
    /// terminal status releases the target's active-job slot.
    pub fn append_status(
        &self,
        job_id: &str,
        status: JobStatus,
        delta: &str,
    ) -> StateResult<DeploymentJob> {
        let now = self.clock.now();
        let txn = self.begin_write()?;
        let (job, previous) = {
            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let mut active = txn.open_table(ACTIVE_JOBS).map_err(map_err!(Table))?;

            let mut job = live_job(&jobs, job_id, now)?;
            let previous = job.status;
            if let Err(e) = job.apply_status(status, delta, now, self.retention_secs) {
                warn!(%job_id, current = %previous, requested = %status, "status write rejected");
                return Err(e);
            }

            let value = encode(&job)?;
            jobs.insert(job_id, value.as_slice())
                .map_err(map_err!(Write))?;

            if status.is_terminal() {
                let owns_slot = active
                    .get(job.target.as_str())
                    .map_err(map_err!(Read))?
                    .is_some_and(|guard| guard.value() == job_id);
                if owns_slot {
                    active
                        .remove(job.target.as_str())
                        .map_err(map_err!(Write))?;
                }
            }
            (job, previous)
        };
        txn.commit().map_err(map_err!(Transaction))?;

        if previous != status {
            info!(%job_id, target = %job.target, from = %previous, to = %status, "job status changed");
        }
        Ok(job)
    }

    /// Look up a job by target and id. Both must match.
    pub fn get_job(&self, target: &str, job_id: &str) -> StateResult<DeploymentJob> {
        match self.get_job_by_id(job_id)? {
            Some(job) if job.target == target => Ok(job),
            _ => Err(StateError::JobNotFound(job_id.to_string())),
        }
    }

    /// Look up a job by id alone. Internal callers only; request paths use
    /// [`StateStore::get_job`].
    pub fn get_job_by_id(&self, job_id: &str) -> StateResult<Option<DeploymentJob>> {
        let now = self.clock.now();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        let job: Option<DeploymentJob> = read_record(&table, job_id)?;
        Ok(job.filter(|job| !job.is_expired(now)))
    }

    /// List every unexpired job. The scan runs in one read transaction.
    pub fn list_jobs(&self) -> StateResult<Vec<DeploymentJob>> {
        let now = self.clock.now();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        let jobs: Vec<DeploymentJob> = read_all(&table)?;
        Ok(jobs.into_iter().filter(|job| !job.is_expired(now)).collect())
    }

    /// Physically remove expired jobs. Returns the number removed.
    pub fn purge_expired(&self) -> StateResult<u32> {
        let now = self.clock.now();
        let txn = self.begin_write()?;
        let count = {
            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let mut active = txn.open_table(ACTIVE_JOBS).map_err(map_err!(Table))?;

            let expired: Vec<DeploymentJob> = read_all::<DeploymentJob, _>(&jobs)?
                .into_iter()
                .filter(|job| job.is_expired(now))
                .collect();
            for job in &expired {
                jobs.remove(job.job_id.as_str())
                    .map_err(map_err!(Write))?;
                let owns_slot = active
                    .get(job.target.as_str())
                    .map_err(map_err!(Read))?
                    .is_some_and(|guard| guard.value() == job.job_id);
                if owns_slot {
                    active
                        .remove(job.target.as_str())
                        .map_err(map_err!(Write))?;
                }
            }
            expired.len() as u32
        };
        txn.commit().map_err(map_err!(Transaction))?;
        if count > 0 {
            info!(count, "expired jobs purged");
        }
        Ok(count)
    }

    /// Remove every job and index entry. Administrative use only.
    pub fn clear_jobs(&self) -> StateResult<u32> {
        let txn = self.begin_write()?;
        let count = {
            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let mut active = txn.open_table(ACTIVE_JOBS).map_err(map_err!(Table))?;

            let job_ids = keys(&jobs)?;
            for key in &job_ids {
                jobs.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            let targets = {
                let mut targets = Vec::new();
                for entry in active.iter().map_err(map_err!(Read))? {
                    let (key, _) = entry.map_err(map_err!(Read))?;
                    targets.push(key.value().to_string());
                }
                targets
            };
            for target in &targets {
                active.remove(target.as_str()).map_err(map_err!(Write))?;
            }
            job_ids.len() as u32
        };
        txn.commit().map_err(map_err!(Transaction))?;
        warn!(count, "all jobs cleared");
        Ok(count)
    }
}

/// Read a job that exists and has not expired.
fn live_job<R>(table: &R, job_id: &str, now: u64) -> StateResult<DeploymentJob>
where
    R: ReadableTable<&'static str, &'static [u8]>,
{
    read_record::<DeploymentJob, _>(table, job_id)?
        .filter(|job| !job.is_expired(now))
        .ok_or_else(|| StateError::JobNotFound(job_id.to_string()))
}

fn keys<R>(table: &R) -> StateResult<Vec<String>>
where
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut keys = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        keys.push(key.value().to_string());
    }
    Ok(keys)
}
