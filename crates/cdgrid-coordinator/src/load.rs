//! Load reporting: jobs started per status over named trailing windows.

use std::collections::BTreeMap;

use cdgrid_state::{DeploymentJob, JobStatus, StateStore};

use crate::error::{CoordinatorError, CoordinatorResult};

/// Named trailing windows, in seconds.
pub type Windows = BTreeMap<String, u64>;

/// `{window: {status: count}}`, every status present.
pub type LoadReport = BTreeMap<String, BTreeMap<&'static str, u64>>;

/// Windows used when the caller supplies none.
pub fn default_windows() -> Windows {
    [("1_hour", 3_600), ("1_day", 86_400), ("1_week", 604_800)]
        .into_iter()
        .map(|(name, secs)| (name.to_string(), secs))
        .collect()
}

/// Parse `name:seconds[,name:seconds...]`.
pub fn parse_windows(raw: &str) -> CoordinatorResult<Windows> {
    let mut windows = Windows::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, secs) = entry
            .split_once(':')
            .ok_or_else(|| CoordinatorError::InvalidWindows(format!("'{entry}' is not name:seconds")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(CoordinatorError::InvalidWindows(format!("'{entry}' has no name")));
        }
        let secs: u64 = secs.trim().parse().map_err(|_| {
            CoordinatorError::InvalidWindows(format!("'{entry}' has a non-numeric duration"))
        })?;
        if windows.insert(name.to_string(), secs).is_some() {
            return Err(CoordinatorError::InvalidWindows(format!("duplicate window '{name}'")));
        }
    }
    Ok(windows)
}

/// Read-only view over the job store.
#[derive(Clone)]
pub struct LoadReporter {
    store: StateStore,
}

impl LoadReporter {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Count jobs by status for each window, ending at the store's clock.
    pub fn report(&self, windows: &Windows) -> CoordinatorResult<LoadReport> {
        let now = self.store.clock().now();
        let jobs = self.store.list_jobs()?;
        Ok(report_at(&jobs, windows, now))
    }
}

/// Count `jobs` whose `started_at` lies in `[now - secs, now]` per window.
pub fn report_at(jobs: &[DeploymentJob], windows: &Windows, now: u64) -> LoadReport {
    windows
        .iter()
        .map(|(name, secs)| {
            let since = now.saturating_sub(*secs);
            let mut counts: BTreeMap<&'static str, u64> =
                JobStatus::ALL.iter().map(|s| (s.as_str(), 0)).collect();
            for job in jobs
                .iter()
                .filter(|j| j.started_at >= since && j.started_at <= now)
            {
                *counts.entry(job.status.as_str()).or_default() += 1;
            }
            (name.clone(), counts)
        })
        .collect()
}
