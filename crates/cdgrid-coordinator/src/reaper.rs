//! Periodic removal of expired job records.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use cdgrid_state::StateStore;

/// Purges expired jobs on a fixed interval.
pub struct JobReaper {
    store: StateStore,
}

impl JobReaper {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// One purge pass. Returns the number of records removed.
    pub fn sweep(&self) -> u32 {
        match self.store.purge_expired() {
            Ok(0) => 0,
            Ok(n) => {
                debug!(purged = n, "expired jobs purged");
                n
            }
            Err(e) => {
                error!(error = %e, "failed to purge expired jobs");
                0
            }
        }
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "job reaper started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.sweep();
                }
                _ = shutdown.changed() => {
                    info!("job reaper shutting down");
                    break;
                }
            }
        }
    }
}
