//! Time source for record timestamps and expiry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Unix-seconds clock. The system clock in production, a settable one in tests.
#[derive(Debug, Clone, Default)]
pub struct Clock {
    manual: Option<Arc<AtomicU64>>,
}

impl Clock {
    /// Wall clock.
    pub fn system() -> Self {
        Self { manual: None }
    }

    /// A clock frozen at `start` until moved with [`Clock::advance`] or [`Clock::set`].
    pub fn manual(start: u64) -> Self {
        Self {
            manual: Some(Arc::new(AtomicU64::new(start))),
        }
    }

    /// Current time in unix seconds.
    pub fn now(&self) -> u64 {
        match &self.manual {
            Some(t) => t.load(Ordering::SeqCst),
            None => epoch_secs(),
        }
    }

    /// Move a manual clock forward. No effect on the system clock.
    pub fn advance(&self, secs: u64) {
        if let Some(t) = &self.manual {
            t.fetch_add(secs, Ordering::SeqCst);
        }
    }

    /// Set a manual clock. No effect on the system clock.
    pub fn set(&self, secs: u64) {
        if let Some(t) = &self.manual {
            t.store(secs, Ordering::SeqCst);
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_is_shared_between_clones() {
        let clock = Clock::manual(1000);
        let other = clock.clone();
        clock.advance(60);
        assert_eq!(other.now(), 1060);
        other.set(5);
        assert_eq!(clock.now(), 5);
    }

    #[test]
    fn system_clock_ignores_adjustments() {
        let clock = Clock::system();
        let before = clock.now();
        clock.set(0);
        assert!(clock.now() >= before);
    }
}
