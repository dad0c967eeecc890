//! StateStore — redb-backed state persistence for cdgrid.
//!
//! Opening, table setup and the shared encode/decode helpers live here.
//! Registry operations are in [`crate::registry`], job operations in
//! [`crate::jobs`]. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;
#[cfg(any(test, feature = "test-util"))]
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use redb::{Database, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::clock::Clock;
use crate::error::StateResult;
use crate::tables::*;

/// Job retention window: 7 days, refreshed on every write.
pub const DEFAULT_RETENTION_SECS: u64 = 60 * 60 * 24 * 7;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    pub(crate) db: Arc<Database>,
    pub(crate) clock: Clock,
    pub(crate) retention_secs: u64,
    #[cfg(any(test, feature = "test-util"))]
    fail_writes: Arc<AtomicBool>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            clock: Clock::system(),
            retention_secs: DEFAULT_RETENTION_SECS,
            #[cfg(any(test, feature = "test-util"))]
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Override the job retention window.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention_secs = retention.as_secs();
        self
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Make every write transaction fail until switched off again.
    /// Shared by all clones of this store.
    #[cfg(any(test, feature = "test-util"))]
    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    #[cfg(any(test, feature = "test-util"))]
    fn writes_refused(&self) -> bool {
        self.fail_writes.load(Ordering::SeqCst)
    }

    #[cfg(not(any(test, feature = "test-util")))]
    fn writes_refused(&self) -> bool {
        false
    }

    pub(crate) fn begin_write(&self) -> StateResult<WriteTransaction> {
        if self.writes_refused() {
            return Err(crate::StateError::Transaction("write transaction refused".into()));
        }
        self.db.begin_write().map_err(map_err!(Transaction))
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.begin_write()?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(APPS).map_err(map_err!(Table))?;
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.open_table(ACTIVE_JOBS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Read and decode one record from a `&str → &[u8]` table.
pub(crate) fn read_record<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

/// Decode every record of a `&str → &[u8]` table.
pub(crate) fn read_all<T, R>(table: &R) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(decode(value.value())?);
    }
    Ok(results)
}
