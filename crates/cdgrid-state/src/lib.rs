//! cdgrid-state — embedded state store for cdgrid.
//!
//! Backed by [redb](https://docs.rs/redb), holds the application registry
//! and the deployment job records.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! The `active_jobs` table is a secondary index from target to the job id
//! of its single non-terminal job. Because redb admits one write
//! transaction at a time, the lookup and the insert performed by
//! [`StateStore::get_or_create_active`] form one atomic unit.
//!
//! Job records carry a sliding expiry (`expires_at`) refreshed on every
//! write. Expired records are invisible to reads and are physically
//! removed by [`StateStore::purge_expired`].
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub mod clock;
pub mod error;
pub mod jobs;
pub mod registry;
pub mod store;
pub mod tables;
pub mod types;

pub use clock::Clock;
pub use error::{StateError, StateResult};
pub use store::{DEFAULT_RETENTION_SECS, StateStore};
pub use types::*;
