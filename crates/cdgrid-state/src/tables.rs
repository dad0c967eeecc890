//! redb table definitions for the cdgrid state store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// App registrations keyed by app `id`.
pub const APPS: TableDefinition<&str, &[u8]> = TableDefinition::new("apps");

/// Deployment jobs keyed by `job_id`.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Target → `job_id` of the target's non-terminal job.
pub const ACTIVE_JOBS: TableDefinition<&str, &str> = TableDefinition::new("active_jobs");
