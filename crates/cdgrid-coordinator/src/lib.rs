//! cdgrid-coordinator — deployment job lifecycle.
//!
//! ```text
//!   deploy ──▶ Dispatcher ──get_or_create_active──▶ StateStore
//!                 │                                     ▲
//!                 └─spawn─▶ Executor::launch            │ append_status
//!                              │                        │
//!                              └─track──▶ Poller ───────┘
//!                                         (inspect every interval
//!                                          until the job is terminal)
//! ```
//!
//! [`LoadReporter`] reads job counts per status over trailing windows and
//! [`JobReaper`] drops records past their retention.

pub mod dispatcher;
pub mod error;
pub mod load;
pub mod poller;
pub mod reaper;

pub use dispatcher::{DEFAULT_SELF_TARGET, Dispatcher, JobView};
pub use error::{CoordinatorError, CoordinatorResult};
pub use load::{LoadReport, LoadReporter, Windows, default_windows, parse_windows};
pub use poller::{Poller, PollerConfig};
pub use reaper::JobReaper;
