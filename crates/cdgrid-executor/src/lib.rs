//! cdgrid-executor — the external automation executor, seen from the coordinator.
//!
//! The coordinator only ever launches an action, inspects the resulting
//! container, and removes it once finished. Those three operations form
//! the [`Executor`] trait, injected into the dispatcher and poller so the
//! container runtime can be replaced in tests.
//!
//! # Implementations
//!
//! - [`DockerExecutor`] drives the `docker` CLI through `tokio::process`.
//! - [`ScriptedExecutor`] replays pre-recorded inspections in-process,
//!   for tests and for `cdgridd serve --dry-run`.

pub mod docker;
pub mod error;
pub mod scripted;
pub mod types;

use std::future::Future;
use std::pin::Pin;

pub use docker::{DockerConfig, DockerExecutor, merge_log_streams};
pub use error::{ExecutorError, ExecutorResult};
pub use scripted::{ScriptStep, ScriptedExecutor};
pub use types::{ContainerState, ExecutorHandle, Inspection, LaunchAction, SUCCESS_SENTINEL};

/// Boxed future returned by [`Executor`] methods.
pub type ExecFuture<'a, T> = Pin<Box<dyn Future<Output = ExecutorResult<T>> + Send + 'a>>;

/// Launch / inspect / terminate interface to the container runtime.
pub trait Executor: Send + Sync {
    /// Start `action` detached and return its handle.
    fn launch<'a>(&'a self, action: &'a LaunchAction) -> ExecFuture<'a, ExecutorHandle>;

    /// Report liveness and the cumulative log of a launched container.
    fn inspect<'a>(&'a self, handle: &'a ExecutorHandle) -> ExecFuture<'a, Inspection>;

    /// Remove a container, stopping it first if needed.
    fn terminate<'a>(&'a self, handle: &'a ExecutorHandle) -> ExecFuture<'a, ()>;
}
