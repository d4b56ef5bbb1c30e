//! Task dispatch: the boundary between batch control and row processing.

pub mod pool;
pub mod retry;
pub mod task;

use std::time::Duration;

pub use pool::WorkerPool;
pub use retry::RetryPolicy;
pub use task::RowTask;

use crate::error::WorkerError;

/// Delivers row tasks to the row processor, at least once.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, task: RowTask) -> Result<(), WorkerError>;
}

/// Consumer side of dispatch.
pub trait TaskHandler: Send + Sync + 'static {
    /// Runs one delivery. Returns a delay when the task should be delivered
    /// again as its next attempt.
    fn handle(&self, task: &RowTask) -> Option<Duration>;
}
