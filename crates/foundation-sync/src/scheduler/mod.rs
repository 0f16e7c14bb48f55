//! Job scheduling on top of tokio task sets
//!
//! Tokio is the task runtime here; this module only decides when and how
//! many units of work it gets to run.

mod cancelable;
mod options;
mod queue;

pub use cancelable::{add_cancelable_task, CancelableTaskHandle, CancelableTaskSetExt, ChildOutcome};
pub use options::SchedulerOptions;
pub use queue::{
    run_with_concurrency_limit, Job, JobFuture, JobQueue, QueueClosed, Scheduler, SchedulerStats,
};
