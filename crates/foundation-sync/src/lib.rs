//! Foundation concurrency coordination core
//!
//! This crate provides the coordination primitives the rest of the foundation
//! library builds on:
//! - Cancellable counting semaphore with strict FIFO wakeups
//! - Bounded-concurrency job scheduler on top of tokio task sets
//! - Thread-blocking reader-writer locks (plain and reentrant)
//! - Externally cancellable child tasks inside a task set
//! - Hierarchical cancellation tokens shared by all of the above
//!
//! Cooperative primitives (semaphore, scheduler, cancelable tasks) suspend the
//! calling task without blocking its worker thread. The reader-writer locks
//! block the calling OS thread and must not be held across `.await`.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cancel;
pub mod scheduler;
pub mod sync;

pub use cancel::{CancelToken, Cancelled};
pub use scheduler::{
    add_cancelable_task, run_with_concurrency_limit, CancelableTaskHandle, CancelableTaskSetExt,
    ChildOutcome, Job, JobQueue, Scheduler, SchedulerOptions, SchedulerStats,
};
pub use sync::{
    OwnerToken, RecursiveRwLock, RecursiveRwLockReadGuard, RecursiveRwLockWriteGuard, RwLock,
    RwLockReadGuard, RwLockWriteGuard, Semaphore, SemaphorePermit,
};

/// Errors surfaced by the coordination core
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// The operation observed a cancellation request
    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    /// A concurrency limit of zero was configured
    #[error("Invalid concurrency limit: {0} (must be at least 1)")]
    InvalidLimit(usize),
}

/// Result type for fallible coordination operations
pub type SyncResult<T> = Result<T, SyncError>;
