//! Externally cancellable child tasks
//!
//! [`CancelableTaskSetExt::spawn_cancelable`] adds a task to an existing
//! [`JoinSet`] and hands back a [`CancelableTaskHandle`]. Inside the added
//! task the operation races a listener on a fresh oneshot signal; whichever
//! finishes first wins, the loser is aborted and awaited, and only then does
//! the task report its [`ChildOutcome`]. Aborting or dropping the enclosing
//! set tears both racers down with it.

use std::future::Future;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinSet};
use tracing::trace;

/// Result of a cancelable child task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildOutcome<T> {
    /// The operation ran to completion
    Completed(T),
    /// The handle's signal fired before the operation finished
    Cancelled,
}

impl<T> ChildOutcome<T> {
    /// Whether the task was cancelled through its handle
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChildOutcome::Cancelled)
    }

    /// The operation's output, if it completed
    pub fn completed(self) -> Option<T> {
        match self {
            ChildOutcome::Completed(value) => Some(value),
            ChildOutcome::Cancelled => None,
        }
    }
}

/// Handle that cancels one child task
///
/// Dropping the handle without calling [`CancelableTaskHandle::cancel`]
/// detaches it; the operation then runs to completion.
#[derive(Debug)]
pub struct CancelableTaskHandle {
    signal: oneshot::Sender<()>,
}

impl CancelableTaskHandle {
    /// Fire the cancellation signal
    ///
    /// Never blocks. Has no effect if the task already finished.
    pub fn cancel(self) {
        // The listener is gone once the race is decided
        let _ = self.signal.send(());
    }

    /// Whether the child task has already settled
    pub fn is_finished(&self) -> bool {
        self.signal.is_closed()
    }
}

/// Adds cancelable tasks to a [`JoinSet`]
pub trait CancelableTaskSetExt<T> {
    /// Spawn `operation` into the set and return a handle that cancels it
    fn spawn_cancelable<F>(&mut self, operation: F) -> CancelableTaskHandle
    where
        F: Future<Output = T> + Send + 'static;
}

impl<T> CancelableTaskSetExt<T> for JoinSet<ChildOutcome<T>>
where
    T: Send + 'static,
{
    fn spawn_cancelable<F>(&mut self, operation: F) -> CancelableTaskHandle
    where
        F: Future<Output = T> + Send + 'static,
    {
        add_cancelable_task(self, operation)
    }
}

/// Spawn `operation` into `set` and return a handle that cancels it
///
/// Must be called from within a tokio runtime.
pub fn add_cancelable_task<T, F>(
    set: &mut JoinSet<ChildOutcome<T>>,
    operation: F,
) -> CancelableTaskHandle
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    let (signal, listener) = oneshot::channel();
    set.spawn(race(operation, listener));
    CancelableTaskHandle { signal }
}

enum Racer<T> {
    Finished(T),
    Signalled,
}

async fn race<T, F>(operation: F, listener: oneshot::Receiver<()>) -> ChildOutcome<T>
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    let mut racers = JoinSet::new();
    racers.spawn(async move { Racer::Finished(operation.await) });
    racers.spawn(async move {
        match listener.await {
            Ok(()) => Racer::Signalled,
            // Handle dropped without cancelling: this racer never wins
            Err(_) => std::future::pending().await,
        }
    });

    let first = racers.join_next().await;
    racers.abort_all();
    let second = racers.join_next().await;

    let outcome = settle(first, second);
    trace!(cancelled = outcome.is_cancelled(), "cancelable task settled");
    outcome
}

/// Combine the two racer results
///
/// # Panics
/// Re-raises a panic from the operation. Panics on any combination that the
/// race cannot produce, since that means the race itself is broken.
fn settle<T>(
    first: Option<Result<Racer<T>, JoinError>>,
    second: Option<Result<Racer<T>, JoinError>>,
) -> ChildOutcome<T> {
    let first = match first {
        Some(Ok(racer)) => racer,
        Some(Err(err)) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        _ => panic!("cancelable task race finished without a winner"),
    };
    let second = match second {
        Some(Ok(racer)) => Some(racer),
        Some(Err(err)) if err.is_cancelled() => None,
        Some(Err(err)) => std::panic::resume_unwind(err.into_panic()),
        None => panic!("cancelable task race lost its second racer"),
    };

    match (first, second) {
        (Racer::Finished(value), None | Some(Racer::Signalled)) => {
            ChildOutcome::Completed(value)
        }
        // Signal won, but the operation finished before the abort landed
        (Racer::Signalled, Some(Racer::Finished(value))) => ChildOutcome::Completed(value),
        (Racer::Signalled, None) => ChildOutcome::Cancelled,
        (Racer::Finished(_), Some(Racer::Finished(_)))
        | (Racer::Signalled, Some(Racer::Signalled)) => {
            panic!("cancelable task race reported the same outcome twice")
        }
    }
}
