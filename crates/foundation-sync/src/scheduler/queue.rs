//! Bounded-concurrency job scheduler
//!
//! A producer feeds jobs into an unbounded FIFO while the scheduler launches
//! them, in submission order, onto at most `limit` concurrently running tokio
//! tasks. When every slot is busy the scheduler waits for any running job to
//! finish before launching the next one.
//!
//! Cancellation is structured: the run owns a child of the caller's token,
//! the producer and every job get children of that, and cancelling the
//! caller's token cancels all of them, aborts their tasks and waits for them
//! to unwind. Jobs still queued at that point are dropped without running.

use super::SchedulerOptions;
use crate::cancel::{CancelToken, Cancelled};
use crate::SyncResult;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, warn, Instrument};

/// Boxed future run by a job
pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

type JobOperation = Box<dyn FnOnce(CancelToken) -> JobFuture + Send + 'static>;

/// A deferred unit of work submitted to the scheduler
///
/// The operation is only created when the job is launched. It receives a
/// token that is cancelled when the run is cancelled.
pub struct Job {
    name: Option<String>,
    operation: JobOperation,
}

impl Job {
    /// Create an unnamed job
    pub fn new<F, Fut>(operation: F) -> Self
    where
        F: FnOnce(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: None,
            operation: Box::new(move |token| Box::pin(operation(token))),
        }
    }

    /// Create a job with a label used in log events
    pub fn named<F, Fut>(name: impl Into<String>, operation: F) -> Self
    where
        F: FnOnce(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: Some(name.into()),
            ..Self::new(operation)
        }
    }

    /// Label of the job, if any
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("name", &self.name).finish()
    }
}

/// Error returned when submitting after the run stopped accepting jobs
///
/// Carries the rejected job back to the caller.
#[derive(Debug, thiserror::Error)]
#[error("job queue is closed")]
pub struct QueueClosed(pub Job);

/// Submission handle given to the producer
///
/// Cloneable; submissions are accepted until the producer has returned and
/// the queue has been drained, or until the run is cancelled.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Job>,
    token: CancelToken,
}

impl JobQueue {
    /// Queue a job for execution
    pub fn submit(&self, job: Job) -> Result<(), QueueClosed> {
        self.tx.send(job).map_err(|err| QueueClosed(err.0))
    }

    /// Queue an unnamed job built from `operation`
    pub fn add_task<F, Fut>(&self, operation: F) -> Result<(), QueueClosed>
    where
        F: FnOnce(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.submit(Job::new(operation))
    }

    /// Token cancelled when the run is cancelled
    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Counters reported by a completed run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Jobs launched
    pub jobs_started: u64,

    /// Jobs that ran to completion
    pub jobs_completed: u64,

    /// Jobs that panicked
    pub jobs_panicked: u64,

    /// Highest number of jobs running at once
    pub peak_active: usize,
}

impl SchedulerStats {
    fn record(&mut self, result: Result<Option<String>, JoinError>) {
        match result {
            Ok(name) => {
                self.jobs_completed += 1;
                debug!(job = name.as_deref().unwrap_or("<unnamed>"), "job finished");
            }
            Err(err) if err.is_panic() => {
                self.jobs_panicked += 1;
                warn!("job panicked: {err}");
            }
            // Aborted jobs only occur during teardown
            Err(_) => {}
        }
    }
}

enum Event {
    Cancelled,
    Submitted(Option<Job>),
    ProducerFinished(Option<Result<(), JoinError>>),
}

/// Run jobs from `producer` with at most `limit` of them active at once
///
/// `producer` runs as its own task and may submit jobs at any point until it
/// returns. The call completes once the producer has returned and every job
/// it submitted has finished, successfully or by panicking; job panics are
/// counted in the returned stats and not propagated. A panic in the producer
/// is re-raised after the active jobs have been torn down.
///
/// Returns `Err(Cancelled)` if `token` is cancelled first.
///
/// # Panics
/// Panics if `limit` is zero.
pub async fn run_with_concurrency_limit<P, Fut>(
    limit: usize,
    token: &CancelToken,
    producer: P,
) -> Result<SchedulerStats, Cancelled>
where
    P: FnOnce(JobQueue) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    assert!(limit >= 1, "concurrency limit must be at least 1, got {limit}");

    let scope = token.child();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let queue = JobQueue {
        tx,
        token: scope.child(),
    };

    // The producer lives in its own set so it is aborted if this future is
    // dropped.
    let mut producer_task = JoinSet::new();
    producer_task.spawn(producer(queue));
    let mut producer_running = true;
    let mut queue_open = true;

    let mut active: JoinSet<Option<String>> = JoinSet::new();
    let mut stats = SchedulerStats::default();

    while producer_running || queue_open {
        let event = tokio::select! {
            biased;
            () = scope.cancelled() => Event::Cancelled,
            job = rx.recv(), if queue_open => Event::Submitted(job),
            result = producer_task.join_next(), if producer_running => {
                Event::ProducerFinished(result)
            }
        };

        let job = match event {
            Event::Cancelled => {
                return Err(shut_down(&mut producer_task, &mut active, &mut rx).await);
            }
            Event::Submitted(Some(job)) => job,
            Event::Submitted(None) => {
                queue_open = false;
                continue;
            }
            Event::ProducerFinished(result) => {
                producer_running = false;
                // Reject late submissions; anything already queued still runs
                rx.close();
                if let Some(Err(err)) = result {
                    if err.is_panic() {
                        active.shutdown().await;
                        std::panic::resume_unwind(err.into_panic());
                    }
                }
                continue;
            }
        };

        // Reap jobs that already finished so they neither hold a slot nor
        // count towards the peak.
        while let Some(result) = active.try_join_next() {
            stats.record(result);
        }

        while active.len() >= limit {
            let finished = tokio::select! {
                biased;
                () = scope.cancelled() => None,
                Some(result) = active.join_next() => Some(result),
            };
            match finished {
                Some(result) => stats.record(result),
                None => {
                    drop(job);
                    return Err(shut_down(&mut producer_task, &mut active, &mut rx).await);
                }
            }
        }

        let name = job.name;
        let operation = (job.operation)(scope.child());
        let span = tracing::debug_span!("job", name = name.as_deref().unwrap_or("<unnamed>"));
        active.spawn(
            async move {
                operation.await;
                name
            }
            .instrument(span),
        );
        stats.jobs_started += 1;
        stats.peak_active = stats.peak_active.max(active.len());
        debug!(active = active.len(), limit, "job started");
    }

    while !active.is_empty() {
        let finished = tokio::select! {
            biased;
            () = scope.cancelled() => None,
            Some(result) = active.join_next() => Some(result),
        };
        match finished {
            Some(result) => stats.record(result),
            None => return Err(shut_down(&mut producer_task, &mut active, &mut rx).await),
        }
    }

    debug!(
        started = stats.jobs_started,
        panicked = stats.jobs_panicked,
        "bounded run finished"
    );
    Ok(stats)
}

/// Tear the run down after its scope was cancelled
async fn shut_down(
    producer_task: &mut JoinSet<()>,
    active: &mut JoinSet<Option<String>>,
    rx: &mut mpsc::UnboundedReceiver<Job>,
) -> Cancelled {
    producer_task.shutdown().await;
    active.shutdown().await;

    rx.close();
    let mut dropped = 0usize;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    debug!(dropped, "bounded run cancelled");
    Cancelled
}

/// Bounded-concurrency scheduler configured from [`SchedulerOptions`]
#[derive(Debug, Clone)]
pub struct Scheduler {
    options: SchedulerOptions,
}

impl Scheduler {
    /// Create a scheduler, validating `options`
    pub fn new(options: SchedulerOptions) -> SyncResult<Self> {
        options.validate()?;
        Ok(Self { options })
    }

    /// Maximum number of concurrently running jobs
    pub fn limit(&self) -> usize {
        self.options.max_concurrent_jobs
    }

    /// The scheduler's configuration
    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Run jobs from `producer` under the configured limit
    ///
    /// See [`run_with_concurrency_limit`].
    pub async fn run<P, Fut>(
        &self,
        token: &CancelToken,
        producer: P,
    ) -> Result<SchedulerStats, Cancelled>
    where
        P: FnOnce(JobQueue) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let span = tracing::debug_span!(
            "scheduler",
            name = self.options.name.as_deref().unwrap_or("<unnamed>")
        );
        run_with_concurrency_limit(self.limit(), token, producer)
            .instrument(span)
            .await
    }
}
