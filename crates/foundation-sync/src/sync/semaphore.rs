//! Task-aware counting semaphore
//!
//! Unlike OS-level semaphores that block threads, [`Semaphore`] suspends the
//! waiting task and lets its worker thread run other tasks.
//!
//! The permit counter is a signed value. A non-negative value is the number of
//! permits immediately available; a negative value `-n` means `n` tasks are
//! queued waiting for a permit. The counter and the wait queue are only
//! mutated together under one lock, so `max(0, -value) == waiters.len()`
//! holds whenever the lock is free.
//!
//! Waiters are woken in strict FIFO order regardless of whether they entered
//! through [`Semaphore::wait`] or [`Semaphore::wait_cancellable`]. Wakeups are
//! delivered after the state lock is released.

use crate::cancel::{CancelToken, Cancelled};
use parking_lot::Mutex as ParkingLotMutex;
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::oneshot;
use tracing::trace;

/// How a queued waiter may leave the queue
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum WaiterKind {
    /// Entered through `wait`; only a signal can resume it
    NonCancellable,
    /// Entered through `wait_cancellable`
    Cancellable,
}

/// Outcome delivered to a suspended waiter
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Resume {
    Granted,
    Cancelled,
}

struct Waiter {
    id: u64,
    kind: WaiterKind,
    resume: oneshot::Sender<Resume>,
}

struct SemaphoreState {
    /// Signed permit counter
    value: isize,

    /// FIFO queue of suspended tasks
    waiters: VecDeque<Waiter>,

    /// Next waiter id
    next_waiter_id: u64,
}

impl SemaphoreState {
    /// Queue a waiter. The caller has already decremented `value`.
    fn enqueue(&mut self, kind: WaiterKind) -> (u64, oneshot::Receiver<Resume>) {
        let id = self.next_waiter_id;
        self.next_waiter_id = self.next_waiter_id.wrapping_add(1);
        let (resume, rx) = oneshot::channel();
        self.waiters.push_back(Waiter { id, kind, resume });
        (id, rx)
    }

    /// Remove a still-queued waiter and give its permit back to the counter
    fn withdraw(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == id) {
            Some(pos) => {
                self.waiters.remove(pos);
                self.value += 1;
                true
            }
            None => false,
        }
    }
}

/// Cooperative counting semaphore with cancellable and non-cancellable waits
pub struct Semaphore {
    state: ParkingLotMutex<SemaphoreState>,
}

impl Semaphore {
    /// Create a semaphore with `initial` permits
    ///
    /// # Panics
    /// Panics if `initial` is negative.
    pub fn new(initial: isize) -> Self {
        assert!(
            initial >= 0,
            "Semaphore requires a non-negative initial permit count, got {initial}"
        );
        Self {
            state: ParkingLotMutex::new(SemaphoreState {
                value: initial,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
            }),
        }
    }

    /// Create a semaphore from an unsigned permit count
    ///
    /// # Panics
    /// Panics if `permits` does not fit in the signed permit counter.
    pub fn with_permits(permits: usize) -> Self {
        let initial = isize::try_from(permits)
            .unwrap_or_else(|_| panic!("Semaphore permit count {permits} exceeds isize::MAX"));
        Self::new(initial)
    }

    /// Current value of the permit counter
    ///
    /// Negative values report the number of queued waiters.
    pub fn value(&self) -> isize {
        self.state.lock().value
    }

    /// Number of tasks currently suspended waiting for a permit
    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Take a permit only if one is free right now
    ///
    /// A positive counter implies an empty queue, so this never jumps ahead of
    /// a queued waiter.
    pub fn try_wait(&self) -> bool {
        let mut state = self.state.lock();
        if state.value > 0 {
            state.value -= 1;
            true
        } else {
            false
        }
    }

    /// Acquire a permit, suspending until one is available
    ///
    /// This wait cannot be cancelled through a token. Dropping the future while
    /// it is queued gives the permit slot back.
    pub async fn wait(&self) {
        let (id, rx) = {
            let mut state = self.state.lock();
            state.value -= 1;
            if state.value >= 0 {
                return;
            }
            state.enqueue(WaiterKind::NonCancellable)
        };
        trace!(waiter = id, "semaphore wait suspended");

        let mut pending = PendingWait::new(self, id, rx);
        let outcome = pending.resumed().await;
        debug_assert_eq!(outcome, Resume::Granted);
    }

    /// Acquire a permit unless `token` is cancelled first
    ///
    /// Cancellation is observed before taking the state lock, right after
    /// taking it, and while suspended. A cancelled call leaves the permit
    /// counter exactly as it was before the call. If a signal already handed
    /// this waiter a permit when the cancellation arrives, the permit is kept
    /// and the call succeeds.
    pub async fn wait_cancellable(&self, token: &CancelToken) -> Result<(), Cancelled> {
        token.check()?;
        let (id, rx) = {
            let mut state = self.state.lock();
            token.check()?;
            state.value -= 1;
            if state.value >= 0 {
                return Ok(());
            }
            state.enqueue(WaiterKind::Cancellable)
        };
        trace!(waiter = id, "semaphore cancellable wait suspended");

        let mut pending = PendingWait::new(self, id, rx);
        let woken = tokio::select! {
            biased;
            outcome = pending.resumed() => Woken::Resumed(outcome),
            () = token.cancelled() => Woken::TokenFired,
        };
        let outcome = match woken {
            Woken::Resumed(outcome) => outcome,
            Woken::TokenFired => pending.cancel().await,
        };

        match outcome {
            Resume::Granted => Ok(()),
            Resume::Cancelled => Err(Cancelled),
        }
    }

    /// Acquire a permit wrapped in a guard that signals on drop
    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        self.wait().await;
        SemaphorePermit { semaphore: self }
    }

    /// Cancellable form of [`Semaphore::acquire`]
    pub async fn acquire_cancellable(
        &self,
        token: &CancelToken,
    ) -> Result<SemaphorePermit<'_>, Cancelled> {
        self.wait_cancellable(token).await?;
        Ok(SemaphorePermit { semaphore: self })
    }

    /// Release one permit
    ///
    /// Resumes the earliest queued waiter, if any, and returns whether a
    /// waiter was resumed.
    pub fn signal(&self) -> bool {
        let waiter = {
            let mut state = self.state.lock();
            state.value += 1;
            state.waiters.pop_front()
        };

        match waiter {
            Some(waiter) => {
                trace!(waiter = waiter.id, "semaphore resuming waiter");
                if waiter.resume.send(Resume::Granted).is_err() {
                    // The waiter's future was dropped between dequeue and
                    // delivery; pass its permit on.
                    return self.signal();
                }
                true
            }
            None => false,
        }
    }

    /// Resume every queued waiter in enqueue order
    ///
    /// Returns the number of waiters that were dequeued.
    pub fn signal_all(&self) -> usize {
        let waiters = self.drain_waiters();
        let count = waiters.len();
        for waiter in waiters {
            if waiter.resume.send(Resume::Granted).is_err() {
                self.signal();
            }
        }
        count
    }

    /// Fail every queued waiter with [`Cancelled`]
    ///
    /// The counter is incremented by the number of waiters removed. Returns
    /// that number.
    ///
    /// # Panics
    /// Panics without changing any state if a non-cancellable waiter is
    /// queued: such a waiter has no way to receive a cancellation.
    pub fn cancel_all(&self) -> usize {
        let waiters = {
            let mut state = self.state.lock();
            if let Some(waiter) = state
                .waiters
                .iter()
                .find(|w| w.kind == WaiterKind::NonCancellable)
            {
                let id = waiter.id;
                drop(state);
                panic!("Semaphore::cancel_all called while non-cancellable waiter {id} is queued");
            }
            let waiters: Vec<Waiter> = state.waiters.drain(..).collect();
            state.value += waiters.len() as isize;
            waiters
        };

        let count = waiters.len();
        for waiter in waiters {
            trace!(waiter = waiter.id, "semaphore cancelling waiter");
            // A dropped receiver has nothing to roll back
            let _ = waiter.resume.send(Resume::Cancelled);
        }
        count
    }

    fn drain_waiters(&self) -> Vec<Waiter> {
        let mut state = self.state.lock();
        let waiters: Vec<Waiter> = state.waiters.drain(..).collect();
        state.value += waiters.len() as isize;
        waiters
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Semaphore")
            .field("value", &state.value)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

enum Woken {
    Resumed(Resume),
    TokenFired,
}

/// A queued wait that has not yet observed its outcome
///
/// Dropping it before it settles withdraws the waiter, or forwards a permit
/// that was already granted to it.
struct PendingWait<'a> {
    semaphore: &'a Semaphore,
    id: u64,
    rx: oneshot::Receiver<Resume>,
    settled: bool,
}

impl<'a> PendingWait<'a> {
    fn new(semaphore: &'a Semaphore, id: u64, rx: oneshot::Receiver<Resume>) -> Self {
        Self {
            semaphore,
            id,
            rx,
            settled: false,
        }
    }

    async fn resumed(&mut self) -> Resume {
        let outcome = match (&mut self.rx).await {
            Ok(outcome) => outcome,
            // Senders live in the queue of a semaphore that outlives us and
            // are always consumed by a send.
            Err(_) => unreachable!("semaphore waiter {} dropped without a resume", self.id),
        };
        self.settled = true;
        outcome
    }

    /// Roll the wait back, unless a signal already dequeued it
    async fn cancel(&mut self) -> Resume {
        {
            let mut state = self.semaphore.state.lock();
            if state.withdraw(self.id) {
                self.settled = true;
                trace!(waiter = self.id, "semaphore wait cancelled");
                return Resume::Cancelled;
            }
        }
        // Dequeued concurrently; the outcome is already in flight
        self.resumed().await
    }
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.semaphore.state.lock().withdraw(self.id) {
            return;
        }
        // Closing first makes any later send fail, so exactly one side
        // forwards the permit.
        self.rx.close();
        if let Ok(Resume::Granted) = self.rx.try_recv() {
            self.semaphore.signal();
        }
    }
}

/// RAII permit returned by [`Semaphore::acquire`]
///
/// Calls [`Semaphore::signal`] when dropped.
#[must_use = "permit will be immediately released if not held"]
pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
}

impl SemaphorePermit<'_> {
    /// Keep the permit acquired without ever signalling it back
    pub fn forget(self) {
        std::mem::forget(self);
    }
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.signal();
    }
}
