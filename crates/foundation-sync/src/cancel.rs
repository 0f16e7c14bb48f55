//! Hierarchical cancellation tokens
//!
//! Cancellation in this crate is explicit: every cancellable asynchronous
//! operation takes a [`CancelToken`] and polls it at its suspension points.
//! Tokens form a tree. Cancelling a token cancels all of its descendants, and
//! a child created from an already-cancelled parent starts out cancelled.

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

/// Error returned when an operation observed a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
    /// Live children, pruned lazily when new children are attached
    children: Mutex<Vec<Weak<TokenInner>>>,
}

/// Cloneable handle to a node in the cancellation tree
///
/// Clones share state: cancelling any clone cancels them all.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Create a new root token
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a child token that is cancelled whenever `self` is
    ///
    /// Cancelling the child does not affect the parent.
    pub fn child(&self) -> Self {
        let child = Self::new();
        let mut children = self.inner.children.lock();
        // Checked under the children lock so a concurrent `cancel` either
        // sees this child in the list or we see its flag here.
        if self.is_cancelled() {
            drop(children);
            child.cancel();
            return child;
        }
        children.retain(|weak| weak.strong_count() > 0);
        children.push(Arc::downgrade(&child.inner));
        child
    }

    /// Request cancellation of this token and every descendant
    ///
    /// Idempotent: only the first call has an effect.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.notify.notify_waiters();

        let children = std::mem::take(&mut *self.inner.children.lock());
        for weak in children {
            if let Some(inner) = weak.upgrade() {
                CancelToken { inner }.cancel();
            }
        }
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Return `Err(Cancelled)` if cancellation has been requested
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Wait until cancellation is requested
    ///
    /// Completes immediately if the token is already cancelled.
    pub async fn cancelled(&self) {
        loop {
            // A `Notified` receives `notify_waiters` as soon as it exists, so
            // creating it before the flag check cannot miss a wakeup.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Drive `future` until it completes or this token is cancelled
    ///
    /// The future is dropped at its current suspension point on cancellation.
    pub async fn run_until_cancelled<F>(&self, future: F) -> Result<F::Output, Cancelled>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            () = self.cancelled() => Err(Cancelled),
            output = future => Ok(output),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_token_starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert_eq!(token.check(), Ok(()));
    }

    #[test]
    fn test_cancel_is_shared_by_clones() {
        let token = CancelToken::new();
        let clone = token.clone();

        clone.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.check(), Err(Cancelled));

        // Second cancel is a no-op
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_cancel_propagates_to_descendants() {
        let root = CancelToken::new();
        let child = root.child();
        let grandchild = child.child();

        root.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn test_child_cancel_does_not_affect_parent() {
        let root = CancelToken::new();
        let child = root.child();
        let sibling = root.child();

        child.cancel();
        assert!(!root.is_cancelled());
        assert!(!sibling.is_cancelled());
    }

    #[test]
    fn test_child_of_cancelled_parent_starts_cancelled() {
        let root = CancelToken::new();
        root.cancel();
        assert!(root.child().is_cancelled());
    }

    #[test]
    fn test_dropped_children_are_pruned() {
        let root = CancelToken::new();
        for _ in 0..16 {
            let _ = root.child();
        }
        let _live = root.child();
        assert_eq!(root.inner.children.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_until_cancelled() {
        let token = CancelToken::new();
        assert_eq!(token.run_until_cancelled(async { 7 }).await, Ok(7));

        let child = token.child();
        token.cancel();
        let result = child
            .run_until_cancelled(std::future::pending::<()>())
            .await;
        assert_eq!(result, Err(Cancelled));
    }
}
