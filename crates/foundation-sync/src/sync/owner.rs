//! Opaque identity of an execution context

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of the context that owns a reentrant lock
///
/// Each OS thread gets one token for its lifetime through
/// [`OwnerToken::current`]. Tokens are never reused, so a stale owner can
/// not be confused with a new thread.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct OwnerToken(NonZeroU64);

static NEXT_OWNER_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_OWNER: OwnerToken = OwnerToken::new();
}

impl OwnerToken {
    /// Generate a new unique token
    pub fn new() -> Self {
        let id = NEXT_OWNER_TOKEN.fetch_add(1, Ordering::Relaxed);
        OwnerToken(NonZeroU64::new(id).unwrap_or(NonZeroU64::MIN))
    }

    /// Token of the calling thread
    pub fn current() -> Self {
        CURRENT_OWNER.with(|token| *token)
    }

    /// Get the numeric token value
    pub fn as_u64(self) -> u64 {
        self.0.get()
    }
}

impl Default for OwnerToken {
    fn default() -> Self {
        Self::new()
    }
}
