//! Reentrant reader-writer lock
//!
//! A context that holds the write lock may take it again, and may take the
//! read lock, without blocking on itself. Nested acquisitions are counted and
//! the underlying raw lock is released only when the outermost write is
//! released. Contexts that do not own the write lock compete for the raw lock
//! exactly like [`super::RwLock`]: readers share it, writers wait.
//!
//! Ownership is compared through [`OwnerToken`], captured when the write lock
//! is first taken.
//!
//! Upgrading a plain (non-owner) read acquisition to a write acquisition on
//! the same thread deadlocks, as with any reader-writer lock.

use super::OwnerToken;
use crossbeam::atomic::AtomicCell;
use parking_lot::lock_api::RawRwLock as _;
use parking_lot::RawRwLock;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Reader-writer lock that its writer can re-enter
pub struct RecursiveRwLock {
    raw: RawRwLock,

    /// Context holding the write lock (None if no writer)
    owner: AtomicCell<Option<OwnerToken>>,

    /// Write acquisitions by the owner, including the outermost one
    writer_depth: AtomicUsize,

    /// Read acquisitions nested inside the owner's write lock
    reader_depth: AtomicUsize,

    /// Shared acquisitions by non-owning contexts
    shared: AtomicUsize,
}

impl RecursiveRwLock {
    /// Create an unlocked lock
    pub fn new() -> Self {
        Self {
            raw: RawRwLock::INIT,
            owner: AtomicCell::new(None),
            writer_depth: AtomicUsize::new(0),
            reader_depth: AtomicUsize::new(0),
            shared: AtomicUsize::new(0),
        }
    }

    fn owned_by_current(&self) -> bool {
        // Only the owning thread ever stores its own token, so a match here
        // cannot race with another thread.
        self.owner.load() == Some(OwnerToken::current())
    }

    /// Acquire exclusive access, re-entering if the caller already owns it
    pub fn acquire_write(&self) {
        if self.owned_by_current() {
            self.writer_depth.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.raw.lock_exclusive();
        self.owner.store(Some(OwnerToken::current()));
        self.writer_depth.store(1, Ordering::Relaxed);
    }

    /// Release one write acquisition
    ///
    /// The raw lock is unlocked when the outermost acquisition is released.
    ///
    /// # Panics
    /// Panics if the caller does not own the write lock, or if this is the
    /// outermost release while nested read acquisitions are outstanding.
    pub fn release_write(&self) {
        if !self.owned_by_current() {
            panic!(
                "RecursiveRwLock::release_write called by a context that does not own the write lock"
            );
        }

        let depth = self.writer_depth.load(Ordering::Relaxed);
        if depth > 1 {
            self.writer_depth.store(depth - 1, Ordering::Relaxed);
            return;
        }

        let nested_reads = self.reader_depth.load(Ordering::Relaxed);
        if nested_reads > 0 {
            panic!(
                "RecursiveRwLock::release_write would unlock with {nested_reads} nested read acquisitions outstanding"
            );
        }
        self.writer_depth.store(0, Ordering::Relaxed);
        self.owner.store(None);
        // SAFETY: ownership was checked above and this is the outermost write.
        unsafe { self.raw.unlock_exclusive() };
    }

    /// Acquire shared access
    ///
    /// Does not block when the caller owns the write lock.
    pub fn acquire_read(&self) {
        if self.owned_by_current() {
            self.reader_depth.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.raw.lock_shared();
        self.shared.fetch_add(1, Ordering::AcqRel);
    }

    /// Release one read acquisition
    ///
    /// # Panics
    /// Panics if the caller holds no read acquisition.
    pub fn release_read(&self) {
        if self.owned_by_current() {
            if self
                .reader_depth
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_err()
            {
                panic!(
                    "RecursiveRwLock::release_read called by the writer without a nested read lock"
                );
            }
            return;
        }

        if self
            .shared
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            panic!("RecursiveRwLock::release_read called without a held read lock");
        }
        // SAFETY: the shared count proves a shared lock is held.
        unsafe { self.raw.unlock_shared() };
    }

    /// Acquire shared access, released when the guard drops
    pub fn read(&self) -> RecursiveRwLockReadGuard<'_> {
        self.acquire_read();
        RecursiveRwLockReadGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Acquire exclusive access, released when the guard drops
    pub fn write(&self) -> RecursiveRwLockWriteGuard<'_> {
        self.acquire_write();
        RecursiveRwLockWriteGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Run `body` while holding shared access
    pub fn with_read_lock<R>(&self, body: impl FnOnce() -> R) -> R {
        let _guard = self.read();
        body()
    }

    /// Run `body` while holding exclusive access
    ///
    /// May be nested inside another `with_write_lock` on the same thread.
    pub fn with_write_lock<R>(&self, body: impl FnOnce() -> R) -> R {
        let _guard = self.write();
        body()
    }

    /// Whether any context currently holds the write lock
    pub fn is_write_locked(&self) -> bool {
        self.raw.is_locked_exclusive()
    }

    /// Whether the calling context holds the write lock
    pub fn is_write_locked_by_current(&self) -> bool {
        self.owned_by_current()
    }

    /// Nesting depth of the caller's write acquisitions (0 if not the owner)
    pub fn write_depth(&self) -> usize {
        if self.owned_by_current() {
            self.writer_depth.load(Ordering::Relaxed)
        } else {
            0
        }
    }
}

impl Default for RecursiveRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RecursiveRwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecursiveRwLock")
            .field("owner", &self.owner.load())
            .field("shared", &self.shared.load(Ordering::Relaxed))
            .finish()
    }
}

/// RAII guard for [`RecursiveRwLock`] shared access
#[must_use = "the read lock is released as soon as the guard is dropped"]
pub struct RecursiveRwLockReadGuard<'a> {
    lock: &'a RecursiveRwLock,
    _not_send: PhantomData<*const ()>,
}

impl Drop for RecursiveRwLockReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// RAII guard for [`RecursiveRwLock`] exclusive access
#[must_use = "the write lock is released as soon as the guard is dropped"]
pub struct RecursiveRwLockWriteGuard<'a> {
    lock: &'a RecursiveRwLock,
    _not_send: PhantomData<*const ()>,
}

impl Drop for RecursiveRwLockWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Probe from another thread whether the raw lock is free for a writer
    fn free_for_other_writer(lock: &Arc<RecursiveRwLock>) -> bool {
        let lock = lock.clone();
        std::thread::spawn(move || {
            if lock.raw.try_lock_exclusive() {
                // SAFETY: just acquired above.
                unsafe { lock.raw.unlock_exclusive() };
                true
            } else {
                false
            }
        })
        .join()
        .unwrap()
    }

    #[test]
    fn test_reentrant_write() {
        let lock = Arc::new(RecursiveRwLock::new());

        lock.with_write_lock(|| {
            assert_eq!(lock.write_depth(), 1);
            lock.with_write_lock(|| {
                assert_eq!(lock.write_depth(), 2);
                assert!(lock.is_write_locked_by_current());
            });
            assert_eq!(lock.write_depth(), 1);
            assert!(!free_for_other_writer(&lock));
        });

        assert!(!lock.is_write_locked());
        assert_eq!(lock.write_depth(), 0);
        assert!(free_for_other_writer(&lock));
    }

    #[test]
    fn test_writer_may_read() {
        let lock = RecursiveRwLock::new();

        let value = lock.with_write_lock(|| lock.with_read_lock(|| 42));
        assert_eq!(value, 42);
        assert!(!lock.is_write_locked());
    }

    #[test]
    fn test_plain_readers_share() {
        let lock = RecursiveRwLock::new();
        let first = lock.read();
        let second = lock.read();
        assert!(!lock.is_write_locked());
        assert!(!lock.is_write_locked_by_current());
        drop(first);
        drop(second);
        assert!(lock.raw.try_lock_exclusive());
        // SAFETY: just acquired above.
        unsafe { lock.raw.unlock_exclusive() };
    }

    #[test]
    fn test_other_thread_is_not_owner() {
        let lock = Arc::new(RecursiveRwLock::new());
        let _guard = lock.write();

        let observed = {
            let lock = lock.clone();
            std::thread::spawn(move || (lock.is_write_locked(), lock.is_write_locked_by_current()))
                .join()
                .unwrap()
        };
        assert_eq!(observed, (true, false));
    }

    #[test]
    #[should_panic(expected = "does not own the write lock")]
    fn test_release_write_by_non_owner_panics() {
        RecursiveRwLock::new().release_write();
    }

    #[test]
    #[should_panic(expected = "nested read acquisitions outstanding")]
    fn test_outermost_release_with_nested_reads_panics() {
        let lock = RecursiveRwLock::new();
        lock.acquire_write();
        lock.acquire_read();
        lock.release_write();
    }
}
