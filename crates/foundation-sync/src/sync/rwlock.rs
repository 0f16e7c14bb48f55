//! Thread-blocking reader-writer lock
//!
//! [`RwLock`] guards state that lives elsewhere: it carries no payload and
//! callers pair it with whatever they need to protect. Contended acquisition
//! parks the calling OS thread, so the lock must not be held across an
//! `.await`. The guards are `!Send` to keep them on the acquiring thread.
//!
//! Fairness between waiting readers and writers is whatever
//! `parking_lot::RawRwLock` provides (eventual fairness), not a guarantee of
//! this type.

use super::OwnerToken;
use crossbeam::atomic::AtomicCell;
use parking_lot::lock_api::RawRwLock as _;
use parking_lot::RawRwLock;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Reader-writer lock with explicit and scoped acquisition
pub struct RwLock {
    raw: RawRwLock,

    /// Read acquisitions currently held, across all threads
    readers: AtomicUsize,

    /// Thread holding the write lock (None if no writer)
    writer: AtomicCell<Option<OwnerToken>>,
}

impl RwLock {
    /// Create an unlocked lock
    pub const fn new() -> Self {
        Self {
            raw: RawRwLock::INIT,
            readers: AtomicUsize::new(0),
            writer: AtomicCell::new(None),
        }
    }

    /// Block until shared access is granted
    ///
    /// Must be balanced by [`RwLock::release_read`] on the same thread.
    pub fn acquire_read(&self) {
        self.raw.lock_shared();
        self.readers.fetch_add(1, Ordering::AcqRel);
    }

    /// Release one shared acquisition
    ///
    /// Readers are counted, not identified: the check is against the total
    /// number of read acquisitions, so a thread that holds nothing can still
    /// release another thread's read lock.
    ///
    /// # Panics
    /// Panics if no read lock is held by any thread.
    pub fn release_read(&self) {
        if self
            .readers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            panic!("RwLock::release_read called without a held read lock");
        }
        // SAFETY: the reader count proves some shared lock is held.
        unsafe { self.raw.unlock_shared() };
    }

    /// Block until exclusive access is granted
    ///
    /// Must be balanced by [`RwLock::release_write`] on the same thread.
    pub fn acquire_write(&self) {
        self.raw.lock_exclusive();
        self.writer.store(Some(OwnerToken::current()));
    }

    /// Release the exclusive acquisition
    ///
    /// # Panics
    /// Panics if the calling thread does not hold the write lock.
    pub fn release_write(&self) {
        let current = OwnerToken::current();
        if let Err(owner) = self.writer.compare_exchange(Some(current), None) {
            match owner {
                None => panic!("RwLock::release_write called without a held write lock"),
                Some(_) => panic!(
                    "RwLock::release_write called by a thread that does not hold the write lock"
                ),
            }
        }
        // SAFETY: the calling thread was recorded as the exclusive holder.
        unsafe { self.raw.unlock_exclusive() };
    }

    /// Acquire shared access, released when the guard drops
    pub fn read(&self) -> RwLockReadGuard<'_> {
        self.acquire_read();
        RwLockReadGuard::new(self)
    }

    /// Acquire exclusive access, released when the guard drops
    pub fn write(&self) -> RwLockWriteGuard<'_> {
        self.acquire_write();
        RwLockWriteGuard::new(self)
    }

    /// Try to acquire shared access without blocking
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_>> {
        if self.raw.try_lock_shared() {
            self.readers.fetch_add(1, Ordering::AcqRel);
            Some(RwLockReadGuard::new(self))
        } else {
            None
        }
    }

    /// Try to acquire exclusive access without blocking
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_>> {
        if self.raw.try_lock_exclusive() {
            self.writer.store(Some(OwnerToken::current()));
            Some(RwLockWriteGuard::new(self))
        } else {
            None
        }
    }

    /// Run `body` while holding shared access
    ///
    /// The lock is released on every exit path of `body`, including early
    /// returns of an error and unwinding.
    pub fn with_read_lock<R>(&self, body: impl FnOnce() -> R) -> R {
        let _guard = self.read();
        body()
    }

    /// Run `body` while holding exclusive access
    pub fn with_write_lock<R>(&self, body: impl FnOnce() -> R) -> R {
        let _guard = self.write();
        body()
    }

    /// Whether a writer currently holds the lock
    ///
    /// Never blocks and never changes ownership. Also true when the caller is
    /// the writer.
    pub fn is_write_locked(&self) -> bool {
        self.raw.is_locked_exclusive()
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock")
            .field("readers", &self.readers.load(Ordering::Relaxed))
            .field("write_locked", &self.is_write_locked())
            .finish()
    }
}

/// RAII guard for shared access (releases on drop)
#[must_use = "the read lock is released as soon as the guard is dropped"]
pub struct RwLockReadGuard<'a> {
    lock: &'a RwLock,
    _not_send: PhantomData<*const ()>,
}

impl<'a> RwLockReadGuard<'a> {
    fn new(lock: &'a RwLock) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl Drop for RwLockReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// RAII guard for exclusive access (releases on drop)
#[must_use = "the write lock is released as soon as the guard is dropped"]
pub struct RwLockWriteGuard<'a> {
    lock: &'a RwLock,
    _not_send: PhantomData<*const ()>,
}

impl<'a> RwLockWriteGuard<'a> {
    fn new(lock: &'a RwLock) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl Drop for RwLockWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_then_write() {
        let lock = RwLock::new();

        lock.acquire_read();
        lock.acquire_read();
        assert!(!lock.is_write_locked());
        assert!(lock.try_write().is_none());
        lock.release_read();
        lock.release_read();

        lock.acquire_write();
        assert!(lock.is_write_locked());
        assert!(lock.try_read().is_none());
        lock.release_write();
        assert!(!lock.is_write_locked());
    }

    #[test]
    fn test_probe_from_the_writer() {
        let lock = RwLock::new();
        lock.with_write_lock(|| assert!(lock.is_write_locked()));
        assert!(!lock.is_write_locked());
    }

    #[test]
    fn test_scoped_release_on_error() {
        let lock = RwLock::new();

        let result: Result<(), &str> = lock.with_write_lock(|| {
            Err::<(), _>("boom")?;
            Ok(())
        });
        assert_eq!(result, Err("boom"));
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn test_scoped_release_on_panic() {
        let lock = RwLock::new();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            lock.with_read_lock(|| panic!("reader failed"));
        }));
        assert!(result.is_err());
        assert!(lock.try_write().is_some());
    }

    #[test]
    #[should_panic(expected = "without a held read lock")]
    fn test_unbalanced_release_read_panics() {
        RwLock::new().release_read();
    }

    #[test]
    #[should_panic(expected = "without a held write lock")]
    fn test_unbalanced_release_write_panics() {
        let lock = RwLock::new();
        lock.acquire_read();
        lock.release_write();
    }

    #[test]
    fn test_release_write_from_other_thread_panics() {
        let lock = RwLock::new();
        let _guard = lock.write();

        let result = std::thread::scope(|s| s.spawn(|| lock.release_write()).join());
        let payload = result.unwrap_err();
        let message = payload
            .downcast_ref::<&str>()
            .map(|m| m.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap();
        assert!(message.contains("does not hold the write lock"), "{message}");

        // The writer still holds the lock
        assert!(lock.is_write_locked());
        assert!(lock.try_read().is_none());
    }
}
