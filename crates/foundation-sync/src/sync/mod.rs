//! Synchronization primitives
//!
//! [`Semaphore`] suspends tasks cooperatively. [`RwLock`] and
//! [`RecursiveRwLock`] block the calling OS thread when contended and protect
//! state that lives outside the lock.

mod owner;
mod recursive;
mod rwlock;
mod semaphore;

pub use owner::OwnerToken;
pub use recursive::{RecursiveRwLock, RecursiveRwLockReadGuard, RecursiveRwLockWriteGuard};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use semaphore::{Semaphore, SemaphorePermit};
