//! Integration tests for the thread-blocking reader-writer locks

use foundation_sync::{RecursiveRwLock, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn test_writer_waits_for_all_readers() {
    const READERS: usize = 5;

    let lock = Arc::new(RwLock::new());
    let active_readers = Arc::new(AtomicUsize::new(0));
    let writer_done = Arc::new(AtomicBool::new(false));
    // Readers plus the main thread
    let all_reading = Arc::new(Barrier::new(READERS + 1));
    let release = Arc::new(Barrier::new(READERS + 1));

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let lock = lock.clone();
            let active_readers = active_readers.clone();
            let writer_done = writer_done.clone();
            let all_reading = all_reading.clone();
            let release = release.clone();
            thread::spawn(move || {
                lock.with_read_lock(|| {
                    active_readers.fetch_add(1, Ordering::SeqCst);
                    all_reading.wait();
                    release.wait();
                    assert!(!writer_done.load(Ordering::SeqCst));
                    active_readers.fetch_sub(1, Ordering::SeqCst);
                });
            })
        })
        .collect();

    all_reading.wait();
    assert_eq!(active_readers.load(Ordering::SeqCst), READERS);

    let writer = {
        let lock = lock.clone();
        let active_readers = active_readers.clone();
        let writer_done = writer_done.clone();
        thread::spawn(move || {
            lock.with_write_lock(|| {
                assert_eq!(active_readers.load(Ordering::SeqCst), 0);
                writer_done.store(true, Ordering::SeqCst);
            });
        })
    };

    // The writer cannot get in while the readers hold the lock
    thread::sleep(Duration::from_millis(50));
    assert!(!writer_done.load(Ordering::SeqCst));

    release.wait();
    for reader in readers {
        reader.join().unwrap();
    }
    writer.join().unwrap();
    assert!(writer_done.load(Ordering::SeqCst));
    assert!(!lock.is_write_locked());
}

#[test]
fn test_writers_never_overlap() {
    let lock = Arc::new(RwLock::new());
    let inside = Arc::new(AtomicUsize::new(0));
    let total = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let lock = lock.clone();
            let inside = inside.clone();
            let total = total.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    lock.with_write_lock(|| {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        total.fetch_add(1, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(total.load(Ordering::SeqCst), 8 * 200);
}

#[test]
fn test_recursive_reentry_across_threads() {
    let lock = Arc::new(RecursiveRwLock::new());
    let counter = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let lock = lock.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    lock.with_write_lock(|| {
                        // Re-entering the write lock and reading under it
                        // must not deadlock
                        lock.with_write_lock(|| {
                            assert_eq!(lock.write_depth(), 2);
                            lock.with_read_lock(|| {
                                counter.fetch_add(1, Ordering::SeqCst);
                            });
                        });
                        assert_eq!(lock.write_depth(), 1);
                    });
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 400);
    assert!(!lock.is_write_locked());
}

#[test]
fn test_recursive_writer_excludes_other_threads() {
    let lock = Arc::new(RecursiveRwLock::new());
    let acquired = Arc::new(AtomicBool::new(false));

    let guard = lock.write();
    let _nested = lock.write();

    let other = {
        let lock = lock.clone();
        let acquired = acquired.clone();
        thread::spawn(move || {
            assert!(!lock.is_write_locked_by_current());
            lock.with_read_lock(|| acquired.store(true, Ordering::SeqCst));
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!acquired.load(Ordering::SeqCst));

    drop(_nested);
    thread::sleep(Duration::from_millis(20));
    // Still held once
    assert!(!acquired.load(Ordering::SeqCst));

    drop(guard);
    other.join().unwrap();
    assert!(acquired.load(Ordering::SeqCst));
}
