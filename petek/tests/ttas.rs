//! TTAS spin mutex: exclusion and try_lock behavior.

use petek::TTas;
use std::sync::Arc;
use std::thread;

#[test]
fn lock_unlock() {
    let lock = TTas::new(41u64);
    {
        let mut guard = lock.lock();
        *guard += 1;
    }
    assert_eq!(*lock.lock(), 42);
}

#[test]
fn try_lock_respects_holder() {
    let lock = TTas::new(());
    let guard = lock.lock();
    assert!(lock.try_lock().is_none());
    drop(guard);
    assert!(lock.try_lock().is_some());
}

#[test]
#[cfg_attr(miri, ignore)]
fn mutual_exclusion() {
    const THREADS: usize = 8;
    const INCREMENTS: usize = 10_000;

    let counter = Arc::new(TTas::new(0u64));

    let mut handles = vec![];
    for _ in 0..THREADS {
        let counter = counter.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..INCREMENTS {
                *counter.lock() += 1;
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(*counter.lock(), (THREADS * INCREMENTS) as u64);
}
