//! Contracts of the get-or-insert family: at-most-once factories and
//! first-writer-wins semantics.

use petek_map::RobinMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;

#[test]
fn value_form_inserts_when_absent() {
    let map = RobinMap::new();
    let value = map.get_or_insert(1u64, "fresh".to_string());
    assert_eq!(value, "fresh");
    assert_eq!(map.get(&1), Some("fresh".to_string()));
    assert_eq!(map.len(), 1);
}

#[test]
fn value_form_returns_existing() {
    let map = RobinMap::new();
    map.insert(1u64, "original".to_string());
    let value = map.get_or_insert(1u64, "ignored".to_string());
    assert_eq!(value, "original");
    assert_eq!(map.get(&1), Some("original".to_string()));
    assert_eq!(map.len(), 1);
}

#[test]
fn factory_form_runs_once_when_absent() {
    let map = RobinMap::new();
    let mut calls = 0;
    let value = map.get_or_insert_with(1u64, || {
        calls += 1;
        "lazy".to_string()
    });
    assert_eq!(value, "lazy");
    assert_eq!(calls, 1);
}

#[test]
fn factory_form_skips_factory_when_present() {
    let map = RobinMap::new();
    map.insert(1u64, "resident".to_string());
    let mut calls = 0;
    let value = map.get_or_insert_with(1u64, || {
        calls += 1;
        "never".to_string()
    });
    assert_eq!(value, "resident");
    assert_eq!(calls, 0);
}

#[test]
fn returns_the_stored_allocation_not_a_rebuild() {
    // With Arc values, every later call must hand back a clone of the Arc
    // the first call stored.
    let map: RobinMap<&'static str, Arc<AtomicU64>> = RobinMap::new();

    let first = Arc::new(AtomicU64::new(1));
    let stored = map.get_or_insert("key", first.clone());
    assert!(Arc::ptr_eq(&stored, &first));

    stored.store(100, Ordering::Relaxed);

    let again = map.get_or_insert("key", Arc::new(AtomicU64::new(999)));
    assert!(Arc::ptr_eq(&again, &first));
    assert_eq!(again.load(Ordering::Relaxed), 100);
}

#[test]
#[cfg_attr(miri, ignore)]
fn concurrent_same_key_agrees_on_one_value() {
    const THREADS: usize = 10;

    let map: Arc<RobinMap<&'static str, Arc<AtomicU64>>> = Arc::new(RobinMap::new());
    let factory_runs = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let map = map.clone();
            let factory_runs = factory_runs.clone();
            thread::spawn(move || {
                map.get_or_insert_with("shared", || {
                    factory_runs.fetch_add(1, Ordering::SeqCst);
                    Arc::new(AtomicU64::new(tid as u64))
                })
            })
        })
        .collect();

    let values: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // Exactly one factory ran, and every thread got that winner's Arc.
    assert_eq!(factory_runs.load(Ordering::SeqCst), 1);
    assert_eq!(map.len(), 1);
    for value in &values {
        assert!(Arc::ptr_eq(value, &values[0]));
    }
}
