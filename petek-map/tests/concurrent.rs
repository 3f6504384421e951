//! Multi-threaded correctness: winner uniqueness, lost updates, torn reads,
//! and erase accounting.

use petek_map::RobinMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

fn run_threads(n: usize, f: impl Fn(usize) + Send + Sync + 'static) {
    let f = Arc::new(f);
    let handles: Vec<_> = (0..n)
        .map(|i| {
            let f = f.clone();
            thread::spawn(move || f(i))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn disjoint_inserts_sum_up() {
    const THREADS: usize = 16;
    const PER_THREAD: usize = 1000;

    let map = Arc::new(RobinMap::new());

    {
        let map = map.clone();
        run_threads(THREADS, move |tid| {
            let base = (tid * PER_THREAD) as u64;
            for i in 0..PER_THREAD as u64 {
                assert!(map.insert(base + i, base + i));
            }
        });
    }

    assert_eq!(map.len(), THREADS * PER_THREAD);
    for key in 0..(THREADS * PER_THREAD) as u64 {
        assert_eq!(map.get(&key), Some(key), "key {key} lost");
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn hot_key_has_exactly_one_winner() {
    const THREADS: usize = 16;

    let map = Arc::new(RobinMap::new());
    let winners = Arc::new(AtomicUsize::new(0));

    {
        let map = map.clone();
        let winners = winners.clone();
        run_threads(THREADS, move |tid| {
            if map.insert(42u64, tid as u64) {
                winners.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert_eq!(map.len(), 1);
    let value = map.get(&42).expect("hot key must be present");
    assert!(value < THREADS as u64);
}

#[test]
#[cfg_attr(miri, ignore)]
fn reads_are_never_torn() {
    const WRITERS: usize = 4;
    const KEYS: u64 = 2000;

    let map: Arc<RobinMap<u64, u64>> = Arc::new(RobinMap::new());
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let map = map.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut hits = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    for key in 0..KEYS {
                        if let Some(value) = map.get(&key) {
                            // Only values some inserter actually wrote may
                            // ever be observed.
                            assert_eq!(value, key * 2, "torn read for key {key}");
                            hits += 1;
                        }
                    }
                }
                hits
            })
        })
        .collect();

    {
        let map = map.clone();
        run_threads(WRITERS, move |tid| {
            let mut key = tid as u64;
            while key < KEYS {
                map.insert(key, key * 2);
                key += WRITERS as u64;
            }
        });
    }
    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(map.len(), KEYS as usize);
}

#[test]
#[cfg_attr(miri, ignore)]
fn concurrent_erase_accounts_once() {
    const KEYS: u64 = 1000;
    const THREADS: usize = 8;

    let map = Arc::new(RobinMap::new());
    for key in 0..KEYS {
        map.insert(key, key);
    }

    let erased = Arc::new(AtomicUsize::new(0));
    {
        let map = map.clone();
        let erased = erased.clone();
        run_threads(THREADS, move |_| {
            for key in 0..KEYS {
                if map.remove(&key) {
                    erased.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
    }

    assert_eq!(erased.load(Ordering::SeqCst), KEYS as usize);
    assert_eq!(map.len(), 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn resize_under_concurrent_insert_loses_nothing() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 2000;

    // Few shards: every thread hammers the same tables through several
    // expansions.
    let map: Arc<RobinMap<u64, u64, _, 2>> =
        Arc::new(RobinMap::with_hasher(foldhash::fast::FixedState::default()));

    {
        let map = map.clone();
        run_threads(THREADS, move |tid| {
            let base = (tid * PER_THREAD) as u64;
            for i in 0..PER_THREAD as u64 {
                assert!(map.insert(base + i, base + i));
            }
        });
    }

    assert_eq!(map.len(), THREADS * PER_THREAD);
    for key in 0..(THREADS * PER_THREAD) as u64 {
        assert_eq!(map.get(&key), Some(key), "key {key} lost across resizes");
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn mixed_readers_and_writers_stay_consistent() {
    const KEYS: u64 = 512;

    let map: Arc<RobinMap<u64, u64>> = Arc::new(RobinMap::new());

    {
        let map = map.clone();
        run_threads(8, move |tid| {
            for round in 0..200u64 {
                for key in 0..KEYS {
                    match (tid + round as usize) % 4 {
                        0 => {
                            map.insert(key, key);
                        }
                        1 => {
                            if let Some(value) = map.get(&key) {
                                assert_eq!(value, key);
                            }
                        }
                        2 => {
                            map.remove(&key);
                        }
                        _ => {
                            let value = map.get_or_insert(key, key);
                            assert_eq!(value, key);
                        }
                    }
                }
            }
        });
    }

    assert!(map.len() <= KEYS as usize);
}
