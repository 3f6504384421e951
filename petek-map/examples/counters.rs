//! Shared counter table: many threads bump per-endpoint counters while a
//! sampler reads them lock-free.

use petek_map::RobinMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

fn main() {
    let counters: Arc<RobinMap<String, Arc<AtomicU64>>> = Arc::new(RobinMap::new());

    let mut workers = Vec::new();
    for worker in 0..8 {
        let counters = Arc::clone(&counters);
        workers.push(thread::spawn(move || {
            for i in 0..10_000u64 {
                let endpoint = format!("/api/v1/resource/{}", (worker + i) % 32);
                // First toucher allocates the counter; everyone else gets
                // the same Arc back and bumps it.
                let counter = counters.get_or_insert_with(endpoint, || Arc::new(AtomicU64::new(0)));
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    for worker in workers {
        worker.join().unwrap();
    }

    let mut total = 0;
    for endpoint in 0..32u64 {
        let key = format!("/api/v1/resource/{endpoint}");
        if let Some(counter) = counters.get(&key) {
            let hits = counter.load(Ordering::Relaxed);
            println!("{key}: {hits}");
            total += hits;
        }
    }

    println!("---");
    println!("endpoints: {}", counters.len());
    println!("total hits: {total}");
}
