//! Shared driver for the multi-thread correctness tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use funnel_counters::Counter;

/// Window of counter values whose returns are collected verbatim.
pub const INTERVAL_START: u64 = 5_000;
pub const INTERVAL_SIZE: u64 = 1_000;

const RING_SIZE: usize = 128;

/// Drive `thread_count` workers through `ops_count` operations in total
/// (1% reads, 99% unit increments) and verify the partition contract:
///
/// - every worker's recent returns are globally distinct,
/// - the returns falling in `[INTERVAL_START, INTERVAL_START + INTERVAL_SIZE)`
///   cover that interval exactly once,
/// - the sum of locally tracked increments equals the final `load()`.
///
/// Callers must keep `ops_count / thread_count` comfortably above the ring
/// size so every ring slot is overwritten, and the total increment count
/// above the collection interval so the interval fills up.
pub fn multi_test(counter: &dyn Counter, thread_count: usize, ops_count: usize) {
    assert!(ops_count / thread_count >= 10 * RING_SIZE);

    let tracked = AtomicU64::new(0);
    let recent: Mutex<Vec<u64>> = Mutex::new(Vec::new());
    let interval_hits: Mutex<Vec<u64>> = Mutex::new(Vec::new());

    std::thread::scope(|s| {
        for tid in 0..thread_count {
            let tracked = &tracked;
            let recent = &recent;
            let interval_hits = &interval_hits;
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(0xC0FFEE + tid as u64);
                let mut ring = [0u64; RING_SIZE];
                let mut pos = 0usize;
                let mut hits: Vec<u64> = Vec::new();
                let mut local_count = 0u64;

                for _ in 0..ops_count / thread_count {
                    if rng.gen_range(0..100u32) == 0 {
                        let value = counter.load();
                        assert!(
                            value >= ring[pos],
                            "load went backwards: {} < {}",
                            value,
                            ring[pos]
                        );
                    } else {
                        let value = counter.fetch_add(1, tid);
                        local_count += 1;
                        pos = (pos + 1) % RING_SIZE;
                        ring[pos] = value;
                        if (INTERVAL_START..INTERVAL_START + INTERVAL_SIZE).contains(&value) {
                            hits.push(value);
                        }
                    }
                }

                tracked.fetch_add(local_count, Ordering::AcqRel);
                recent.lock().unwrap().extend_from_slice(&ring);
                interval_hits.lock().unwrap().extend(hits);
            });
        }
    });

    assert_eq!(
        tracked.load(Ordering::Acquire),
        counter.load(),
        "tracked increments disagree with the counter"
    );

    let mut recent = recent.into_inner().unwrap();
    let expected = recent.len();
    recent.sort_unstable();
    recent.dedup();
    assert_eq!(recent.len(), expected, "recent returns are not distinct");

    let mut hits = interval_hits.into_inner().unwrap();
    hits.sort_unstable();
    assert_eq!(hits.len() as u64, INTERVAL_SIZE);
    for (i, value) in hits.iter().enumerate() {
        assert_eq!(*value, INTERVAL_START + i as u64);
    }
}
