//! The baseline counter: one hardware atomic on its own cache line.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::counter::{Counter, ThreadCounterStats};

/// A plain fetch-and-add counter. Every call lands on the same cache line,
/// so throughput degrades under contention; the funnel counters use this
/// shape as their root.
pub struct HardwareCounter {
    value: CachePadded<AtomicU64>,
    /// Per-thread increment tallies, kept off each other's cache lines.
    accesses: Box<[CachePadded<AtomicU64>]>,
}

impl HardwareCounter {
    pub fn new(start: u64, max_threads: usize) -> Self {
        Self {
            value: CachePadded::new(AtomicU64::new(start)),
            accesses: (0..max_threads)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
        }
    }
}

impl Counter for HardwareCounter {
    fn fetch_add(&self, diff: u64, tid: usize) -> u64 {
        self.accesses[tid].fetch_add(1, Ordering::Relaxed);
        self.value.fetch_add(diff, Ordering::SeqCst)
    }

    fn load(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    fn store(&self, value: u64) {
        self.value.store(value, Ordering::SeqCst);
    }

    fn compare_exchange(&self, expected: &mut u64, desired: u64) -> bool {
        match self
            .value
            .compare_exchange(*expected, desired, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => true,
            Err(actual) => {
                *expected = actual;
                false
            }
        }
    }

    fn name(&self) -> String {
        "HardwareCounter".to_string()
    }

    fn root_access(&self) -> u64 {
        self.accesses
            .iter()
            .map(|a| a.load(Ordering::Relaxed))
            .sum()
    }

    fn max_access(&self) -> u64 {
        // Every access is a root access here.
        self.root_access()
    }

    fn thread_stats(&self, tid: usize) -> ThreadCounterStats {
        ThreadCounterStats {
            root_access: self.accesses[tid].load(Ordering::Relaxed),
            ..ThreadCounterStats::default()
        }
    }
}
