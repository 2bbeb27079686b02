//! The combining funnel counter.
//!
//! Instead of static routing, threads collide at random: each call walks a
//! layered grid of slots, swapping a pointer to its own in-flight record
//! into a random slot per layer. Whoever pulls out a peer's record tries to
//! *capture* it (an ACTIVE→COLLIDED compare-and-swap on the peer), folds
//! the peer's delta into its own, and promises to deliver the peer's
//! result. A thread that survives all layers uncaptured applies the whole
//! aggregated delta to the root with one compare-and-swap and then
//! distributes disjoint sub-ranges to everyone it captured. Under high
//! contention almost every call is combined away before reaching the root;
//! a lone thread falls through the empty grid and hits the root directly.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use log::debug;
use rand::Rng;

use crate::counter::{Counter, ThreadCounterStats};
use crate::ebr::Ebr;

const IDLE: u32 = 0;
const ACTIVE: u32 = 1;
const COLLIDED: u32 = 2;

/// `result` sentinel while no survivor has delivered a value yet.
const PENDING: u64 = u64::MAX;

/// Widest (outermost) slot row.
const MAX_WIDTH: usize = 256;
const MAX_LAYERS: usize = 10;

/// Loads spent watching for a late capture after each layer.
const CAPTURE_WINDOW: usize = 100;

/// One in-flight `fetch_add`. Allocated per call, retired through EBR once
/// the caller has read its result and scrubbed its slots.
struct FunnelOp {
    state: AtomicU32,
    sum: AtomicU64,
    result: AtomicU64,
}

impl Default for FunnelOp {
    fn default() -> Self {
        Self {
            state: AtomicU32::new(IDLE),
            sum: AtomicU64::new(0),
            result: AtomicU64::new(PENDING),
        }
    }
}

/// Per-thread linear congruential generator for slot picks; one padded
/// slot per worker id keeps the hot path free of shared RNG state.
struct SlotRng(AtomicU32);

impl SlotRng {
    fn next(&self) -> u32 {
        let seed = self.0.load(Ordering::Relaxed);
        let next = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345) & 0x7fff_ffff;
        self.0.store(next, Ordering::Relaxed);
        next
    }
}

pub struct CombiningFunnelCounter {
    root: CachePadded<AtomicU64>,
    /// `layers[0]` is the outermost (widest) row; widths halve toward the
    /// root, which is the width-1 "layer" represented by the CAS itself.
    layers: Vec<Vec<AtomicPtr<FunnelOp>>>,
    rngs: Box<[CachePadded<SlotRng>]>,
    root_accesses: Box<[CachePadded<AtomicU64>]>,
    ebr: Ebr<FunnelOp>,
}

impl CombiningFunnelCounter {
    pub fn new(start: u64, max_threads: usize) -> Self {
        let mut layer_count = 0usize;
        let mut cur = 1usize;
        while 2 * cur < max_threads && layer_count < MAX_LAYERS - 1 {
            cur *= 2;
            layer_count += 1;
        }

        let layers: Vec<Vec<AtomicPtr<FunnelOp>>> = (0..layer_count)
            .map(|i| {
                let width = (1usize << (layer_count - i)).min(MAX_WIDTH);
                (0..width).map(|_| AtomicPtr::new(ptr::null_mut())).collect()
            })
            .collect();
        debug!(
            "combining funnel: {} layers, widths {:?}",
            layer_count,
            layers.iter().map(|l| l.len()).collect::<Vec<_>>()
        );

        let mut seeder = rand::thread_rng();
        let base: u32 = seeder.gen();
        Self {
            root: CachePadded::new(AtomicU64::new(start)),
            layers,
            rngs: (0..max_threads)
                .map(|i| {
                    CachePadded::new(SlotRng(AtomicU32::new(
                        base.wrapping_mul(100).wrapping_add(i as u32),
                    )))
                })
                .collect(),
            root_accesses: (0..max_threads)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
            ebr: Ebr::new(max_threads),
        }
    }
}

impl Counter for CombiningFunnelCounter {
    fn fetch_add(&self, diff: u64, tid: usize) -> u64 {
        // The whole call is one critical section: any record pulled out of
        // a slot stays valid until we are done with it.
        self.ebr.enter_critical(tid);

        let my = self.ebr.new_node(tid);
        unsafe {
            (*my).sum.store(diff, Ordering::Relaxed);
            (*my).state.store(ACTIVE, Ordering::Relaxed);
        }
        let rng = &*self.rngs[tid];
        // Peers captured by this call, with their sums at capture time.
        let mut captured: Vec<(*mut FunnelOp, u64)> = Vec::new();
        // Slots this call published itself into, for the final scrub.
        let mut visited: Vec<(usize, usize)> = Vec::new();

        'funnel: loop {
            for (layer_idx, layer) in self.layers.iter().enumerate() {
                let slot_idx = rng.next() as usize % layer.len();
                let q = layer[slot_idx].swap(my, Ordering::AcqRel);
                visited.push((layer_idx, slot_idx));

                // Lock ourselves so nobody captures us while we inspect q.
                let locked = unsafe {
                    (*my)
                        .state
                        .compare_exchange(ACTIVE, COLLIDED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                };
                if !locked {
                    // Someone captured us between layers.
                    break 'funnel;
                }
                if !q.is_null() {
                    let won = unsafe {
                        (*q).state
                            .compare_exchange(ACTIVE, COLLIDED, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                    };
                    if won {
                        let q_sum = unsafe { (*q).sum.load(Ordering::Acquire) };
                        captured.push((q, q_sum));
                        unsafe { (*my).sum.fetch_add(q_sum, Ordering::Relaxed) };
                    }
                }
                unsafe { (*my).state.store(ACTIVE, Ordering::Release) };

                let mut window = 0;
                while window < CAPTURE_WINDOW {
                    if unsafe { (*my).state.load(Ordering::Acquire) } == COLLIDED {
                        break 'funnel;
                    }
                    std::hint::spin_loop();
                    window += 1;
                }
            }

            // Out of the grid uncaptured: try to apply the aggregate at the
            // root. Locking ourselves first shuts out late capturers.
            let locked = unsafe {
                (*my)
                    .state
                    .compare_exchange(ACTIVE, COLLIDED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            };
            if locked {
                let current = self.root.load(Ordering::SeqCst);
                let sum = unsafe { (*my).sum.load(Ordering::Relaxed) };
                if self
                    .root
                    .compare_exchange(current, current + sum, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    unsafe { (*my).result.store(current, Ordering::Release) };
                    self.root_accesses[tid].fetch_add(1, Ordering::Relaxed);
                    break 'funnel;
                }
                unsafe { (*my).state.store(ACTIVE, Ordering::Release) };
            }
        }

        // Either we applied the batch ourselves or a capturer will deliver;
        // wait for the pre-image of the aggregate we belong to.
        let prior = loop {
            let result = unsafe { (*my).result.load(Ordering::Acquire) };
            if result != PENDING {
                break result;
            }
            std::hint::spin_loop();
        };

        // Hand every captured peer its disjoint sub-range, in capture order.
        let mut subtotal = diff;
        for (peer, peer_sum) in captured {
            unsafe { (*peer).result.store(prior + subtotal, Ordering::Release) };
            subtotal += peer_sum;
        }

        // Remove our record from any slot still holding it, then retire it;
        // after the grace period nothing in the grid can reach it.
        for (layer_idx, slot_idx) in visited {
            let _ = self.layers[layer_idx][slot_idx].compare_exchange(
                my,
                ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
        self.ebr.retire(my, tid);
        self.ebr.exit_critical(tid);

        prior
    }

    fn load(&self) -> u64 {
        self.root.load(Ordering::SeqCst)
    }

    fn store(&self, value: u64) {
        self.root.store(value, Ordering::SeqCst);
    }

    fn compare_exchange(&self, expected: &mut u64, desired: u64) -> bool {
        match self
            .root
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
        "CombiningFunnelCounter".to_string()
    }

    fn root_access(&self) -> u64 {
        self.root_accesses
            .iter()
            .map(|a| a.load(Ordering::Relaxed))
            .sum()
    }

    fn max_access(&self) -> u64 {
        // Per-slot traffic is not tracked; the root is the only location
        // with a tally.
        0
    }

    fn thread_stats(&self, tid: usize) -> ThreadCounterStats {
        ThreadCounterStats {
            root_access: self.root_accesses[tid].load(Ordering::Relaxed),
            ..ThreadCounterStats::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_is_scrubbed(counter: &CombiningFunnelCounter) -> bool {
        counter
            .layers
            .iter()
            .all(|layer| layer.iter().all(|slot| slot.load(Ordering::SeqCst).is_null()))
    }

    #[test]
    fn layer_widths_halve_toward_the_root() {
        let counter = CombiningFunnelCounter::new(0, 16);
        let widths: Vec<usize> = counter.layers.iter().map(|l| l.len()).collect();
        assert_eq!(widths, vec![8, 4, 2]);
    }

    #[test]
    fn a_single_thread_gets_no_layers() {
        let counter = CombiningFunnelCounter::new(0, 1);
        assert!(counter.layers.is_empty());
    }

    #[test]
    fn the_outermost_layer_is_capped() {
        let counter = CombiningFunnelCounter::new(0, 600);
        assert!(!counter.layers.is_empty());
        assert!(counter.layers[0].len() <= MAX_WIDTH);
        assert_eq!(counter.layers.last().unwrap().len(), 2);
    }

    #[test]
    fn single_thread_hits_the_root_every_call() {
        let counter = CombiningFunnelCounter::new(0, 1);
        for i in 0..100 {
            assert_eq!(counter.fetch_add(1, 0), i);
        }
        assert_eq!(counter.load(), 100);
        assert_eq!(counter.root_access(), 100);
    }

    #[test]
    fn store_then_load_round_trips() {
        let counter = CombiningFunnelCounter::new(0, 2);
        counter.store(99);
        assert_eq!(counter.load(), 99);
    }

    #[test]
    fn concurrent_increments_all_land() {
        let threads = 4;
        let per_thread = 25_000u64;
        let counter = CombiningFunnelCounter::new(0, threads);
        std::thread::scope(|s| {
            for tid in 0..threads {
                let counter = &counter;
                s.spawn(move || {
                    for _ in 0..per_thread {
                        counter.fetch_add(1, tid);
                    }
                });
            }
        });
        assert_eq!(counter.load(), threads as u64 * per_thread);
        assert!(
            grid_is_scrubbed(&counter),
            "every call scrubs the slots it published into"
        );
    }

    #[test]
    fn concurrent_increments_above_the_width_cap() {
        // More threads than the widest row has slots, so every slot is
        // contended and the capped geometry carries real collision traffic.
        let threads = 600;
        let per_thread = 500u64;
        let counter = CombiningFunnelCounter::new(0, threads);
        assert_eq!(counter.layers[0].len(), MAX_WIDTH);

        std::thread::scope(|s| {
            for tid in 0..threads {
                let counter = &counter;
                s.spawn(move || {
                    for _ in 0..per_thread {
                        counter.fetch_add(1, tid);
                    }
                });
            }
        });

        assert_eq!(counter.load(), threads as u64 * per_thread);
        assert!(
            grid_is_scrubbed(&counter),
            "every call scrubs the slots it published into"
        );
    }
}
