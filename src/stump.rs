//! The aggregating funnel ("stump") counter.
//!
//! Threads are statically routed to one of K intermediate nodes. A thread
//! reserves its slice of the node-local count with one fetch-and-add, and
//! the unique thread that observes its reservation at the node's send
//! frontier becomes the *batcher*: it forwards everything accumulated on
//! the node to the root in a single root fetch-and-add and publishes a
//! mapping entry translating node-local offsets into root values. Peers
//! whose reservation was covered by someone else's batch just read the
//! mapping list. The root is touched once per batch instead of once per
//! call.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use log::{debug, info};

use crate::counter::{env_number, ConfigError, Counter, ThreadCounterStats};
use crate::ebr::Ebr;

/// Upper bound on intermediate nodes.
pub const MAX_NODES: usize = 64;

/// Upper bound on worker threads.
pub const MAX_THREADS: usize = 4096;

/// How the intermediate nodes are sized and assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutPolicy {
    /// A fixed number of nodes; thread `tid` goes to node `tid % n`.
    Fixed(usize),
    /// `ceil(sqrt(thread_count))` nodes.
    Sqrt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StumpConfig {
    pub fanout: FanoutPolicy,
    /// The first `direct` thread ids bypass the nodes and hit the root
    /// directly. Worthwhile only at very low thread counts.
    pub direct: usize,
}

impl Default for StumpConfig {
    fn default() -> Self {
        Self {
            fanout: FanoutPolicy::Fixed(6),
            direct: 0,
        }
    }
}

impl StumpConfig {
    /// Read the configuration from `STUMP_CONFIG_TYPE`,
    /// `STUMP_FANOUT_COUNT` and `STUMP_DIRECT_COUNT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let use_sqrt = std::env::var("STUMP_CONFIG_TYPE")
            .map(|v| v == "sqrt")
            .unwrap_or(false);
        let fanout = if use_sqrt {
            FanoutPolicy::Sqrt
        } else {
            FanoutPolicy::Fixed(env_number("STUMP_FANOUT_COUNT", 6)? as usize)
        };
        let direct = env_number("STUMP_DIRECT_COUNT", 0)? as usize;
        Ok(Self { fanout, direct })
    }

    fn resolve_fanout(&self, thread_count: usize) -> usize {
        match self.fanout {
            FanoutPolicy::Fixed(n) => n,
            FanoutPolicy::Sqrt => {
                let mut block = 1usize;
                while block * block < thread_count {
                    block += 1;
                }
                block
            }
        }
    }
}

/// One link of a node's mapping list: node-local range
/// `[child_from, child_to)` was forwarded to the root at `root_from`.
/// Entries are immutable once published and reclaimed through EBR.
struct MappingEntry {
    prev: *mut MappingEntry,
    child_from: u64,
    child_to: u64,
    root_from: u64,
}

impl Default for MappingEntry {
    fn default() -> Self {
        Self {
            prev: ptr::null_mut(),
            child_from: 0,
            child_to: 0,
            root_from: 0,
        }
    }
}

// Entries are only dereferenced inside an EBR critical section, and never
// mutated after publication.
unsafe impl Send for MappingEntry {}

struct StumpNode {
    count: CachePadded<AtomicU64>,
    sent: CachePadded<AtomicU64>,
    mapping_head: AtomicPtr<MappingEntry>,
}

impl StumpNode {
    fn new() -> Self {
        Self {
            count: CachePadded::new(AtomicU64::new(0)),
            sent: CachePadded::new(AtomicU64::new(0)),
            // A zeroed sentinel so the list is never empty.
            mapping_head: AtomicPtr::new(Box::into_raw(Box::default())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    /// Straight to the root, no node and no EBR involvement.
    Direct,
    Node(usize),
}

/// Per-thread diagnostic tallies, one padded slot per worker id.
struct ThreadSlot {
    node_access: Box<[AtomicU64]>,
    root_access: AtomicU64,
    wait_loops: AtomicU64,
    scan_loops: AtomicU64,
}

pub struct StumpCounter {
    root: CachePadded<AtomicU64>,
    nodes: Box<[StumpNode]>,
    routes: Box<[Route]>,
    stats: Box<[CachePadded<ThreadSlot>]>,
    ebr: Ebr<MappingEntry>,
    config: StumpConfig,
}

impl StumpCounter {
    pub fn new(start: u64, max_threads: usize) -> Self {
        Self::with_config(start, max_threads, StumpConfig::default())
    }

    pub fn with_config(start: u64, max_threads: usize, config: StumpConfig) -> Self {
        assert!(max_threads >= 1 && max_threads <= MAX_THREADS);
        let fanout = config.resolve_fanout(max_threads);
        assert!(fanout >= 1 && fanout <= MAX_NODES);
        let direct = config.direct.min(max_threads);

        let routes: Box<[Route]> = (0..max_threads)
            .map(|tid| {
                if tid < direct {
                    Route::Direct
                } else {
                    Route::Node(tid % fanout)
                }
            })
            .collect();

        info!(
            "stump counter: fanout={} direct={} threads={}",
            fanout, direct, max_threads
        );
        for (tid, route) in routes.iter().enumerate() {
            debug!("thread {:3} -> {:?}", tid, route);
        }

        Self {
            root: CachePadded::new(AtomicU64::new(start)),
            nodes: (0..fanout).map(|_| StumpNode::new()).collect(),
            routes,
            stats: (0..max_threads)
                .map(|_| {
                    CachePadded::new(ThreadSlot {
                        node_access: (0..fanout).map(|_| AtomicU64::new(0)).collect(),
                        root_access: AtomicU64::new(0),
                        wait_loops: AtomicU64::new(0),
                        scan_loops: AtomicU64::new(0),
                    })
                })
                .collect(),
            ebr: Ebr::new(max_threads),
            config,
        }
    }

    /// Batcher path: forward `[child_from, child_to)` to the root and
    /// publish the mapping before releasing the node's send frontier.
    fn publish(&self, node: &StumpNode, child_from: u64, child_to: u64, tid: usize) -> u64 {
        debug_assert!(!matches!(self.routes[tid], Route::Direct));
        let root_from = self.root.fetch_add(child_to - child_from, Ordering::SeqCst);

        let fresh = self.ebr.new_node(tid);
        let prev_head = node.mapping_head.load(Ordering::Acquire);
        unsafe {
            *fresh = MappingEntry {
                prev: prev_head,
                child_from,
                child_to,
                root_from,
            };
        }
        // Publication order matters: waiters acquire `sent` and must then
        // find a head covering their reservation.
        node.mapping_head.store(fresh, Ordering::Release);
        node.sent.store(child_to, Ordering::Release);

        self.ebr.retire(prev_head, tid);
        root_from
    }

    /// Waiter path: the batch covering `my_from` is already published;
    /// translate the node-local offset through the mapping list.
    fn translate(&self, node: &StumpNode, my_from: u64, tid: usize) -> u64 {
        debug_assert!(!matches!(self.routes[tid], Route::Direct));
        let mut scans = 0u64;
        let mut entry = node.mapping_head.load(Ordering::Acquire);
        // Heads are strictly decreasing in child_from, so the first entry
        // at or below my_from is the covering one.
        let value = unsafe {
            while (*entry).child_from > my_from {
                scans += 1;
                entry = (*entry).prev;
            }
            (*entry).root_from + (my_from - (*entry).child_from)
        };
        if scans > 0 {
            self.stats[tid].scan_loops.fetch_add(scans, Ordering::Relaxed);
        }
        value
    }
}

impl Counter for StumpCounter {
    fn fetch_add(&self, diff: u64, tid: usize) -> u64 {
        let node_idx = match self.routes[tid] {
            Route::Direct => {
                // Direct threads never touch a mapping list, so they do not
                // need the EBR critical section either.
                self.stats[tid].root_access.fetch_add(1, Ordering::Relaxed);
                return self.root.fetch_add(diff, Ordering::SeqCst);
            }
            Route::Node(idx) => idx,
        };

        self.ebr.enter_critical(tid);
        let node = &self.nodes[node_idx];

        let child_from = node.count.fetch_add(diff, Ordering::AcqRel);
        let mut waits = 0u64;
        let mut sent = node.sent.load(Ordering::Acquire);
        while sent < child_from {
            waits += 1;
            std::hint::spin_loop();
            sent = node.sent.load(Ordering::Acquire);
        }
        if waits > 0 {
            self.stats[tid].wait_loops.fetch_add(waits, Ordering::Relaxed);
        }

        let stats = &*self.stats[tid];
        let root_from = if sent == child_from {
            // Exactly one thread per publication observes equality: it
            // batches everything accumulated so far.
            let child_to = node.count.load(Ordering::Acquire);
            let root_from = self.publish(node, child_from, child_to, tid);
            stats.node_access[node_idx].fetch_add(1, Ordering::Relaxed);
            stats.root_access.fetch_add(1, Ordering::Relaxed);
            root_from
        } else {
            let root_from = self.translate(node, child_from, tid);
            stats.node_access[node_idx].fetch_add(1, Ordering::Relaxed);
            root_from
        };

        self.ebr.exit_critical(tid);
        root_from
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
        match self.config.fanout {
            FanoutPolicy::Fixed(n) => format!("StumpCounter/fanout{}/direct{}", n, self.config.direct),
            FanoutPolicy::Sqrt => format!("StumpCounter/sqrt/direct{}", self.config.direct),
        }
    }

    fn root_access(&self) -> u64 {
        self.stats
            .iter()
            .map(|s| s.root_access.load(Ordering::Relaxed))
            .sum()
    }

    fn max_access(&self) -> u64 {
        let mut max = self.root_access();
        for node_idx in 0..self.nodes.len() {
            let node_total: u64 = self
                .stats
                .iter()
                .map(|s| s.node_access[node_idx].load(Ordering::Relaxed))
                .sum();
            max = max.max(node_total);
        }
        max
    }

    fn thread_stats(&self, tid: usize) -> ThreadCounterStats {
        let slot = &*self.stats[tid];
        ThreadCounterStats {
            wait_loops: slot.wait_loops.load(Ordering::Relaxed),
            scan_loops: slot.scan_loops.load(Ordering::Relaxed),
            root_access: slot.root_access.load(Ordering::Relaxed),
        }
    }
}

impl Drop for StumpCounter {
    fn drop(&mut self) {
        // Each node still owns its current head; everything behind it was
        // retired to the EBR instance, which frees its bags on drop.
        for node in self.nodes.iter() {
            let head = node.mapping_head.load(Ordering::Relaxed);
            if !head.is_null() {
                drop(unsafe { Box::from_raw(head) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_fanout_routes_modulo() {
        let counter = StumpCounter::with_config(
            0,
            48,
            StumpConfig {
                fanout: FanoutPolicy::Fixed(6),
                direct: 0,
            },
        );
        assert_eq!(counter.nodes.len(), 6);
        for tid in 0..48 {
            assert_eq!(counter.routes[tid], Route::Node(tid % 6));
        }
    }

    #[test]
    fn sqrt_fanout_is_ceiling_of_the_square_root() {
        for (threads, expected) in [(1, 1), (2, 2), (4, 2), (16, 4), (17, 5), (64, 8), (4096, 64)]
        {
            let config = StumpConfig {
                fanout: FanoutPolicy::Sqrt,
                direct: 0,
            };
            assert_eq!(config.resolve_fanout(threads), expected);
        }
    }

    #[test]
    fn direct_threads_come_first() {
        let counter = StumpCounter::with_config(
            0,
            8,
            StumpConfig {
                fanout: FanoutPolicy::Fixed(3),
                direct: 2,
            },
        );
        assert_eq!(counter.routes[0], Route::Direct);
        assert_eq!(counter.routes[1], Route::Direct);
        for tid in 2..8 {
            assert_eq!(counter.routes[tid], Route::Node(tid % 3));
        }
    }

    #[test]
    fn single_thread_returns_are_sequential() {
        let counter = StumpCounter::new(0, 1);
        for i in 0..1_000 {
            assert_eq!(counter.fetch_add(1, 0), i);
        }
        assert_eq!(counter.load(), 1_000);
    }

    #[test]
    fn direct_route_goes_straight_to_the_root() {
        let counter = StumpCounter::with_config(
            0,
            1,
            StumpConfig {
                fanout: FanoutPolicy::Fixed(1),
                direct: 1,
            },
        );
        for _ in 0..100 {
            counter.fetch_add(1, 0);
        }
        assert_eq!(counter.root_access(), 100);
        assert_eq!(counter.max_access(), 100);
        assert_eq!(counter.thread_stats(0).root_access, 100);
    }

    #[test]
    fn mapping_heads_strictly_decrease() {
        let counter = StumpCounter::new(0, 1);
        for diff in [3u64, 1, 7, 2] {
            counter.fetch_add(diff, 0);
        }
        let node = &counter.nodes[0];
        unsafe {
            let mut entry = node.mapping_head.load(Ordering::Acquire);
            let mut last_from = u64::MAX;
            while !entry.is_null() {
                let from = (*entry).child_from;
                assert!(from < last_from || (from == 0 && last_from == 0));
                last_from = from;
                entry = (*entry).prev;
            }
        }
    }

    #[test]
    fn nodes_are_quiescent_after_a_concurrent_run() {
        let threads = 8;
        let per_thread = 20_000u64;
        let counter = StumpCounter::with_config(
            0,
            threads,
            StumpConfig {
                fanout: FanoutPolicy::Fixed(3),
                direct: 0,
            },
        );

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
        for node in counter.nodes.iter() {
            let count = node.count.load(Ordering::SeqCst);
            let sent = node.sent.load(Ordering::SeqCst);
            assert_eq!(count, sent);
        }
    }

    #[test]
    fn forty_eight_threads_quiesce_on_six_nodes() {
        let threads = 48;
        let per_thread = 10_000u64;
        let counter = StumpCounter::with_config(
            0,
            threads,
            StumpConfig {
                fanout: FanoutPolicy::Fixed(6),
                direct: 0,
            },
        );
        for tid in 0..threads {
            assert_eq!(counter.routes[tid], Route::Node(tid % 6));
        }

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
        for node in counter.nodes.iter() {
            let count = node.count.load(Ordering::SeqCst);
            let sent = node.sent.load(Ordering::SeqCst);
            assert_eq!(count, sent);
        }
    }

    #[test]
    fn env_defaults_are_fanout_six_direct_zero() {
        // Runs in a clean test environment where the variables are unset.
        let config = StumpConfig::from_env().unwrap();
        assert_eq!(config.fanout, FanoutPolicy::Fixed(6));
        assert_eq!(config.direct, 0);
    }
}
