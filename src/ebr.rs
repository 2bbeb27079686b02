//! Epoch-based reclamation for the funnel counters.
//!
//! Nodes unlinked from a shared structure may still be read by concurrent
//! threads, so they cannot be freed eagerly. Each counter owns one [`Ebr`]
//! instance; threads bracket every traversal of reclaimable pointers with
//! [`Ebr::enter_critical`] / [`Ebr::exit_critical`] and hand removed nodes
//! to [`Ebr::retire`]. A retired node is physically freed only after the
//! global epoch has advanced twice past the epoch it was retired in, which
//! cannot happen while any thread that might still see the node is inside a
//! critical section.
//!
//! Thread identity is the caller's problem: `tid` indexes a per-thread slot
//! and must stay below the `max_threads` the instance was built with. Two
//! live threads must never share a `tid`.

use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// A thread announcing this value is outside any critical section.
const INACTIVE: u64 = u64::MAX;

/// Epoch-advance attempt cadence, in retirements per thread.
const REFRESH_STEPS: u64 = 16;

struct ThreadSpace<T> {
    /// Epoch observed on `enter_critical`, [`INACTIVE`] when outside.
    announcement: AtomicU64,
    /// Last global epoch at which this thread's bags were swapped.
    epoch: Cell<u64>,
    /// Retirements performed by this thread, drives the advance cadence.
    retired: Cell<u64>,
    /// `bags[0]` is the old bag (one full epoch behind), `bags[1]` collects
    /// current retirements.
    bags: UnsafeCell<[Vec<*mut T>; 2]>,
}

/// Deferred-free service shared by all threads operating on one counter.
pub struct Ebr<T> {
    global_epoch: CachePadded<AtomicU64>,
    spaces: Box<[CachePadded<ThreadSpace<T>>]>,
}

// The non-atomic parts of a ThreadSpace (cells and bags) are only touched
// through the slot's own `tid`, and a tid has a single live owner.
// Announcements, the only cross-thread reads, are atomic.
unsafe impl<T: Send> Send for Ebr<T> {}
unsafe impl<T: Send> Sync for Ebr<T> {}

impl<T> Ebr<T> {
    pub fn new(max_threads: usize) -> Self {
        let spaces = (0..max_threads)
            .map(|_| {
                CachePadded::new(ThreadSpace {
                    announcement: AtomicU64::new(INACTIVE),
                    epoch: Cell::new(0),
                    retired: Cell::new(0),
                    bags: UnsafeCell::new([Vec::with_capacity(512), Vec::with_capacity(512)]),
                })
            })
            .collect();
        Self {
            global_epoch: CachePadded::new(AtomicU64::new(0)),
            spaces,
        }
    }

    /// Publish the current epoch into this thread's announcement slot.
    /// Reclaimable pointers may only be dereferenced between this call and
    /// the matching [`exit_critical`](Self::exit_critical).
    pub fn enter_critical(&self, tid: usize) {
        let epoch = self.global_epoch.load(Ordering::SeqCst);
        self.spaces[tid].announcement.swap(epoch, Ordering::AcqRel);
    }

    pub fn exit_critical(&self, tid: usize) {
        self.spaces[tid].announcement.store(INACTIVE, Ordering::Release);
    }

    /// Allocate a fresh node owned by the shared structure. The pointer must
    /// eventually come back through [`retire`](Self::retire).
    pub fn new_node(&self, _tid: usize) -> *mut T
    where
        T: Default,
    {
        Box::into_raw(Box::default())
    }

    /// Hand over a node that has been unlinked from the shared structure.
    /// The node stays valid for any thread already inside a critical
    /// section; it is freed after two further epoch advances.
    pub fn retire(&self, ptr: *mut T, tid: usize) {
        let space = &*self.spaces[tid];
        let global = self.global_epoch.load(Ordering::SeqCst);
        if space.epoch.get() < global {
            // The old bag has now survived a full epoch of grace.
            let bags = unsafe { &mut *space.bags.get() };
            for p in bags[0].drain(..) {
                drop(unsafe { Box::from_raw(p) });
            }
            bags.swap(0, 1);
            space.epoch.set(global);
        }

        space.retired.set(space.retired.get() + 1);
        let stride = REFRESH_STEPS * self.spaces.len() as u64;
        if space.retired.get() % stride == REFRESH_STEPS * tid as u64 {
            self.try_advance();
        }

        unsafe { (*space.bags.get())[1].push(ptr) };
    }

    /// Attempt to move the global epoch forward by one. Gives up silently
    /// if any thread is still announced in an earlier epoch.
    fn try_advance(&self) -> bool {
        let current = self.global_epoch.load(Ordering::SeqCst);
        // Announcements are scanned twice before the epoch may move.
        for _ in 0..2 {
            for space in self.spaces.iter() {
                let seen = space.announcement.load(Ordering::Acquire);
                if seen != INACTIVE && seen < current {
                    return false;
                }
            }
        }
        self.global_epoch
            .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

impl<T> Drop for Ebr<T> {
    fn drop(&mut self) {
        // Exclusive access: no thread can be in a critical section anymore.
        for space in self.spaces.iter() {
            let bags = unsafe { &mut *space.bags.get() };
            for bag in bags.iter_mut() {
                for p in bag.drain(..) {
                    drop(unsafe { Box::from_raw(p) });
                }
            }
        }
    }
}
