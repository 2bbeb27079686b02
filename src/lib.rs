//! Scalable shared counters for many-core machines.
//!
//! A single hardware fetch-and-add serialises every caller on one cache
//! line; under heavy contention its throughput collapses. The counters in
//! this crate keep the linearisable fetch-and-add contract (every call owns
//! a disjoint range `[prev, prev + diff)` of counter values) while routing
//! contention through auxiliary structures so that only a fraction of calls
//! ever touch the root atomic:
//!
//! - [`HardwareCounter`]: the plain single-atomic baseline.
//! - [`StumpCounter`]: threads are statically routed to intermediate
//!   nodes; one thread per node batches its peers' contributions into a
//!   single root fetch-and-add.
//! - [`CombiningFunnelCounter`]: threads collide in a randomised layered
//!   grid and merge their increments pairwise before a survivor applies the
//!   aggregate at the root.
//!
//! All variants implement the [`Counter`] trait and are selected at
//! construction via [`CounterKind`]. The stump counter's mapping lists and
//! the funnel's per-call records are reclaimed through the epoch-based
//! scheme in [`ebr`].

pub mod atomic;
pub mod bench;
pub mod counter;
pub mod ebr;
pub mod funnel;
pub mod stump;
pub mod work;

pub use atomic::HardwareCounter;
pub use counter::{new_counter, ConfigError, Counter, CounterKind, ThreadCounterStats};
pub use funnel::CombiningFunnelCounter;
pub use stump::{FanoutPolicy, StumpConfig, StumpCounter};
