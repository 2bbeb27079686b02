//! The polymorphic counter contract shared by all implementations.

use log::info;
use thiserror::Error;

use crate::atomic::HardwareCounter;
use crate::funnel::CombiningFunnelCounter;
use crate::stump::{StumpConfig, StumpCounter};

/// Per-thread diagnostics extracted after a run.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadCounterStats {
    /// Iterations spent waiting for another thread's batch to be published.
    pub wait_loops: u64,
    /// Iterations spent scanning a mapping list for the covering entry.
    pub scan_loops: u64,
    /// Times this thread touched the root atomic itself.
    pub root_access: u64,
}

/// A concurrent 64-bit counter with linearisable fetch-and-add.
///
/// `fetch_add(diff, tid)` returns the pre-image `prev` and grants the caller
/// exclusive ownership of the value range `[prev, prev + diff)`: no other
/// call ever receives a value from that range. `tid` must be a stable
/// worker id below the `max_threads` the counter was constructed with; the
/// counter keeps no thread-local state of its own, so ids may come from a
/// thread pool.
pub trait Counter: Send + Sync {
    /// Atomically add `diff` and return the previous value.
    fn fetch_add(&self, diff: u64, tid: usize) -> u64;

    /// Read the current value. Monotonic, and at least as large as any
    /// pre-image returned by a `fetch_add` that happened before this call.
    fn load(&self) -> u64;

    /// Overwrite the value. Only meaningful on a quiescent counter (reset
    /// or teardown); racing it with `fetch_add` leaves the returned ranges
    /// undefined.
    fn store(&self, value: u64);

    /// Strong compare-and-swap on the root value. On failure `expected` is
    /// updated to the observed value.
    fn compare_exchange(&self, expected: &mut u64, desired: u64) -> bool;

    /// Human-readable variant name, including its configuration.
    fn name(&self) -> String;

    /// How many times any thread touched the root atomic.
    fn root_access(&self) -> u64;

    /// The largest per-location touch count (root or any intermediate
    /// node), an upper bound on single-cache-line traffic.
    fn max_access(&self) -> u64;

    /// Diagnostics accumulated for one worker id.
    fn thread_stats(&self, tid: usize) -> ThreadCounterStats;
}

/// Which counter implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    /// Single hardware atomic, the baseline.
    Hardware,
    /// Aggregating funnel with statically routed intermediate nodes.
    Stump,
    /// Randomised combining funnel.
    CombiningFunnel,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("COUNTER_TYPE is not set (expected 0, 1 or 3)")]
    MissingCounterType,
    #[error("unsupported COUNTER_TYPE `{0}` (expected 0, 1 or 3)")]
    UnknownCounterType(String),
    #[error("invalid {name} `{value}`: not a number")]
    InvalidNumber { name: &'static str, value: String },
}

impl CounterKind {
    /// Map a `COUNTER_TYPE` code to a kind. Code 2 is reserved for a
    /// nested stump variant and rejected.
    pub fn from_code(code: &str) -> Result<Self, ConfigError> {
        match code.trim() {
            "0" => Ok(CounterKind::Hardware),
            "1" => Ok(CounterKind::Stump),
            "3" => Ok(CounterKind::CombiningFunnel),
            other => Err(ConfigError::UnknownCounterType(other.to_string())),
        }
    }

    /// Read the kind from the `COUNTER_TYPE` environment variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var("COUNTER_TYPE") {
            Ok(code) => Self::from_code(&code),
            Err(_) => Err(ConfigError::MissingCounterType),
        }
    }
}

/// Construct a counter of the given kind.
///
/// The stump counter additionally reads its routing configuration from the
/// environment (`STUMP_CONFIG_TYPE`, `STUMP_FANOUT_COUNT`,
/// `STUMP_DIRECT_COUNT`); use [`StumpCounter::with_config`] directly for a
/// programmatic configuration.
pub fn new_counter(
    kind: CounterKind,
    start: u64,
    max_threads: usize,
) -> Result<Box<dyn Counter>, ConfigError> {
    let counter: Box<dyn Counter> = match kind {
        CounterKind::Hardware => Box::new(HardwareCounter::new(start, max_threads)),
        CounterKind::Stump => Box::new(StumpCounter::with_config(
            start,
            max_threads,
            StumpConfig::from_env()?,
        )),
        CounterKind::CombiningFunnel => Box::new(CombiningFunnelCounter::new(start, max_threads)),
    };
    info!("counter: {}", counter.name());
    Ok(counter)
}

pub(crate) fn env_number(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
        Err(_) => Ok(default),
    }
}
