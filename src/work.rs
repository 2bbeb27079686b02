//! Synthetic inter-operation work for benchmarks.

use rand::Rng;

/// Spin drawing random numbers until one lands on 0 modulo `slots`, and
/// return how many draws it took. Benchmark loops call this between
/// counter operations to model realistic spacing; returning the draw count
/// keeps the loop observable so it cannot be eliminated. `slots <= 1`
/// means no work.
pub fn random_additional_work<R: Rng>(rng: &mut R, slots: u64) -> u64 {
    if slots <= 1 {
        return 0;
    }
    let mut draws = 0u64;
    let mut x = 1u64;
    while x % slots != 0 {
        x = rng.gen::<u64>() % slots;
        draws += 1;
    }
    draws
}
