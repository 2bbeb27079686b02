//! Fixed-duration throughput benchmark over any [`Counter`].
//!
//! Workers start behind a barrier, run a configurable read/increment mix
//! with synthetic work between operations until the stop flag rises, and
//! report per-thread tallies. A mirror atomic accumulates every committed
//! delta so the counter's final value can be cross-checked after the join.

use std::fs::{self, File};
use std::hint::black_box;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Barrier;
use std::time::{Duration, Instant};

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::counter::Counter;
use crate::work::random_additional_work;

#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub thread_count: usize,
    pub run_milliseconds: u64,
    pub read_percent: u32,
    pub increment_percent: u32,
    /// Amplitude of the synthetic work loop between operations.
    pub additional_work: u64,
    /// Increment deltas are drawn uniformly from `[1, diff_range]`.
    pub diff_range: u64,
}

/// What one worker did during the measurement window.
#[derive(Debug, Default, Clone)]
pub struct RunResult {
    pub read_count: u64,
    pub inc_count: u64,
    pub total_count: u64,
    pub random_work: u64,
    pub wait_loops: u64,
    pub scan_loops: u64,
    pub root_access: u64,
}

#[derive(Debug)]
pub struct BenchSummary {
    pub results: Vec<RunResult>,
    pub elapsed_ms: f64,
    pub final_value: u64,
    /// Sum of all committed deltas, tracked outside the counter.
    pub mirror_value: u64,
    pub max_access: u64,
    pub root_access: u64,
}

impl BenchSummary {
    pub fn total_count(&self) -> u64 {
        self.results.iter().map(|r| r.total_count).sum()
    }

    pub fn total_update_count(&self) -> u64 {
        self.results.iter().map(|r| r.inc_count).sum()
    }

    /// Aggregate throughput in operations per millisecond.
    pub fn throughput(&self) -> f64 {
        self.total_count() as f64 / self.elapsed_ms
    }

    /// Slowest thread's share of the fastest thread's total.
    pub fn fairness(&self) -> f64 {
        let max = self.results.iter().map(|r| r.total_count).max().unwrap_or(0);
        let min = self.results.iter().map(|r| r.total_count).min().unwrap_or(0);
        if max == 0 {
            return 0.0;
        }
        min as f64 / max as f64
    }

    /// Standard deviation of per-thread throughput, in ops per ms.
    pub fn throughput_stddev(&self) -> f64 {
        let mean = self.total_count() as f64 / self.results.len() as f64 / self.elapsed_ms;
        let sum_squared: f64 = self
            .results
            .iter()
            .map(|r| {
                let diff = r.total_count as f64 / self.elapsed_ms - mean;
                diff * diff
            })
            .sum();
        (sum_squared / self.results.len() as f64).sqrt()
    }

    /// Root-atomic touches per update operation.
    pub fn root_access_ratio(&self) -> f64 {
        let updates = self.total_update_count();
        if updates == 0 {
            return 0.0;
        }
        self.root_access as f64 / updates as f64
    }

    /// Hottest single location's touches per update operation.
    pub fn max_access_ratio(&self) -> f64 {
        let updates = self.total_update_count();
        if updates == 0 {
            return 0.0;
        }
        self.max_access as f64 / updates as f64
    }

    /// Whether the counter's final value matches the mirrored tally.
    pub fn is_consistent(&self) -> bool {
        self.final_value == self.mirror_value
    }
}

/// Run the measurement window and gather per-thread results.
pub fn run_benchmark(counter: &dyn Counter, config: &BenchConfig) -> BenchSummary {
    assert!(config.thread_count >= 1);
    assert!(config.diff_range >= 1);

    let core_seed: u64 = rand::thread_rng().gen_range(0..1_000_000);
    info!("benchmark seed: {}", core_seed);

    let barrier = Barrier::new(config.thread_count + 1);
    let stop = AtomicBool::new(false);
    let mirror = AtomicU64::new(0);

    let mut results: Vec<RunResult> = Vec::with_capacity(config.thread_count);
    let mut elapsed_ms = 0.0f64;
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..config.thread_count)
            .map(|tid| {
                let barrier = &barrier;
                let stop = &stop;
                let mirror = &mirror;
                s.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(core_seed * 1_000 + tid as u64);
                    let mut result = RunResult::default();
                    let mut committed = 0u64;

                    barrier.wait();
                    debug!("thread {} started", tid);

                    while !stop.load(Ordering::Acquire) {
                        let draw = rng.gen_range(0..100u32);
                        if draw < config.read_percent {
                            black_box(counter.load());
                            result.read_count += 1;
                        } else if draw < config.read_percent + config.increment_percent {
                            let diff = rng.gen_range(1..=config.diff_range);
                            black_box(counter.fetch_add(diff, tid));
                            committed += diff;
                            result.inc_count += 1;
                        } else {
                            continue;
                        }
                        result.total_count += 1;

                        if config.additional_work > 1 {
                            result.random_work +=
                                random_additional_work(&mut rng, config.additional_work);
                        }
                    }

                    mirror.fetch_add(committed, Ordering::AcqRel);
                    let stats = counter.thread_stats(tid);
                    result.wait_loops = stats.wait_loops;
                    result.scan_loops = stats.scan_loops;
                    result.root_access = stats.root_access;
                    result
                })
            })
            .collect();

        let started = Instant::now();
        barrier.wait();
        // The last few ms of the window are left for stop propagation.
        std::thread::sleep(Duration::from_millis(config.run_milliseconds.saturating_sub(5)));
        stop.store(true, Ordering::Release);

        for handle in handles {
            results.push(handle.join().expect("benchmark worker panicked"));
        }
        elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
    });

    BenchSummary {
        results,
        elapsed_ms,
        final_value: counter.load(),
        mirror_value: mirror.load(Ordering::Acquire),
        max_access: counter.max_access(),
        root_access: counter.root_access(),
    }
}

/// Write the two CSV artefacts under `dir` (usually `results/`).
pub fn write_reports(summary: &BenchSummary, config: &BenchConfig, dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;

    let mut main_file = File::create(dir.join("counter_main.csv"))?;
    writeln!(
        main_file,
        "thread_count,run_milliseconds,read_percent,increment_percent,additional_work,\
         total_count,elapsed_time,max_access_ratio,root_access_ratio,fairness,stddev,throughput"
    )?;
    writeln!(
        main_file,
        "{},{},{},{},{},{},{},{},{},{},{},{}",
        config.thread_count,
        config.run_milliseconds,
        config.read_percent,
        config.increment_percent,
        config.additional_work,
        summary.total_count(),
        summary.elapsed_ms,
        summary.max_access_ratio(),
        summary.root_access_ratio(),
        summary.fairness(),
        summary.throughput_stddev(),
        summary.throughput(),
    )?;

    let mut aux_file = File::create(dir.join("counter_aux.csv"))?;
    writeln!(
        aux_file,
        "thread_id,read_count,inc_count,total_count,loop_count_1,loop_count_2,root_access"
    )?;
    for (tid, result) in summary.results.iter().enumerate() {
        writeln!(
            aux_file,
            "{},{},{},{},{},{},{}",
            tid,
            result.read_count,
            result.inc_count,
            result.total_count,
            result.wait_loops,
            result.scan_loops,
            result.root_access,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::HardwareCounter;

    fn small_config() -> BenchConfig {
        BenchConfig {
            thread_count: 2,
            run_milliseconds: 60,
            read_percent: 50,
            increment_percent: 50,
            additional_work: 8,
            diff_range: 10,
        }
    }

    #[test]
    fn the_mirror_matches_the_counter() {
        let config = small_config();
        let counter = HardwareCounter::new(0, config.thread_count);
        let summary = run_benchmark(&counter, &config);
        assert!(summary.is_consistent());
        assert_eq!(summary.final_value, counter.load());
        assert_eq!(
            summary.total_count(),
            summary.results.iter().map(|r| r.total_count).sum::<u64>()
        );
    }

    #[test]
    fn reports_agree_with_each_other() {
        let config = small_config();
        let counter = HardwareCounter::new(0, config.thread_count);
        let summary = run_benchmark(&counter, &config);

        let dir = tempfile::tempdir().unwrap();
        write_reports(&summary, &config, dir.path()).unwrap();

        let main_csv = fs::read_to_string(dir.path().join("counter_main.csv")).unwrap();
        let aux_csv = fs::read_to_string(dir.path().join("counter_aux.csv")).unwrap();

        let main_row: Vec<&str> = main_csv.lines().nth(1).unwrap().split(',').collect();
        let total_count: u64 = main_row[5].parse().unwrap();

        let aux_total: u64 = aux_csv
            .lines()
            .skip(1)
            .map(|line| line.split(',').nth(3).unwrap().parse::<u64>().unwrap())
            .sum();
        assert_eq!(total_count, aux_total);
        assert_eq!(aux_csv.lines().count(), 1 + config.thread_count);

        let elapsed: f64 = main_row[6].parse().unwrap();
        let throughput: f64 = main_row[11].parse().unwrap();
        assert!((throughput - total_count as f64 / elapsed).abs() < 1e-6);
    }
}
