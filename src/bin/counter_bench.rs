//! Counter throughput benchmark.
//!
//! Drives the counter selected by the `COUNTER_TYPE` environment variable
//! (0 = hardware atomic, 1 = stump, 3 = combining funnel) with N workers
//! for a fixed window and writes `counter_main.csv` / `counter_aux.csv`
//! under `results/`.

use std::path::Path;
use std::process;

use clap::Parser;
use log::{debug, error, info};

use funnel_counters::bench::{run_benchmark, write_reports, BenchConfig};
use funnel_counters::{new_counter, CounterKind};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of worker threads
    thread_count: usize,

    /// Measurement window in milliseconds
    run_milliseconds: u64,

    /// Share of read operations, in percent
    #[arg(default_value_t = 50)]
    read_percent: u32,

    /// Share of increment operations, in percent [default: 100 - read_percent]
    increment_percent: Option<u32>,

    /// Amplitude of the synthetic work loop between operations
    #[arg(default_value_t = 32)]
    additional_work: u64,

    /// Increment deltas are drawn uniformly from [1, diff_range]
    #[arg(default_value_t = 100)]
    diff_range: u64,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::try_parse().unwrap_or_else(|err| {
        let _ = err.print();
        process::exit(1);
    });

    let config = BenchConfig {
        thread_count: args.thread_count,
        run_milliseconds: args.run_milliseconds,
        read_percent: args.read_percent,
        increment_percent: args
            .increment_percent
            .unwrap_or_else(|| 100u32.saturating_sub(args.read_percent)),
        additional_work: args.additional_work,
        diff_range: args.diff_range,
    };

    info!("thread count:      {}", config.thread_count);
    info!("run milliseconds:  {}", config.run_milliseconds);
    info!("read percent:      {}", config.read_percent);
    info!("increment percent: {}", config.increment_percent);
    info!("additional work:   {}", config.additional_work);
    info!("diff range:        {}", config.diff_range);

    let kind = CounterKind::from_env().unwrap_or_else(|err| {
        error!("{}", err);
        process::exit(1);
    });
    let counter = new_counter(kind, 0, config.thread_count).unwrap_or_else(|err| {
        error!("{}", err);
        process::exit(1);
    });

    let summary = run_benchmark(&*counter, &config);

    info!("structure gave:    {}", summary.final_value);
    info!("verification gave: {}", summary.mirror_value);
    if !summary.is_consistent() {
        error!(
            "counter value {} does not match the mirrored tally {}",
            summary.final_value, summary.mirror_value
        );
        process::exit(1);
    }

    for (tid, result) in summary.results.iter().enumerate() {
        debug!(
            "thread {:3}: {} reads, {} increments, {} total, {} random work",
            tid, result.read_count, result.inc_count, result.total_count, result.random_work
        );
    }

    info!("elapsed time:       {:.2} ms", summary.elapsed_ms);
    info!("total count:        {}", summary.total_count());
    info!("average throughput: {:.2} ops/ms", summary.throughput());
    info!("standard deviation: {:.2} ops/ms", summary.throughput_stddev());
    info!("fairness:           {:.4}", summary.fairness());
    info!("root access ratio:  {:.4}", summary.root_access_ratio());
    info!("max access ratio:   {:.4}", summary.max_access_ratio());

    let out_dir = Path::new("results");
    if let Err(err) = write_reports(&summary, &config, out_dir) {
        error!("failed to write reports under {}: {}", out_dir.display(), err);
        process::exit(1);
    }
    info!("wrote {} and {}",
        out_dir.join("counter_main.csv").display(),
        out_dir.join("counter_aux.csv").display()
    );
}
