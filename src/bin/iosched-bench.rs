//! Synthetic workload driver for the I/O scheduler.
//!
//! Several client threads submit requests against a set of files while a
//! simulated device thread acknowledges whatever the scheduler dispatches.

use clap::{Parser, ValueEnum};
use crossbeam::channel::{unbounded, RecvTimeoutError};
use lightning_iosched::logging::init_logging;
use lightning_iosched::{Direction, IoScheduler, PolicyKind, Request, SchedulerConfig};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Pattern {
    /// Each thread streams through its file
    Contiguous,
    /// Each thread skips one request-sized hole between requests
    Strided,
}

#[derive(Parser)]
#[command(name = "iosched-bench")]
#[command(about = "Drive the I/O scheduler with a synthetic workload", version)]
struct Cli {
    /// Scheduling policy (AIOLI, MLF, SJF, SRTF, TO, TO_AGG, TW, NOOP, ARMED_BANDIT, DYN_TREE)
    #[arg(short, long, default_value = "AIOLI")]
    policy: String,

    /// Optional JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Client threads
    #[arg(short, long, default_value = "4")]
    threads: usize,

    /// Distinct files
    #[arg(short, long, default_value = "4")]
    files: usize,

    /// Requests per client thread
    #[arg(short, long, default_value = "10000")]
    requests: u64,

    /// Request size in bytes
    #[arg(short, long, default_value = "4096")]
    size: u64,

    /// Access pattern
    #[arg(long, value_enum, default_value = "contiguous")]
    pattern: Pattern,

    /// Simulated device latency per dispatched request, in microseconds
    #[arg(long, default_value = "0")]
    device_latency_us: u64,

    /// Write the final statistics report here
    #[arg(long)]
    stats: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_level, cli.json_logs);

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> lightning_iosched::Result<()> {
    let policy = PolicyKind::from_name(&cli.policy)?;
    let mut config = SchedulerConfig::load_or_default(cli.config.as_deref());
    if policy.descriptor().is_dynamic {
        config.starting_policy = Some(policy.name().to_string());
    } else {
        config.default_policy = policy.name().to_string();
        config.starting_policy = None;
    }

    let (device_tx, device_rx) = unbounded::<Request>();
    let scheduler = Arc::new(
        IoScheduler::builder()
            .config(config)
            .max_stream_id(cli.threads.max(1) as u32)
            .process_one(move |r: &Request| {
                let _ = device_tx.send(r.clone());
            })
            .start()?,
    );

    let total = cli.threads as u64 * cli.requests;
    let completed = Arc::new(AtomicU64::new(0));
    let start = Instant::now();

    let device = {
        let scheduler = Arc::clone(&scheduler);
        let completed = Arc::clone(&completed);
        let latency = Duration::from_micros(cli.device_latency_us);
        thread::spawn(move || {
            while completed.load(Ordering::Relaxed) < total {
                match device_rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(r) => {
                        if !latency.is_zero() {
                            thread::sleep(latency);
                        }
                        if scheduler.complete(&r.file_id, r.direction, r.offset, r.length).is_ok() {
                            completed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })
    };

    let barrier = Arc::new(Barrier::new(cli.threads));
    let clients: Vec<_> = (0..cli.threads)
        .map(|t| {
            let scheduler = Arc::clone(&scheduler);
            let barrier = Arc::clone(&barrier);
            let file = format!("file-{}", t % cli.files.max(1));
            let stride = match cli.pattern {
                Pattern::Contiguous => cli.size,
                Pattern::Strided => cli.size * 2,
            };
            let (size, requests) = (cli.size, cli.requests);
            thread::spawn(move || -> lightning_iosched::Result<()> {
                barrier.wait();
                // Threads sharing a file take disjoint regions of it.
                let base = t as u64 * requests * stride;
                for i in 0..requests {
                    let direction = if t % 2 == 0 { Direction::Read } else { Direction::Write };
                    scheduler.submit(&file, direction, base + i * stride, size, i, t as u32)?;
                }
                Ok(())
            })
        })
        .collect();

    for client in clients {
        match client.join() {
            Ok(result) => result?,
            Err(_) => eprintln!("client thread panicked"),
        }
    }
    let _ = device.join();
    let elapsed = start.elapsed();

    let report = scheduler.statistics();
    println!("policy:            {}", report.current_policy);
    println!("requests:          {}", completed.load(Ordering::Relaxed));
    println!("elapsed:           {:.3}s", elapsed.as_secs_f64());
    println!(
        "throughput:        {:.0} req/s",
        completed.load(Ordering::Relaxed) as f64 / elapsed.as_secs_f64().max(1e-9)
    );
    println!("dispatched:        {}", report.global.dispatched_entries);
    println!("avg aggregation:   {:.2}", report.global.average_aggregation());
    println!("max aggregation:   {}", report.global.max_aggregation);
    println!("migrations:        {}", report.global.migrations);
    println!("lock retries:      {}", report.global.lock_retries);

    if let Some(path) = cli.stats {
        report.write_to(&path)?;
        println!("statistics written to {}", path.display());
    }
    scheduler.shutdown();
    Ok(())
}
