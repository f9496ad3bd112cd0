// src/bin/rate_limiter_bench.rs

use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use structopt::StructOpt;
use tokio::sync::{Barrier, Semaphore};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

use keyed_rate_limiter::config::{
    AlgorithmConfig, InMemoryConfig, RedisConfig, SlidingWindowConfig, TokenBucketConfig,
};
use keyed_rate_limiter::storage::RedisStorage;
use keyed_rate_limiter::{build_limiter, Limiter, MemoryStorage, Store, WindowedStore};

#[derive(Debug, Clone, StructOpt)]
#[structopt(
    name = "rate_limiter_bench",
    about = "Concurrency benchmark and no-double-grant check for the rate limiters"
)]
struct Opt {
    /// Rate limiting algorithm to benchmark
    #[structopt(short, long, possible_values = &["sliding_window", "token_bucket", "all"], default_value = "all")]
    algorithm: String,

    /// Storage backend to use
    #[structopt(short, long, possible_values = &["memory", "redis"], default_value = "memory")]
    storage: String,

    /// Redis URL (when using Redis storage)
    #[structopt(long, default_value = "redis://localhost:6379")]
    redis_url: String,

    /// Burst (token bucket) or window limit (sliding window) per key
    #[structopt(short, long, default_value = "1000")]
    limit: u64,

    /// Refill interval / window in seconds; keep it longer than a run so the
    /// allowed count per key is exact
    #[structopt(short, long, default_value = "3600")]
    window_seconds: u64,

    /// Number of concurrent tasks
    #[structopt(short = "g", long, default_value = "10")]
    tasks: usize,

    /// Requests issued by each task
    #[structopt(short = "r", long, default_value = "500")]
    requests_per_task: usize,

    /// Number of distinct keys the tasks draw from
    #[structopt(short = "k", long, default_value = "4")]
    keys: usize,

    /// Number of iterations to run
    #[structopt(short, long, default_value = "3")]
    iterations: usize,

    /// Maximum in-flight requests
    #[structopt(short = "c", long, default_value = "100")]
    concurrency: usize,

    /// Verbosity level
    #[structopt(short, long, parse(from_occurrences))]
    verbose: usize,

    /// Only log errors
    #[structopt(long)]
    disable_logs: bool,
}

impl Opt {
    fn algorithm_config(
        &self,
        algorithm: &str,
    ) -> Result<AlgorithmConfig, Box<dyn std::error::Error>> {
        let window = Duration::from_secs(self.window_seconds);
        match algorithm {
            "token_bucket" => Ok(AlgorithmConfig::TokenBucket(TokenBucketConfig {
                rate: 1,
                interval: window,
                burst: Some(self.limit),
            })),
            "sliding_window" => Ok(AlgorithmConfig::SlidingWindow(SlidingWindowConfig {
                limit: self.limit,
                window,
            })),
            other => Err(format!("Unknown algorithm: {}", other).into()),
        }
    }
}

/// Per-key request and grant counts
#[derive(Debug, Default, Clone, Copy)]
struct KeyTally {
    requests: u64,
    allowed: u64,
    errors: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::from_args();

    let log_level = match (opt.disable_logs, opt.verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        _ => "trace",
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!(
            "rate_limiter_bench={},keyed_rate_limiter={}",
            log_level, log_level
        )))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let store: Arc<dyn WindowedStore> = match opt.storage.as_str() {
        "memory" => Arc::new(MemoryStorage::new(InMemoryConfig::default())?),
        "redis" => {
            let config = RedisConfig {
                url: opt.redis_url.clone(),
                key_prefix: "ratelimit_bench".to_string(),
                connection_timeout: Duration::from_secs(5),
            };
            match RedisStorage::new(config).await {
                Ok(storage) => Arc::new(storage),
                Err(e) => {
                    error!("Failed to connect to Redis: {}", e);
                    return Err(e.into());
                }
            }
        }
        other => return Err(format!("Unknown storage backend: {}", other).into()),
    };

    let algorithms = if opt.algorithm == "all" {
        vec!["token_bucket", "sliding_window"]
    } else {
        vec![opt.algorithm.as_str()]
    };

    let mut violations = 0;
    for algorithm in algorithms {
        let limiter = build_limiter(&opt.algorithm_config(algorithm)?, Arc::clone(&store))?;
        let name = format!("{} ({})", algorithm, opt.storage);
        violations += run_benchmark(limiter, &name, &opt).await;
    }

    store.close().await?;

    if violations > 0 {
        return Err(format!("{} keys were granted more than their limit", violations).into());
    }
    Ok(())
}

/// Runs every iteration and returns how many keys broke the limit
async fn run_benchmark(limiter: Arc<dyn Limiter>, name: &str, opt: &Opt) -> usize {
    println!("\nRunning benchmark: {}", name);
    println!("======================={}", "=".repeat(name.len()));

    let mut total_duration = Duration::ZERO;
    let mut total_requests = 0u64;
    let mut total_allowed = 0u64;
    let mut violations = 0;

    for iteration in 0..opt.iterations {
        info!("Starting iteration {} of {}", iteration + 1, opt.iterations);

        // Fresh keys per iteration so earlier runs on a shared store don't leak in
        let run_id = Uuid::new_v4();
        let keys: Arc<Vec<String>> = Arc::new(
            (0..opt.keys.max(1))
                .map(|i| format!("bench_{}_{}", run_id, i))
                .collect(),
        );

        let barrier = Arc::new(Barrier::new(opt.tasks));
        let semaphore = Arc::new(Semaphore::new(opt.concurrency.max(1)));
        let start_time = Instant::now();

        let handles: Vec<_> = (0..opt.tasks)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let barrier = Arc::clone(&barrier);
                let semaphore = Arc::clone(&semaphore);
                let keys = Arc::clone(&keys);
                let requests = opt.requests_per_task;

                tokio::spawn(async move {
                    barrier.wait().await;
                    let mut tally: HashMap<usize, KeyTally> = HashMap::new();

                    for _ in 0..requests {
                        let Ok(_permit) = semaphore.acquire().await else {
                            break;
                        };
                        let index = rand::rng().random_range(0..keys.len());
                        let entry = tally.entry(index).or_default();
                        entry.requests += 1;

                        match limiter.allow(&keys[index]).await {
                            Ok(status) if status.allowed => entry.allowed += 1,
                            Ok(_) => {}
                            Err(e) => {
                                entry.errors += 1;
                                warn!("Error in rate limiting: {}", e);
                            }
                        }
                    }
                    tally
                })
            })
            .collect();

        let mut per_key: HashMap<usize, KeyTally> = HashMap::new();
        for result in futures::future::join_all(handles).await {
            match result {
                Ok(tally) => {
                    for (index, counts) in tally {
                        let merged = per_key.entry(index).or_default();
                        merged.requests += counts.requests;
                        merged.allowed += counts.allowed;
                        merged.errors += counts.errors;
                    }
                }
                Err(e) => error!("Benchmark task failed: {}", e),
            }
        }

        let elapsed = start_time.elapsed();
        let mut iteration_requests = 0;
        let mut iteration_allowed = 0;

        for (index, counts) in &per_key {
            iteration_requests += counts.requests;
            iteration_allowed += counts.allowed;

            let expected = (counts.requests - counts.errors).min(opt.limit);
            if counts.allowed > opt.limit {
                violations += 1;
                error!(
                    key = %keys[*index],
                    allowed = counts.allowed,
                    limit = opt.limit,
                    "Limit exceeded"
                );
            } else if counts.allowed != expected {
                warn!(
                    key = %keys[*index],
                    allowed = counts.allowed,
                    expected,
                    "Fewer grants than expected; is the window shorter than the run?"
                );
            }
        }

        total_duration += elapsed;
        total_requests += iteration_requests;
        total_allowed += iteration_allowed;

        println!(
            "Iteration {}: {:?}, {} allowed, {} denied, {:.2} req/sec",
            iteration + 1,
            elapsed,
            iteration_allowed,
            iteration_requests - iteration_allowed,
            iteration_requests as f64 / elapsed.as_secs_f64()
        );

        for key in keys.iter() {
            if let Err(e) = limiter.reset(key).await {
                warn!("Failed to reset {}: {}", key, e);
            }
        }
    }

    let total_denied = total_requests - total_allowed;
    let percent = |n: u64| 100.0 * n as f64 / total_requests.max(1) as f64;

    println!("\nBenchmark Results for {}:", name);
    println!("  Total Requests:     {}", total_requests);
    println!("  Allowed:            {} ({:.1}%)", total_allowed, percent(total_allowed));
    println!("  Denied:             {} ({:.1}%)", total_denied, percent(total_denied));
    if opt.iterations > 0 {
        println!(
            "  Avg. Duration:      {:?}",
            total_duration / opt.iterations as u32
        );
    }
    println!(
        "  Avg. Throughput:    {:.2} requests/second",
        total_requests as f64 / total_duration.as_secs_f64().max(f64::EPSILON)
    );
    println!(
        "  Limit violations:   {}",
        if violations == 0 { "none".to_string() } else { violations.to_string() }
    );

    violations
}
