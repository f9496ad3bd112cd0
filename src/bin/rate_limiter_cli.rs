// src/bin/rate_limiter_cli.rs

use std::sync::Arc;
use std::time::{Duration, Instant};
use structopt::StructOpt;
use tokio::time;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use keyed_rate_limiter::config::{
    AlgorithmConfig, InMemoryConfig, SlidingWindowConfig, TokenBucketConfig,
};
use keyed_rate_limiter::{build_limiter, Limiter, MemoryStorage, RateLimitStatus, Store};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "rate_limiter_cli",
    about = "Simulate traffic against a token bucket or sliding window limiter"
)]
struct Opt {
    /// Rate limiting algorithm to use
    #[structopt(short, long, possible_values = &["token_bucket", "sliding_window"], default_value = "token_bucket")]
    algorithm: String,

    /// Key to use for rate limiting
    #[structopt(short, long, default_value = "default_user")]
    key: String,

    /// Bucket capacity (token bucket) or requests per window (sliding window)
    #[structopt(short, long, default_value = "10")]
    limit: u64,

    /// Tokens added per refill interval (token bucket)
    #[structopt(short, long, default_value = "1")]
    rate: u64,

    /// Refill interval (token bucket) or window length (sliding window) in milliseconds
    #[structopt(short = "w", long, default_value = "1000")]
    window_ms: u64,

    /// Units consumed per request
    #[structopt(short, long, default_value = "1")]
    cost: u64,

    /// Simulation mode
    #[structopt(long, possible_values = &["burst", "steady", "sine_wave", "interactive"], default_value = "burst")]
    simulation: String,

    /// Number of requests to simulate
    #[structopt(short = "n", long, default_value = "20")]
    num_requests: usize,

    /// Time between requests in milliseconds (steady and sine_wave modes)
    #[structopt(short = "t", long, default_value = "100")]
    request_interval_ms: u64,

    /// Verbosity level
    #[structopt(short, long, parse(from_occurrences))]
    verbose: usize,

    /// Only log errors
    #[structopt(long)]
    disable_logs: bool,
}

impl Opt {
    fn algorithm_config(&self) -> Result<AlgorithmConfig, Box<dyn std::error::Error>> {
        let window = Duration::from_millis(self.window_ms);
        match self.algorithm.as_str() {
            "token_bucket" => Ok(AlgorithmConfig::TokenBucket(TokenBucketConfig {
                rate: self.rate,
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

/// Running totals for one simulation
#[derive(Debug, Default)]
struct Tally {
    allowed: usize,
    denied: usize,
}

impl Tally {
    fn record(&mut self, request: usize, status: &RateLimitStatus, quiet: bool) {
        if status.allowed {
            self.allowed += 1;
            if !quiet {
                info!("Request {}: ALLOWED (remaining: {})", request, status.remaining);
            }
        } else {
            self.denied += 1;
            if !quiet {
                warn!(
                    "Request {}: DENIED (limit: {}, retry after {} ms)",
                    request,
                    status.limit,
                    status.retry_after().num_milliseconds().max(0)
                );
            }
        }
    }

    fn print(&self, title: &str, elapsed: Duration) {
        println!("\n{} Simulation Results:", title);
        println!("{}", "-".repeat(title.len() + 20));
        println!("Total requests: {}", self.allowed + self.denied);
        println!("Allowed: {}", self.allowed);
        println!("Denied: {}", self.denied);
        println!("Time elapsed: {:?}", elapsed);
    }
}

fn init_cli_logging(opt: &Opt) -> Result<(), Box<dyn std::error::Error>> {
    let log_level = match (opt.disable_logs, opt.verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        _ => "trace",
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!(
            "rate_limiter_cli={},keyed_rate_limiter={}",
            log_level, log_level
        )))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::from_args();
    init_cli_logging(&opt)?;

    let storage = Arc::new(MemoryStorage::new(InMemoryConfig::default())?);
    let config = opt.algorithm_config()?;
    let limiter = build_limiter(&config, Arc::clone(&storage))?;

    info!("Starting rate limiter CLI with {} algorithm", config.name());
    info!(
        "Configuration: limit={}, rate={}, window={}ms, cost={}",
        opt.limit, opt.rate, opt.window_ms, opt.cost
    );

    let result = match opt.simulation.as_str() {
        "burst" => simulate_burst(&opt, limiter.as_ref()).await,
        "steady" => simulate_paced(&opt, limiter.as_ref(), "Steady", |_| 1.0).await,
        "sine_wave" => {
            // One full cycle over the run, intervals between 0.5x and 1.5x
            let total = opt.num_requests.max(1) as f64;
            simulate_paced(&opt, limiter.as_ref(), "Sine Wave", move |i| {
                let phase = (i as f64 * std::f64::consts::PI * 2.0) / total;
                1.0 + 0.5 * phase.sin()
            })
            .await
        }
        "interactive" => simulate_interactive(&opt, limiter.as_ref()).await,
        other => Err(format!("Unknown simulation mode: {}", other).into()),
    };

    storage.close().await?;
    result
}

// All requests at once
async fn simulate_burst(
    opt: &Opt,
    limiter: &dyn Limiter,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Simulating burst of {} requests for key: {}",
        opt.num_requests, opt.key
    );

    let mut tally = Tally::default();
    let start_time = Instant::now();

    for i in 0..opt.num_requests {
        let status = limiter.allow_n(&opt.key, opt.cost).await?;
        tally.record(i + 1, &status, opt.disable_logs);
    }

    tally.print("Burst", start_time.elapsed());
    Ok(())
}

// Requests spaced by `request_interval_ms` scaled by `factor(i)`
async fn simulate_paced<F>(
    opt: &Opt,
    limiter: &dyn Limiter,
    title: &str,
    factor: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: Fn(usize) -> f64,
{
    info!(
        "Simulating {} pattern of {} requests around {}ms apart for key: {}",
        title, opt.num_requests, opt.request_interval_ms, opt.key
    );

    let base_interval = Duration::from_millis(opt.request_interval_ms);
    let mut tally = Tally::default();
    let start_time = Instant::now();

    for i in 0..opt.num_requests {
        let request_time = Instant::now();

        let status = limiter.allow_n(&opt.key, opt.cost).await?;
        tally.record(i + 1, &status, opt.disable_logs);

        let this_interval = base_interval.mul_f64(factor(i).max(0.0));
        let elapsed = request_time.elapsed();
        if elapsed < this_interval {
            time::sleep(this_interval - elapsed).await;
        }
    }

    tally.print(title, start_time.elapsed());
    Ok(())
}

// One request per line on stdin
async fn simulate_interactive(
    opt: &Opt,
    limiter: &dyn Limiter,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("\nInteractive Simulation Mode");
    println!("---------------------------");
    println!("Press Enter to make a request, 's' for status, 'r' to reset, 'quit' to exit");

    let mut tally = Tally::default();
    let start_time = Instant::now();
    let mut input_buffer = String::new();

    loop {
        input_buffer.clear();
        if std::io::stdin().read_line(&mut input_buffer)? == 0 {
            break;
        }

        match input_buffer.trim() {
            "quit" | "exit" | "q" => break,
            "s" => {
                let status = limiter.status(&opt.key).await?;
                println!(
                    "STATUS remaining {}/{} (resets {})",
                    status.remaining,
                    status.limit,
                    status.reset_at.to_rfc3339()
                );
            }
            "r" => {
                limiter.reset(&opt.key).await?;
                println!("RESET {}", opt.key);
            }
            _ => {
                let status = limiter.allow_n(&opt.key, opt.cost).await?;
                if status.allowed {
                    println!("ALLOWED (remaining: {})", status.remaining);
                } else {
                    println!(
                        "DENIED (retry after: {} ms)",
                        status.retry_after().num_milliseconds().max(0)
                    );
                }
                tally.record(tally.allowed + tally.denied + 1, &status, true);
            }
        }
    }

    tally.print("Interactive", start_time.elapsed());
    Ok(())
}
