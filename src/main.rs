use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ratekeeper::config::{EvictionConfig, LimiterConfig, RateKeeperConfig, RefillUnit};
use ratekeeper::ratelimit::{
    spawn_evictor, Decision, LimiterSet, MonotonicClock, TokenBucketLimiter,
};

/// Drive a token bucket limiter with a simulated stream of requests.
#[derive(Debug, Parser)]
#[command(name = "ratekeeper", version, about)]
struct Cli {
    /// YAML file defining limiter classes
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Limiter class to use from the config file
    #[arg(long, requires = "config")]
    class: Option<String>,

    /// Burst capacity when no config file is given
    #[arg(long, default_value_t = 10.0)]
    capacity: f64,

    /// Tokens added per unit when no config file is given
    #[arg(long, default_value_t = 10.0)]
    refill_rate: f64,

    /// Time unit for --refill-rate (second, minute, hour, day)
    #[arg(long, default_value = "minute")]
    unit: RefillUnit,

    /// Caller key to send requests as
    #[arg(short, long, default_value = "user123")]
    key: String,

    /// Requests in the first burst
    #[arg(short = 'n', long, default_value_t = 15)]
    requests: u32,

    /// Delay between requests in milliseconds
    #[arg(long, default_value_t = 500)]
    interval_ms: u64,

    /// Seconds to wait for refill before the second burst
    #[arg(long, default_value_t = 30)]
    pause_secs: u64,

    /// Requests in the second burst
    #[arg(long, default_value_t = 3)]
    replay: u32,

    /// Print decisions as JSON lines
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

/// One line of simulation output.
#[derive(Debug, Serialize)]
struct RequestReport<'a> {
    phase: &'static str,
    request: u32,
    key: &'a str,
    allowed: bool,
    remaining: f64,
    retry_after_ms: Option<u64>,
}

impl<'a> RequestReport<'a> {
    fn new(phase: &'static str, request: u32, key: &'a str, decision: &Decision) -> Self {
        Self {
            phase,
            request,
            key,
            allowed: decision.allowed,
            remaining: decision.remaining,
            retry_after_ms: decision.retry_after_millis(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Starting Ratekeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let (limiter, eviction) = build_limiter(&cli)?;
    info!(
        capacity = limiter.capacity(),
        refill_rate = limiter.refill_rate(),
        "Rate limiter initialized"
    );

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let sweeper = spawn_evictor(Arc::clone(&limiter), eviction, async move {
        let _ = stop_rx.await;
    });

    tokio::select! {
        result = simulate(&cli, &limiter) => result?,
        _ = shutdown_signal() => {}
    }

    let _ = stop_tx.send(());
    sweeper.await?;

    info!("Ratekeeper stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Build the limiter from the config file class, or from the CLI flags.
fn build_limiter(cli: &Cli) -> anyhow::Result<(Arc<TokenBucketLimiter>, EvictionConfig)> {
    match &cli.config {
        Some(path) => {
            let config = RateKeeperConfig::from_file(path)?;
            let set = LimiterSet::from_config(&config)?;
            let class = match &cli.class {
                Some(class) => class.clone(),
                None => set
                    .classes()
                    .next()
                    .map(str::to_owned)
                    .ok_or_else(|| anyhow::anyhow!("no limiter classes in {}", path.display()))?,
            };
            info!(class = %class, "Using limiter class");
            Ok((Arc::clone(set.get(&class)?), config.eviction))
        }
        None => {
            let rate = cli.refill_rate / cli.unit.duration().as_secs_f64();
            let config = LimiterConfig::new(cli.capacity, rate)?;
            let limiter = TokenBucketLimiter::from_config(config, MonotonicClock);
            Ok((Arc::new(limiter), EvictionConfig::default()))
        }
    }
}

/// Send a burst, wait for refill, then send a second burst.
async fn simulate(cli: &Cli, limiter: &TokenBucketLimiter) -> anyhow::Result<()> {
    let spacing = Duration::from_millis(cli.interval_ms);

    info!(requests = cli.requests, key = %cli.key, "Sending first burst");
    run_burst(cli, limiter, "burst", cli.requests, spacing).await?;

    if cli.replay == 0 {
        return Ok(());
    }

    info!(pause_secs = cli.pause_secs, "Waiting for tokens to refill");
    tokio::time::sleep(Duration::from_secs(cli.pause_secs)).await;

    info!(requests = cli.replay, key = %cli.key, "Sending second burst");
    run_burst(cli, limiter, "replay", cli.replay, spacing).await
}

async fn run_burst(
    cli: &Cli,
    limiter: &TokenBucketLimiter,
    phase: &'static str,
    count: u32,
    spacing: Duration,
) -> anyhow::Result<()> {
    for i in 1..=count {
        let decision = limiter.check(&cli.key);
        let report = RequestReport::new(phase, i, &cli.key, &decision);

        if cli.json {
            println!("{}", serde_json::to_string(&report)?);
        } else {
            println!(
                "Request {}: {}, remaining tokens: {:.2}",
                i,
                if report.allowed { "allowed" } else { "rate limited" },
                limiter.peek(&cli.key)
            );
        }

        if i < count {
            tokio::time::sleep(spacing).await;
        }
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(name: &str, yaml: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "ratekeeper-{}-{}.yaml",
            name,
            std::process::id()
        ));
        std::fs::write(&path, yaml).unwrap();
        path
    }

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("ratekeeper").chain(args.iter().copied()))
    }

    const CLASSES: &str = r#"
limiters:
  login:
    capacity: 3
    refill_rate: 1
  api:
    capacity: 10
    refill_rate: 10
    unit: minute
eviction:
  interval_secs: 7
"#;

    #[test]
    fn test_build_limiter_defaults_to_first_class() {
        let path = write_config("first-class", CLASSES);
        let cli = cli(&["--config", path.to_str().unwrap()]);

        let (limiter, eviction) = build_limiter(&cli).unwrap();
        // Classes are ordered by name, so "api" comes first
        assert_eq!(limiter.capacity(), 10.0);
        assert_eq!(eviction.interval_secs, 7);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_build_limiter_selects_named_class() {
        let path = write_config("named-class", CLASSES);
        let cli = cli(&["--config", path.to_str().unwrap(), "--class", "login"]);

        let (limiter, _) = build_limiter(&cli).unwrap();
        assert_eq!(limiter.capacity(), 3.0);
        assert_eq!(limiter.refill_rate(), 1.0);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_build_limiter_unknown_class() {
        let path = write_config("unknown-class", CLASSES);
        let cli = cli(&["--config", path.to_str().unwrap(), "--class", "upload"]);

        let err = build_limiter(&cli).err().unwrap();
        assert!(err.to_string().contains("upload"));

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_build_limiter_empty_config() {
        let path = write_config("empty", "limiters: {}\n");
        let cli = cli(&["--config", path.to_str().unwrap()]);

        let err = build_limiter(&cli).err().unwrap();
        assert!(err.to_string().contains("no limiter classes"));

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_build_limiter_from_flags() {
        let cli = cli(&["--capacity", "4", "--refill-rate", "2", "--unit", "second"]);

        let (limiter, eviction) = build_limiter(&cli).unwrap();
        assert_eq!(limiter.capacity(), 4.0);
        assert_eq!(limiter.refill_rate(), 2.0);
        assert_eq!(eviction.max_idle_secs, EvictionConfig::default().max_idle_secs);
    }

    #[test]
    fn test_build_limiter_rejects_bad_flags() {
        let cli = cli(&["--capacity", "0"]);
        assert!(build_limiter(&cli).is_err());
    }
}
