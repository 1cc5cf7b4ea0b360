use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{LoggingConfig, TurnstileConfig};
use turnstile::ratelimit::{
    spawn_cleanup_task, AlgorithmKind, LimitRule, PolicySet, RateLimitConfig, RateLimitEngine,
};

/// Distributed admission control.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Service configuration file (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Route policy file (YAML)
    #[arg(long, global = true)]
    policies: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check, and consume, quota for a request
    Check(RequestArgs),
    /// Show usage without consuming quota
    Status(RequestArgs),
    /// Forget usage for an identifier and route
    Reset(RequestArgs),
    /// Aggregate usage across routes and identifiers
    Metrics,
    /// Run one cleanup pass
    Cleanup,
    /// Run cleanup periodically until interrupted
    RunCleanup,
}

#[derive(Debug, Args)]
struct RequestArgs {
    /// Caller identity, e.g. an IP address or API key
    #[arg(long)]
    identifier: String,

    /// Route being accessed
    #[arg(long)]
    route: String,

    #[command(flatten)]
    limit: LimitArgs,
}

/// An inline limit; overrides the policy file when `--algorithm` is given.
#[derive(Debug, Args)]
struct LimitArgs {
    #[arg(long, value_enum)]
    algorithm: Option<AlgorithmArg>,

    #[arg(long, default_value_t = 60_000)]
    window_ms: u64,

    #[arg(long, default_value_t = 100)]
    max: u64,

    #[arg(long)]
    refill_rate: Option<f64>,

    #[arg(long)]
    bucket_size: Option<u64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AlgorithmArg {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
}

impl From<AlgorithmArg> for AlgorithmKind {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::FixedWindow => AlgorithmKind::FixedWindow,
            AlgorithmArg::SlidingWindow => AlgorithmKind::SlidingWindow,
            AlgorithmArg::TokenBucket => AlgorithmKind::TokenBucket,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = TurnstileConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Turnstile");

    let policies = match &cli.policies {
        Some(path) => PolicySet::from_file(path).context("Failed to load route policies")?,
        None => PolicySet::default(),
    };

    if !config.store.is_shared() {
        warn!("No store.url configured; this run uses an empty in-process store and its results are not shared");
    }
    let engine = Arc::new(RateLimitEngine::connect(&config).await?);

    match cli.command {
        Command::Check(args) => {
            let limits = resolve_limits(&args, &policies)?;
            let result = engine.evaluate(&args.identifier, &args.route, &limits).await?;
            engine.flush_stats().await;
            print_json(&result)?;
        }
        Command::Status(args) => {
            let limits = resolve_limits(&args, &policies)?;
            let mut statuses = Vec::with_capacity(limits.len());
            for limit in &limits {
                statuses.push(engine.status(&args.identifier, &args.route, limit).await?);
            }
            print_json(&statuses)?;
        }
        Command::Reset(args) => {
            let limits = resolve_limits(&args, &policies)?;
            for limit in &limits {
                engine.reset(&args.identifier, &args.route, limit).await?;
            }
            print_json(&serde_json::json!({ "reset": limits.len() }))?;
        }
        Command::Metrics => {
            print_json(&engine.metrics().await)?;
        }
        Command::Cleanup => {
            let removed = engine.cleanup().await;
            print_json(&serde_json::json!({ "removed": removed }))?;
        }
        Command::RunCleanup => {
            let interval = config.engine.cleanup_interval();
            info!(interval_secs = interval.as_secs(), "Running periodic cleanup");
            spawn_cleanup_task(engine, interval, shutdown_signal()).await?;
        }
    }

    info!("Turnstile stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn resolve_limits(args: &RequestArgs, policies: &PolicySet) -> anyhow::Result<Vec<RateLimitConfig>> {
    if let Some(algorithm) = args.limit.algorithm {
        let rule = LimitRule {
            algorithm: algorithm.into(),
            window_ms: args.limit.window_ms,
            max: args.limit.max,
            refill_rate: args.limit.refill_rate,
            bucket_size: args.limit.bucket_size,
            skip_successful_requests: false,
            skip_failed_requests: false,
        };
        return Ok(vec![rule.to_config()?]);
    }

    match policies.limits_for(&args.route) {
        Some(limits) => Ok(limits.to_vec()),
        None => bail!(
            "no limits for route {}; pass --algorithm or a --policies file",
            args.route
        ),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
