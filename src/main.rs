//! Edge Cache
//!
//! Operator binary for the edge cache storage engine. `serve` initialises
//! the configured tiers and keeps their maintenance running until
//! interrupted; the other subcommands inspect or modify a cache directory
//! offline.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use edge_cache::{CacheConfig, CacheStack, PurgeKind};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Edge Cache - disk and memory cache storage for CDN edge nodes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, short, env = "EDGE_CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the cache directory
    #[arg(long, env = "EDGE_CACHE_DIR")]
    dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the cache and its background maintenance until interrupted
    Serve {
        /// Seconds between statistics log lines (0 = never)
        #[arg(long, default_value = "60")]
        stat_interval_secs: u64,
    },
    /// Print index totals and counters as JSON
    Stat,
    /// Remove exact keys, or invalidate prefixes and host wildcards with --dir
    Purge {
        /// Treat targets as prefixes (`https://*.example.com/path` allowed)
        #[arg(long)]
        dir: bool,
        #[arg(required = true)]
        targets: Vec<String>,
    },
    /// Remove every entry
    Clean,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => CacheConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => CacheConfig::default(),
    };
    if let Some(dir) = &args.dir {
        config.disk.dir = dir.clone();
    }

    info!("Starting Edge Cache");
    info!("  Version: {}", edge_cache::VERSION);
    info!("  Front tier: {}", config.kind);
    info!("  Directory: {}", config.disk.dir.display());

    let stack = CacheStack::new(config).context("building cache stack")?;
    stack.start().context("starting cache stack")?;

    match args.command.unwrap_or(Command::Serve {
        stat_interval_secs: 60,
    }) {
        Command::Serve { stat_interval_secs } => serve(&stack, stat_interval_secs).await?,
        Command::Stat => {
            let stat = stack.stat()?;
            println!("{}", serde_json::to_string_pretty(&stat)?);
        }
        Command::Purge { dir, targets } => {
            let kind = if dir { PurgeKind::Dir } else { PurgeKind::File };
            let affected = stack.purge(&targets, kind)?;
            println!("{}", affected);
        }
        Command::Clean => {
            stack.clean_all()?;
            info!("Cache cleaned");
        }
    }

    stack.stop();
    info!("Edge Cache shutdown complete");
    Ok(())
}

async fn serve(stack: &CacheStack, stat_interval_secs: u64) -> anyhow::Result<()> {
    info!("Serving; press Ctrl-C to stop");
    if stat_interval_secs == 0 {
        tokio::signal::ctrl_c().await?;
        return Ok(());
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(stat_interval_secs));
    ticker.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Interrupt received, stopping");
                return Ok(());
            }
            _ = ticker.tick() => log_stat(stack),
        }
    }
}

fn log_stat(stack: &CacheStack) {
    match stack.stat() {
        Ok(stat) => {
            for tier in &stat.tiers {
                info!(
                    tier = %tier.kind,
                    entries = tier.index.count,
                    bytes = tier.index.total_size,
                    hits = tier.metrics.hits,
                    misses = tier.metrics.misses,
                    evictions = tier.metrics.evictions,
                    "Cache statistics"
                );
            }
            if let Some(flush) = stat.flush {
                info!(
                    queued = flush.queued,
                    flushed = flush.flushed,
                    failed = flush.failed,
                    "Flush statistics"
                );
            }
        }
        Err(e) => warn!(error = %e, "Failed to collect statistics"),
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // stdout carries command output
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
