//! cross-send - Background daemon for scheduled publishing
//!
//! Reconciles posts left behind by a previous run, then runs the publish
//! workers and the token refresh scheduler until it receives a signal.

use clap::Parser;
use libcrosscast::logging::{LogFormat, LoggingConfig};
use libcrosscast::{Config, CrosscastError, CrosscastService, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "cross-send")]
#[command(version)]
#[command(about = "Background daemon for scheduled publishing")]
#[command(long_about = "\
cross-send - Background daemon for scheduled publishing

DESCRIPTION:
    cross-send is a long-running daemon that claims due jobs from the
    Crosscast queue and publishes the matching posts to Facebook,
    Instagram, Twitter/X and TikTok.

    On startup it recovers posts left in 'publishing' by a crashed run.
    Failed attempts are retried with exponential backoff; OAuth tokens
    are refreshed before they expire by a background scheduler.

    Several cross-send processes may share one database; a job is only
    ever claimed by one of them.

USAGE:
    # Run in foreground (logs to stderr)
    cross-send

    # Four concurrent workers, JSON logs
    cross-send --concurrency 4 --log-format json

    # Enable verbose logging
    cross-send --verbose

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes jobs in progress)

CONFIGURATION:
    Configuration file: ~/.config/crosscast/config.toml
    Database location: ~/.local/share/crosscast/crosscast.db

    [worker]
    concurrency = 2          # publish workers in this process
    poll_interval_ms = 1000  # idle poll interval
    max_attempts = 3         # attempts per job before failing the post
    base_delay_ms = 2000     # first retry delay, doubled each attempt
    claim_lease_secs = 300   # claims older than this are abandoned

    [tokens]
    threshold_hours = 24     # refresh tokens expiring within this window
    refresh_interval = \"24h\"

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Path to config file (overrides CROSSCAST_CONFIG)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Number of concurrent publish workers (overrides config)
    #[arg(long, value_name = "N")]
    concurrency: Option<usize>,

    /// Idle poll interval in milliseconds (overrides config)
    #[arg(long, value_name = "MS")]
    poll_interval_ms: Option<u64>,

    /// Log output format
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    #[arg(help = "Log output format: text, json or pretty")]
    log_format: LogFormat,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    #[arg(help = "Enable verbose logging (useful for debugging)")]
    verbose: bool,

    /// Do not run the token refresh scheduler in this process
    #[arg(long)]
    no_refresh: bool,

    /// Run once and exit (for testing)
    #[arg(long, hide = true)]
    #[arg(help = "Process due jobs once and exit (for testing)")]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env(cli.log_format, cli.verbose).init();

    if let Err(e) = run(cli).await {
        error!(error = %e, "cross-send failed");
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    if let Some(concurrency) = cli.concurrency {
        config.worker.concurrency = concurrency.max(1);
    }
    if let Some(ms) = cli.poll_interval_ms {
        config.worker.poll_interval_ms = ms;
    }

    let service = CrosscastService::from_config(config).await?;
    let worker = service.worker();

    info!(
        concurrency = service.config().worker.concurrency,
        poll_interval_ms = service.config().worker.poll_interval_ms,
        queue = service.queue().name(),
        "cross-send daemon starting"
    );

    let report = worker.reconcile().await?;
    info!(
        expired_claims = report.expired_claims,
        requeued = report.requeued,
        "Startup reconciliation complete"
    );

    if cli.once {
        let processed = worker.run_once().await?;
        info!(processed, "cross-send: processed due jobs once, exiting");
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    let mut tasks = Vec::new();
    for id in 0..service.config().worker.concurrency {
        let worker = worker.clone();
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = worker.run(shutdown).await {
                error!(worker = id, error = %e, "Worker exited with error");
            }
        }));
    }

    if cli.no_refresh {
        info!("Token refresh scheduler disabled");
    } else {
        let scheduler = service.refresh_scheduler()?;
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move { scheduler.run(shutdown).await }));
    }

    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            error!(error = %e, "Daemon task panicked");
        }
    }

    info!("cross-send daemon stopped");
    Ok(())
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| CrosscastError::InvalidInput(format!("Signal setup failed: {}", e)))?;

    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            info!("Received shutdown signal, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });
    Ok(())
}
