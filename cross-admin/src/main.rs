//! cross-admin - HTTP admin server for the Crosscast queue

use anyhow::Context;
use clap::Parser;
use cross_admin::{router, AppState};
use libcrosscast::logging::{LogFormat, LoggingConfig};
use libcrosscast::{Config, CrosscastService};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "cross-admin")]
#[command(version)]
#[command(about = "HTTP admin server for the publish queue")]
#[command(long_about = "\
cross-admin - HTTP admin server for the publish queue

ROUTES:
    POST /admin/posts/{id}/publish   Publish now, or retry a failed post
    GET  /admin/posts/{id}/publish   Publish status of a post
    GET  /admin/queue-stats          Job counts by state
    POST /admin/tokens/refresh       Refresh expiring tokens now
    GET  /admin/tokens/refresh       Profiles whose tokens expire soon
    GET  /health                     Liveness

The server does not authenticate requests; bind it to a private address.

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (in-flight requests complete)
")]
struct Cli {
    /// Path to config file (overrides CROSSCAST_CONFIG)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides [admin] bind)
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// Log output format
    #[arg(long, value_name = "FORMAT", default_value = "json")]
    log_format: LogFormat,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    LoggingConfig::from_env(cli.log_format, cli.verbose).init();

    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    let bind = cli.bind.unwrap_or_else(|| config.admin.bind.clone());

    let service = CrosscastService::from_config(config).await?;
    let app = router(AppState {
        admin: service.admin(),
    });

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;
    info!(address = %bind, "cross-admin listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("admin server failed")?;

    info!("cross-admin stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use futures::StreamExt;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    match Signals::new([SIGINT, SIGTERM]) {
        Ok(mut signals) => {
            if signals.next().await.is_some() {
                info!("Received shutdown signal, stopping gracefully...");
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Signal setup failed, falling back to Ctrl-C");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received shutdown signal, stopping gracefully...");
}
