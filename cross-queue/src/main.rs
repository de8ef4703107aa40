//! cross-queue - Inspect and steer the publish queue
//!
//! Unix-style operator tool over the same admin operations the HTTP
//! server exposes.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use libcrosscast::admin::{PublishAccepted, PublishStatus};
use libcrosscast::logging::{LogFormat, LoggingConfig};
use libcrosscast::tokens::{ExpiringProfile, RefreshOutcome, RefreshSummary};
use libcrosscast::{CrosscastError, CrosscastService, QueueStats, Result};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "cross-queue")]
#[command(version)]
#[command(about = "Inspect and steer the publish queue")]
#[command(long_about = "\
cross-queue - Inspect and steer the publish queue

DESCRIPTION:
    cross-queue is a Unix-style tool for operating the Crosscast publish
    queue. Use it to view queue statistics, publish or retry a post right
    away, inspect a post's publish state, cancel a pending job, and check
    or refresh platform tokens.

COMMANDS:
    stats           Show job counts by state
    now             Publish a post now (also retries a failed post)
    status          Show the publish state of a post
    cancel          Cancel the pending job of a post
    tokens status   List profiles whose tokens expire soon
    tokens refresh  Refresh expiring tokens now
    prune           Delete finished jobs older than a duration

USAGE EXAMPLES:
    # View queue statistics
    cross-queue stats

    # Same, as JSON
    cross-queue stats --format json

    # Retry a failed post
    cross-queue now <POST_ID>

    # Drop finished jobs older than a week
    cross-queue prune --older-than 7d

CONFIGURATION:
    Configuration file: ~/.config/crosscast/config.toml
    Database location: ~/.local/share/crosscast/crosscast.db

    Override with environment variables:
        CROSSCAST_CONFIG    - Path to config file
        CROSSCAST_DB_PATH   - Path to database file

EXIT CODES:
    0 - Success
    1 - Operation failed (conflict, platform or database error)
    2 - Configuration error or inactive profile
    3 - Invalid input (unknown post ID, bad format or duration)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format: text or json
    #[arg(short, long, global = true, default_value = "text")]
    format: String,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    #[arg(help = "Enable verbose logging to stderr (useful for debugging)")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show queue statistics
    Stats,

    /// Publish a post immediately, or retry a failed one
    Now {
        /// Post ID to publish
        post_id: String,
    },

    /// Show the publish state of a post
    Status {
        /// Post ID to inspect
        post_id: String,
    },

    /// Cancel the pending job of a post
    Cancel {
        /// Post ID whose job to cancel
        post_id: String,
    },

    /// Token maintenance
    Tokens {
        #[command(subcommand)]
        command: TokensCommand,
    },

    /// Delete completed and failed jobs
    Prune {
        /// Minimum age of jobs to delete (e.g. "7d", "12h")
        #[arg(long, value_name = "DURATION")]
        older_than: String,
    },
}

#[derive(Subcommand, Debug)]
enum TokensCommand {
    /// List active profiles whose tokens expire within the threshold
    Status,
    /// Refresh every expiring token now
    Refresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(format: &str) -> Result<Self> {
        match format {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(CrosscastError::InvalidInput(format!(
                "Invalid format '{}'. Must be 'text' or 'json'",
                other
            ))),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "error" };
    LoggingConfig::new(LogFormat::Text, level.to_string(), cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Validate before touching the database
    let format = OutputFormat::parse(&cli.format)?;
    let older_than = match &cli.command {
        Commands::Prune { older_than } => Some(parse_age(older_than)?),
        _ => None,
    };

    let service = CrosscastService::new().await?;
    tracing::debug!(
        db_path = %service.config().database.path,
        command = ?cli.command,
        "Running queue command"
    );
    let admin = service.admin();

    match cli.command {
        Commands::Stats => {
            let stats = admin.queue_stats().await?;
            output(format, &stats, print_stats)?;
        }
        Commands::Now { post_id } => {
            let accepted = admin.publish_now(&post_id).await?;
            output(format, &accepted, print_accepted)?;
        }
        Commands::Status { post_id } => {
            let status = admin.publish_status(&post_id).await?;
            output(format, &status, print_status)?;
        }
        Commands::Cancel { post_id } => {
            if !admin.cancel(&post_id).await? {
                return Err(CrosscastError::Conflict(format!(
                    "post {} has no pending job (it may already be running)",
                    post_id
                )));
            }
            output(format, &serde_json::json!({ "postId": post_id, "cancelled": true }), |_| {
                println!("Cancelled pending job for {}", post_id)
            })?;
        }
        Commands::Tokens { command } => match command {
            TokensCommand::Status => {
                let expiring = admin.expiring_tokens().await?;
                output(format, &expiring, |p| print_expiring(p))?;
            }
            TokensCommand::Refresh => {
                let summary = admin.refresh_tokens_now().await?;
                output(format, &summary, print_refresh_summary)?;
            }
        },
        Commands::Prune { .. } => {
            if let Some(age) = older_than {
                let deleted = admin.prune(age).await?;
                output(format, &serde_json::json!({ "deleted": deleted }), |_| {
                    println!("Deleted {} finished job{}", deleted, plural(deleted))
                })?;
            }
        }
    }

    Ok(())
}

fn parse_age(input: &str) -> Result<std::time::Duration> {
    humantime::parse_duration(input).map_err(|e| {
        CrosscastError::InvalidInput(format!("Invalid duration '{}': {}", input, e))
    })
}

/// Print `value` as pretty JSON, or hand it to `text`
fn output<T: Serialize>(format: OutputFormat, value: &T, text: impl FnOnce(&T)) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value).map_err(|e| {
                CrosscastError::InvalidInput(format!("Failed to encode output: {}", e))
            })?;
            println!("{}", json);
        }
        OutputFormat::Text => text(value),
    }
    Ok(())
}

fn print_stats(stats: &QueueStats) {
    println!("Queue statistics");
    println!("  waiting:   {}", stats.waiting);
    println!("  delayed:   {}", stats.delayed);
    println!("  active:    {}", stats.active);
    println!("  completed: {}", stats.completed);
    println!("  failed:    {}", stats.failed);
}

fn print_accepted(accepted: &PublishAccepted) {
    println!(
        "Queued {} for immediate publishing (job {})",
        accepted.post_id, accepted.job_id
    );
}

fn print_status(status: &PublishStatus) {
    let now = Utc::now();
    println!("{} | {} | {}", status.post_id, status.platform, status.status);
    println!("  attempts: {}", status.attempts);
    if let Some(at) = status.scheduled_at {
        println!("  scheduled: {} ({})", at.to_rfc3339(), format_relative(now, at));
    }
    if let Some(at) = status.published_at {
        println!("  published: {}", at.to_rfc3339());
    }
    if let Some(id) = &status.platform_post_id {
        println!("  platform post: {}", id);
    }
    if let Some(at) = status.failed_at {
        println!("  failed: {}", at.to_rfc3339());
    }
    if let Some(error) = &status.error_message {
        println!("  error: {}", truncate(error, 120));
    }
    match &status.job {
        Some(job) => println!(
            "  job: {} {} (attempt {}, due {})",
            job.id,
            job.state.as_str(),
            job.attempt,
            format_relative(now, job.not_before)
        ),
        None => println!("  job: none"),
    }
    if status.can_retry {
        println!("  retry with: cross-queue now {}", status.post_id);
    }
}

fn print_expiring(profiles: &[ExpiringProfile]) {
    if profiles.is_empty() {
        println!("No tokens expiring within the threshold");
        return;
    }
    for p in profiles {
        println!(
            "{} | {} | {} | expires in {:.1}h",
            p.profile_id, p.platform, p.external_account_id, p.hours_until_expiry
        );
    }
}

fn print_refresh_summary(summary: &RefreshSummary) {
    println!(
        "Refreshed {} of {} profile{} ({} failed)",
        summary.refreshed,
        summary.total,
        plural(summary.total as u64),
        summary.failed
    );
    for entry in &summary.outcomes {
        let detail = match &entry.outcome {
            RefreshOutcome::Refreshed { expires_at } => match expires_at {
                Some(at) => format!("refreshed, expires {}", at.to_rfc3339()),
                None => "refreshed, no expiry".to_string(),
            },
            RefreshOutcome::AlreadyFresh => "already fresh".to_string(),
            RefreshOutcome::Deactivated { reason } => format!("deactivated: {}", reason),
            RefreshOutcome::Failed { error, .. } => format!("failed: {}", truncate(error, 80)),
        };
        println!("  {} | {} | {}", entry.profile_id, entry.platform, detail);
    }
}

fn plural(n: u64) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

/// Truncate to `max_chars` characters with an ellipsis
fn truncate(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        content.to_string()
    } else {
        let cut: String = content.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

/// Describe `at` relative to `now` ("in 3 hours", "5 minutes ago")
fn format_relative(now: DateTime<Utc>, at: DateTime<Utc>) -> String {
    let diff = at - now;
    let (secs, future) = if diff.num_seconds() >= 0 {
        (diff.num_seconds(), true)
    } else {
        (-diff.num_seconds(), false)
    };

    let minutes = secs / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    let span = if days > 0 {
        format!("{} day{}", days, plural(days as u64))
    } else if hours > 0 {
        format!("{} hour{}", hours, plural(hours as u64))
    } else if minutes > 0 {
        format!("{} minute{}", minutes, plural(minutes as u64))
    } else {
        return "now".to_string();
    };

    if future {
        format!("in {}", span)
    } else {
        format!("{} ago", span)
    }
}
