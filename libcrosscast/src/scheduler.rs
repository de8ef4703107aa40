//! Recurring token refresh
//!
//! Runs [`TokenManager::refresh_all_expiring`] once at startup and then on
//! every tick of the configured interval. A trigger that arrives while a
//! run is still going is dropped rather than queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::tokens::{RefreshSummary, TokenManager};

#[derive(Debug, Clone)]
pub enum RefreshRun {
    Completed(RefreshSummary),
    AlreadyRunning,
}

pub struct RefreshScheduler {
    tokens: Arc<TokenManager>,
    interval: Duration,
    running: AtomicBool,
}

/// Clears the running flag however the run ends
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RefreshScheduler {
    pub fn new(tokens: Arc<TokenManager>, interval: Duration) -> Self {
        Self {
            tokens,
            interval,
            running: AtomicBool::new(false),
        }
    }

    /// One refresh sweep, unless one is already in progress
    pub async fn trigger(&self) -> Result<RefreshRun> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Token refresh already running, trigger ignored");
            return Ok(RefreshRun::AlreadyRunning);
        }
        let _guard = RunGuard(&self.running);

        let summary = self
            .tokens
            .refresh_all_expiring(self.tokens.threshold_hours())
            .await?;
        Ok(RefreshRun::Completed(summary))
    }

    /// Tick until `shutdown` is set. The first tick fires immediately.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Wake at least once a second so shutdown is noticed promptly
        let mut shutdown_check = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    if let Err(e) = self.trigger().await {
                        tracing::error!(error = %e, "Token refresh sweep failed");
                    }
                }
                _ = shutdown_check.tick() => {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Refresh scheduler stopped");
    }
}
