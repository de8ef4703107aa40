//! Publish worker
//!
//! A worker claims due jobs from the queue and drives each post through
//! `SCHEDULED -> PUBLISHING -> PUBLISHED | FAILED`. Retries are part of the
//! same state machine: a transient failure hands the job back to the queue
//! with an exponential delay and returns the post to `SCHEDULED`.
//!
//! Every processed job yields an [`Outcome`]; logging is derived from it by
//! [`log_outcome`] and nothing else observes worker progress.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::WorkerConfig;
use crate::db::{Database, PostTransition};
use crate::error::Result;
use crate::platforms::AdapterRegistry;
use crate::queue::{Job, JobQueue, JobState, RetryDisposition};
use crate::tokens::TokenManager;
use crate::types::{Post, PostStatus};

pub const PROFILE_INACTIVE: &str = "profile inactive, reconnect account";
pub const CREDENTIALS_INVALID: &str = "credentials invalid, reconnect account";
const INTERRUPTED: &str = "publish interrupted before completion, retrying";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` (1-based) just failed
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay * 2i32.pow(exponent)
    }
}

impl From<&WorkerConfig> for RetryPolicy {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_std(config.base_delay()).unwrap_or(Duration::MAX),
        }
    }
}

/// Result of processing one claimed job
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Published {
        job_id: i64,
        post_id: String,
        attempt: u32,
        platform_post_id: String,
    },
    Retrying {
        job_id: i64,
        post_id: String,
        attempt: u32,
        max_attempts: u32,
        retry_at: DateTime<Utc>,
        error: String,
    },
    Failed {
        job_id: i64,
        post_id: String,
        attempt: u32,
        error: String,
    },
    /// Nothing to do: the post vanished or another actor moved it
    Skipped {
        job_id: i64,
        post_id: String,
        reason: String,
    },
}

impl Outcome {
    pub fn post_id(&self) -> &str {
        match self {
            Outcome::Published { post_id, .. }
            | Outcome::Retrying { post_id, .. }
            | Outcome::Failed { post_id, .. }
            | Outcome::Skipped { post_id, .. } => post_id,
        }
    }
}

pub fn log_outcome(outcome: &Outcome) {
    match outcome {
        Outcome::Published {
            job_id,
            post_id,
            attempt,
            platform_post_id,
        } => tracing::info!(
            job_id,
            post_id = %post_id,
            attempt,
            platform_post_id = %platform_post_id,
            "Post published"
        ),
        Outcome::Retrying {
            job_id,
            post_id,
            attempt,
            max_attempts,
            retry_at,
            error,
        } => tracing::warn!(
            job_id,
            post_id = %post_id,
            attempt,
            max_attempts,
            retry_at = %retry_at,
            error = %error,
            "Publish attempt failed, retry scheduled"
        ),
        Outcome::Failed {
            job_id,
            post_id,
            attempt,
            error,
        } => tracing::error!(job_id, post_id = %post_id, attempt, error = %error, "Post failed"),
        Outcome::Skipped {
            job_id,
            post_id,
            reason,
        } => tracing::debug!(job_id, post_id = %post_id, reason = %reason, "Job skipped"),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Claims past the lease that were closed
    pub expired_claims: usize,
    /// Posts re-enqueued: interrupted PUBLISHING posts and SCHEDULED posts
    /// that had lost their job
    pub requeued: usize,
}

#[derive(Clone)]
pub struct PublishWorker {
    db: Database,
    queue: JobQueue,
    adapters: AdapterRegistry,
    tokens: Arc<TokenManager>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    poll_interval: std::time::Duration,
    lease: Duration,
}

impl PublishWorker {
    pub fn new(
        db: Database,
        queue: JobQueue,
        adapters: AdapterRegistry,
        tokens: Arc<TokenManager>,
        clock: Arc<dyn Clock>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            db,
            queue,
            adapters,
            tokens,
            clock,
            policy: RetryPolicy::from(config),
            poll_interval: config.poll_interval(),
            lease: Duration::from_std(config.claim_lease()).unwrap_or(Duration::MAX),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Poll for due jobs until `shutdown` is set.
    ///
    /// Jobs are drained back to back while available; the poll interval
    /// only applies when the queue is idle. A job in progress is finished
    /// before the loop exits.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            match self.queue.dequeue_due(self.clock.now()).await {
                Ok(Some(job)) => self.handle(&job).await,
                Ok(None) => tokio::time::sleep(self.poll_interval).await,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to claim job");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
        tracing::debug!(queue = self.queue.name(), "Worker stopped");
        Ok(())
    }

    /// Process every job that is due right now, then return how many ran
    pub async fn run_once(&self) -> Result<usize> {
        let mut processed = 0;
        while let Some(job) = self.queue.dequeue_due(self.clock.now()).await? {
            self.handle(&job).await;
            processed += 1;
        }
        Ok(processed)
    }

    async fn handle(&self, job: &Job) {
        match self.process_job(job).await {
            Ok(outcome) => log_outcome(&outcome),
            // The job stays claimed; reconciliation picks it up after the lease
            Err(e) => tracing::error!(
                job_id = job.id,
                post_id = %job.post_id,
                error = %e,
                "Job processing aborted"
            ),
        }
    }

    /// Drive one claimed job to its next state
    pub async fn process_job(&self, job: &Job) -> Result<Outcome> {
        let post = match self.db.get_post(&job.post_id).await? {
            Some(post) if post.status == PostStatus::Scheduled => post,
            Some(post) => {
                return self.skip(job, format!("post is {}", post.status)).await;
            }
            None => return self.skip(job, "post no longer exists".to_string()).await,
        };

        if !self.db.mark_publishing(&post.id).await? {
            return self.skip(job, "post changed state before publishing".to_string()).await;
        }

        let profile = match self.db.get_profile(&post.profile_id).await? {
            Some(profile) if profile.is_active => profile,
            _ => return self.fail_without_attempt(job, &post, PROFILE_INACTIVE).await,
        };

        if !self.tokens.ensure_valid(&profile).await? {
            return self.fail_without_attempt(job, &post, CREDENTIALS_INVALID).await;
        }

        // Read again so a token refreshed just now is the one used
        let profile = match self.db.get_profile(&post.profile_id).await? {
            Some(profile) if profile.is_active => profile,
            _ => return self.fail_without_attempt(job, &post, PROFILE_INACTIVE).await,
        };

        let adapter = self.adapters.get(post.platform);
        let attempt = job.attempt + 1;

        tracing::debug!(
            job_id = job.id,
            post_id = %post.id,
            platform = %post.platform,
            profile_id = %profile.id,
            attempt,
            "Publishing"
        );

        let result = adapter
            .publish(&post, &post.media, &profile.credentials())
            .await;
        let now = self.clock.now();

        let error = match result {
            Ok(receipt) => {
                let published = PostTransition::Published {
                    platform_post_id: &receipt.platform_post_id,
                    metadata: receipt.metadata.as_ref(),
                    attempts: post.attempts,
                    at: now,
                };
                self.queue.complete_with(job, &published).await?;
                return Ok(Outcome::Published {
                    job_id: job.id,
                    post_id: post.id,
                    attempt,
                    platform_post_id: receipt.platform_post_id,
                });
            }
            Err(error) => error,
        };

        let kind = adapter.classify_error(&error);
        let post_attempts = post.attempts + 1;

        if !kind.is_transient() {
            let message = error.to_string();
            self.fail_post(job, post_attempts, &message, now).await?;
            return Ok(Outcome::Failed {
                job_id: job.id,
                post_id: post.id,
                attempt,
                error: message,
            });
        }

        let max = self.policy.max_attempts;
        if attempt < max {
            let retry_at = now + self.policy.delay_after(attempt);
            let message = format!("attempt {}/{} failed, retrying: {}", attempt, max, error);
            let retrying = PostTransition::Retrying {
                attempts: post_attempts,
                error: &message,
                retry_at,
            };
            let disposition = self
                .queue
                .retry_with(job, attempt, retry_at, &message, &retrying)
                .await?;
            if disposition == RetryDisposition::Superseded {
                tracing::debug!(
                    job_id = job.id,
                    post_id = %post.id,
                    "Retry superseded by newer job"
                );
            }
            return Ok(Outcome::Retrying {
                job_id: job.id,
                post_id: post.id,
                attempt,
                max_attempts: max,
                retry_at,
                error: message,
            });
        }

        let message = format!("failed after {} attempts: {}", max, error);
        self.fail_post(job, post_attempts, &message, now).await?;
        Ok(Outcome::Failed {
            job_id: job.id,
            post_id: post.id,
            attempt,
            error: message,
        })
    }

    async fn skip(&self, job: &Job, reason: String) -> Result<Outcome> {
        self.queue.complete(job).await?;
        Ok(Outcome::Skipped {
            job_id: job.id,
            post_id: job.post_id.clone(),
            reason,
        })
    }

    async fn fail_post(
        &self,
        job: &Job,
        attempts: u32,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let failed = PostTransition::Failed {
            attempts,
            error: message,
            at,
        };
        self.queue.fail_with(job, message, &failed).await
    }

    /// Terminal failure decided before any platform call; the attempt
    /// counter is left as it was
    async fn fail_without_attempt(
        &self,
        job: &Job,
        post: &Post,
        message: &str,
    ) -> Result<Outcome> {
        let now = self.clock.now();
        self.fail_post(job, post.attempts, message, now).await?;
        Ok(Outcome::Failed {
            job_id: job.id,
            post_id: post.id.clone(),
            attempt: job.attempt,
            error: message.to_string(),
        })
    }

    /// Recover posts left behind by a worker that died.
    ///
    /// Claims older than the lease are closed as failed. A PUBLISHING post
    /// with no claim still in flight goes back to SCHEDULED and is
    /// re-enqueued for now, keeping the attempt count of its last job. A
    /// SCHEDULED post with no live job is re-enqueued at its schedule time.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let now = self.clock.now();
        let mut report = ReconcileReport::default();

        let mut carried_attempts: HashMap<String, u32> = HashMap::new();
        for job in self.queue.stale_active(now - self.lease).await? {
            self.queue.fail(&job, "claim lease expired").await?;
            carried_attempts.insert(job.post_id.clone(), job.attempt);
            report.expired_claims += 1;
        }

        for post in self.db.posts_with_status(PostStatus::Publishing).await? {
            let live = self.queue.live_jobs(&post.id).await?;
            if live.iter().any(|j| j.state == JobState::Active) {
                continue;
            }

            if !self.db.mark_interrupted(&post.id, INTERRUPTED, now).await? {
                continue;
            }
            let attempt = carried_attempts.get(&post.id).copied().unwrap_or(0);
            let job_id = self
                .queue
                .enqueue_at_attempt(&post.id, &post.user_id, now, attempt)
                .await?;
            tracing::warn!(
                post_id = %post.id,
                job_id,
                attempt,
                "Requeued post stuck in publishing"
            );
            report.requeued += 1;
        }

        for post in self.db.posts_with_status(PostStatus::Scheduled).await? {
            if !self.queue.live_jobs(&post.id).await?.is_empty() {
                continue;
            }

            let not_before = post.scheduled_at.unwrap_or(now);
            let attempt = carried_attempts.get(&post.id).copied().unwrap_or(0);
            let job_id = self
                .queue
                .enqueue_at_attempt(&post.id, &post.user_id, not_before, attempt)
                .await?;
            tracing::warn!(
                post_id = %post.id,
                job_id,
                attempt,
                "Requeued scheduled post with no job"
            );
            report.requeued += 1;
        }

        if report != ReconcileReport::default() {
            tracing::info!(
                expired_claims = report.expired_claims,
                requeued = report.requeued,
                "Reconciliation finished"
            );
        }
        Ok(report)
    }
}
