//! Operator actions shared by the admin HTTP server and the `cross-queue`
//! CLI

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::clock::Clock;
use crate::db::Database;
use crate::error::{CrosscastError, Result};
use crate::queue::{Job, JobQueue, JobState, QueueStats};
use crate::tokens::{ExpiringProfile, RefreshSummary, TokenManager};
use crate::types::{Platform, PostStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishAccepted {
    pub job_id: i64,
    pub post_id: String,
    pub status: PostStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: i64,
    pub state: JobState,
    pub attempt: u32,
    pub not_before: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            state: job.state,
            attempt: job.attempt,
            not_before: job.not_before,
            last_error: job.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishStatus {
    pub post_id: String,
    pub platform: Platform,
    pub status: PostStatus,
    pub attempts: u32,
    pub error_message: Option<String>,
    pub platform_post_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub job: Option<JobSnapshot>,
    pub can_retry: bool,
}

#[derive(Clone)]
pub struct AdminService {
    db: Database,
    queue: JobQueue,
    tokens: Arc<TokenManager>,
    clock: Arc<dyn Clock>,
}

impl AdminService {
    pub fn new(
        db: Database,
        queue: JobQueue,
        tokens: Arc<TokenManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            queue,
            tokens,
            clock,
        }
    }

    /// Publish a post now, or retry a failed one.
    ///
    /// A failed post has its error cleared and goes back to SCHEDULED; its
    /// attempt counter is kept, but the new job starts a fresh retry budget.
    pub async fn publish_now(&self, post_id: &str) -> Result<PublishAccepted> {
        let post = self
            .db
            .get_post(post_id)
            .await?
            .ok_or_else(|| CrosscastError::NotFound(format!("post {}", post_id)))?;

        if matches!(post.status, PostStatus::Published | PostStatus::Publishing) {
            return Err(CrosscastError::Conflict(format!(
                "post {} is already {}",
                post_id, post.status
            )));
        }

        let live = self.queue.live_jobs(post_id).await?;
        if live.iter().any(|j| j.state == JobState::Active) {
            return Err(CrosscastError::Conflict(format!(
                "post {} is being processed by a worker",
                post_id
            )));
        }

        match self.db.get_profile(&post.profile_id).await? {
            Some(profile) if profile.is_active => {}
            Some(profile) => {
                return Err(CrosscastError::ProfileInactive(
                    profile
                        .deactivation_reason
                        .unwrap_or_else(|| format!("profile {} is inactive", profile.id)),
                ))
            }
            None => {
                return Err(CrosscastError::ProfileInactive(format!(
                    "profile {} no longer exists",
                    post.profile_id
                )))
            }
        }

        let now = self.clock.now();
        let moved = match post.status {
            PostStatus::Failed => self.db.reset_failed(post_id, now).await?,
            _ => {
                self.db
                    .set_schedule(
                        post_id,
                        &[PostStatus::Draft, PostStatus::Scheduled],
                        PostStatus::Scheduled,
                        Some(now),
                    )
                    .await?
            }
        };
        if !moved {
            return Err(CrosscastError::Conflict(format!(
                "post {} changed state, try again",
                post_id
            )));
        }

        let job_id = self.queue.enqueue(post_id, &post.user_id, now).await?;
        tracing::info!(post_id, job_id, previous = %post.status, "Manual publish requested");

        Ok(PublishAccepted {
            job_id,
            post_id: post_id.to_string(),
            status: PostStatus::Scheduled,
        })
    }

    pub async fn publish_status(&self, post_id: &str) -> Result<PublishStatus> {
        let post = self
            .db
            .get_post(post_id)
            .await?
            .ok_or_else(|| CrosscastError::NotFound(format!("post {}", post_id)))?;

        let profile_active = self
            .db
            .get_profile(&post.profile_id)
            .await?
            .map(|p| p.is_active)
            .unwrap_or(false);

        let live = self.queue.live_jobs(post_id).await?;
        // Prefer the claimed job; otherwise the newest pending one
        let job = live
            .iter()
            .find(|j| j.state == JobState::Active)
            .or_else(|| live.first())
            .map(JobSnapshot::from);

        Ok(PublishStatus {
            can_retry: post.status == PostStatus::Failed && profile_active,
            post_id: post.id,
            platform: post.platform,
            status: post.status,
            attempts: post.attempts,
            error_message: post.error_message,
            platform_post_id: post.platform_post_id,
            scheduled_at: post.scheduled_at,
            published_at: post.published_at,
            failed_at: post.failed_at,
            job,
        })
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.queue.stats(self.clock.now()).await
    }

    pub async fn refresh_tokens_now(&self) -> Result<RefreshSummary> {
        self.tokens
            .refresh_all_expiring(self.tokens.threshold_hours())
            .await
    }

    pub async fn expiring_tokens(&self) -> Result<Vec<ExpiringProfile>> {
        self.tokens
            .expiring_profiles(self.tokens.threshold_hours())
            .await
    }

    pub async fn cancel(&self, post_id: &str) -> Result<bool> {
        self.queue.cancel(post_id).await
    }

    /// Delete finished jobs older than `age`
    pub async fn prune(&self, age: std::time::Duration) -> Result<u64> {
        let age = chrono::Duration::from_std(age)
            .map_err(|e| CrosscastError::InvalidInput(format!("age out of range: {}", e)))?;
        self.queue.prune_finished(self.clock.now() - age).await
    }
}
