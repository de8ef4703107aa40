//! Post editing operations that keep the queue in step
//!
//! Every change to when (or whether) a post goes out is paired with the
//! matching enqueue or cancel, so a post never has a pending job its status
//! does not call for.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::clock::Clock;
use crate::db::Database;
use crate::error::{CrosscastError, Result};
use crate::queue::JobQueue;
use crate::types::{Post, PostStatus};

#[derive(Clone)]
pub struct PostLifecycle {
    db: Database,
    queue: JobQueue,
    clock: Arc<dyn Clock>,
}

impl PostLifecycle {
    pub fn new(db: Database, queue: JobQueue, clock: Arc<dyn Clock>) -> Self {
        Self { db, queue, clock }
    }

    async fn load(&self, post_id: &str) -> Result<Post> {
        self.db
            .get_post(post_id)
            .await?
            .ok_or_else(|| CrosscastError::NotFound(format!("post {}", post_id)))
    }

    /// DRAFT -> SCHEDULED for `at`
    pub async fn schedule(&self, post_id: &str, at: DateTime<Utc>) -> Result<i64> {
        self.move_to_scheduled(post_id, &[PostStatus::Draft], at).await
    }

    /// Schedule for immediate publication
    pub async fn publish_now(&self, post_id: &str) -> Result<i64> {
        let now = self.clock.now();
        self.move_to_scheduled(post_id, &[PostStatus::Draft, PostStatus::Scheduled], now)
            .await
    }

    /// Move a scheduled post to a new time; the old job is replaced
    pub async fn reschedule(&self, post_id: &str, at: DateTime<Utc>) -> Result<i64> {
        self.move_to_scheduled(post_id, &[PostStatus::Scheduled], at).await
    }

    async fn move_to_scheduled(
        &self,
        post_id: &str,
        from: &[PostStatus],
        at: DateTime<Utc>,
    ) -> Result<i64> {
        let post = self.load(post_id).await?;

        if !self
            .db
            .set_schedule(post_id, from, PostStatus::Scheduled, Some(at))
            .await?
        {
            return Err(CrosscastError::Conflict(format!(
                "post {} is {} and cannot be scheduled",
                post_id, post.status
            )));
        }

        let job_id = self.queue.enqueue(post_id, &post.user_id, at).await?;
        tracing::info!(post_id, job_id, scheduled_at = %at, "Post scheduled");
        Ok(job_id)
    }

    /// SCHEDULED -> DRAFT, dropping its pending job
    pub async fn revert_to_draft(&self, post_id: &str) -> Result<()> {
        let post = self.load(post_id).await?;

        if !self
            .db
            .set_schedule(post_id, &[PostStatus::Scheduled], PostStatus::Draft, None)
            .await?
        {
            return Err(CrosscastError::Conflict(format!(
                "post {} is {} and cannot return to draft",
                post_id, post.status
            )));
        }

        self.queue.cancel(post_id).await?;
        tracing::info!(post_id, "Post reverted to draft");
        Ok(())
    }

    /// Remove a post and its pending job.
    ///
    /// An attempt already in flight is not interrupted; its final write
    /// finds no row and changes nothing.
    pub async fn delete(&self, post_id: &str) -> Result<()> {
        let cancelled = self.queue.cancel(post_id).await?;
        if !self.db.delete_post(post_id).await? {
            return Err(CrosscastError::NotFound(format!("post {}", post_id)));
        }
        tracing::info!(post_id, cancelled, "Post deleted");
        Ok(())
    }
}
