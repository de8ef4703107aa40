//! Durable delayed job queue
//!
//! Jobs live in the `jobs` table next to the posts they point at. A job is
//! `pending` until a worker claims it (`active`), and ends `completed` or
//! `failed`; finished rows are kept for statistics until pruned.
//!
//! Mutual exclusion between workers comes from the store alone: a claim is
//! one `UPDATE ... RETURNING` statement, so two workers (tasks or separate
//! processes sharing the database file) can never claim the same row.
//! The partial unique index `idx_jobs_one_pending` guarantees at most one
//! pending job per post.
//!
//! Queues are named, so several independent queues can share one store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::sync::Arc;

use crate::clock::Clock;
use crate::db::{Database, PostTransition};
use crate::error::{DbError, Result};
use crate::types::{from_millis, opt_from_millis, to_millis};

pub const DEFAULT_QUEUE: &str = "publish";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobState::Pending),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(DbError::CorruptRow(format!("job state: {}", other)).into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: i64,
    pub queue: String,
    pub post_id: String,
    pub user_id: String,
    pub not_before: DateTime<Utc>,
    /// Attempts already consumed in this run
    pub attempt: u32,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Pending and already due
    pub waiting: u64,
    /// Pending with a future not-before
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// What happened to a claimed job handed back for another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Rescheduled,
    /// A newer pending job for the same post already exists and wins
    Superseded,
}

#[derive(Clone)]
pub struct JobQueue {
    db: Database,
    name: String,
    clock: Arc<dyn Clock>,
}

impl JobQueue {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self::named(db, DEFAULT_QUEUE, clock)
    }

    pub fn named(db: Database, name: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            name: name.to_string(),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a job for `post_id`, replacing any pending one.
    ///
    /// A `not_before` in the past means ready immediately. A job already
    /// claimed by a worker is left alone; the new pending job supersedes it.
    pub async fn enqueue(
        &self,
        post_id: &str,
        user_id: &str,
        not_before: DateTime<Utc>,
    ) -> Result<i64> {
        self.enqueue_at_attempt(post_id, user_id, not_before, 0).await
    }

    pub(crate) async fn enqueue_at_attempt(
        &self,
        post_id: &str,
        user_id: &str,
        not_before: DateTime<Utc>,
        attempt: u32,
    ) -> Result<i64> {
        let now = self.clock.now();
        let mut tx = self.db.pool().begin().await.map_err(DbError::SqlxError)?;

        sqlx::query("DELETE FROM jobs WHERE queue = ? AND post_id = ? AND state = 'pending'")
            .bind(&self.name)
            .bind(post_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (queue, post_id, user_id, not_before, attempt, state, enqueued_at)
            VALUES (?, ?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(&self.name)
        .bind(post_id)
        .bind(user_id)
        .bind(to_millis(not_before))
        .bind(attempt as i64)
        .bind(to_millis(now))
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;

        let job_id = result.last_insert_rowid();
        tracing::debug!(
            queue = %self.name,
            post_id,
            job_id,
            not_before = %not_before,
            "Job enqueued"
        );
        Ok(job_id)
    }

    /// Remove the pending job for `post_id`.
    ///
    /// Returns false if there was none, including when the job has already
    /// been claimed: an in-flight attempt cannot be cancelled.
    pub async fn cancel(&self, post_id: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM jobs WHERE queue = ? AND post_id = ? AND state = 'pending'")
                .bind(&self.name)
                .bind(post_id)
                .execute(self.db.pool())
                .await
                .map_err(DbError::SqlxError)?;

        let removed = result.rows_affected() > 0;
        if removed {
            tracing::debug!(queue = %self.name, post_id, "Job cancelled");
        }
        Ok(removed)
    }

    /// Atomically claim one due job.
    ///
    /// Earliest not-before first, then enqueue order.
    pub async fn dequeue_due(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            UPDATE jobs SET state = 'active', claimed_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = ? AND state = 'pending' AND not_before <= ?
                ORDER BY not_before ASC, id ASC
                LIMIT 1
            ) AND state = 'pending'
            RETURNING *
            "#,
        )
        .bind(to_millis(now))
        .bind(&self.name)
        .bind(to_millis(now))
        .fetch_optional(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    /// Hand a claimed job back for another attempt at `not_before`.
    pub async fn retry(
        &self,
        job: &Job,
        attempt: u32,
        not_before: DateTime<Utc>,
        error: &str,
    ) -> Result<RetryDisposition> {
        self.settle_retry(job, attempt, not_before, error, None).await
    }

    /// [`JobQueue::retry`], writing `post` to the job's post in the same
    /// transaction.
    pub async fn retry_with(
        &self,
        job: &Job,
        attempt: u32,
        not_before: DateTime<Utc>,
        error: &str,
        post: &PostTransition<'_>,
    ) -> Result<RetryDisposition> {
        self.settle_retry(job, attempt, not_before, error, Some(post))
            .await
    }

    async fn settle_retry(
        &self,
        job: &Job,
        attempt: u32,
        not_before: DateTime<Utc>,
        error: &str,
        post: Option<&PostTransition<'_>>,
    ) -> Result<RetryDisposition> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::SqlxError)?;

        if let Some(post) = post {
            post.apply(&mut *tx, &job.post_id).await?;
        }

        // OR IGNORE: if a newer pending job exists the unique index rejects
        // the update and the claimed row is closed below instead.
        let result = sqlx::query(
            r#"
            UPDATE OR IGNORE jobs
            SET state = 'pending', not_before = ?, attempt = ?, claimed_at = NULL, last_error = ?
            WHERE id = ? AND state = 'active'
            "#,
        )
        .bind(to_millis(not_before))
        .bind(attempt as i64)
        .bind(error)
        .bind(job.id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        let disposition = if result.rows_affected() > 0 {
            RetryDisposition::Rescheduled
        } else {
            sqlx::query(
                r#"
                UPDATE jobs SET state = 'completed', finished_at = ?, last_error = 'superseded'
                WHERE id = ? AND state = 'active'
                "#,
            )
            .bind(to_millis(self.clock.now()))
            .bind(job.id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;
            RetryDisposition::Superseded
        };

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(disposition)
    }

    pub async fn complete(&self, job: &Job) -> Result<()> {
        self.finish(job, "completed", None, None).await
    }

    /// Complete `job` and write `post` in one transaction
    pub async fn complete_with(&self, job: &Job, post: &PostTransition<'_>) -> Result<()> {
        self.finish(job, "completed", None, Some(post)).await
    }

    pub async fn fail(&self, job: &Job, error: &str) -> Result<()> {
        self.finish(job, "failed", Some(error), None).await
    }

    /// Fail `job` and write `post` in one transaction
    pub async fn fail_with(
        &self,
        job: &Job,
        error: &str,
        post: &PostTransition<'_>,
    ) -> Result<()> {
        self.finish(job, "failed", Some(error), Some(post)).await
    }

    async fn finish(
        &self,
        job: &Job,
        state: &str,
        error: Option<&str>,
        post: Option<&PostTransition<'_>>,
    ) -> Result<()> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::SqlxError)?;

        if let Some(post) = post {
            post.apply(&mut *tx, &job.post_id).await?;
        }

        sqlx::query(
            r#"
            UPDATE jobs SET state = ?, finished_at = ?, last_error = COALESCE(?, last_error)
            WHERE id = ? AND state = 'active'
            "#,
        )
        .bind(state)
        .bind(to_millis(self.clock.now()))
        .bind(error)
        .bind(job.id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// Pending or active jobs for a post, newest first
    pub async fn live_jobs(&self, post_id: &str) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE queue = ? AND post_id = ? AND state IN ('pending', 'active')
            ORDER BY id DESC
            "#,
        )
        .bind(&self.name)
        .bind(post_id)
        .fetch_all(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(job_from_row).collect()
    }

    /// Active jobs claimed before `cutoff`
    pub async fn stale_active(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE queue = ? AND state = 'active' AND claimed_at < ?
            ORDER BY id
            "#,
        )
        .bind(&self.name)
        .bind(to_millis(cutoff))
        .fetch_all(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(job_from_row).collect()
    }

    pub async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN state = 'pending' AND not_before <= ? THEN 1 ELSE 0 END), 0) AS waiting,
                COALESCE(SUM(CASE WHEN state = 'pending' AND not_before > ? THEN 1 ELSE 0 END), 0) AS delayed,
                COALESCE(SUM(CASE WHEN state = 'active' THEN 1 ELSE 0 END), 0) AS active,
                COALESCE(SUM(CASE WHEN state = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
                COALESCE(SUM(CASE WHEN state = 'failed' THEN 1 ELSE 0 END), 0) AS failed
            FROM jobs WHERE queue = ?
            "#,
        )
        .bind(to_millis(now))
        .bind(to_millis(now))
        .bind(&self.name)
        .fetch_one(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(QueueStats {
            waiting: row.get::<i64, _>("waiting") as u64,
            delayed: row.get::<i64, _>("delayed") as u64,
            active: row.get::<i64, _>("active") as u64,
            completed: row.get::<i64, _>("completed") as u64,
            failed: row.get::<i64, _>("failed") as u64,
        })
    }

    /// Delete completed and failed jobs finished before `cutoff`
    pub async fn prune_finished(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE queue = ? AND state IN ('completed', 'failed') AND finished_at < ?
            "#,
        )
        .bind(&self.name)
        .bind(to_millis(cutoff))
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }
}

fn job_from_row(r: &SqliteRow) -> Result<Job> {
    let state: String = r.get("state");
    Ok(Job {
        id: r.get("id"),
        queue: r.get("queue"),
        post_id: r.get("post_id"),
        user_id: r.get("user_id"),
        not_before: from_millis(r.get("not_before"))?,
        attempt: r.get::<i64, _>("attempt") as u32,
        state: JobState::parse(&state)?,
        enqueued_at: from_millis(r.get("enqueued_at"))?,
        claimed_at: opt_from_millis(r.get("claimed_at"))?,
        finished_at: opt_from_millis(r.get("finished_at"))?,
        last_error: r.get("last_error"),
    })
}
