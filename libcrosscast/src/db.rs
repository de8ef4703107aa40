//! Database operations for Crosscast
//!
//! Posts and profiles live here. Jobs share the same pool but their SQL is
//! kept in [`crate::queue`].

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;

use crate::error::{DbError, Result};
use crate::types::{from_millis, opt_from_millis, to_millis, Platform, Post, PostStatus, Profile};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database file and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }
        }

        // WAL lets readers proceed while a worker holds the write lock;
        // the busy timeout makes concurrent claimers wait instead of failing.
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Posts
    // ------------------------------------------------------------------

    pub async fn create_post(&self, post: &Post) -> Result<()> {
        let media = serde_json::to_string(&post.media)
            .map_err(|e| DbError::CorruptRow(format!("media: {}", e)))?;
        let metadata = post.platform_metadata.as_ref().map(|m| m.to_string());

        sqlx::query(
            r#"
            INSERT INTO posts (id, user_id, profile_id, platform, content, media, status,
                               created_at, scheduled_at, published_at, failed_at,
                               error_message, platform_post_id, platform_metadata, attempts)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.user_id)
        .bind(&post.profile_id)
        .bind(post.platform.as_str())
        .bind(&post.content)
        .bind(media)
        .bind(post.status.as_str())
        .bind(to_millis(post.created_at))
        .bind(post.scheduled_at.map(to_millis))
        .bind(post.published_at.map(to_millis))
        .bind(post.failed_at.map(to_millis))
        .bind(&post.error_message)
        .bind(&post.platform_post_id)
        .bind(metadata)
        .bind(post.attempts as i64)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_post(&self, post_id: &str) -> Result<Option<Post>> {
        let row = sqlx::query("SELECT * FROM posts WHERE id = ?")
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.map(|r| post_from_row(&r)).transpose()
    }

    pub async fn posts_with_status(&self, status: PostStatus) -> Result<Vec<Post>> {
        let rows = sqlx::query("SELECT * FROM posts WHERE status = ? ORDER BY created_at")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(post_from_row).collect()
    }

    /// Returns whether a row was deleted
    pub async fn delete_post(&self, post_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM posts WHERE id = ?")
            .bind(post_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Set status and schedule time, but only from one of `from`.
    ///
    /// Returns false when the post was not in an allowed state.
    pub async fn set_schedule(
        &self,
        post_id: &str,
        from: &[PostStatus],
        to: PostStatus,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE posts SET status = ?, scheduled_at = ? WHERE id = ? AND status IN ({})",
            placeholders
        );

        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(scheduled_at.map(to_millis))
            .bind(post_id);
        for status in from {
            query = query.bind(status.as_str());
        }

        let result = query.execute(&self.pool).await.map_err(DbError::SqlxError)?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a failed post back to scheduled; the attempt counter is kept.
    pub async fn reset_failed(&self, post_id: &str, scheduled_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'scheduled', scheduled_at = ?, error_message = NULL, failed_at = NULL
            WHERE id = ? AND status = 'failed'
            "#,
        )
        .bind(to_millis(scheduled_at))
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// SCHEDULED -> PUBLISHING. False if another actor moved the post first.
    pub async fn mark_publishing(&self, post_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE posts SET status = 'publishing' WHERE id = ? AND status = 'scheduled'",
        )
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// PUBLISHING -> SCHEDULED for an attempt that never reported back
    pub async fn mark_interrupted(
        &self,
        post_id: &str,
        error: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts SET status = 'scheduled', error_message = ?, scheduled_at = ?
            WHERE id = ? AND status = 'publishing'
            "#,
        )
        .bind(error)
        .bind(to_millis(scheduled_at))
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_published(
        &self,
        post_id: &str,
        platform_post_id: &str,
        metadata: Option<&serde_json::Value>,
        attempts: u32,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.apply(
            post_id,
            &PostTransition::Published {
                platform_post_id,
                metadata,
                attempts,
                at,
            },
        )
        .await
    }

    /// PUBLISHING -> SCHEDULED after a transient failure
    pub async fn mark_retrying(
        &self,
        post_id: &str,
        attempts: u32,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<()> {
        self.apply(
            post_id,
            &PostTransition::Retrying {
                attempts,
                error,
                retry_at,
            },
        )
        .await
    }

    pub async fn mark_failed(
        &self,
        post_id: &str,
        attempts: u32,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.apply(post_id, &PostTransition::Failed { attempts, error, at })
            .await
    }

    async fn apply(&self, post_id: &str, transition: &PostTransition<'_>) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(DbError::SqlxError)?;
        transition.apply(&mut conn, post_id).await
    }

    // ------------------------------------------------------------------
    // Profiles
    // ------------------------------------------------------------------

    pub async fn create_profile(&self, profile: &Profile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO profiles (id, user_id, platform, external_account_id, access_token,
                                  refresh_token, token_expires_at, is_active,
                                  deactivation_reason, last_refreshed_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&profile.id)
        .bind(&profile.user_id)
        .bind(profile.platform.as_str())
        .bind(&profile.external_account_id)
        .bind(profile.access_token.expose_secret())
        .bind(profile.refresh_token.as_ref().map(|t| t.expose_secret().to_string()))
        .bind(profile.token_expires_at.map(to_millis))
        .bind(profile.is_active)
        .bind(&profile.deactivation_reason)
        .bind(profile.last_refreshed_at.map(to_millis))
        .bind(to_millis(profile.created_at))
        .bind(to_millis(profile.updated_at))
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_profile(&self, profile_id: &str) -> Result<Option<Profile>> {
        let row = sqlx::query("SELECT * FROM profiles WHERE id = ?")
            .bind(profile_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.map(|r| profile_from_row(&r)).transpose()
    }

    /// Write a freshly obtained token.
    ///
    /// Only the token columns (plus the active flag it implies) are touched,
    /// so a concurrent writer of other profile fields is never clobbered.
    /// A missing refresh token keeps the stored one.
    pub async fn update_profile_tokens(
        &self,
        profile_id: &str,
        access_token: &SecretString,
        refresh_token: Option<&SecretString>,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE profiles SET
                access_token = ?,
                refresh_token = COALESCE(?, refresh_token),
                token_expires_at = ?,
                is_active = 1,
                deactivation_reason = NULL,
                last_refreshed_at = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(access_token.expose_secret())
        .bind(refresh_token.map(|t| t.expose_secret().to_string()))
        .bind(expires_at.map(to_millis))
        .bind(to_millis(now))
        .bind(to_millis(now))
        .bind(profile_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn deactivate_profile(
        &self,
        profile_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE profiles SET is_active = 0, deactivation_reason = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(reason)
        .bind(to_millis(now))
        .bind(profile_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Active profiles whose token expires at or before `cutoff`, soonest first
    pub async fn active_profiles_expiring_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Profile>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM profiles
            WHERE is_active = 1 AND token_expires_at IS NOT NULL AND token_expires_at <= ?
            ORDER BY token_expires_at ASC
            "#,
        )
        .bind(to_millis(cutoff))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(profile_from_row).collect()
    }
}

/// Outcome of a publish attempt as written to the post row.
///
/// The queue applies these on the same transaction that settles the job,
/// so a post and its job never disagree after a crash.
#[derive(Debug, Clone)]
pub enum PostTransition<'a> {
    Published {
        platform_post_id: &'a str,
        metadata: Option<&'a serde_json::Value>,
        attempts: u32,
        at: DateTime<Utc>,
    },
    /// Back to SCHEDULED for another attempt at `retry_at`
    Retrying {
        attempts: u32,
        error: &'a str,
        retry_at: DateTime<Utc>,
    },
    Failed {
        attempts: u32,
        error: &'a str,
        at: DateTime<Utc>,
    },
}

impl PostTransition<'_> {
    pub(crate) async fn apply(&self, conn: &mut SqliteConnection, post_id: &str) -> Result<()> {
        let query = match self {
            PostTransition::Published {
                platform_post_id,
                metadata,
                attempts,
                at,
            } => sqlx::query(
                r#"
                UPDATE posts
                SET status = 'published', platform_post_id = ?, platform_metadata = ?,
                    error_message = NULL, published_at = ?, failed_at = NULL, attempts = ?
                WHERE id = ?
                "#,
            )
            .bind(*platform_post_id)
            .bind(metadata.map(|m| m.to_string()))
            .bind(to_millis(*at))
            .bind(*attempts as i64),
            PostTransition::Retrying {
                attempts,
                error,
                retry_at,
            } => sqlx::query(
                r#"
                UPDATE posts
                SET status = 'scheduled', attempts = ?, error_message = ?, scheduled_at = ?
                WHERE id = ?
                "#,
            )
            .bind(*attempts as i64)
            .bind(*error)
            .bind(to_millis(*retry_at)),
            PostTransition::Failed {
                attempts,
                error,
                at,
            } => sqlx::query(
                r#"
                UPDATE posts
                SET status = 'failed', attempts = ?, error_message = ?, failed_at = ?
                WHERE id = ?
                "#,
            )
            .bind(*attempts as i64)
            .bind(*error)
            .bind(to_millis(*at)),
        };

        query
            .bind(post_id)
            .execute(conn)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(())
    }
}

fn post_from_row(r: &SqliteRow) -> Result<Post> {
    let status: String = r.get("status");
    let platform: String = r.get("platform");
    let media: String = r.get("media");
    let metadata: Option<String> = r.get("platform_metadata");

    Ok(Post {
        id: r.get("id"),
        user_id: r.get("user_id"),
        profile_id: r.get("profile_id"),
        platform: platform
            .parse::<Platform>()
            .map_err(|_| DbError::CorruptRow(format!("platform: {}", platform)))?,
        content: r.get("content"),
        media: serde_json::from_str(&media)
            .map_err(|e| DbError::CorruptRow(format!("media: {}", e)))?,
        status: status
            .parse::<PostStatus>()
            .map_err(|_| DbError::CorruptRow(format!("status: {}", status)))?,
        created_at: from_millis(r.get("created_at"))?,
        scheduled_at: opt_from_millis(r.get("scheduled_at"))?,
        published_at: opt_from_millis(r.get("published_at"))?,
        failed_at: opt_from_millis(r.get("failed_at"))?,
        error_message: r.get("error_message"),
        platform_post_id: r.get("platform_post_id"),
        platform_metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        attempts: r.get::<i64, _>("attempts") as u32,
    })
}

fn profile_from_row(r: &SqliteRow) -> Result<Profile> {
    let platform: String = r.get("platform");
    let access_token: String = r.get("access_token");
    let refresh_token: Option<String> = r.get("refresh_token");

    Ok(Profile {
        id: r.get("id"),
        user_id: r.get("user_id"),
        platform: platform
            .parse::<Platform>()
            .map_err(|_| DbError::CorruptRow(format!("platform: {}", platform)))?,
        external_account_id: r.get("external_account_id"),
        access_token: SecretString::from(access_token),
        refresh_token: refresh_token.map(SecretString::from),
        token_expires_at: opt_from_millis(r.get("token_expires_at"))?,
        is_active: r.get::<bool, _>("is_active"),
        deactivation_reason: r.get("deactivation_reason"),
        last_refreshed_at: opt_from_millis(r.get("last_refreshed_at"))?,
        created_at: from_millis(r.get("created_at"))?,
        updated_at: from_millis(r.get("updated_at"))?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::CrosscastError;
    use chrono::Duration;
    use tempfile::TempDir;

    pub(crate) async fn setup_test_db() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
        (temp_dir, db)
    }

    pub(crate) async fn seed_profile(db: &Database, platform: Platform) -> Profile {
        let profile = Profile::new(
            "user-1",
            platform,
            "acct-1",
            "access-1",
            Some("refresh-1"),
            Some(Utc::now() + Duration::days(30)),
        );
        db.create_profile(&profile).await.unwrap();
        profile
    }

    #[tokio::test]
    async fn test_database_initialization_with_invalid_path() {
        #[cfg(unix)]
        let invalid_path = "/dev/null/nested/test.db";

        #[cfg(windows)]
        let invalid_path = "C:\\invalid<>path\\test.db";

        let result = Database::new(invalid_path).await;
        assert!(matches!(result, Err(CrosscastError::Database(_))));
    }

    #[tokio::test]
    async fn test_create_and_retrieve_post() {
        let (_dir, db) = setup_test_db().await;
        let profile = seed_profile(&db, Platform::Twitter).await;

        let post = Post::new("user-1", &profile.id, Platform::Twitter, "hello".to_string())
            .with_media(vec!["https://cdn.example.com/a.jpg".to_string()]);
        db.create_post(&post).await.unwrap();

        let retrieved = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(retrieved.id, post.id);
        assert_eq!(retrieved.content, "hello");
        assert_eq!(retrieved.platform, Platform::Twitter);
        assert_eq!(retrieved.status, PostStatus::Draft);
        assert_eq!(retrieved.media, post.media);
        assert_eq!(retrieved.created_at.timestamp_millis(), post.created_at.timestamp_millis());
    }

    #[tokio::test]
    async fn test_post_requires_existing_profile() {
        let (_dir, db) = setup_test_db().await;
        let post = Post::new("user-1", "no-such-profile", Platform::Twitter, "x".to_string());

        let result = db.create_post(&post).await;
        assert!(result.is_err(), "Expected foreign key constraint violation");
    }

    #[tokio::test]
    async fn test_get_nonexistent_post_returns_none() {
        let (_dir, db) = setup_test_db().await;
        assert!(db.get_post("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_publishing_only_from_scheduled() {
        let (_dir, db) = setup_test_db().await;
        let profile = seed_profile(&db, Platform::Facebook).await;
        let post = Post::new("user-1", &profile.id, Platform::Facebook, "x".to_string());
        db.create_post(&post).await.unwrap();

        // Draft cannot jump straight to publishing
        assert!(!db.mark_publishing(&post.id).await.unwrap());

        assert!(db
            .set_schedule(&post.id, &[PostStatus::Draft], PostStatus::Scheduled, Some(Utc::now()))
            .await
            .unwrap());
        assert!(db.mark_publishing(&post.id).await.unwrap());
        // Second claimer loses
        assert!(!db.mark_publishing(&post.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_published_clears_error() {
        let (_dir, db) = setup_test_db().await;
        let profile = seed_profile(&db, Platform::Tiktok).await;
        let post = Post::new("user-1", &profile.id, Platform::Tiktok, "x".to_string());
        db.create_post(&post).await.unwrap();

        let now = Utc::now();
        db.mark_retrying(&post.id, 1, "attempt 1/3 failed", now).await.unwrap();
        let metadata = serde_json::json!({"publish_id": "p-1"});
        db.mark_published(&post.id, "abc", Some(&metadata), 2, now).await.unwrap();

        let post = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(post.status, PostStatus::Published);
        assert_eq!(post.platform_post_id.as_deref(), Some("abc"));
        assert_eq!(post.platform_metadata, Some(metadata));
        assert!(post.error_message.is_none());
        assert_eq!(post.attempts, 2);
        assert!(post.published_at.is_some());
    }

    #[tokio::test]
    async fn test_reset_failed_keeps_attempts() {
        let (_dir, db) = setup_test_db().await;
        let profile = seed_profile(&db, Platform::Twitter).await;
        let post = Post::new("user-1", &profile.id, Platform::Twitter, "x".to_string());
        db.create_post(&post).await.unwrap();

        let now = Utc::now();
        db.mark_failed(&post.id, 3, "failed after 3 attempts", now).await.unwrap();
        assert!(db.reset_failed(&post.id, now).await.unwrap());
        // Only from failed
        assert!(!db.reset_failed(&post.id, now).await.unwrap());

        let post = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(post.status, PostStatus::Scheduled);
        assert_eq!(post.attempts, 3);
        assert!(post.error_message.is_none());
        assert!(post.failed_at.is_none());
    }

    #[tokio::test]
    async fn test_update_tokens_touches_only_token_fields() {
        let (_dir, db) = setup_test_db().await;
        let profile = seed_profile(&db, Platform::Twitter).await;
        let now = Utc::now();

        db.deactivate_profile(&profile.id, "token revoked", now).await.unwrap();
        let stored = db.get_profile(&profile.id).await.unwrap().unwrap();
        assert!(!stored.is_active);
        assert_eq!(stored.deactivation_reason.as_deref(), Some("token revoked"));

        let new_expiry = now + Duration::days(60);
        db.update_profile_tokens(
            &profile.id,
            &SecretString::from("access-2".to_string()),
            None,
            Some(new_expiry),
            now,
        )
        .await
        .unwrap();

        let stored = db.get_profile(&profile.id).await.unwrap().unwrap();
        assert!(stored.is_active);
        assert!(stored.deactivation_reason.is_none());
        assert_eq!(stored.access_token.expose_secret(), "access-2");
        // Refresh token preserved when the platform did not rotate it
        assert_eq!(stored.refresh_token.unwrap().expose_secret(), "refresh-1");
        assert_eq!(
            stored.token_expires_at.unwrap().timestamp_millis(),
            new_expiry.timestamp_millis()
        );
        assert_eq!(stored.external_account_id, "acct-1");
    }

    #[tokio::test]
    async fn test_expiring_profiles_skips_inactive_and_non_expiring() {
        let (_dir, db) = setup_test_db().await;
        let now = Utc::now();

        let expiring = |account: &str, platform, expires_at| {
            Profile::new("u", platform, account, "t", Some("r"), Some(expires_at))
        };
        let soon = expiring("a", Platform::Twitter, now + Duration::hours(5));
        let later = expiring("b", Platform::Twitter, now + Duration::days(10));
        let never = Profile::new("u", Platform::Facebook, "c", "t", None, None);
        let mut inactive = expiring("d", Platform::Tiktok, now + Duration::hours(1));
        inactive.is_active = false;

        for p in [&soon, &later, &never, &inactive] {
            db.create_profile(p).await.unwrap();
        }

        let expiring = db
            .active_profiles_expiring_before(now + Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].id, soon.id);
    }
}
