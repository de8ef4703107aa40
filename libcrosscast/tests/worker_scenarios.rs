//! End-to-end publish scenarios against a real SQLite file, a manual clock
//! and a scripted platform adapter.

use chrono::{Duration, Utc};
use libcrosscast::config::{TokenConfig, WorkerConfig};
use libcrosscast::error::PlatformError;
use libcrosscast::platforms::mock::MockAdapter;
use libcrosscast::platforms::PublishReceipt;
use libcrosscast::worker::{CREDENTIALS_INVALID, PROFILE_INACTIVE};
use libcrosscast::{
    AdapterRegistry, AdminService, Clock, Database, JobQueue, ManualClock, Outcome, Platform,
    PlatformAdapter, Post, PostLifecycle, PostStatus, Profile, PublishWorker, TokenManager,
};
use secrecy::ExposeSecret;
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    _temp_dir: TempDir,
    db: Database,
    clock: ManualClock,
    queue: JobQueue,
    mock: MockAdapter,
    worker: PublishWorker,
    lifecycle: PostLifecycle,
    admin: AdminService,
}

async fn harness() -> Harness {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("crosscast.db");
    let db = Database::new(&db_path.to_string_lossy()).await.unwrap();

    let clock = ManualClock::new(Utc::now());
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let queue = JobQueue::new(db.clone(), shared.clone());

    let mock = MockAdapter::new(Platform::Twitter);
    let adapters =
        AdapterRegistry::from_fn(|_| Arc::new(mock.clone()) as Arc<dyn PlatformAdapter>);
    let token_config = TokenConfig {
        inter_call_delay_ms: 0,
        ..Default::default()
    };
    let tokens = Arc::new(TokenManager::new(
        db.clone(),
        adapters.clone(),
        shared.clone(),
        &token_config,
    ));

    let worker = PublishWorker::new(
        db.clone(),
        queue.clone(),
        adapters,
        tokens.clone(),
        shared.clone(),
        &WorkerConfig::default(),
    );
    let lifecycle = PostLifecycle::new(db.clone(), queue.clone(), shared.clone());
    let admin = AdminService::new(db.clone(), queue.clone(), tokens, shared);

    Harness {
        _temp_dir: temp_dir,
        db,
        clock,
        queue,
        mock,
        worker,
        lifecycle,
        admin,
    }
}

impl Harness {
    async fn profile(&self, expires_in: Option<Duration>) -> Profile {
        let expires_at = expires_in.map(|d| self.clock.now() + d);
        let profile = Profile::new(
            "user-1",
            Platform::Twitter,
            "acct-1",
            "token-1",
            Some("refresh-1"),
            expires_at,
        );
        self.db.create_profile(&profile).await.unwrap();
        profile
    }

    async fn post(&self, profile: &Profile) -> Post {
        let post = Post::new("user-1", &profile.id, Platform::Twitter, "hello".to_string());
        self.db.create_post(&post).await.unwrap();
        post
    }

    /// Claim the next due job and process it
    async fn step(&self) -> Option<Outcome> {
        let job = self.queue.dequeue_due(self.clock.now()).await.unwrap()?;
        Some(self.worker.process_job(&job).await.unwrap())
    }

    async fn stored(&self, post: &Post) -> Post {
        self.db.get_post(&post.id).await.unwrap().unwrap()
    }
}

#[tokio::test]
async fn test_scheduled_post_publishes_when_due() {
    let h = harness().await;
    let profile = h.profile(Some(Duration::days(30))).await;
    let post = h.post(&profile).await;
    h.mock.push_publish(Ok(PublishReceipt {
        platform_post_id: "abc".to_string(),
        metadata: None,
    }));

    h.lifecycle
        .schedule(&post.id, h.clock.now() + Duration::hours(1))
        .await
        .unwrap();

    assert!(h.step().await.is_none(), "not due yet");
    h.clock.advance(Duration::hours(1));

    let outcome = h.step().await.unwrap();
    assert!(matches!(outcome, Outcome::Published { attempt: 1, .. }));

    let stored = h.stored(&post).await;
    assert_eq!(stored.status, PostStatus::Published);
    assert_eq!(stored.platform_post_id.as_deref(), Some("abc"));
    assert!(stored.published_at.is_some());
    assert!(stored.error_message.is_none());
    assert_eq!(h.mock.publish_calls(), 1);

    let stats = h.admin.queue_stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.waiting + stats.delayed + stats.active, 0);
}

#[tokio::test]
async fn test_transient_failures_exhaust_after_three_attempts() {
    let h = harness().await;
    let profile = h.profile(Some(Duration::days(30))).await;
    let post = h.post(&profile).await;
    for _ in 0..3 {
        h.mock.push_publish_error(PlatformError::Network("connection reset".into()));
    }

    h.lifecycle.publish_now(&post.id).await.unwrap();

    // Attempt 1 fails, retry in 2000ms
    let start = h.clock.now();
    match h.step().await.unwrap() {
        Outcome::Retrying {
            attempt, retry_at, ..
        } => {
            assert_eq!(attempt, 1);
            assert_eq!(retry_at, start + Duration::milliseconds(2000));
        }
        other => panic!("expected retry, got {:?}", other),
    }
    let stored = h.stored(&post).await;
    assert_eq!(stored.status, PostStatus::Scheduled);
    assert!(stored
        .error_message
        .unwrap()
        .starts_with("attempt 1/3 failed, retrying:"));

    h.clock.advance(Duration::milliseconds(1999));
    assert!(h.step().await.is_none());
    h.clock.advance(Duration::milliseconds(1));

    // Attempt 2 fails, retry in 4000ms
    let second = h.clock.now();
    match h.step().await.unwrap() {
        Outcome::Retrying {
            attempt, retry_at, ..
        } => {
            assert_eq!(attempt, 2);
            assert_eq!(retry_at, second + Duration::milliseconds(4000));
        }
        other => panic!("expected retry, got {:?}", other),
    }

    h.clock.advance(Duration::milliseconds(3999));
    assert!(h.step().await.is_none());
    h.clock.advance(Duration::milliseconds(1));

    // Attempt 3 is the last
    assert!(matches!(
        h.step().await.unwrap(),
        Outcome::Failed { attempt: 3, .. }
    ));

    let stored = h.stored(&post).await;
    assert_eq!(stored.status, PostStatus::Failed);
    assert_eq!(stored.attempts, 3);
    assert!(stored.failed_at.is_some());
    assert!(stored
        .error_message
        .unwrap()
        .starts_with("failed after 3 attempts:"));
    assert_eq!(h.mock.publish_calls(), 3);

    // Nothing left to run
    h.clock.advance(Duration::hours(1));
    assert!(h.step().await.is_none());
    assert_eq!(h.admin.queue_stats().await.unwrap().failed, 1);
}

#[tokio::test]
async fn test_rejected_content_fails_without_retry() {
    let h = harness().await;
    let profile = h.profile(None).await;
    let post = h.post(&profile).await;
    h.mock
        .push_publish_error(PlatformError::Validation("Tweet text is too long".into()));

    h.lifecycle.publish_now(&post.id).await.unwrap();
    assert!(matches!(h.step().await.unwrap(), Outcome::Failed { attempt: 1, .. }));

    let stored = h.stored(&post).await;
    assert_eq!(stored.status, PostStatus::Failed);
    assert_eq!(
        stored.error_message.as_deref(),
        Some("Content rejected: Tweet text is too long")
    );
    assert_eq!(h.mock.publish_calls(), 1);
}

#[tokio::test]
async fn test_inactive_profile_short_circuits() {
    let h = harness().await;
    let profile = h.profile(Some(Duration::days(30))).await;
    let post = h.post(&profile).await;
    h.db
        .deactivate_profile(&profile.id, "token revoked", h.clock.now())
        .await
        .unwrap();

    h.lifecycle.publish_now(&post.id).await.unwrap();
    match h.step().await.unwrap() {
        Outcome::Failed { error, .. } => assert_eq!(error, PROFILE_INACTIVE),
        other => panic!("expected failure, got {:?}", other),
    }

    let stored = h.stored(&post).await;
    assert_eq!(stored.status, PostStatus::Failed);
    assert_eq!(stored.attempts, 0);
    assert_eq!(h.mock.publish_calls(), 0);
    assert_eq!(h.mock.refresh_calls(), 0);
}

#[tokio::test]
async fn test_expired_token_is_refreshed_before_publish() {
    let h = harness().await;
    let profile = h.profile(Some(Duration::hours(-2))).await;
    let post = h.post(&profile).await;
    h.mock
        .push_refreshed("token-2", Some(h.clock.now() + Duration::days(60)));

    h.lifecycle.publish_now(&post.id).await.unwrap();
    assert!(matches!(h.step().await.unwrap(), Outcome::Published { .. }));

    assert_eq!(h.mock.tokens_seen(), vec!["token-2"]);
    let stored = h.db.get_profile(&profile.id).await.unwrap().unwrap();
    assert_eq!(stored.access_token.expose_secret(), "token-2");
}

#[tokio::test]
async fn test_expired_token_with_revoked_grant_fails_and_deactivates() {
    let h = harness().await;
    let profile = h.profile(Some(Duration::hours(-2))).await;
    let post = h.post(&profile).await;
    h.mock.push_refresh(Err(PlatformError::Authentication(
        "refresh token revoked".into(),
    )));

    h.lifecycle.publish_now(&post.id).await.unwrap();
    match h.step().await.unwrap() {
        Outcome::Failed { error, .. } => assert_eq!(error, CREDENTIALS_INVALID),
        other => panic!("expected failure, got {:?}", other),
    }

    let stored = h.db.get_profile(&profile.id).await.unwrap().unwrap();
    assert!(!stored.is_active);
    assert_eq!(h.mock.publish_calls(), 0);
}

#[tokio::test]
async fn test_manual_retry_after_exhaustion() {
    let h = harness().await;
    let profile = h.profile(None).await;
    let post = h.post(&profile).await;
    for _ in 0..3 {
        h.mock.push_publish_error(PlatformError::Server("HTTP 503".into()));
    }

    h.lifecycle.publish_now(&post.id).await.unwrap();
    for _ in 0..3 {
        h.step().await.unwrap();
        h.clock.advance(Duration::seconds(10));
    }
    assert_eq!(h.stored(&post).await.status, PostStatus::Failed);

    let status = h.admin.publish_status(&post.id).await.unwrap();
    assert!(status.can_retry);

    h.admin.publish_now(&post.id).await.unwrap();
    let stored = h.stored(&post).await;
    assert_eq!(stored.status, PostStatus::Scheduled);
    assert_eq!(stored.attempts, 3, "attempt counter kept for observability");
    assert!(stored.error_message.is_none());

    // The retried job starts a fresh budget
    assert!(matches!(
        h.step().await.unwrap(),
        Outcome::Published { attempt: 1, .. }
    ));
    assert_eq!(h.stored(&post).await.status, PostStatus::Published);
}

#[tokio::test]
async fn test_post_deleted_while_claimed_is_skipped() {
    let h = harness().await;
    let profile = h.profile(None).await;
    let post = h.post(&profile).await;

    h.lifecycle.publish_now(&post.id).await.unwrap();
    let job = h.queue.dequeue_due(h.clock.now()).await.unwrap().unwrap();
    // Cancel cannot reach a claimed job; the post itself is gone though
    h.lifecycle.delete(&post.id).await.unwrap();

    let outcome = h.worker.process_job(&job).await.unwrap();
    assert!(matches!(outcome, Outcome::Skipped { .. }));
    assert_eq!(h.mock.publish_calls(), 0);
}

#[tokio::test]
async fn test_reconcile_requeues_abandoned_publishing_posts() {
    let h = harness().await;
    let profile = h.profile(None).await;

    // Claimed by a worker that then died
    let abandoned = h.post(&profile).await;
    h.lifecycle.publish_now(&abandoned.id).await.unwrap();
    h.queue.dequeue_due(h.clock.now()).await.unwrap().unwrap();
    assert!(h.db.mark_publishing(&abandoned.id).await.unwrap());

    // Stuck in publishing with no job at all
    let orphan = h.post(&profile).await;
    h.lifecycle.publish_now(&orphan.id).await.unwrap();
    h.queue.cancel(&orphan.id).await.unwrap();
    assert!(h.db.mark_publishing(&orphan.id).await.unwrap());

    h.clock.advance(Duration::seconds(301));
    let report = h.worker.reconcile().await.unwrap();
    assert_eq!(report.expired_claims, 1);
    assert_eq!(report.requeued, 2);

    for post in [&abandoned, &orphan] {
        let stored = h.stored(post).await;
        assert_eq!(stored.status, PostStatus::Scheduled);
        assert!(stored.error_message.is_some());
    }

    assert!(matches!(h.step().await.unwrap(), Outcome::Published { .. }));
    assert!(matches!(h.step().await.unwrap(), Outcome::Published { .. }));
}

#[tokio::test]
async fn test_reconcile_leaves_live_claims_alone() {
    let h = harness().await;
    let profile = h.profile(None).await;
    let post = h.post(&profile).await;

    h.lifecycle.publish_now(&post.id).await.unwrap();
    h.queue.dequeue_due(h.clock.now()).await.unwrap().unwrap();
    h.db.mark_publishing(&post.id).await.unwrap();

    h.clock.advance(Duration::seconds(30));
    let report = h.worker.reconcile().await.unwrap();
    assert_eq!(report.requeued, 0);
    assert_eq!(h.stored(&post).await.status, PostStatus::Publishing);
}

#[tokio::test]
async fn test_run_once_drains_due_jobs() {
    let h = harness().await;
    let profile = h.profile(None).await;
    for _ in 0..3 {
        let post = h.post(&profile).await;
        h.lifecycle.publish_now(&post.id).await.unwrap();
    }
    let later = h.post(&profile).await;
    h.lifecycle
        .schedule(&later.id, h.clock.now() + Duration::minutes(5))
        .await
        .unwrap();

    assert_eq!(h.worker.run_once().await.unwrap(), 3);
    assert_eq!(h.mock.publish_calls(), 3);
    assert_eq!(h.stored(&later).await.status, PostStatus::Scheduled);
}

#[tokio::test]
async fn test_reconcile_requeues_scheduled_post_whose_job_was_lost() {
    let h = harness().await;
    let profile = h.profile(None).await;
    let post = h.post(&profile).await;

    // The post row was written back for a retry, but the worker died before
    // the claimed job was handed back
    h.lifecycle.publish_now(&post.id).await.unwrap();
    let job = h.queue.dequeue_due(h.clock.now()).await.unwrap().unwrap();
    assert!(h.db.mark_publishing(&post.id).await.unwrap());
    let retry_at = h.clock.now() + Duration::seconds(2);
    h.db
        .mark_retrying(&post.id, 1, "attempt 1/3 failed, retrying: timeout", retry_at)
        .await
        .unwrap();

    h.clock.advance(Duration::seconds(301));
    let report = h.worker.reconcile().await.unwrap();
    assert_eq!(report.expired_claims, 1);
    assert_eq!(report.requeued, 1);

    let live = h.queue.live_jobs(&post.id).await.unwrap();
    assert_eq!(live.len(), 1);
    assert_ne!(live[0].id, job.id);
    assert_eq!(live[0].attempt, job.attempt);

    assert_eq!(h.worker.run_once().await.unwrap(), 1);
    let stored = h.stored(&post).await;
    assert_eq!(stored.status, PostStatus::Published);
    assert_eq!(stored.attempts, 1);
}

#[tokio::test]
async fn test_retry_writes_post_and_job_together() {
    let h = harness().await;
    let profile = h.profile(None).await;
    let post = h.post(&profile).await;
    h.mock.push_publish_error(PlatformError::Network("timeout".into()));

    h.lifecycle.publish_now(&post.id).await.unwrap();
    assert!(matches!(h.step().await.unwrap(), Outcome::Retrying { .. }));

    let stored = h.stored(&post).await;
    assert_eq!(stored.status, PostStatus::Scheduled);
    let live = h.queue.live_jobs(&post.id).await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].attempt, 1);
    assert_eq!(Some(live[0].not_before), stored.scheduled_at);

    // A restart finds nothing to repair
    h.clock.advance(Duration::seconds(301));
    let report = h.worker.reconcile().await.unwrap();
    assert_eq!(report, Default::default());
}

#[tokio::test]
async fn test_published_post_leaves_no_claim_for_reconcile() {
    let h = harness().await;
    let profile = h.profile(None).await;
    let post = h.post(&profile).await;

    h.lifecycle.publish_now(&post.id).await.unwrap();
    assert!(matches!(h.step().await.unwrap(), Outcome::Published { .. }));

    h.clock.advance(Duration::seconds(301));
    let report = h.worker.reconcile().await.unwrap();
    assert_eq!(report.expired_claims, 0);

    let stats = h.admin.queue_stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(h.stored(&post).await.status, PostStatus::Published);
}
