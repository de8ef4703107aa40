//! Scripted adapter for tests
//!
//! Results are queued ahead of time and consumed one per call; once the
//! script runs out every call succeeds. Call counters and the credentials
//! seen on each publish are recorded for assertions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::PlatformError;
use crate::platforms::{PlatformAdapter, PlatformResult, PublishReceipt, RefreshedCredentials};
use crate::types::{Credentials, Platform, Post};

#[derive(Default)]
struct Script {
    publish: VecDeque<PlatformResult<PublishReceipt>>,
    refresh: VecDeque<PlatformResult<RefreshedCredentials>>,
}

#[derive(Clone)]
pub struct MockAdapter {
    platform: Platform,
    script: Arc<Mutex<Script>>,
    publish_calls: Arc<AtomicUsize>,
    refresh_calls: Arc<AtomicUsize>,
    tokens_seen: Arc<Mutex<Vec<String>>>,
    delay: Duration,
}

impl MockAdapter {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            script: Arc::new(Mutex::new(Script::default())),
            publish_calls: Arc::new(AtomicUsize::new(0)),
            refresh_calls: Arc::new(AtomicUsize::new(0)),
            tokens_seen: Arc::new(Mutex::new(Vec::new())),
            delay: Duration::ZERO,
        }
    }

    /// Sleep this long inside each call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_publish(&self, result: PlatformResult<PublishReceipt>) -> &Self {
        self.lock().publish.push_back(result);
        self
    }

    pub fn push_publish_error(&self, error: PlatformError) -> &Self {
        self.push_publish(Err(error))
    }

    pub fn push_refresh(&self, result: PlatformResult<RefreshedCredentials>) -> &Self {
        self.lock().refresh.push_back(result);
        self
    }

    /// Script a successful refresh issuing `access_token`
    pub fn push_refreshed(&self, access_token: &str, expires_at: Option<DateTime<Utc>>) -> &Self {
        self.push_refresh(Ok(RefreshedCredentials {
            access_token: SecretString::from(access_token.to_string()),
            refresh_token: None,
            expires_at,
        }))
    }

    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Access tokens presented to `publish`, in call order
    pub fn tokens_seen(&self) -> Vec<String> {
        self.tokens_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl PlatformAdapter for MockAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn publish(
        &self,
        post: &Post,
        _media: &[String],
        credentials: &Credentials,
    ) -> PlatformResult<PublishReceipt> {
        let call = self.publish_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.tokens_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(credentials.access_token.expose_secret().to_string());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = self.lock().publish.pop_front();
        scripted.unwrap_or_else(|| {
            Ok(PublishReceipt {
                platform_post_id: format!("{}-{}-{}", self.platform, post.id, call),
                metadata: None,
            })
        })
    }

    async fn refresh_token(
        &self,
        credentials: &Credentials,
    ) -> PlatformResult<RefreshedCredentials> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = self.lock().refresh.pop_front();
        scripted.unwrap_or_else(|| {
            Ok(RefreshedCredentials {
                access_token: SecretString::from(format!(
                    "{}-refreshed",
                    credentials.access_token.expose_secret()
                )),
                refresh_token: None,
                expires_at: credentials.expires_at,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        Credentials {
            external_account_id: "acct".to_string(),
            access_token: SecretString::from("tok".to_string()),
            refresh_token: None,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_script_is_consumed_in_order_then_succeeds() {
        let mock = MockAdapter::new(Platform::Twitter);
        mock.push_publish_error(PlatformError::Network("down".into()))
            .push_publish_error(PlatformError::Server("502".into()));

        let post = Post::new("u", "p", Platform::Twitter, "x".to_string());
        assert!(matches!(
            mock.publish(&post, &[], &credentials()).await,
            Err(PlatformError::Network(_))
        ));
        assert!(matches!(
            mock.publish(&post, &[], &credentials()).await,
            Err(PlatformError::Server(_))
        ));
        assert!(mock.publish(&post, &[], &credentials()).await.is_ok());
        assert_eq!(mock.publish_calls(), 3);
        assert_eq!(mock.tokens_seen(), vec!["tok", "tok", "tok"]);
    }

    #[tokio::test]
    async fn test_clones_share_counters() {
        let mock = MockAdapter::new(Platform::Tiktok);
        let clone = mock.clone();
        clone.refresh_token(&credentials()).await.unwrap();
        assert_eq!(mock.refresh_calls(), 1);
    }
}
