//! Platform adapters
//!
//! Each adapter wraps one platform's HTTP API behind [`PlatformAdapter`].
//! Adapters only talk to the platform and report what went wrong; whether a
//! failure is retried or the profile is deactivated is decided by the
//! worker and the token manager from the [`ErrorKind`] they classify.
//!
//! ```no_run
//! use libcrosscast::config::PlatformsConfig;
//! use libcrosscast::platforms::AdapterRegistry;
//! use libcrosscast::types::Platform;
//!
//! # fn example() -> libcrosscast::error::Result<()> {
//! let registry = AdapterRegistry::from_config(&PlatformsConfig::default())?;
//! let adapter = registry.get(Platform::Instagram);
//! assert_eq!(adapter.platform(), Platform::Instagram);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;
use std::sync::Arc;

use crate::config::PlatformsConfig;
use crate::error::{PlatformError, Result};
use crate::types::{Credentials, Platform, Post};

pub mod http;
pub mod meta;
pub mod tiktok;
pub mod twitter;

// Available outside tests so integration tests and the binaries' tests can
// build registries without network access
pub mod mock;

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// How the worker and token manager should treat a platform failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Token revoked or expired beyond refresh; needs the user to reconnect
    InvalidCredentials,
    RateLimited,
    Network,
    Server,
    /// The platform refused this content; retrying will not help
    Rejected,
}

impl ErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited | ErrorKind::Network | ErrorKind::Server
        )
    }
}

impl From<&PlatformError> for ErrorKind {
    fn from(error: &PlatformError) -> Self {
        match error {
            PlatformError::Authentication(_) => ErrorKind::InvalidCredentials,
            PlatformError::Validation(_) => ErrorKind::Rejected,
            PlatformError::RateLimit(_) => ErrorKind::RateLimited,
            PlatformError::Network(_) => ErrorKind::Network,
            // Unexpected responses are treated like an upstream fault
            PlatformError::Server(_) | PlatformError::Posting(_) => ErrorKind::Server,
        }
    }
}

/// What a successful publish returns
#[derive(Debug, Clone, PartialEq)]
pub struct PublishReceipt {
    pub platform_post_id: String,
    pub metadata: Option<serde_json::Value>,
}

/// Tokens issued by a refresh call.
///
/// `refresh_token` is only set when the platform rotated it.
#[derive(Debug, Clone)]
pub struct RefreshedCredentials {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Publish `post` with its media references on behalf of `credentials`
    async fn publish(
        &self,
        post: &Post,
        media: &[String],
        credentials: &Credentials,
    ) -> PlatformResult<PublishReceipt>;

    /// Exchange the current credentials for fresh ones
    async fn refresh_token(
        &self,
        credentials: &Credentials,
    ) -> PlatformResult<RefreshedCredentials>;

    fn classify_error(&self, error: &PlatformError) -> ErrorKind {
        ErrorKind::from(error)
    }
}

/// One adapter per platform.
///
/// Lookups are an exhaustive match, so adding a [`Platform`] variant does not
/// compile until it has an adapter here.
#[derive(Clone)]
pub struct AdapterRegistry {
    facebook: Arc<dyn PlatformAdapter>,
    instagram: Arc<dyn PlatformAdapter>,
    twitter: Arc<dyn PlatformAdapter>,
    tiktok: Arc<dyn PlatformAdapter>,
}

impl AdapterRegistry {
    /// Build the real HTTP adapters
    pub fn from_config(config: &PlatformsConfig) -> Result<Self> {
        Ok(Self {
            facebook: Arc::new(meta::MetaAdapter::new(Platform::Facebook, &config.meta)?),
            instagram: Arc::new(meta::MetaAdapter::new(Platform::Instagram, &config.meta)?),
            twitter: Arc::new(twitter::TwitterAdapter::new(&config.twitter)?),
            tiktok: Arc::new(tiktok::TikTokAdapter::new(&config.tiktok)?),
        })
    }

    /// Every platform served by `make(platform)`; used to wire mocks
    pub fn from_fn<F>(mut make: F) -> Self
    where
        F: FnMut(Platform) -> Arc<dyn PlatformAdapter>,
    {
        Self {
            facebook: make(Platform::Facebook),
            instagram: make(Platform::Instagram),
            twitter: make(Platform::Twitter),
            tiktok: make(Platform::Tiktok),
        }
    }

    pub fn with_adapter(mut self, platform: Platform, adapter: Arc<dyn PlatformAdapter>) -> Self {
        match platform {
            Platform::Facebook => self.facebook = adapter,
            Platform::Instagram => self.instagram = adapter,
            Platform::Twitter => self.twitter = adapter,
            Platform::Tiktok => self.tiktok = adapter,
        }
        self
    }

    pub fn get(&self, platform: Platform) -> Arc<dyn PlatformAdapter> {
        match platform {
            Platform::Facebook => self.facebook.clone(),
            Platform::Instagram => self.instagram.clone(),
            Platform::Twitter => self.twitter.clone(),
            Platform::Tiktok => self.tiktok.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::mock::MockAdapter;

    #[test]
    fn test_error_kind_transience() {
        assert!(ErrorKind::RateLimited.is_transient());
        assert!(ErrorKind::Network.is_transient());
        assert!(ErrorKind::Server.is_transient());
        assert!(!ErrorKind::InvalidCredentials.is_transient());
        assert!(!ErrorKind::Rejected.is_transient());
    }

    #[test]
    fn test_default_classification_by_variant() {
        let cases = [
            (PlatformError::Authentication("revoked".into()), ErrorKind::InvalidCredentials),
            (PlatformError::Validation("too long".into()), ErrorKind::Rejected),
            (PlatformError::RateLimit("429".into()), ErrorKind::RateLimited),
            (PlatformError::Network("timed out".into()), ErrorKind::Network),
            (PlatformError::Server("503".into()), ErrorKind::Server),
            (PlatformError::Posting("no id in response".into()), ErrorKind::Server),
        ];
        for (error, kind) in cases {
            assert_eq!(ErrorKind::from(&error), kind, "{}", error);
        }
    }

    #[test]
    fn test_registry_from_config_covers_every_platform() {
        let registry = AdapterRegistry::from_config(&PlatformsConfig::default()).unwrap();
        for platform in Platform::ALL {
            assert_eq!(registry.get(platform).platform(), platform);
        }
    }

    #[test]
    fn test_registry_with_adapter_replaces_one_platform() {
        let mock = Arc::new(MockAdapter::new(Platform::Twitter));
        let registry = AdapterRegistry::from_config(&PlatformsConfig::default())
            .unwrap()
            .with_adapter(Platform::Twitter, mock.clone());

        let twitter = registry.get(Platform::Twitter);
        assert!(Arc::ptr_eq(
            &(twitter as Arc<dyn PlatformAdapter>),
            &(mock as Arc<dyn PlatformAdapter>)
        ));
    }
}
