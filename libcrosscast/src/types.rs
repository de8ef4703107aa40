//! Core types for Crosscast

use chrono::{DateTime, TimeZone, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CrosscastError, Result};

/// Destination platforms. Closed set: adding one means adding an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Facebook,
    Instagram,
    Twitter,
    Tiktok,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::Facebook,
        Platform::Instagram,
        Platform::Twitter,
        Platform::Tiktok,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Facebook => "facebook",
            Platform::Instagram => "instagram",
            Platform::Twitter => "twitter",
            Platform::Tiktok => "tiktok",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = CrosscastError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "facebook" => Ok(Platform::Facebook),
            "instagram" => Ok(Platform::Instagram),
            "twitter" | "x" => Ok(Platform::Twitter),
            "tiktok" => Ok(Platform::Tiktok),
            other => Err(CrosscastError::InvalidInput(format!(
                "Unknown platform: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostStatus {
    Draft,
    Scheduled,
    Publishing,
    Published,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Publishing => "publishing",
            PostStatus::Published => "published",
            PostStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PostStatus {
    type Err = CrosscastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(PostStatus::Draft),
            "scheduled" => Ok(PostStatus::Scheduled),
            "publishing" => Ok(PostStatus::Publishing),
            "published" => Ok(PostStatus::Published),
            "failed" => Ok(PostStatus::Failed),
            other => Err(CrosscastError::InvalidInput(format!(
                "Unknown post status: {}",
                other
            ))),
        }
    }
}

/// A single platform-bound unit of content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub user_id: String,
    pub profile_id: String,
    pub platform: Platform,
    pub content: String,
    /// Media references (URLs); upload happens elsewhere
    pub media: Vec<String>,
    pub status: PostStatus,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub platform_post_id: Option<String>,
    pub platform_metadata: Option<serde_json::Value>,
    pub attempts: u32,
}

impl Post {
    pub fn new(user_id: &str, profile_id: &str, platform: Platform, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            profile_id: profile_id.to_string(),
            platform,
            content,
            media: Vec::new(),
            status: PostStatus::Draft,
            created_at: Utc::now(),
            scheduled_at: None,
            published_at: None,
            failed_at: None,
            error_message: None,
            platform_post_id: None,
            platform_metadata: None,
            attempts: 0,
        }
    }

    pub fn with_media(mut self, media: Vec<String>) -> Self {
        self.media = media;
        self
    }
}

/// A target account on a platform, holding its credentials
#[derive(Debug, Clone)]
pub struct Profile {
    pub id: String,
    pub user_id: String,
    pub platform: Platform,
    pub external_account_id: String,
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    /// None for tokens that never expire
    pub token_expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub deactivation_reason: Option<String>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    pub fn new(
        user_id: &str,
        platform: Platform,
        external_account_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            platform,
            external_account_id: external_account_id.to_string(),
            access_token: SecretString::from(access_token.to_string()),
            refresh_token: refresh_token.map(|t| SecretString::from(t.to_string())),
            token_expires_at,
            is_active: true,
            deactivation_reason: None,
            last_refreshed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            external_account_id: self.external_account_id.clone(),
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_at: self.token_expires_at,
        }
    }
}

/// What an adapter needs to act on behalf of a profile
#[derive(Debug, Clone)]
pub struct Credentials {
    pub external_account_id: String,
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
        crate::error::DbError::CorruptRow(format!("timestamp out of range: {}", ms)).into()
    })
}

pub(crate) fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}
