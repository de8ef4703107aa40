//! TikTok Content Posting API
//!
//! Photo posts are created with `POST /v2/post/publish/content/init/` in
//! direct-post mode, pulling images from the post's media URLs. TikTok
//! publishes asynchronously; the returned `publish_id` is stored as the
//! platform post id.
//!
//! Access tokens last a day; refresh tokens a year and may be rotated.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::TikTokConfig;
use crate::error::{PlatformError, Result};
use crate::platforms::http::{build_client, json_body, status_error, transport_error};
use crate::platforms::{PlatformAdapter, PlatformResult, PublishReceipt, RefreshedCredentials};
use crate::types::{Credentials, Platform, Post};

const MAX_TITLE_CHARS: usize = 90;

pub struct TikTokAdapter {
    http: Client,
    api_base: String,
    client_key: String,
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct InitResponse {
    data: Option<InitData>,
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct InitData {
    publish_id: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    #[serde(default)]
    message: String,
    log_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
    error_description: Option<String>,
}

impl TikTokAdapter {
    pub fn new(config: &TikTokConfig) -> Result<Self> {
        Ok(Self {
            http: build_client(config.timeout_secs)?,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            client_key: config.client_key.clone(),
            client_secret: config.client_secret.clone(),
        })
    }
}

/// TikTok reports most failures in an `error.code` string, sometimes with
/// a 200 status
fn api_error(error: &ApiError) -> PlatformError {
    let detail = match &error.log_id {
        Some(log_id) => format!("{}: {} (log_id {})", error.code, error.message, log_id),
        None => format!("{}: {}", error.code, error.message),
    };
    match error.code.as_str() {
        "access_token_invalid" | "scope_not_authorized" | "scope_permission_missed" => {
            PlatformError::Authentication(detail)
        }
        "rate_limit_exceeded"
        | "spam_risk_too_many_posts"
        | "spam_risk_user_banned_from_posting" => PlatformError::RateLimit(detail),
        "internal_error" => PlatformError::Server(detail),
        _ => PlatformError::Validation(detail),
    }
}

fn title(content: &str) -> String {
    content.chars().take(MAX_TITLE_CHARS).collect()
}

#[async_trait]
impl PlatformAdapter for TikTokAdapter {
    fn platform(&self) -> Platform {
        Platform::Tiktok
    }

    async fn publish(
        &self,
        post: &Post,
        media: &[String],
        credentials: &Credentials,
    ) -> PlatformResult<PublishReceipt> {
        if media.is_empty() {
            return Err(PlatformError::Validation(
                "TikTok posts need at least one image".to_string(),
            ));
        }

        let body = serde_json::json!({
            "post_info": {
                "title": title(&post.content),
                "description": post.content,
                "privacy_level": "PUBLIC_TO_EVERYONE",
            },
            "source_info": {
                "source": "PULL_FROM_URL",
                "photo_cover_index": 0,
                "photo_images": media,
            },
            "post_mode": "DIRECT_POST",
            "media_type": "PHOTO",
        });

        let response = self
            .http
            .post(format!("{}/v2/post/publish/content/init/", self.api_base))
            .bearer_auth(credentials.access_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;
        let parsed: InitResponse = match serde_json::from_str(&text) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => return Err(status_error(status, &text)),
            Err(e) => {
                return Err(PlatformError::Posting(format!(
                    "unexpected response body: {}",
                    e
                )))
            }
        };

        if parsed.error.code != "ok" {
            return Err(api_error(&parsed.error));
        }
        if !status.is_success() {
            return Err(status_error(status, &text));
        }

        let data = parsed
            .data
            .ok_or_else(|| PlatformError::Posting("response has no publish_id".to_string()))?;

        Ok(PublishReceipt {
            metadata: Some(serde_json::json!({
                "publish_id": data.publish_id,
                "log_id": parsed.error.log_id,
            })),
            platform_post_id: data.publish_id,
        })
    }

    async fn refresh_token(
        &self,
        credentials: &Credentials,
    ) -> PlatformResult<RefreshedCredentials> {
        let refresh_token = credentials.refresh_token.as_ref().ok_or_else(|| {
            PlatformError::Authentication("no refresh token stored for this account".to_string())
        })?;

        let params = [
            ("client_key", self.client_key.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose_secret()),
        ];

        let response = self
            .http
            .post(format!("{}/v2/oauth/token/", self.api_base))
            .form(&params)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let token: TokenResponse = json_body(response).await?;
        if let Some(error) = token.error {
            let detail = format!(
                "{}: {}",
                error,
                token.error_description.unwrap_or_default()
            );
            return Err(match error.as_str() {
                "invalid_grant" | "invalid_client" => PlatformError::Authentication(detail),
                "rate_limit_exceeded" => PlatformError::RateLimit(detail),
                _ => PlatformError::Posting(detail),
            });
        }

        let access_token = token
            .access_token
            .ok_or_else(|| {
                PlatformError::Posting("token response has no access_token".to_string())
            })?;

        Ok(RefreshedCredentials {
            access_token: SecretString::from(access_token),
            refresh_token: token.refresh_token.map(SecretString::from),
            expires_at: token.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
        })
    }
}
