//! Facebook Pages and Instagram via the Graph API
//!
//! Both platforms share one Meta app, so one adapter type serves both and
//! is instantiated once per [`Platform`].
//!
//! - Facebook: text goes to `/{page-id}/feed`; a post with media goes to
//!   `/{page-id}/photos` with the first image URL.
//! - Instagram: a container is created with `/{ig-user-id}/media` and then
//!   published with `/{ig-user-id}/media_publish`. Instagram has no
//!   text-only posts.
//!
//! Meta tokens have no refresh token; a long-lived token is exchanged for a
//! new one with `grant_type=fb_exchange_token` (valid for about 60 days).

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::MetaConfig;
use crate::error::{PlatformError, Result};
use crate::platforms::http::{build_client, json_body, status_error, transport_error};
use crate::platforms::{PlatformAdapter, PlatformResult, PublishReceipt, RefreshedCredentials};
use crate::types::{Credentials, Platform, Post};

const LONG_LIVED_TOKEN_DAYS: i64 = 60;

/// Graph API error codes meaning the token is no longer usable
const INVALID_TOKEN_CODES: [i64; 2] = [102, 190];
/// Application, user and page-level throttling
const THROTTLE_CODES: [i64; 5] = [4, 17, 32, 613, 80001];

pub struct MetaAdapter {
    platform: Platform,
    http: Client,
    api_base: String,
    app_id: String,
    app_secret: String,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
    /// Set by `/photos`; the feed story id
    post_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    access_token: String,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct GraphErrorEnvelope {
    error: GraphError,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    message: String,
    code: Option<i64>,
}

impl MetaAdapter {
    pub fn new(platform: Platform, config: &MetaConfig) -> Result<Self> {
        Ok(Self {
            platform,
            http: build_client(config.timeout_secs)?,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            app_id: config.app_id.clone(),
            app_secret: config.app_secret.clone(),
        })
    }

    async fn post_form(&self, path: &str, form: &[(&str, &str)]) -> PlatformResult<IdResponse> {
        let response = self
            .http
            .post(format!("{}{}", self.api_base, path))
            .form(form)
            .send()
            .await
            .map_err(transport_error)?;

        let response = graph_check(response).await?;
        json_body(response).await
    }

    async fn publish_facebook(
        &self,
        post: &Post,
        media: &[String],
        credentials: &Credentials,
    ) -> PlatformResult<PublishReceipt> {
        let page_id = &credentials.external_account_id;
        let token = credentials.access_token.expose_secret();

        let created = match media.first() {
            Some(image_url) => {
                self.post_form(
                    &format!("/{}/photos", page_id),
                    &[
                        ("url", image_url.as_str()),
                        ("caption", post.content.as_str()),
                        ("access_token", token),
                    ],
                )
                .await?
            }
            None => {
                self.post_form(
                    &format!("/{}/feed", page_id),
                    &[("message", post.content.as_str()), ("access_token", token)],
                )
                .await?
            }
        };

        let metadata = created
            .post_id
            .as_ref()
            .map(|story| serde_json::json!({ "photo_id": created.id, "post_id": story }));

        Ok(PublishReceipt {
            platform_post_id: created.post_id.clone().unwrap_or(created.id),
            metadata,
        })
    }

    async fn publish_instagram(
        &self,
        post: &Post,
        media: &[String],
        credentials: &Credentials,
    ) -> PlatformResult<PublishReceipt> {
        let image_url = media.first().ok_or_else(|| {
            PlatformError::Validation("Instagram posts need at least one image".to_string())
        })?;
        let ig_user = &credentials.external_account_id;
        let token = credentials.access_token.expose_secret();

        let container = self
            .post_form(
                &format!("/{}/media", ig_user),
                &[
                    ("image_url", image_url.as_str()),
                    ("caption", post.content.as_str()),
                    ("access_token", token),
                ],
            )
            .await?;

        tracing::debug!(
            post_id = %post.id,
            creation_id = %container.id,
            "Instagram container created"
        );

        let published = self
            .post_form(
                &format!("/{}/media_publish", ig_user),
                &[("creation_id", container.id.as_str()), ("access_token", token)],
            )
            .await?;

        Ok(PublishReceipt {
            platform_post_id: published.id,
            metadata: Some(serde_json::json!({ "creation_id": container.id })),
        })
    }
}

/// Graph API errors carry a code that is more precise than the HTTP
/// status; an expired token comes back as 400 with code 190.
async fn graph_check(response: reqwest::Response) -> PlatformResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();

    if let Ok(envelope) = serde_json::from_str::<GraphErrorEnvelope>(&body) {
        if let Some(code) = envelope.error.code {
            let detail = format!("Graph API error {}: {}", code, envelope.error.message);
            if INVALID_TOKEN_CODES.contains(&code) {
                return Err(PlatformError::Authentication(detail));
            }
            if THROTTLE_CODES.contains(&code) {
                return Err(PlatformError::RateLimit(detail));
            }
        }
    }
    Err(status_error(status, &body))
}

#[async_trait]
impl PlatformAdapter for MetaAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn publish(
        &self,
        post: &Post,
        media: &[String],
        credentials: &Credentials,
    ) -> PlatformResult<PublishReceipt> {
        match self.platform {
            Platform::Instagram => self.publish_instagram(post, media, credentials).await,
            _ => self.publish_facebook(post, media, credentials).await,
        }
    }

    async fn refresh_token(
        &self,
        credentials: &Credentials,
    ) -> PlatformResult<RefreshedCredentials> {
        let response = self
            .http
            .get(format!("{}/oauth/access_token", self.api_base))
            .query(&[
                ("grant_type", "fb_exchange_token"),
                ("client_id", self.app_id.as_str()),
                ("client_secret", self.app_secret.as_str()),
                ("fb_exchange_token", credentials.access_token.expose_secret()),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        let exchanged: ExchangeResponse = json_body(graph_check(response).await?).await?;
        let lifetime = exchanged
            .expires_in
            .map(Duration::seconds)
            .unwrap_or_else(|| Duration::days(LONG_LIVED_TOKEN_DAYS));

        Ok(RefreshedCredentials {
            access_token: SecretString::from(exchanged.access_token),
            refresh_token: None,
            expires_at: Some(Utc::now() + lifetime),
        })
    }
}
