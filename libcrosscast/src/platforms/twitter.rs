//! Twitter / X API v2
//!
//! Tweets go through `POST /2/tweets` with the user's OAuth 2.0 bearer
//! token. Media references on a Twitter post are media ids that were
//! uploaded beforehand.
//!
//! Refresh uses the OAuth 2.0 refresh grant. Twitter rotates refresh
//! tokens: the one returned replaces the stored one, and the old one stops
//! working.

use async_trait::async_trait;
use base64::Engine;
use chrono::{Duration, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::TwitterConfig;
use crate::error::{PlatformError, Result};
use crate::platforms::http::{build_client, check_status, json_body, status_error, transport_error};
use crate::platforms::{PlatformAdapter, PlatformResult, PublishReceipt, RefreshedCredentials};
use crate::types::{Credentials, Platform, Post};

pub struct TwitterAdapter {
    http: Client,
    api_base: String,
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct TweetResponse {
    data: TweetData,
}

#[derive(Debug, Deserialize)]
struct TweetData {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

impl TwitterAdapter {
    pub fn new(config: &TwitterConfig) -> Result<Self> {
        Ok(Self {
            http: build_client(config.timeout_secs)?,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        })
    }

    fn basic_auth_header(&self) -> String {
        let credentials = format!("{}:{}", self.client_id, self.client_secret);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(credentials)
        )
    }
}

#[async_trait]
impl PlatformAdapter for TwitterAdapter {
    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    async fn publish(
        &self,
        post: &Post,
        media: &[String],
        credentials: &Credentials,
    ) -> PlatformResult<PublishReceipt> {
        let mut body = serde_json::json!({ "text": post.content });
        if !media.is_empty() {
            body["media"] = serde_json::json!({ "media_ids": media });
        }

        let response = self
            .http
            .post(format!("{}/2/tweets", self.api_base))
            .bearer_auth(credentials.access_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        // Twitter answers a duplicate tweet with 403, which is a content
        // problem rather than a credential one
        let status = response.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            if body.to_lowercase().contains("duplicate content") {
                return Err(PlatformError::Validation(format!("duplicate tweet: {}", body)));
            }
            return Err(status_error(status, &body));
        }

        let tweet: TweetResponse = json_body(check_status(response).await?).await?;

        Ok(PublishReceipt {
            platform_post_id: tweet.data.id,
            metadata: None,
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
            ("refresh_token", refresh_token.expose_secret()),
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
        ];

        let response = self
            .http
            .post(format!("{}/2/oauth2/token", self.api_base))
            .header("Authorization", self.basic_auth_header())
            .form(&params)
            .send()
            .await
            .map_err(transport_error)?;

        // A spent or revoked refresh token comes back as 400 invalid_request;
        // only the user can fix that, so treat it like a 401
        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            return Err(PlatformError::Authentication(format!(
                "refresh token rejected: {}",
                body
            )));
        }

        let token: TokenResponse = json_body(check_status(response).await?).await?;

        Ok(RefreshedCredentials {
            access_token: SecretString::from(token.access_token),
            refresh_token: token.refresh_token.map(SecretString::from),
            expires_at: token.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
        })
    }
}
