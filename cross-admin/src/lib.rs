//! HTTP admin surface for Crosscast
//!
//! Every route is a thin wrapper over [`AdminService`]. Responses use a
//! `{data}` / `{error: {code, message}}` envelope.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use libcrosscast::{AdminService, CrosscastError};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Upper bound for a request; a token refresh sweep may call every platform
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct AppState {
    pub admin: AdminService,
}

/// Success envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self { data }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

/// Error envelope built from a library error
#[derive(Debug)]
pub struct ApiError(pub CrosscastError);

impl From<CrosscastError> for ApiError {
    fn from(err: CrosscastError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            CrosscastError::NotFound(_) => StatusCode::NOT_FOUND,
            CrosscastError::Conflict(_) => StatusCode::CONFLICT,
            CrosscastError::ProfileInactive(_) | CrosscastError::InvalidInput(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match &self.0 {
            CrosscastError::NotFound(_) => "NOT_FOUND",
            CrosscastError::Conflict(_) => "CONFLICT",
            CrosscastError::ProfileInactive(_) => "PROFILE_INACTIVE",
            CrosscastError::InvalidInput(_) => "INVALID_INPUT",
            CrosscastError::Config(_) => "CONFIG_ERROR",
            CrosscastError::Database(_) => "DATABASE_ERROR",
            CrosscastError::Platform(_) => "PLATFORM_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();

        if status.is_server_error() {
            tracing::error!(error = %self.0, code, "Admin request failed");
        } else {
            tracing::debug!(error = %self.0, code, "Admin request rejected");
        }

        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.0.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<ApiResponse<T>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/admin/posts/{id}/publish",
            post(publish_now).get(publish_status),
        )
        .route("/admin/queue-stats", get(queue_stats))
        .route(
            "/admin/tokens/refresh",
            post(refresh_tokens).get(expiring_tokens),
        )
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    ApiResponse::ok(json!({ "status": "ok" }))
}

async fn publish_now(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<libcrosscast::admin::PublishAccepted> {
    Ok(ApiResponse::ok(state.admin.publish_now(&id).await?))
}

async fn publish_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<libcrosscast::admin::PublishStatus> {
    Ok(ApiResponse::ok(state.admin.publish_status(&id).await?))
}

async fn queue_stats(State(state): State<AppState>) -> ApiResult<libcrosscast::QueueStats> {
    Ok(ApiResponse::ok(state.admin.queue_stats().await?))
}

async fn refresh_tokens(
    State(state): State<AppState>,
) -> ApiResult<libcrosscast::tokens::RefreshSummary> {
    Ok(ApiResponse::ok(state.admin.refresh_tokens_now().await?))
}

async fn expiring_tokens(
    State(state): State<AppState>,
) -> ApiResult<Vec<libcrosscast::tokens::ExpiringProfile>> {
    Ok(ApiResponse::ok(state.admin.expiring_tokens().await?))
}
