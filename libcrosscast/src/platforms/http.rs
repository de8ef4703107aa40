//! HTTP plumbing shared by the adapters

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::{ConfigError, PlatformError, Result};
use crate::platforms::PlatformResult;

/// Longest slice of a response body kept in an error message
const MAX_BODY_IN_ERROR: usize = 500;

pub fn build_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(concat!("crosscast/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| {
            ConfigError::InvalidValue {
                field: "platforms.*.timeout_secs".to_string(),
                message: format!("failed to build HTTP client: {}", e),
            }
            .into()
        })
}

/// Map a reqwest transport failure. Timeouts and connection errors are
/// both `Network`.
pub fn transport_error(error: reqwest::Error) -> PlatformError {
    if error.is_timeout() {
        PlatformError::Network(format!("request timed out: {}", error))
    } else {
        PlatformError::Network(error.to_string())
    }
}

/// Map an unsuccessful HTTP status onto the error taxonomy
pub fn status_error(status: StatusCode, body: &str) -> PlatformError {
    let detail = format!("HTTP {}: {}", status.as_u16(), truncate(body));
    match status.as_u16() {
        401 | 403 => PlatformError::Authentication(detail),
        429 => PlatformError::RateLimit(detail),
        400 | 422 => PlatformError::Validation(detail),
        500..=599 => PlatformError::Server(detail),
        // Anything else in 4xx (404 on a page id, 409...) will not get
        // better by retrying
        400..=499 => PlatformError::Validation(detail),
        _ => PlatformError::Posting(detail),
    }
}

/// Pass a successful response through, or turn it into a [`PlatformError`]
pub async fn check_status(response: Response) -> PlatformResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

/// Decode a JSON body; a malformed body is a `Posting` error
pub async fn json_body<T: DeserializeOwned>(response: Response) -> PlatformResult<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| PlatformError::Posting(format!("unexpected response body: {}", e)))
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_BODY_IN_ERROR) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_status_mapping() {
        let cases = [
            (401, "Authentication"),
            (403, "Authentication"),
            (429, "RateLimit"),
            (400, "Validation"),
            (422, "Validation"),
            (404, "Validation"),
            (500, "Server"),
            (502, "Server"),
            (503, "Server"),
        ];
        for (code, expected) in cases {
            let error = status_error(StatusCode::from_u16(code).unwrap(), "body");
            let name = match error {
                PlatformError::Authentication(_) => "Authentication",
                PlatformError::RateLimit(_) => "RateLimit",
                PlatformError::Validation(_) => "Validation",
                PlatformError::Server(_) => "Server",
                PlatformError::Network(_) => "Network",
                PlatformError::Posting(_) => "Posting",
            };
            assert_eq!(name, expected, "HTTP {}", code);
        }
    }

    #[test]
    fn test_error_body_is_truncated() {
        let body = "x".repeat(2000);
        let error = status_error(StatusCode::BAD_GATEWAY, &body);
        assert!(error.to_string().len() < 600);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_network() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&mock_server)
            .await;

        let client = build_client(1).unwrap();
        let error = client
            .get(format!("{}/slow", mock_server.uri()))
            .send()
            .await
            .map_err(transport_error)
            .unwrap_err();

        assert!(matches!(error, PlatformError::Network(ref m) if m.contains("timed out")));
    }

    #[tokio::test]
    async fn test_check_status_passes_success_through() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "1"})))
            .mount(&mock_server)
            .await;

        let response = reqwest::get(format!("{}/ok", mock_server.uri())).await.unwrap();
        let body: serde_json::Value = json_body(check_status(response).await.unwrap())
            .await
            .unwrap();
        assert_eq!(body["id"], "1");
    }
}
