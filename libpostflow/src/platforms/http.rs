//! Provider HTTP plumbing shared by the adapters
//!
//! Sends requests and classifies failures into [`PlatformError`] codes:
//! 400/422 are validation errors, 401/403 auth errors, 429 rate limits,
//! other non-2xx responses API errors, and transport failures network
//! errors. Context always names the platform and the operation.

use chrono::{Duration as ChronoDuration, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::{ErrorCode, PlatformError, PostflowError, Result};
use crate::types::Platform;

/// Provider error bodies are truncated to this many characters in context
const MAX_BODY_CONTEXT: usize = 500;

pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("postflow/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| {
            PlatformError::network(format!("Failed to build HTTP client: {}", e)).into()
        })
}

/// Send a request, mapping only transport failures
pub async fn send_raw(platform: Platform, operation: &str, request: RequestBuilder) -> Result<Response> {
    request
        .send()
        .await
        .map_err(|e| transport_error(platform, operation, e).into())
}

/// Send a request and fail on any non-2xx status
pub async fn send(platform: Platform, operation: &str, request: RequestBuilder) -> Result<Response> {
    let response = send_raw(platform, operation, request).await?;
    ensure_success(platform, operation, response).await
}

/// Send a request and decode a JSON body
pub async fn send_json<T: DeserializeOwned>(
    platform: Platform,
    operation: &str,
    request: RequestBuilder,
) -> Result<T> {
    let response = send(platform, operation, request).await?;
    read_json(platform, operation, response).await
}

pub async fn ensure_success(
    platform: Platform,
    operation: &str,
    response: Response,
) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok());
    let body = response.text().await.unwrap_or_default();

    debug!(platform = %platform, operation, status = status.as_u16(), "Provider request failed");

    let mut error = classify_status(platform, operation, status, &body);
    if let Some(secs) = retry_after.filter(|_| status == StatusCode::TOO_MANY_REQUESTS) {
        error = error.with_blocked_until(Utc::now() + ChronoDuration::seconds(secs));
    }
    Err(error.into())
}

pub async fn read_json<T: DeserializeOwned>(
    platform: Platform,
    operation: &str,
    response: Response,
) -> Result<T> {
    let body = response
        .text()
        .await
        .map_err(|e| transport_error(platform, operation, e))?;

    serde_json::from_str(&body).map_err(|e| {
        PlatformError::api(format!("Unexpected {} response during {}: {}", platform, operation, e))
            .with_context("platform", platform.as_str())
            .with_context("operation", operation)
            .with_context("body", truncate(&body))
            .into()
    })
}

pub fn classify_status(
    platform: Platform,
    operation: &str,
    status: StatusCode,
    body: &str,
) -> PlatformError {
    let code = match status.as_u16() {
        400 | 422 => ErrorCode::ValidationError,
        401 | 403 => ErrorCode::AuthError,
        429 => ErrorCode::RateLimitExceeded,
        _ => ErrorCode::ApiError,
    };

    let detail = provider_message(body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string()
    });

    PlatformError::new(
        code,
        format!("{} {} failed ({}): {}", platform, operation, status.as_u16(), detail),
    )
    .with_context("platform", platform.as_str())
    .with_context("operation", operation)
    .with_context("status", status.as_u16())
    .with_context("body", truncate(body))
}

pub fn transport_error(platform: Platform, operation: &str, error: reqwest::Error) -> PlatformError {
    let kind = if error.is_timeout() {
        "timed out"
    } else if error.is_connect() {
        "could not connect"
    } else {
        "transport failure"
    };

    PlatformError::network(format!("{} {} {}: {}", platform, operation, kind, error))
        .with_context("platform", platform.as_str())
        .with_context("operation", operation)
}

/// Token endpoints reject bad codes with 400; callers see AUTH_ERROR
pub fn into_auth_error(error: PostflowError) -> PostflowError {
    match error {
        PostflowError::Platform(mut e) if e.code == ErrorCode::ValidationError => {
            e.code = ErrorCode::AuthError;
            PostflowError::Platform(e)
        }
        other => other,
    }
}

/// Pull a human-readable message out of a provider's error body
fn provider_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;

    let candidates = [
        value.get("error_description"),
        value.get("message"),
        value.get("detail"),
        value.pointer("/error/message"),
        value.pointer("/errors/0/message"),
        value.pointer("/errors/0/detail"),
        value.get("title"),
        value.get("error"),
    ];

    let message = candidates
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str().filter(|s| !s.is_empty()).map(str::to_string));
    message
}

fn truncate(body: &str) -> String {
    if body.chars().count() <= MAX_BODY_CONTEXT {
        body.to_string()
    } else {
        let cut: String = body.chars().take(MAX_BODY_CONTEXT).collect();
        format!("{}...", cut)
    }
}

/// Percent-encode a value for use as a single URL path segment
pub fn encode_segment(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
