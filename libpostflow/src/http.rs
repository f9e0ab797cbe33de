//! HTTP surface for [`PostflowError`]
//!
//! Route handlers return `Result<_, PostflowError>` and get the JSON
//! [`ErrorResponse`] body, the mapped status code and `Retry-After` for
//! rate-limited requests.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;

use crate::error::{ErrorResponse, PostflowError};

impl IntoResponse for PostflowError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }

        let retry_after = self.retry_after_secs(Utc::now());
        let mut response = (status, Json(ErrorResponse::from(&self))).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
