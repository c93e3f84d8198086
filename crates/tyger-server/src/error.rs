//! Maps `TygerError` to the JSON error body spec.md §7 prescribes, the way
//! the teacher's `AppError` maps `SemOsError` to a status code + JSON body
//! (`sem_os_server::error`) — here the body additionally carries the stable
//! `code` string and the request's `Request-Id` so CLI clients can surface
//! both without re-deriving them from the HTTP status alone.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use tyger_core::error::TygerError;

use crate::request_id::RequestId;

pub struct AppError {
    inner: TygerError,
    request_id: String,
}

impl AppError {
    pub fn new(inner: TygerError, request_id: impl Into<String>) -> Self {
        Self { inner, request_id: request_id.into() }
    }
}

/// Lets handlers still `?`-propagate a bare `TygerError`; the request id is
/// filled in as `"unknown"` only when the extractor genuinely couldn't run
/// (it's infallible in practice — see `request_id.rs`).
impl From<TygerError> for AppError {
    fn from(inner: TygerError) -> Self {
        Self { inner, request_id: "unknown".to_string() }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.inner.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "error": {
                "code": self.inner.code(),
                "message": self.inner.to_string(),
                "requestId": self.request_id,
            }
        });
        let mut response = (status, Json(body)).into_response();
        if let Ok(value) = axum::http::HeaderValue::from_str(&self.request_id) {
            response.headers_mut().insert(RequestId::HEADER_NAME, value);
        }
        response
    }
}

/// Bundles a `TygerError` with the request id pulled from its axum
/// extension, for handlers that want both in one `?` (`.map_err(|e| into_app_error(e, &req_id))`).
pub fn with_request_id(inner: TygerError, request_id: &RequestId) -> AppError {
    AppError::new(inner, request_id.0.clone())
}
