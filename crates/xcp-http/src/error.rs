//! Maps `xcp_core::Error` onto HTTP status codes and JSON error bodies.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use xcp_core::error::Error as CoreError;

/// Whether error bodies include the underlying message. Off by default —
/// flip on in non-production deployments via [`ApiError::set_debug`].
static DEBUG_BODIES: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

pub fn set_debug(enabled: bool) {
    DEBUG_BODIES.store(enabled, std::sync::atomic::Ordering::Relaxed);
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

/// Thin wrapper so handlers can return `Result<_, ApiError>` and get a JSON
/// error response for free.
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for_kind(self.0.kind());
        let detail =
            if DEBUG_BODIES.load(std::sync::atomic::Ordering::Relaxed) { Some(self.0.to_string()) } else { None };
        let body = ErrorBody { error: self.0.kind().to_string(), detail };
        (status, Json(body)).into_response()
    }
}

fn status_for_kind(kind: &str) -> StatusCode {
    match kind {
        "bad_location" => StatusCode::BAD_REQUEST,
        "decode_error" => StatusCode::BAD_REQUEST,
        "io_error" => StatusCode::INTERNAL_SERVER_ERROR,
        "unauthorized" => StatusCode::UNAUTHORIZED,
        "source_error" => StatusCode::INTERNAL_SERVER_ERROR,
        "transform_error" => StatusCode::INTERNAL_SERVER_ERROR,
        "template_error" => StatusCode::INTERNAL_SERVER_ERROR,
        "not_configured" => StatusCode::NOT_FOUND,
        "cipher_error" => StatusCode::BAD_REQUEST,
        "timeout" => StatusCode::GATEWAY_TIMEOUT,
        "internal_error" => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
