//! API error responses.
//!
//! Error bodies have the shape `{"error": {"code": "...", "message": "..."}}`.
//! Infrastructure failures get a generic message; the detail is only logged.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dialr_engine::ResolveError;
use serde::Serialize;

/// A resolution failure rendered as JSON
#[derive(Debug)]
pub struct ApiError(pub ResolveError);

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl From<ResolveError> for ApiError {
    fn from(e: ResolveError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = if self.0.is_client_error() {
            self.0.to_string()
        } else {
            "internal server error".to_string()
        };
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.0.code(),
                message,
            },
        };
        (status, axum::Json(body)).into_response()
    }
}
