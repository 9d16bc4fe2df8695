//! The request surface's single conversion point from `ChatError` into an
//! HTTP response (§9 "a single conversion helper at the boundary").

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chat_core::{ChatError, ErrorEnvelope};

pub struct ApiError(pub ChatError);

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let envelope = ErrorEnvelope::from(&self.0);
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), error = %self.0, "request failed");
        } else {
            tracing::warn!(code = self.0.code(), error = %self.0, "request denied");
        }
        (status, Json(envelope)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Wraps a successful payload in the `{success: true, data, meta?}` envelope (§6.1).
#[derive(serde::Serialize)]
pub struct Envelope<T: serde::Serialize> {
    pub success: bool,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

pub fn ok<T: serde::Serialize>(data: T) -> Envelope<T> {
    Envelope {
        success: true,
        data,
        meta: None,
    }
}

pub fn ok_with_meta<T: serde::Serialize>(data: T, meta: serde_json::Value) -> Envelope<T> {
    Envelope {
        success: true,
        data,
        meta: Some(meta),
    }
}
