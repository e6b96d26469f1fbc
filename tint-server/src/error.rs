//! HTTP error type.
//!
//! Every handler returns `Result<T, ApiError>`. Client mistakes map to 4xx,
//! everything else to 500; the body is always `{"detail": "..."}`.

use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tint_core::ProcessError;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum ApiError {
    /// A non-generate operation arrived without a file.
    #[error("No file uploaded")]
    MissingInput,

    #[error("missing form field `{0}`")]
    MissingField(&'static str),

    #[error(transparent)]
    Multipart(#[from] MultipartError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("failed to write output image: {0}")]
    Image(#[from] image::ImageError),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingInput => StatusCode::BAD_REQUEST,
            ApiError::MissingField(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Multipart(e) => e.status(),
            ApiError::Process(ProcessError::UnsupportedOperation(_)) => StatusCode::BAD_REQUEST,
            ApiError::Process(ProcessError::ProcessingFailure(_))
            | ApiError::Io(_)
            | ApiError::Image(_)
            | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = match &self {
            ApiError::Multipart(e) => e.body_text(),
            other => other.to_string(),
        };

        if status.is_server_error() {
            error!(error = ?self, "request failed");
        } else {
            warn!(status = status.as_u16(), %detail, "rejected request");
        }

        (status, Json(json!({ "detail": detail }))).into_response()
    }
}
