use avatar_core::AvatarError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// API Error types
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Pipeline unavailable: {0}")]
    Unavailable(String),

    #[error("Pipeline is busy")]
    Busy,

    #[error("Device error: {0}")]
    Device(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) | ApiError::Device(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Busy => StatusCode::TOO_MANY_REQUESTS,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<AvatarError> for ApiError {
    fn from(e: AvatarError) -> Self {
        match e {
            AvatarError::InvalidAudioChunk(msg) => ApiError::InvalidInput(msg),
            AvatarError::Busy => ApiError::Busy,
            AvatarError::NotInitialized | AvatarError::Initialization(_) => {
                ApiError::Unavailable(e.to_string())
            }
            AvatarError::Device { .. } => ApiError::Device(e.to_string()),
            AvatarError::ShapeMismatch { .. } => ApiError::InternalError(e.to_string()),
        }
    }
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

impl From<&ApiError> for ErrorResponse {
    fn from(e: &ApiError) -> Self {
        let error = match e {
            ApiError::InvalidInput(msg)
            | ApiError::Unavailable(msg)
            | ApiError::Device(msg)
            | ApiError::InternalError(msg) => msg.clone(),
            ApiError::Busy => e.to_string(),
        };
        Self {
            error,
            code: e.status().as_u16(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::InternalError(msg) => tracing::error!("Internal error: {}", msg),
            ApiError::Device(msg) => tracing::warn!("Device error: {}", msg),
            _ => {}
        }

        let status = self.status();
        (status, Json(ErrorResponse::from(&self))).into_response()
    }
}
