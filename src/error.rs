use std::path::PathBuf;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("{0}")]
    AuthDenied(String),
    #[error("failed to persist {}: {source}", file.display())]
    Persist {
        file: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    NotFound(String),
    #[error("{failed} of {total} items failed")]
    PartialBatchFailure { failed: usize, total: usize },
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotConfigured(&'static str),
    #[error("Upload exceeds the size limit.")]
    PayloadTooLarge,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidPath(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::AuthDenied(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::PartialBatchFailure { .. } => StatusCode::MULTI_STATUS,
            AppError::NotConfigured(_) => StatusCode::NOT_IMPLEMENTED,
            AppError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Persist { .. } | AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            // Server-side filesystem details stay in the log.
            AppError::Persist { .. } => "Failed to save configuration.".to_string(),
            AppError::Io(_) => "Server error.".to_string(),
            other => other.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
