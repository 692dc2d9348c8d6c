use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

/// Failure taxonomy for the command-and-control surface.
///
/// Auth failures never leak detail beyond "Unauthorized". Validation
/// failures are caller-correctable and carry their message. Storage and push
/// failures are logged with context and surface as 503.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("{0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Storage(anyhow::Error),
    #[error("push failure: {0}")]
    Push(String),
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Storage(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Storage(err) => {
                error!(error = %err, "storage failure");
                (StatusCode::SERVICE_UNAVAILABLE, "Server Error".to_string())
            }
            AppError::Push(reason) => {
                error!(reason = reason.as_str(), "push failure");
                (StatusCode::SERVICE_UNAVAILABLE, "Server Error".to_string())
            }
        };
        (status, body).into_response()
    }
}
