use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the control plane to its front ends.
#[derive(Debug, Error)]
pub(crate) enum ControlError {
    #[error("pipeline is already running")]
    AlreadyRunning,
    #[error("pipeline is not running")]
    NotRunning,
    #[error("could not open {descriptor}: {reason}")]
    SourceUnavailable { descriptor: String, reason: String },
    #[error("{0}")]
    InvalidRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ResponseError for ControlError {
    fn status_code(&self) -> StatusCode {
        match self {
            ControlError::AlreadyRunning | ControlError::NotRunning => StatusCode::CONFLICT,
            ControlError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ControlError::SourceUnavailable { .. } | ControlError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "status": "error",
            "message": self.to_string(),
        }))
    }
}
