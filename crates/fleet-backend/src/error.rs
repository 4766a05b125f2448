//! Backend error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use fleet_state::{ApiResponse, StateError};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl BackendError {
    pub fn status(&self) -> StatusCode {
        match self {
            BackendError::Unauthorized(_) | BackendError::Token(_) => StatusCode::UNAUTHORIZED,
            BackendError::BadRequest(_) => StatusCode::BAD_REQUEST,
            BackendError::NotFound(_) | BackendError::State(StateError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            BackendError::State(StateError::Conflict(_)) => StatusCode::CONFLICT,
            BackendError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BackendError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(ApiResponse::<()>::err(self.to_string()))).into_response()
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses() {
        assert_eq!(
            BackendError::Unauthorized("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            BackendError::State(StateError::NotFound("user".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            BackendError::State(StateError::Corrupt(
                serde_json::from_slice::<u32>(b"{").unwrap_err()
            ))
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            BackendError::BadRequest("name".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
