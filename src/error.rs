use axum::{
    Json,
    extract::rejection::PathRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::api::ErrorBody;

#[derive(Debug, Error)]
pub enum BorrowError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Validation(String),
    #[error("internal error: {0:#}")]
    Internal(#[source] anyhow::Error),
}

pub type BorrowResult<T> = Result<T, BorrowError>;

impl BorrowError {
    /// Machine readable kind reported to callers.
    pub fn kind(&self) -> &'static str {
        use BorrowError::*;
        match self {
            NotFound(_) => "not_found",
            Conflict(_) => "conflict",
            InvalidState(_) => "invalid_state",
            Forbidden(_) => "forbidden",
            Validation(_) => "validation",
            Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        use BorrowError::*;
        match self {
            NotFound(_) => StatusCode::NOT_FOUND,
            Conflict(_) => StatusCode::CONFLICT,
            InvalidState(_) | Validation(_) => StatusCode::BAD_REQUEST,
            Forbidden(_) => StatusCode::FORBIDDEN,
            Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for BorrowError {
    fn from(error: anyhow::Error) -> Self {
        BorrowError::Internal(error)
    }
}

impl From<libsql::Error> for BorrowError {
    fn from(error: libsql::Error) -> Self {
        BorrowError::Internal(error.into())
    }
}

impl From<PathRejection> for BorrowError {
    fn from(rejection: PathRejection) -> Self {
        BorrowError::Validation(rejection.body_text())
    }
}

impl IntoResponse for BorrowError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            BorrowError::Internal(e) => {
                tracing::error!(error = format!("{e:#}"), "unexpected failure");
                "internal server error".to_string()
            }
            other => {
                tracing::debug!(kind = other.kind(), error = %other, "request rejected");
                other.to_string()
            }
        };

        (
            status,
            Json(ErrorBody {
                message,
                kind: self.kind().to_string(),
            }),
        )
            .into_response()
    }
}
