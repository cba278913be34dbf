//! HTTP error types for the `cellar` server.
//!
//! Maps [`CoreError`] into HTTP responses. Every variant produces a JSON body
//! with a machine-readable `error` field and a human-readable `message`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use cellar_core::error::{CoreError, ErrorKind, PolicyError, SealError, TokenError};

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// The vault is sealed: reject all secret operations.
    Sealed,
    /// Authentication failed or token invalid.
    Unauthorized(String),
    /// Policy denied the operation.
    Forbidden(String),
    /// Requested resource not found.
    NotFound(String),
    /// Client sent invalid input.
    BadRequest(String),
    /// A conflict (e.g., already initialized, path already mounted).
    Conflict(String),
    /// A mounted backend failed.
    BadGateway(String),
    /// Internal server error.
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            Self::Sealed => (
                StatusCode::SERVICE_UNAVAILABLE,
                "sealed",
                "vault is sealed".to_owned(),
            ),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            Self::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "backend_error", msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };

        let body = ErrorBody {
            error: error_type,
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        // A few cases read better with a status other than their kind's.
        match &err {
            CoreError::Token(TokenError::NotFound | TokenError::Expired { .. }) => {
                return Self::Unauthorized(err.to_string());
            }
            CoreError::Seal(
                SealError::AlreadyInitialized | SealError::AlreadyUnsealed | SealError::AlreadySealed,
            ) => return Self::Conflict(err.to_string()),
            CoreError::Policy(PolicyError::NotFound { .. }) => {
                return Self::NotFound(err.to_string());
            }
            CoreError::Policy(PolicyError::BuiltIn { .. }) => {
                return Self::Forbidden(err.to_string());
            }
            _ => {}
        }

        match err.kind() {
            ErrorKind::Sealed => Self::Sealed,
            ErrorKind::PathConflict => Self::Conflict(err.to_string()),
            ErrorKind::NotMounted | ErrorKind::NoBackend | ErrorKind::LeaseNotFound => {
                Self::NotFound(err.to_string())
            }
            ErrorKind::NotRenewable | ErrorKind::ShareMismatch | ErrorKind::InvalidRequest => {
                Self::BadRequest(err.to_string())
            }
            ErrorKind::PermissionDenied => Self::Forbidden(err.to_string()),
            ErrorKind::Backend => {
                error!(error = %err, "backend failure");
                Self::BadGateway(err.to_string())
            }
            ErrorKind::Integrity | ErrorKind::Internal => {
                error!(error = %err, "internal error");
                Self::Internal("internal error".to_owned())
            }
        }
    }
}
