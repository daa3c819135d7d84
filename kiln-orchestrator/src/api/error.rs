//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use kiln_remote::{FileError, ShellError};

use crate::lifecycle::{LifecycleError, StartError};
use crate::profiles::ProfileError;
use crate::repository::StoreError;
use crate::service::ServiceError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Forbidden(String),
    Conflict(String),
    /// The deployment host or its scheduler could not be reached or refused
    BadGateway(String),
    DatabaseError(sqlx::Error),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadGateway(msg) => {
                tracing::warn!("Upstream error: {}", msg);
                (StatusCode::BAD_GATEWAY, msg)
            }
            ApiError::DatabaseError(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::DatabaseError(err)
    }
}

impl From<ShellError> for ApiError {
    fn from(err: ShellError) -> Self {
        ApiError::BadGateway(err.to_string())
    }
}

impl From<ProfileError> for ApiError {
    fn from(err: ProfileError) -> Self {
        match err {
            ProfileError::NotFound(_) => ApiError::NotFound(err.to_string()),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => ApiError::NotFound(err.to_string()),
            StoreError::NotTerminal(..) => ApiError::Conflict(err.to_string()),
            StoreError::Database(e) => ApiError::DatabaseError(e),
        }
    }
}

impl From<StartError> for ApiError {
    fn from(err: StartError) -> Self {
        match err {
            StartError::Render(_) | StartError::Unsupported(_) => {
                ApiError::BadRequest(err.to_string())
            }
            StartError::Submit(_) | StartError::Parse(_) | StartError::Shell(_) => {
                ApiError::BadGateway(err.to_string())
            }
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::NotStarted(_) => ApiError::Conflict(err.to_string()),
            LifecycleError::Unsupported(_) => ApiError::BadRequest(err.to_string()),
            LifecycleError::Shell(e) => e.into(),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotFound(_) => ApiError::NotFound(err.to_string()),
            ServiceError::InvalidState(msg) => ApiError::Conflict(msg),
            ServiceError::Profile(e) => e.into(),
            ServiceError::Start(e) => e.into(),
            ServiceError::Lifecycle(e) => e.into(),
            ServiceError::Store(e) => e.into(),
        }
    }
}

impl From<FileError> for ApiError {
    fn from(err: FileError) -> Self {
        match err {
            FileError::NotFound(_) => ApiError::NotFound(err.to_string()),
            FileError::PathTraversal(_) | FileError::PermissionDenied(_) => {
                ApiError::Forbidden(err.to_string())
            }
            FileError::AlreadyExists(_) => ApiError::Conflict(err.to_string()),
            FileError::InvalidPath(_) => ApiError::BadRequest(err.to_string()),
            FileError::Connection(_) => ApiError::BadGateway(err.to_string()),
            FileError::Command(_) | FileError::Parse(_) => ApiError::InternalError(err.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
