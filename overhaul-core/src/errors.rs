use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::warn;

use crate::protocol::ErrorCode;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SyncError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("schema incompatible: {0}")]
    SchemaConflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("request deadline exceeded")]
    DeadlineExceeded,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("password hashing error: {0}")]
    Hashing(argon2::password_hash::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<argon2::password_hash::Error> for SyncError {
    fn from(error: argon2::password_hash::Error) -> Self {
        SyncError::Hashing(error)
    }
}

impl SyncError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Wire error code per the sync protocol.
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::Validation(_) | SyncError::UnknownTable(_) => ErrorCode::Validation,
            SyncError::AuthRequired(_) => ErrorCode::AuthRequired,
            SyncError::Forbidden(_) => ErrorCode::Forbidden,
            SyncError::SchemaConflict(_) => ErrorCode::ConflictSchema,
            SyncError::NotFound(_) => ErrorCode::NotFound,
            SyncError::RateLimited(_) => ErrorCode::RateLimited,
            SyncError::DeadlineExceeded
            | SyncError::Database(_)
            | SyncError::Serialization(_)
            | SyncError::Migration(_)
            | SyncError::Hashing(_)
            | SyncError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.code() {
            ErrorCode::AuthRequired => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::Validation => StatusCode::BAD_REQUEST,
            ErrorCode::ConflictSchema => StatusCode::CONFLICT,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to put on the wire. Database and serialization failures
    /// are collapsed so internals never leak to clients.
    fn wire_message(&self) -> String {
        match self {
            SyncError::Database(_)
            | SyncError::Serialization(_)
            | SyncError::Migration(_)
            | SyncError::Hashing(_)
            | SyncError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        #[derive(serde::Serialize)]
        struct ErrorBody {
            ok: bool,
            code: ErrorCode,
            message: String,
        }

        if matches!(self.code(), ErrorCode::Internal) {
            warn!(error = %self, "request failed");
        }

        let body = ErrorBody {
            ok: false,
            code: self.code(),
            message: self.wire_message(),
        };

        (self.status(), axum::Json(body)).into_response()
    }
}
