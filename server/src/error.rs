//! Error kinds shared by every subsystem.
//!
//! One `AppError` enum covers the whole surface: each variant carries the
//! offending resource (path, ID, or field map) and maps to a stable
//! machine-readable code plus an HTTP status in a single place. Ownership
//! misses deliberately surface as `NotFound` so existence is not leaked.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{message}")]
    Validation {
        message: String,
        /// field -> violation, serialized into the error body when non-empty.
        fields: BTreeMap<String, String>,
    },

    #[error("storage quota exceeded for {0}")]
    QuotaExceeded(String),

    #[error("storage error at {path}: {message}")]
    Storage { path: PathBuf, message: String },

    #[error("processing failed for {0}")]
    Processing(String),

    #[error("unsupported file type: .{0}")]
    UnsupportedFileType(String),

    #[error("too many requests")]
    RateLimited,

    #[error("{0}")]
    Unauthorized(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl AppError {
    pub fn not_found(what: impl Into<String>) -> Self {
        AppError::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        AppError::Conflict(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation { message: msg.into(), fields: BTreeMap::new() }
    }

    pub fn validation_field(field: &str, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        let mut fields = BTreeMap::new();
        fields.insert(field.to_string(), msg.clone());
        AppError::Validation { message: format!("{field}: {msg}"), fields }
    }

    pub fn storage(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        AppError::Storage { path: path.into(), message: err.to_string() }
    }

    /// Stable machine-readable code carried in every error response.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Validation { .. } => "VALIDATION_ERROR",
            AppError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            AppError::Storage { .. } => "STORAGE_ERROR",
            AppError::Processing(_) => "PROCESSING_ERROR",
            AppError::UnsupportedFileType(_) => "UNSUPPORTED_FILE_TYPE",
            AppError::RateLimited => "RATE_LIMITED",
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::Database(_) => "DATABASE_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::QuotaExceeded(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Processing(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::UnsupportedFileType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        // 5xx detail stays in the logs, not on the wire.
        let message = if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };

        let mut body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": message,
                "timestamp": Utc::now().to_rfc3339(),
            }
        });
        if let AppError::Validation { fields, .. } = &self {
            if !fields.is_empty() {
                body["error"]["fields"] = serde_json::json!(fields);
            }
        }

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(AppError::not_found("page").code(), "NOT_FOUND");
        assert_eq!(AppError::conflict("dup").code(), "CONFLICT");
        assert_eq!(AppError::validation("bad").code(), "VALIDATION_ERROR");
        assert_eq!(AppError::QuotaExceeded("alice".into()).code(), "QUOTA_EXCEEDED");
        assert_eq!(AppError::UnsupportedFileType("docx".into()).code(), "UNSUPPORTED_FILE_TYPE");
    }

    #[test]
    fn validation_field_builds_map() {
        let err = AppError::validation_field("title", "must not be empty");
        match err {
            AppError::Validation { fields, .. } => {
                assert_eq!(fields.get("title").unwrap(), "must not be empty");
            }
            _ => panic!("expected validation error"),
        }
    }

    #[test]
    fn statuses_match_kinds() {
        assert_eq!(AppError::not_found("x").status(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            AppError::Unauthorized("no session".into()).status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
