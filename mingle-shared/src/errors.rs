use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::types::ApiErrorResponse;

/// Application error codes following the pattern E{area}{sequence}
///
/// Ranges:
/// - E0xxx: Shared/infrastructure errors
/// - E2xxx: Profile errors
/// - E3xxx: Like/match errors
/// - E5xxx: Notification errors
/// - E6xxx: Listener errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Shared (E0xxx)
    InternalError,
    ValidationError,
    NotFound,
    Forbidden,
    ServiceUnavailable,
    BadRequest,

    // Profile (E2xxx)
    ProfileNotFound,
    ProfileInvisible,

    // Like / match (E3xxx)
    AlreadyLiked,
    CannotLikeSelf,
    LikeFailed,
    LikeNotFound,

    // Notification (E5xxx)
    AlertNotFound,

    // Listener (E6xxx)
    UnknownListener,
    ListenerDenied,
}

impl ErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            // Shared
            Self::InternalError => "E0001",
            Self::ValidationError => "E0002",
            Self::NotFound => "E0003",
            Self::Forbidden => "E0005",
            Self::ServiceUnavailable => "E0007",
            Self::BadRequest => "E0008",

            // Profile
            Self::ProfileNotFound => "E2001",
            Self::ProfileInvisible => "E2002",

            // Like / match
            Self::AlreadyLiked => "E3001",
            Self::CannotLikeSelf => "E3002",
            Self::LikeFailed => "E3003",
            Self::LikeNotFound => "E3004",

            // Notification
            Self::AlertNotFound => "E5001",

            // Listener
            Self::UnknownListener => "E6001",
            Self::ListenerDenied => "E6002",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable | Self::LikeFailed => StatusCode::SERVICE_UNAVAILABLE,
            Self::ValidationError | Self::BadRequest | Self::UnknownListener => StatusCode::BAD_REQUEST,
            Self::NotFound | Self::ProfileNotFound | Self::LikeNotFound
            | Self::AlertNotFound => StatusCode::NOT_FOUND,
            Self::Forbidden | Self::ProfileInvisible | Self::CannotLikeSelf
            | Self::ListenerDenied => StatusCode::FORBIDDEN,
            Self::AlreadyLiked => StatusCode::CONFLICT,
        }
    }
}

// --- Store error taxonomy ---

/// Error codes reported by the remote document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreErrorKind {
    Unavailable,
    DeadlineExceeded,
    PermissionDenied,
    NotFound,
    AlreadyExists,
    InvalidArgument,
    Internal,
}

impl StoreErrorKind {
    /// Map a transport status string (`"permission-denied"`, `"unavailable"`, ...)
    /// onto a kind. Unknown codes are treated as internal failures.
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "unavailable" | "aborted" | "resource-exhausted" => Self::Unavailable,
            "deadline-exceeded" | "timeout" | "timed-out" => Self::DeadlineExceeded,
            "permission-denied" | "unauthenticated" => Self::PermissionDenied,
            "not-found" => Self::NotFound,
            "already-exists" => Self::AlreadyExists,
            "invalid-argument" | "failed-precondition" | "out-of-range" => Self::InvalidArgument,
            _ => Self::Internal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::DeadlineExceeded => "deadline-exceeded",
            Self::PermissionDenied => "permission-denied",
            Self::NotFound => "not-found",
            Self::AlreadyExists => "already-exists",
            Self::InvalidArgument => "invalid-argument",
            Self::Internal => "internal",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Unavailable | Self::DeadlineExceeded => ErrorClass::Transient,
            Self::PermissionDenied => ErrorClass::Permission,
            Self::NotFound => ErrorClass::DataIntegrity,
            Self::AlreadyExists | Self::InvalidArgument | Self::Internal => ErrorClass::Fatal,
        }
    }
}

impl std::fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the caller should react to a store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retry with backoff, bounded attempts.
    Transient,
    /// Never retried. Listeners backing the feature go inert.
    Permission,
    /// An expected related record is missing. Skip the current event.
    DataIntegrity,
    /// Surface to the caller as-is.
    Fatal,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permission => "permission",
            Self::DataIntegrity => "data_integrity",
            Self::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::from_code(code), message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Unavailable, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::PermissionDenied, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::AlreadyExists, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::InvalidArgument, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Internal, message)
    }

    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    pub fn is_transient(&self) -> bool {
        self.class().is_retryable()
    }
}

impl From<validator::ValidationErrors> for StoreError {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::invalid(err.to_string())
    }
}

impl From<diesel::result::Error> for StoreError {
    fn from(err: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error};

        match &err {
            Error::NotFound => Self::not_found(err.to_string()),
            Error::DatabaseError(kind, info) => {
                let message = info.message().to_string();
                let kind = match kind {
                    DatabaseErrorKind::UniqueViolation => StoreErrorKind::AlreadyExists,
                    DatabaseErrorKind::ClosedConnection
                    | DatabaseErrorKind::UnableToSendCommand
                    | DatabaseErrorKind::SerializationFailure => StoreErrorKind::Unavailable,
                    DatabaseErrorKind::ForeignKeyViolation
                    | DatabaseErrorKind::NotNullViolation
                    | DatabaseErrorKind::CheckViolation => StoreErrorKind::InvalidArgument,
                    _ if message.contains("permission denied") => StoreErrorKind::PermissionDenied,
                    _ => StoreErrorKind::Internal,
                };
                Self::new(kind, message)
            }
            _ => Self::internal(err.to_string()),
        }
    }
}

impl From<diesel::r2d2::PoolError> for StoreError {
    fn from(err: diesel::r2d2::PoolError) -> Self {
        Self::unavailable(format!("connection pool: {err}"))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

// --- AppError ---

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{message}")]
    Known {
        code: ErrorCode,
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("validation error: {0}")]
    Validation(String),
}

impl AppError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Known {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(code: ErrorCode, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self::Known {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// The stable code reported to clients for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AppError::Known { code, .. } => *code,
            AppError::Internal(_) => ErrorCode::InternalError,
            AppError::Validation(_) => ErrorCode::ValidationError,
            AppError::Store(err) => match err.class() {
                ErrorClass::Transient => ErrorCode::ServiceUnavailable,
                ErrorClass::Permission => ErrorCode::Forbidden,
                ErrorClass::DataIntegrity => ErrorCode::NotFound,
                ErrorClass::Fatal => ErrorCode::InternalError,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.error_code();
        let (status, error_response) = match &self {
            AppError::Known { message, details, .. } => {
                let mut resp = ApiErrorResponse::new(code.code(), message);
                if let Some(d) = details {
                    resp = resp.with_details(d.clone());
                }
                (code.status_code(), resp)
            }
            AppError::Internal(err) => {
                tracing::error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiErrorResponse::new(code.code(), "internal server error"),
                )
            }
            AppError::Store(err) => {
                tracing::error!(error = %err, class = err.class().as_str(), "store error");
                (
                    code.status_code(),
                    ApiErrorResponse::new(code.code(), err.kind.as_str()),
                )
            }
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                ApiErrorResponse::new(code.code(), msg),
            ),
        };

        (status, Json(error_response)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_codes_are_classified() {
        assert_eq!(StoreErrorKind::from_code("permission-denied"), StoreErrorKind::PermissionDenied);
        assert_eq!(StoreErrorKind::from_code("PERMISSION_DENIED"), StoreErrorKind::PermissionDenied);
        assert_eq!(StoreErrorKind::from_code("unavailable"), StoreErrorKind::Unavailable);
        assert_eq!(StoreErrorKind::from_code("deadline-exceeded"), StoreErrorKind::DeadlineExceeded);
        assert_eq!(StoreErrorKind::from_code("something-new"), StoreErrorKind::Internal);
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(StoreError::unavailable("down").is_transient());
        assert!(StoreError::from_code("timeout", "slow").is_transient());
        assert!(!StoreError::permission_denied("nope").is_transient());
        assert!(!StoreError::not_found("gone").is_transient());
        assert_eq!(StoreError::not_found("gone").class(), ErrorClass::DataIntegrity);
        assert_eq!(StoreError::permission_denied("nope").class(), ErrorClass::Permission);
    }

    #[test]
    fn store_errors_map_to_http_codes() {
        let err = AppError::from(StoreError::unavailable("down"));
        assert_eq!(err.error_code(), ErrorCode::ServiceUnavailable);
        assert_eq!(err.error_code().status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let err = AppError::from(StoreError::permission_denied("denied"));
        assert_eq!(err.error_code().status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn error_display_includes_kind() {
        let err = StoreError::already_exists("like 42");
        assert_eq!(err.to_string(), "already-exists: like 42");
    }
}
