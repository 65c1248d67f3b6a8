use crate::services::retention::{LockReason, RetentionLockError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use std::{borrow::Cow, fmt, io};
use thiserror::Error;

/// Domain errors raised by the metadata core.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0}")]
    Validation(String),
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("region `{0}` is not supported")]
    UnsupportedRegion(String),
    #[error("range not satisfiable: {0}")]
    InvalidRange(String),
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{0}` is not empty")]
    BucketNotEmpty(String),
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("version `{version_id}` of `{key}` not found in bucket `{bucket}`")]
    VersionNotFound {
        bucket: String,
        key: String,
        version_id: String,
    },
    #[error("multipart upload `{0}` not found")]
    UploadNotFound(String),
    #[error("{0}")]
    MethodNotAllowed(String),
    #[error("precondition failed")]
    PreconditionFailed,
    #[error("not modified")]
    NotModified,
    /// The executor ran out of attempts. Transient: the caller may retry.
    #[error("`{operation}` gave up after {attempts} conflicting attempts")]
    Conflict {
        operation: &'static str,
        attempts: u32,
    },
    /// A compare-and-swap lost a race inside a transaction. Never leaves the executor.
    #[error("write conflict on `{0}`")]
    WriteConflict(String),
    #[error(transparent)]
    RetentionLocked(#[from] RetentionLockError),
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Optimistic-concurrency failures the transaction executor retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::WriteConflict(_) => true,
            StorageError::Sqlx(sqlx::Error::Database(db_err)) => is_busy_code(db_err.code()),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::BucketNotFound(_)
                | StorageError::ObjectNotFound { .. }
                | StorageError::VersionNotFound { .. }
                | StorageError::UploadNotFound(_)
        )
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes such as
/// SQLITE_BUSY_SNAPSHOT (517).
fn is_busy_code(code: Option<Cow<'_, str>>) -> bool {
    code.and_then(|c| c.parse::<i64>().ok())
        .is_some_and(|c| matches!(c & 0xff, 5 | 6))
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    /// Extra machine-readable fields merged into the JSON body.
    pub details: Option<Value>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            code: default_code(status),
            message: msg.into(),
            details: None,
        }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = code;
        self
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

fn default_code(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "InvalidRequest",
        StatusCode::NOT_FOUND => "NotFound",
        StatusCode::CONFLICT => "Conflict",
        StatusCode::PRECONDITION_FAILED => "PreconditionFailed",
        StatusCode::SERVICE_UNAVAILABLE => "SlowDown",
        _ => "InternalError",
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status == StatusCode::NOT_MODIFIED {
            return self.status.into_response();
        }

        let mut body = json!({
            "error": self.message,
            "code": self.code,
            "status": self.status.as_u16()
        });
        if let (Some(Value::Object(extra)), Some(map)) = (self.details, body.as_object_mut()) {
            map.extend(extra);
        }

        (self.status, Json(body)).into_response()
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let message = err.to_string();
        match err {
            StorageError::Validation(_) => AppError::bad_request(message),
            StorageError::InvalidObjectKey => {
                AppError::bad_request(message).with_code("KeyTooLongOrInvalid")
            }
            StorageError::InvalidBucketName { .. } => {
                AppError::bad_request(message).with_code("InvalidBucketName")
            }
            StorageError::UnsupportedRegion(_) => {
                AppError::bad_request(message).with_code("InvalidLocationConstraint")
            }
            StorageError::InvalidRange(_) => {
                AppError::new(StatusCode::RANGE_NOT_SATISFIABLE, message).with_code("InvalidRange")
            }
            StorageError::BucketNotFound(_) => AppError::not_found(message).with_code("NoSuchBucket"),
            StorageError::ObjectNotFound { .. } => AppError::not_found(message).with_code("NoSuchKey"),
            StorageError::VersionNotFound { .. } => {
                AppError::not_found(message).with_code("NoSuchVersion")
            }
            StorageError::UploadNotFound(_) => AppError::not_found(message).with_code("NoSuchUpload"),
            StorageError::BucketAlreadyExists(_) => {
                AppError::new(StatusCode::CONFLICT, message).with_code("BucketAlreadyExists")
            }
            StorageError::BucketNotEmpty(_) => {
                AppError::new(StatusCode::CONFLICT, message).with_code("BucketNotEmpty")
            }
            StorageError::MethodNotAllowed(_) => {
                AppError::new(StatusCode::METHOD_NOT_ALLOWED, message).with_code("MethodNotAllowed")
            }
            StorageError::PreconditionFailed => AppError::new(StatusCode::PRECONDITION_FAILED, message),
            StorageError::NotModified => AppError::new(StatusCode::NOT_MODIFIED, message),
            StorageError::Conflict { .. } | StorageError::WriteConflict(_) => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, message)
            }
            StorageError::RetentionLocked(lock) => retention_locked(lock, message),
            StorageError::Internal(_) | StorageError::Sqlx(_) | StorageError::Io(_) => {
                tracing::error!(error = %message, "request failed with internal error");
                AppError::internal(message)
            }
        }
    }
}

/// Retention denials carry the lock kind and expiry so tooling can tell
/// "locked until T" apart from "held indefinitely".
fn retention_locked(lock: RetentionLockError, message: String) -> AppError {
    let (kind, retain_until, bypassable) = match lock.reason {
        LockReason::LegalHold => ("legal_hold", None, false),
        LockReason::Compliance { retain_until } => ("compliance", Some(retain_until), false),
        LockReason::Governance { retain_until } => ("governance", Some(retain_until), true),
    };
    AppError {
        status: StatusCode::FORBIDDEN,
        code: "ObjectLocked",
        message,
        details: Some(json!({
            "key": lock.key,
            "version_id": lock.version_id,
            "lock": kind,
            "retain_until": retain_until.map(|t| t.to_rfc3339()),
            "bypassable": bypassable,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn retention_denial_is_distinct_and_carries_expiry() {
        let until = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let err = StorageError::RetentionLocked(RetentionLockError {
            key: "reports/q1.pdf".into(),
            version_id: "v1".into(),
            reason: LockReason::Compliance {
                retain_until: until,
            },
        });
        let app: AppError = err.into();
        assert_eq!(app.status, StatusCode::FORBIDDEN);
        assert_eq!(app.code, "ObjectLocked");
        let details = app.details.expect("details");
        assert_eq!(details["lock"], "compliance");
        assert_eq!(details["retain_until"], until.to_rfc3339());
        assert_eq!(details["bypassable"], false);
    }

    #[test]
    fn exhausted_conflicts_are_transient() {
        let app: AppError = StorageError::Conflict {
            operation: "put_version",
            attempts: 5,
        }
        .into();
        assert_eq!(app.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn write_conflicts_are_retryable_but_validation_is_not() {
        assert!(StorageError::WriteConflict("k".into()).is_retryable());
        assert!(!StorageError::Validation("bad".into()).is_retryable());
        assert!(is_busy_code(Some(Cow::Borrowed("517"))));
        assert!(is_busy_code(Some(Cow::Borrowed("5"))));
        assert!(!is_busy_code(Some(Cow::Borrowed("2067"))));
        assert!(!is_busy_code(None));
    }
}
