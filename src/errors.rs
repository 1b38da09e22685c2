use crate::{
    models::{identity::ObjectId, lock::LockMode},
    transport::TransportError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::{fmt, io, path::PathBuf};
use thiserror::Error;

/// Why the destroy guard refused a delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    LegalHold {
        version_id: Option<String>,
        /// The hold sits on an older version no configuration reaches.
        noncurrent: bool,
    },
    Retention {
        mode: LockMode,
        retain_until: DateTime<Utc>,
        version_id: Option<String>,
    },
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let version = |v: &Option<String>| match v {
            Some(v) => format!(" on version `{}`", v),
            None => String::new(),
        };
        match self {
            Self::LegalHold {
                version_id,
                noncurrent: false,
            } => write!(
                f,
                "legal hold is ON{}; set object_lock_legal_hold_status to OFF before destroying",
                version(version_id)
            ),
            Self::LegalHold {
                version_id,
                noncurrent: true,
            } => write!(
                f,
                "legal hold is ON on non-current version{}; release the hold on that version in the store, then destroy again",
                version_id.as_deref().map(|v| format!(" `{}`", v)).unwrap_or_default()
            ),
            Self::Retention {
                mode: LockMode::Governance,
                retain_until,
                version_id,
            } => write!(
                f,
                "GOVERNANCE retention until {}{}; set force_destroy to bypass governance retention",
                retain_until.to_rfc3339(),
                version(version_id)
            ),
            Self::Retention {
                mode: LockMode::Compliance,
                retain_until,
                version_id,
            } => write!(
                f,
                "COMPLIANCE retention until {}{}; the object cannot be deleted before then",
                retain_until.to_rfc3339(),
                version(version_id)
            ),
        }
    }
}

/// Everything a reconciliation cycle can fail with.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("reading content source `{}`: {source}", .path.display())]
    ContentSource {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("decoding content_base64: {0}")]
    ContentEncoding(#[from] base64::DecodeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("cannot delete `{id}`: {reason}")]
    ReplaceBlocked { id: ObjectId, reason: BlockReason },
    #[error("{0}")]
    Validation(String),
    #[error("state record `{}`: {source}", .path.display())]
    State {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("state record `{}` is not valid: {source}", .path.display())]
    StateDecode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ReconcileError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Only transport failures are worth retrying; everything else is terminal for the cycle.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_retryable(),
            _ => false,
        }
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
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
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<ReconcileError> for AppError {
    fn from(err: ReconcileError) -> Self {
        let status = match &err {
            ReconcileError::Validation(_)
            | ReconcileError::ContentEncoding(_)
            | ReconcileError::ContentSource { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ReconcileError::ReplaceBlocked { .. } => StatusCode::CONFLICT,
            ReconcileError::Transport(TransportError::NotFound { .. })
            | ReconcileError::Transport(TransportError::BucketNotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            ReconcileError::Transport(_) => StatusCode::BAD_GATEWAY,
            ReconcileError::State { .. } | ReconcileError::StateDecode { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError::new(status, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn blocked_message_names_the_lock_condition() {
        let err = ReconcileError::ReplaceBlocked {
            id: ObjectId::new("bucket", "key"),
            reason: BlockReason::Retention {
                mode: LockMode::Governance,
                retain_until: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
                version_id: Some("v1".into()),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("bucket/key"));
        assert!(msg.contains("GOVERNANCE retention until 2030-01-01"));
        assert!(msg.contains("version `v1`"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn transport_io_errors_are_retryable() {
        let err = ReconcileError::from(TransportError::Io(io::Error::other("reset")));
        assert!(err.is_retryable());
        assert!(!ReconcileError::validation("bad").is_retryable());
    }

    #[test]
    fn app_error_status_follows_taxonomy() {
        let err = AppError::from(ReconcileError::validation("key must not be empty"));
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);

        let err = AppError::from(ReconcileError::ReplaceBlocked {
            id: ObjectId::new("b", "k"),
            reason: BlockReason::LegalHold {
                version_id: None,
                noncurrent: false,
            },
        });
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[test]
    fn noncurrent_hold_names_the_version() {
        let reason = BlockReason::LegalHold {
            version_id: Some("v1".into()),
            noncurrent: true,
        };
        let msg = reason.to_string();
        assert!(msg.contains("non-current version `v1`"));
        assert!(!msg.contains("object_lock_legal_hold_status"));
    }
}
