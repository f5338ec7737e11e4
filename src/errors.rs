use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

use crate::services::{relay_service::RelayError, storage::StorageError};

/// Errors raised by the upload, transfer and notification services.
///
/// Handlers never see provider error shapes; everything is folded into one of
/// these before reaching [`AppError`].
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    /// Missing, expired and deleted resources all look the same.
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    QuotaExceeded(String),
    /// Part manifest does not reconcile with the upload plan.
    #[error("{0}")]
    Integrity(String),
    #[error("storage temporarily unavailable: {0}")]
    StorageTransient(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Internal(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn not_found() -> Self {
        ServiceError::NotFound("transfer not found".into())
    }
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(_) => ServiceError::NotFound("file not found".into()),
            StorageError::Unavailable(msg) => ServiceError::StorageTransient(msg),
            StorageError::Integrity(msg) => ServiceError::Integrity(msg),
            StorageError::InvalidKey(msg) => ServiceError::Validation(msg),
            StorageError::Backend(msg) | StorageError::Config(msg) => ServiceError::Internal(msg),
        }
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
///
/// `kind` is a stable machine-readable tag so clients can tell "retry this
/// part with a fresh URL" from "retry" from "start over".
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, kind: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: msg.into(),
            retryable: false,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation", msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", msg)
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
            "kind": self.kind,
            "retryable": self.retryable,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Validation(msg) => AppError::bad_request(msg),
            ServiceError::Unauthorized(msg) => AppError::unauthorized(msg),
            ServiceError::Forbidden(msg) => {
                AppError::new(StatusCode::FORBIDDEN, "forbidden", msg)
            }
            ServiceError::NotFound(msg) => AppError::not_found(msg),
            ServiceError::QuotaExceeded(msg) => {
                AppError::new(StatusCode::PAYLOAD_TOO_LARGE, "quota_exceeded", msg)
            }
            ServiceError::Integrity(msg) => {
                AppError::new(StatusCode::CONFLICT, "integrity", msg)
            }
            ServiceError::StorageTransient(msg) => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "storage_unavailable", msg)
                    .retryable()
            }
            ServiceError::Database(err) if crate::db::is_busy(&err) => {
                tracing::warn!(error = %err, "database busy");
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "database_busy", "database is busy")
                    .retryable()
            }
            ServiceError::Database(err) => {
                tracing::error!(error = %err, "database error");
                AppError::internal("internal database error")
            }
            ServiceError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                AppError::internal("internal error")
            }
        }
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        ServiceError::from(err).into()
    }
}

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Upstream { status, body } => {
                let code =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                if RelayError::is_expired_response(status, &body) {
                    AppError::new(code, "url_expired", "part upload URL has expired").retryable()
                } else if code.is_server_error() || code == StatusCode::TOO_MANY_REQUESTS {
                    AppError::new(code, "upstream", format!("storage rejected part: {}", body))
                        .retryable()
                } else {
                    AppError::new(code, "upstream", format!("storage rejected part: {}", body))
                }
            }
            RelayError::Network(msg) => {
                AppError::new(StatusCode::BAD_GATEWAY, "network", msg).retryable()
            }
            RelayError::Rejected(msg) => AppError::bad_request(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_and_integrity_are_client_errors() {
        let quota: AppError = ServiceError::QuotaExceeded("too big".into()).into();
        assert_eq!(quota.status, StatusCode::PAYLOAD_TOO_LARGE);
        let integrity: AppError = ServiceError::Integrity("missing part 4".into()).into();
        assert_eq!(integrity.status, StatusCode::CONFLICT);
        assert!(!integrity.retryable);
    }

    #[test]
    fn expired_part_url_is_distinguished_from_network_failure() {
        let expired: AppError = RelayError::Upstream {
            status: 403,
            body: "<Error><Code>AccessDenied</Code><Message>Request has expired</Message></Error>"
                .into(),
        }
        .into();
        assert_eq!(expired.kind, "url_expired");
        assert_eq!(expired.status, StatusCode::FORBIDDEN);
        assert!(expired.retryable);

        let network: AppError = RelayError::Network("connection reset".into()).into();
        assert_eq!(network.kind, "network");
        assert!(network.retryable);

        let quota: AppError = RelayError::Upstream {
            status: 403,
            body: "QuotaExceeded".into(),
        }
        .into();
        assert_eq!(quota.kind, "upstream");
        assert!(!quota.retryable);
    }

    #[test]
    fn database_details_do_not_leak() {
        let err: AppError = ServiceError::Database(sqlx::Error::PoolTimedOut).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "internal database error");
    }
}
