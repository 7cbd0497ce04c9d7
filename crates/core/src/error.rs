//! Structured error handling for gRPC services.
//!
//! Provides type-safe error handling with automatic conversion to gRPC Status codes.
//! Internal details are logged but never exposed to clients.

use std::fmt::Display;

use thiserror::Error;
use tonic::Status;
use tracing::error;

/// Application error type with automatic Status conversion.
///
/// Internal details are logged but sanitized messages are sent to clients.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Internal: {0}")]
    Internal(String),
}

impl AppError {
    /// Create an unauthenticated error with a caller-visible reason.
    pub fn unauthenticated(reason: impl Into<String>) -> Self {
        Self::Unauthenticated(reason.into())
    }

    pub fn permission_denied(reason: impl Into<String>) -> Self {
        Self::PermissionDenied(reason.into())
    }
}

impl From<AppError> for Status {
    fn from(error: AppError) -> Self {
        match &error {
            AppError::Unauthenticated(msg) => Status::unauthenticated(msg),
            AppError::PermissionDenied(msg) => Status::permission_denied(msg),
            AppError::Internal(msg) => {
                error!(error = %msg, "Internal error");
                Status::internal("Internal server error")
            }
        }
    }
}

/// Extension trait for converting errors to Status with logging.
pub trait StatusExt<T> {
    /// Convert error to internal Status with logging.
    ///
    /// # Errors
    /// Returns `Status::internal` with the provided message.
    fn status(self, msg: &'static str) -> Result<T, Status>;
}

impl<T, E: Display> StatusExt<T> for Result<T, E> {
    fn status(self, msg: &'static str) -> Result<T, Status> {
        self.map_err(|e| {
            error!(error = %e, "{msg}");
            Status::internal(msg)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_conversion_maps_correctly() {
        assert_eq!(
            Status::from(AppError::unauthenticated("missing metadata")).code(),
            tonic::Code::Unauthenticated
        );
        assert_eq!(
            Status::from(AppError::permission_denied("Insufficient permissions")).code(),
            tonic::Code::PermissionDenied
        );
    }

    #[test]
    fn unauthenticated_keeps_reason_visible() {
        let status = Status::from(AppError::unauthenticated("invalid or expired token"));
        assert_eq!(status.message(), "invalid or expired token");
    }

    #[test]
    fn internal_details_are_sanitized() {
        let status = Status::from(AppError::Internal("db password leaked".to_string()));
        assert_eq!(status.code(), tonic::Code::Internal);
        assert_eq!(status.message(), "Internal server error");
    }

    #[test]
    fn status_ext_maps_to_internal() {
        let result: Result<(), &str> = Err("boom");
        let status = result.status("Chain execution failed").unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert_eq!(status.message(), "Chain execution failed");
    }
}
