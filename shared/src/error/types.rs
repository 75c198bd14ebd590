//! Error types

use super::category::ErrorCategory;
use super::codes::ErrorCode;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Application error with structured error code and details
///
/// This is the primary error type shared by every scheduler component:
/// - Standardized error codes via [`ErrorCode`]
/// - Human-readable messages
/// - Optional structured details for debugging
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct AppError {
    /// The error code identifying the type of error
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Optional additional details (ids, remote responses, ...)
    pub details: Option<HashMap<String, Value>>,
}

impl AppError {
    /// Create a new error with the default message for the error code
    pub fn new(code: ErrorCode) -> Self {
        Self {
            message: code.message().to_string(),
            code,
            details: None,
        }
    }

    /// Create a new error with a custom message
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Add a detail entry to this error
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Category of this error
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self.code)
    }

    /// Whether the addressed record does not exist
    pub fn is_not_found(&self) -> bool {
        self.code.is_not_found()
    }

    // ==================== Convenience constructors ====================

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::ValidationFailed, msg)
    }

    /// Create a not found error
    pub fn not_found(resource: impl Into<String>) -> Self {
        let r = resource.into();
        Self::with_message(ErrorCode::NotFound, format!("{} not found", r))
            .with_detail("resource", r)
    }

    /// Create an invalid order status error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::InvalidOrderStatus, msg)
    }

    /// Create a remote API error
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::RemoteError, msg)
    }

    /// Create a database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::DatabaseError, msg)
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::InternalError, msg)
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::ConfigError, msg)
    }

    /// Lock instance was already used
    pub fn repeat_lock() -> Self {
        Self::new(ErrorCode::RepeatLock)
    }

    /// Lock could not be acquired
    pub fn lock_failed(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::LockFailed, msg)
    }
}

impl From<ErrorCode> for AppError {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_message(ErrorCode::InvalidRequest, format!("JSON error: {err}"))
    }
}

/// Result type alias using [`AppError`]
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_new() {
        let err = AppError::new(ErrorCode::NotFound);
        assert_eq!(err.code, ErrorCode::NotFound);
        assert_eq!(err.message, "Resource not found");
        assert!(err.details.is_none());
    }

    #[test]
    fn test_app_error_with_detail() {
        let err = AppError::invalid_state("order is Done")
            .with_detail("sub_order_id", "so-1")
            .with_detail("status", "Done");
        let details = err.details.as_ref().unwrap();
        assert_eq!(details.get("sub_order_id"), Some(&Value::from("so-1")));
        assert_eq!(details.len(), 2);
    }

    #[test]
    fn test_not_found_is_distinguishable() {
        assert!(AppError::not_found("apply order so-1").is_not_found());
        assert!(AppError::new(ErrorCode::OrderNotFound).is_not_found());
        assert!(!AppError::database("disk full").is_not_found());
    }

    #[test]
    fn test_app_error_display() {
        let err = AppError::lock_failed("keys busy");
        assert_eq!(err.to_string(), "keys busy");
        assert_eq!(AppError::repeat_lock().code, ErrorCode::RepeatLock);
    }
}
