//! Unified error codes for the scheduler
//!
//! Error codes are organized by category:
//! - 0xxx: General errors
//! - 1xxx: Lock errors
//! - 2xxx: Order / scheduling state errors
//! - 3xxx: Remote API errors (automation, inventory, notification)
//! - 9xxx: System errors

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error code enum
///
/// All error codes are represented as u16 values so they survive a trip
/// through logs and JSON unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum ErrorCode {
    // ==================== 0xxx: General ====================
    /// Operation completed successfully
    Success = 0,
    /// Unknown error
    Unknown = 1,
    /// Validation failed
    ValidationFailed = 2,
    /// Resource not found
    NotFound = 3,
    /// Resource already exists
    AlreadyExists = 4,
    /// Invalid request
    InvalidRequest = 5,

    // ==================== 1xxx: Lock ====================
    /// Lock instance was already used for an acquisition
    RepeatLock = 1001,
    /// Lock could not be acquired within the retry budget
    LockFailed = 1002,

    // ==================== 2xxx: Scheduling ====================
    /// Apply order is not in a status that allows this operation
    InvalidOrderStatus = 2001,
    /// Generate record is not eligible for matching
    RecordNotEligible = 2002,
    /// Apply order not found
    OrderNotFound = 2003,
    /// Ticket not found
    TicketNotFound = 2004,
    /// Generate record not found
    GenerateRecordNotFound = 2005,

    // ==================== 3xxx: Remote ====================
    /// Remote API call failed
    RemoteError = 3001,
    /// Automation job failed or was revoked
    JobFailed = 3002,
    /// Automation job did not finish in time
    JobTimeout = 3003,
    /// Host could not be resolved in the inventory
    HostNotFound = 3004,
    /// Notification could not be delivered
    NotifyFailed = 3005,

    // ==================== 9xxx: System ====================
    /// Internal server error
    InternalError = 9001,
    /// Database error
    DatabaseError = 9002,
    /// Network error
    NetworkError = 9003,
    /// Operation timeout
    TimeoutError = 9004,
    /// Configuration error
    ConfigError = 9005,
    /// Change feed subscription failed
    WatchFailed = 9101,
}

impl ErrorCode {
    /// Get the numeric code value
    #[inline]
    pub const fn code(&self) -> u16 {
        *self as u16
    }

    /// Check if this is a success code
    #[inline]
    pub const fn is_success(&self) -> bool {
        matches!(self, ErrorCode::Success)
    }

    /// Whether the code means the addressed record does not exist
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            ErrorCode::NotFound
                | ErrorCode::OrderNotFound
                | ErrorCode::TicketNotFound
                | ErrorCode::GenerateRecordNotFound
                | ErrorCode::HostNotFound
        )
    }

    /// Get the developer-facing English message for this error code
    pub const fn message(&self) -> &'static str {
        match self {
            ErrorCode::Success => "Operation completed successfully",
            ErrorCode::Unknown => "An unknown error occurred",
            ErrorCode::ValidationFailed => "Validation failed",
            ErrorCode::NotFound => "Resource not found",
            ErrorCode::AlreadyExists => "Resource already exists",
            ErrorCode::InvalidRequest => "Invalid request",

            ErrorCode::RepeatLock => "Lock instance already used",
            ErrorCode::LockFailed => "Failed to acquire lock",

            ErrorCode::InvalidOrderStatus => "Apply order status does not allow this operation",
            ErrorCode::RecordNotEligible => "Generate record is not eligible for matching",
            ErrorCode::OrderNotFound => "Apply order not found",
            ErrorCode::TicketNotFound => "Apply ticket not found",
            ErrorCode::GenerateRecordNotFound => "Generate record not found",

            ErrorCode::RemoteError => "Remote API call failed",
            ErrorCode::JobFailed => "Automation job failed",
            ErrorCode::JobTimeout => "Automation job timed out",
            ErrorCode::HostNotFound => "Host not found in inventory",
            ErrorCode::NotifyFailed => "Notification failed",

            ErrorCode::InternalError => "Internal server error",
            ErrorCode::DatabaseError => "Database error",
            ErrorCode::NetworkError => "Network error",
            ErrorCode::TimeoutError => "Operation timed out",
            ErrorCode::ConfigError => "Configuration error",
            ErrorCode::WatchFailed => "Change feed subscription failed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{:04}", self.code())
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

/// Error returned when a numeric code does not map to a known [`ErrorCode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidErrorCode(pub u16);

impl fmt::Display for InvalidErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid error code: {}", self.0)
    }
}

impl std::error::Error for InvalidErrorCode {}

impl TryFrom<u16> for ErrorCode {
    type Error = InvalidErrorCode;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let code = match value {
            0 => ErrorCode::Success,
            1 => ErrorCode::Unknown,
            2 => ErrorCode::ValidationFailed,
            3 => ErrorCode::NotFound,
            4 => ErrorCode::AlreadyExists,
            5 => ErrorCode::InvalidRequest,
            1001 => ErrorCode::RepeatLock,
            1002 => ErrorCode::LockFailed,
            2001 => ErrorCode::InvalidOrderStatus,
            2002 => ErrorCode::RecordNotEligible,
            2003 => ErrorCode::OrderNotFound,
            2004 => ErrorCode::TicketNotFound,
            2005 => ErrorCode::GenerateRecordNotFound,
            3001 => ErrorCode::RemoteError,
            3002 => ErrorCode::JobFailed,
            3003 => ErrorCode::JobTimeout,
            3004 => ErrorCode::HostNotFound,
            3005 => ErrorCode::NotifyFailed,
            9001 => ErrorCode::InternalError,
            9002 => ErrorCode::DatabaseError,
            9003 => ErrorCode::NetworkError,
            9004 => ErrorCode::TimeoutError,
            9005 => ErrorCode::ConfigError,
            9101 => ErrorCode::WatchFailed,
            other => return Err(InvalidErrorCode(other)),
        };
        Ok(code)
    }
}
