//! Error category classification

use super::codes::ErrorCode;
use serde::{Deserialize, Serialize};

/// Error category classification based on error code ranges
///
/// - 0xxx: General errors
/// - 1xxx: Lock errors
/// - 2xxx: Scheduling state errors
/// - 3xxx: Remote API errors
/// - 9xxx: System errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// General errors (0xxx)
    General,
    /// Lock errors (1xxx)
    Lock,
    /// Scheduling state errors (2xxx)
    Scheduling,
    /// Remote API errors (3xxx)
    Remote,
    /// System errors (9xxx)
    System,
}

impl ErrorCategory {
    /// Determine category from error code value
    pub fn from_code(code: u16) -> Self {
        match code {
            0..1000 => Self::General,
            1000..2000 => Self::Lock,
            2000..3000 => Self::Scheduling,
            3000..4000 => Self::Remote,
            _ => Self::System,
        }
    }

    /// Transient categories are worth a bounded retry
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Remote | Self::System)
    }
}

impl From<ErrorCode> for ErrorCategory {
    fn from(code: ErrorCode) -> Self {
        Self::from_code(code.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_from_code() {
        assert_eq!(ErrorCategory::from(ErrorCode::NotFound), ErrorCategory::General);
        assert_eq!(ErrorCategory::from(ErrorCode::RepeatLock), ErrorCategory::Lock);
        assert_eq!(
            ErrorCategory::from(ErrorCode::InvalidOrderStatus),
            ErrorCategory::Scheduling
        );
        assert_eq!(ErrorCategory::from(ErrorCode::JobFailed), ErrorCategory::Remote);
        assert_eq!(ErrorCategory::from(ErrorCode::DatabaseError), ErrorCategory::System);
    }

    #[test]
    fn test_transient() {
        assert!(ErrorCategory::Remote.is_transient());
        assert!(!ErrorCategory::Scheduling.is_transient());
    }
}
