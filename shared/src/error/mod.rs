//! Unified error system for the scheduler
//!
//! - [`ErrorCode`]: Standardized error codes for all error types
//! - [`ErrorCategory`]: Classification of errors by domain
//! - [`AppError`]: Rich error type with codes, messages, and details
//!
//! # Error Code Ranges
//!
//! - 0xxx: General errors
//! - 1xxx: Lock errors
//! - 2xxx: Scheduling state errors
//! - 3xxx: Remote API errors
//! - 9xxx: System errors
//!
//! # Example
//!
//! ```
//! use shared::error::{AppError, ErrorCode};
//!
//! let err = AppError::new(ErrorCode::OrderNotFound);
//! assert!(err.is_not_found());
//!
//! let err = AppError::invalid_state("order is Done").with_detail("sub_order_id", "so-1");
//! assert_eq!(err.code, ErrorCode::InvalidOrderStatus);
//! ```

mod category;
mod codes;
mod types;

pub use category::ErrorCategory;
pub use codes::{ErrorCode, InvalidErrorCode};
pub use types::{AppError, AppResult};
