//! Shared types for the resource scheduler
//!
//! Domain models (apply orders, tickets, generate records, devices, audit
//! records, notices), the unified error type, and id/time helpers used by
//! every scheduler component.

pub mod error;
pub mod models;
pub mod util;

// Re-exports
pub use error::{AppError, AppResult, ErrorCategory, ErrorCode};
pub use serde::{Deserialize, Serialize};
