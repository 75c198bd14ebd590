//! Data models
//!
//! Persisted as JSON documents, one collection per model. All record ids are
//! plain integers except `sub_order_id`, which is a business-facing string.

pub mod apply_order;
pub mod device;
pub mod generate;
pub mod notice;
pub mod records;
pub mod ticket;

// Re-exports
pub use apply_order::*;
pub use device::*;
pub use generate::*;
pub use notice::*;
pub use records::*;
pub use ticket::*;
