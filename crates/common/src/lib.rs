//! Shared identifiers and process helpers for the order pipeline services.

pub mod shutdown;
pub mod types;

pub use shutdown::shutdown_signal;
pub use types::{CorrelationId, OrderId};
