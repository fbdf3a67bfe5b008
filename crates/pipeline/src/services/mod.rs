//! Business checks applied by the stages, with in-memory implementations.

pub mod inventory;
pub mod payment;

pub use inventory::{InMemoryInventoryService, InventoryService};
pub use payment::{InMemoryPaymentService, PaymentService};
