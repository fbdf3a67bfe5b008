//! Broker-driven stages of the order pipeline.
//!
//! Orders flow through these stages:
//! 1. Inventory: consumes `order.created.topic`, checks availability and
//!    republishes to `inventory.instock.topic`
//! 2. Payment: consumes `inventory.instock.topic` and authorizes payment
//!    (terminal)
//!
//! Both stages acknowledge a delivery only after their check completed and
//! reject malformed or failed deliveries without requeueing them.

pub mod error;
pub mod inventory;
pub mod payment;
pub mod services;
pub mod stage;

pub use error::{Result, StageError};
pub use inventory::{InventoryStage, run_inventory_stage};
pub use payment::{PaymentStage, run_payment_stage};
pub use services::{
    InMemoryInventoryService, InMemoryPaymentService, InventoryService, PaymentService,
};
pub use stage::{ConsumerStage, StageHandler, StageReport};
