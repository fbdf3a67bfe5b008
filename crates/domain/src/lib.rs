//! Domain types for the order pipeline.
//!
//! An [`Order`] is created once at the HTTP boundary and then travels
//! unchanged through every stage as a JSON message body.

pub mod order;

pub use order::{Item, Order, OrderRequest, ProductCode};
