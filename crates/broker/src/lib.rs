//! Topic broker plumbing for the order pipeline.
//!
//! The crate provides:
//! - Topology: durable topic exchanges and server-named consumer queues
//! - A [`BrokerChannel`] seam with in-memory and AMQP implementations
//! - The [`ReliablePublisher`], which tracks every publish until the broker
//!   confirms it and feeds rejected payloads back through a bounded,
//!   delayed [`RetryPath`]

pub mod amqp;
pub mod channel;
pub mod config;
pub mod error;
pub mod memory;
pub mod message;
pub mod payload;
pub mod pending;
pub mod publisher;
pub mod retry;
pub mod topology;
pub mod tracker;

pub use amqp::AmqpChannel;
pub use channel::BrokerChannel;
pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
pub use memory::{InMemoryBroker, InMemoryChannel, PublishedMessage};
pub use message::{
    AckMode, Confirmation, ConfirmationStream, Delivery, DeliveryAcker, DeliveryStream,
    OutboundMessage,
};
pub use payload::WirePayload;
pub use pending::{Attempt, PendingTable};
pub use publisher::{DrainReport, ReliablePublisher};
pub use retry::{RetryOffer, RetryPath, RetryPolicy};
pub use topology::{
    ExchangeSpec, INVENTORY_EXCHANGE, INVENTORY_INSTOCK_TOPIC, ORDER_CREATED_TOPIC,
    ORDER_EXCHANGE, Route, declare_topology,
};
pub use tracker::{ConfirmOutcome, ConfirmationTracker};
