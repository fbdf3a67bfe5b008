//! Stage error types.

use broker::BrokerError;
use common::OrderId;
use thiserror::Error;

/// Errors that can occur while running a pipeline stage.
#[derive(Debug, Error)]
pub enum StageError {
    /// Broker setup, consumption or acknowledgement failed.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// The availability check refused the order.
    #[error("Order {order_id} is not in stock: {reason}")]
    OutOfStock { order_id: OrderId, reason: String },

    /// The payment check refused the order.
    #[error("Payment declined for order {order_id}: {reason}")]
    PaymentDeclined { order_id: OrderId, reason: String },

    /// The stage's publisher is no longer accepting orders.
    #[error("Publisher stopped: {0}")]
    PublisherStopped(String),
}

/// Convenience type alias for stage results.
pub type Result<T> = std::result::Result<T, StageError>;
