use async_trait::async_trait;

use crate::{AckMode, ConfirmationStream, DeliveryStream, OutboundMessage, Result};

/// A confirm-mode broker channel.
///
/// Publishes on a channel are numbered from 1 in the order they are sent;
/// the broker later acknowledges each number exactly once on the stream
/// returned by [`BrokerChannel::confirmations`].
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Ensures a topic exchange exists. Idempotent as long as `durable`
    /// matches the existing exchange.
    async fn declare_exchange(&self, name: &str, durable: bool) -> Result<()>;

    /// Creates a server-named, durable, auto-deleted, non-exclusive queue,
    /// binds it to `exchange` with `routing_key` and starts consuming.
    ///
    /// Every call creates a new queue, so two calls fan out each message
    /// to two independent consumers.
    async fn bind_consumer_queue(
        &self,
        routing_key: &str,
        exchange: &str,
        ack_mode: AckMode,
    ) -> Result<DeliveryStream>;

    /// Sequence number the next successful publish will be assigned.
    fn next_publish_seq_no(&self) -> u64;

    /// Publishes a message. Returning `Ok` does not mean the broker
    /// accepted it; that is reported later as a confirmation.
    async fn publish(&self, exchange: &str, routing_key: &str, message: OutboundMessage)
    -> Result<()>;

    /// Takes the confirmation stream of this channel. Can be called once.
    fn confirmations(&self) -> Result<ConfirmationStream>;
}
