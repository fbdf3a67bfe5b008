//! Messages exchanged with the broker: outbound publishes, inbound
//! deliveries and publisher confirmations.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use common::CorrelationId;
use futures_core::Stream;

use crate::Result;

/// AMQP delivery mode for messages that survive a broker restart.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Broker-level acknowledgement of a single publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    /// Sequence number the publish was assigned on its channel.
    pub delivery_tag: u64,
    /// `true` when the broker accepted the message, `false` on a nack.
    pub ack: bool,
}

impl Confirmation {
    /// A positive acknowledgement.
    pub fn ack(delivery_tag: u64) -> Self {
        Self {
            delivery_tag,
            ack: true,
        }
    }

    /// A negative acknowledgement.
    pub fn nack(delivery_tag: u64) -> Self {
        Self {
            delivery_tag,
            ack: false,
        }
    }
}

/// Stream of confirmations for one channel, in arrival order.
pub type ConfirmationStream = Pin<Box<dyn Stream<Item = Confirmation> + Send>>;

/// A message ready to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub content_type: &'static str,
    pub correlation_id: CorrelationId,
    pub delivery_mode: u8,
    /// Seconds since the Unix epoch at publish time.
    pub timestamp: u64,
    pub body: Vec<u8>,
}

impl OutboundMessage {
    /// Builds a persistent message with a fresh correlation ID.
    pub fn persistent(content_type: &'static str, body: Vec<u8>) -> Self {
        Self {
            content_type,
            correlation_id: CorrelationId::new(),
            delivery_mode: PERSISTENT_DELIVERY_MODE,
            timestamp: chrono::Utc::now().timestamp().max(0) as u64,
            body,
        }
    }
}

/// How a consumer acknowledges deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// The broker considers a delivery handled as soon as it is sent.
    Auto,
    /// The consumer must ack or reject each delivery.
    Manual,
}

impl AckMode {
    /// Returns true when the broker acknowledges on the consumer's behalf.
    pub fn is_auto(self) -> bool {
        matches!(self, AckMode::Auto)
    }
}

/// Consumer-side acknowledgement handle for one delivery.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    /// Tells the broker the delivery was processed.
    async fn ack(&self) -> Result<()>;

    /// Tells the broker the delivery was not processed.
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// A message received from a consumer queue.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub correlation_id: Option<String>,
    pub redelivered: bool,
    pub body: Vec<u8>,
    ack_mode: AckMode,
    acker: Arc<dyn DeliveryAcker>,
}

impl Delivery {
    /// Creates a delivery bound to its acknowledgement handle.
    pub fn new(
        delivery_tag: u64,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: Vec<u8>,
        ack_mode: AckMode,
        acker: Arc<dyn DeliveryAcker>,
    ) -> Self {
        Self {
            delivery_tag,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            correlation_id: None,
            redelivered: false,
            body,
            ack_mode,
            acker,
        }
    }

    /// Sets the correlation ID carried by the message.
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Marks the delivery as a redelivery.
    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Acknowledges the delivery. A no-op for auto-ack consumers.
    pub async fn ack(&self) -> Result<()> {
        if self.ack_mode.is_auto() {
            return Ok(());
        }
        self.acker.ack().await
    }

    /// Rejects the delivery. A no-op for auto-ack consumers.
    pub async fn reject(&self, requeue: bool) -> Result<()> {
        if self.ack_mode.is_auto() {
            return Ok(());
        }
        self.acker.reject(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("correlation_id", &self.correlation_id)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .field("ack_mode", &self.ack_mode)
            .finish()
    }
}

/// Lazy, unbounded stream of deliveries; ends when the connection closes.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistent_message_sets_publish_properties() {
        let msg = OutboundMessage::persistent("application/json", b"{}".to_vec());
        assert_eq!(msg.content_type, "application/json");
        assert_eq!(msg.delivery_mode, PERSISTENT_DELIVERY_MODE);
        assert!(msg.timestamp > 0);
    }

    #[test]
    fn each_message_gets_its_own_correlation_id() {
        let a = OutboundMessage::persistent("application/json", vec![]);
        let b = OutboundMessage::persistent("application/json", vec![]);
        assert_ne!(a.correlation_id, b.correlation_id);
    }
}
