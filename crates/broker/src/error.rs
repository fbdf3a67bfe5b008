use thiserror::Error;

/// Errors that can occur when talking to the broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The channel or its connection is gone; nothing more can be published.
    #[error("Broker channel closed")]
    ChannelClosed,

    /// A publish targeted an exchange the broker does not know.
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    /// An exchange was redeclared with different properties.
    #[error("Exchange {0} already exists with different properties")]
    ExchangeMismatch(String),

    /// A single publish call failed locally; the channel is still usable.
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// The confirmation stream of a channel can only be taken once.
    #[error("Confirmation stream already taken for this channel")]
    ConfirmationsTaken,

    /// Delivery acknowledgement failed.
    #[error("Delivery acknowledgement failed: {0}")]
    Ack(String),

    /// AMQP protocol or transport error.
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    /// Returns true when the error means the channel can no longer be used.
    pub fn is_fatal(&self) -> bool {
        match self {
            BrokerError::ChannelClosed | BrokerError::ConfirmationsTaken => true,
            BrokerError::Amqp(e) => matches!(
                e,
                lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_)
            ),
            _ => false,
        }
    }
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_channel_is_fatal() {
        assert!(BrokerError::ChannelClosed.is_fatal());
    }

    #[test]
    fn local_publish_failure_is_retryable() {
        assert!(!BrokerError::PublishFailed("socket busy".to_string()).is_fatal());
        assert!(!BrokerError::ExchangeNotFound("order.exchange".to_string()).is_fatal());
    }
}
