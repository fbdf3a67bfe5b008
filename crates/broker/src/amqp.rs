//! AMQP 0-9-1 channel backed by lapin, running in publisher-confirm mode.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation as LapinConfirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::mpsc;

use crate::{
    AckMode, BrokerChannel, BrokerError, Confirmation, ConfirmationStream, Delivery,
    DeliveryAcker, DeliveryStream, OutboundMessage, Result,
};

struct LapinAcker(Acker);

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}

/// A lapin channel in confirm mode.
///
/// lapin resolves a future per publish; each one is awaited on its own task
/// and forwarded, tagged with the publish sequence number, to the channel's
/// confirmation stream.
#[derive(Clone)]
pub struct AmqpChannel {
    channel: lapin::Channel,
    published: Arc<AtomicU64>,
    confirm_tx: mpsc::UnboundedSender<Confirmation>,
    confirm_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<Confirmation>>>>,
}

impl AmqpChannel {
    /// Connects to the broker, opens a channel and enables publisher confirms.
    ///
    /// The returned connection must be kept alive for as long as the channel
    /// is used.
    #[tracing::instrument(skip(url))]
    pub async fn connect(url: &str) -> Result<(Connection, Self)> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        tracing::info!("connected to broker");

        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        tracing::info!(channel_id = channel.id(), "channel open in confirm mode");

        Ok((connection, Self::from_channel(channel)))
    }

    /// Wraps a channel that is already in confirm mode.
    pub fn from_channel(channel: lapin::Channel) -> Self {
        let (confirm_tx, confirm_rx) = mpsc::unbounded_channel();
        Self {
            channel,
            published: Arc::new(AtomicU64::new(0)),
            confirm_tx,
            confirm_rx: Arc::new(Mutex::new(Some(confirm_rx))),
        }
    }

    /// Closes the channel.
    pub async fn close(&self) -> Result<()> {
        self.channel.close(200, "shutdown").await?;
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, name: &str, durable: bool) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_consumer_queue(
        &self,
        routing_key: &str,
        exchange: &str,
        ack_mode: AckMode,
    ) -> Result<DeliveryStream> {
        let queue = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    durable: true,
                    auto_delete: true,
                    exclusive: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        let queue_name = queue.name().as_str().to_string();

        self.channel
            .queue_bind(
                &queue_name,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let consumer = self
            .channel
            .basic_consume(
                &queue_name,
                "",
                BasicConsumeOptions {
                    no_ack: ack_mode.is_auto(),
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        tracing::info!(queue = %queue_name, %exchange, %routing_key, ?ack_mode, "consuming");

        let stream = consumer.map(move |result| {
            result.map_err(BrokerError::from).map(|delivery| {
                let correlation_id = delivery
                    .properties
                    .correlation_id()
                    .as_ref()
                    .map(|id| id.as_str().to_string());
                Delivery::new(
                    delivery.delivery_tag,
                    delivery.exchange.as_str(),
                    delivery.routing_key.as_str(),
                    delivery.data,
                    ack_mode,
                    Arc::new(LapinAcker(delivery.acker)),
                )
                .with_correlation_id(correlation_id)
                .with_redelivered(delivery.redelivered)
            })
        });
        Ok(Box::pin(stream))
    }

    fn next_publish_seq_no(&self) -> u64 {
        self.published.load(Ordering::Acquire) + 1
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type(message.content_type.to_string().into())
            .with_correlation_id(message.correlation_id.to_string().into())
            .with_delivery_mode(message.delivery_mode)
            .with_timestamp(message.timestamp);

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?;
        let delivery_tag = self.published.fetch_add(1, Ordering::AcqRel) + 1;

        let confirm_tx = self.confirm_tx.clone();
        tokio::spawn(async move {
            let ack = match confirm.await {
                Ok(LapinConfirmation::Nack(_)) => false,
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(delivery_tag, error = %e, "publisher confirm failed");
                    false
                }
            };
            let _ = confirm_tx.send(Confirmation { delivery_tag, ack });
        });
        Ok(())
    }

    fn confirmations(&self) -> Result<ConfirmationStream> {
        let rx = self
            .confirm_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(BrokerError::ConfirmationsTaken)?;
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|confirmation| (confirmation, rx))
        });
        Ok(Box::pin(stream))
    }
}
