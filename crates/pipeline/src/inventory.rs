//! Inventory stage: checks availability of newly created orders and
//! forwards them to payment.

use std::future::Future;

use async_trait::async_trait;
use broker::{
    AckMode, BrokerChannel, BrokerConfig, ExchangeSpec, INVENTORY_EXCHANGE, ORDER_CREATED_TOPIC,
    ORDER_EXCHANGE, ReliablePublisher, Route, declare_topology,
};
use domain::Order;
use tokio::sync::mpsc;

use crate::services::InventoryService;
use crate::stage::{ConsumerStage, StageHandler, StageReport};
use crate::{Result, StageError};

/// Stage handler running the availability check.
pub struct InventoryStage<I> {
    inventory: I,
}

impl<I: InventoryService> InventoryStage<I> {
    pub fn new(inventory: I) -> Self {
        Self { inventory }
    }
}

#[async_trait]
impl<I: InventoryService> StageHandler for InventoryStage<I> {
    fn name(&self) -> &'static str {
        "inventory"
    }

    async fn process(&self, order: &Order) -> Result<()> {
        self.inventory.check_availability(order).await
    }
}

/// Runs the inventory stage on `channel` until `shutdown` resolves or the
/// broker closes the consumer.
///
/// The publisher takes over the channel's confirmations before the stage
/// consumes anything, and is drained after the consumer stopped.
#[tracing::instrument(skip_all)]
pub async fn run_inventory_stage<C, I, F>(
    channel: C,
    inventory: I,
    config: &BrokerConfig,
    shutdown: F,
) -> Result<StageReport>
where
    C: BrokerChannel + Clone + 'static,
    I: InventoryService,
    F: Future<Output = ()> + Send,
{
    declare_topology(
        &channel,
        &[
            ExchangeSpec::durable(ORDER_EXCHANGE),
            ExchangeSpec::durable(INVENTORY_EXCHANGE),
        ],
    )
    .await?;

    let publisher = ReliablePublisher::<C, Order>::new(
        channel.clone(),
        Route::inventory_instock(),
        config.retry,
    )?
    .with_drain_timeout(config.drain_timeout);
    let (tx, rx) = mpsc::channel(config.publish_buffer);
    let publishing = tokio::spawn(publisher.publish_all(rx));

    let deliveries = channel
        .bind_consumer_queue(ORDER_CREATED_TOPIC, ORDER_EXCHANGE, AckMode::Manual)
        .await?;

    let stage = ConsumerStage::new(InventoryStage::new(inventory));
    let consumed = stage.run(deliveries, Some(&tx), shutdown).await;

    drop(tx);
    let drained = publishing
        .await
        .map_err(|e| StageError::PublisherStopped(e.to_string()))?;

    // A publisher failure is the root cause of any forwarding error.
    let publish = match drained {
        Ok(publish) => publish,
        Err(e) => {
            if let Err(consumer) = &consumed {
                tracing::warn!(error = %consumer, "consumer stopped after publisher failure");
            }
            tracing::error!(error = %e, "inventory publisher failed");
            return Err(e.into());
        }
    };

    let mut report = consumed?;
    report.publish = Some(publish);
    Ok(report)
}
