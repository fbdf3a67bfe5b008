//! The consume → check → acknowledge → forward loop shared by the stages.

use std::future::Future;

use async_trait::async_trait;
use broker::{Delivery, DeliveryStream, DrainReport, WirePayload};
use domain::Order;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::{Result, StageError};

/// The business step a stage applies to each order.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Stage name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Checks the order. An error means the order must not move on.
    async fn process(&self, order: &Order) -> Result<()>;
}

/// Counters describing one run of a stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageReport {
    pub received: u64,
    pub processed: u64,
    pub forwarded: u64,
    pub rejected: u64,
    /// Outcome of the stage's publisher, for stages that publish.
    pub publish: Option<DrainReport>,
}

/// Drives a [`StageHandler`] over a stream of broker deliveries.
///
/// Every delivery is acknowledged manually: valid orders are acked once the
/// handler succeeded, malformed bodies and refused orders are rejected
/// without requeue.
pub struct ConsumerStage<H> {
    handler: H,
}

impl<H: StageHandler> ConsumerStage<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    /// Consumes deliveries until the stream ends or `shutdown` resolves.
    ///
    /// Accepted orders are sent to `forward` when given; a closed `forward`
    /// channel stops the stage.
    pub async fn run<F>(
        &self,
        mut deliveries: DeliveryStream,
        forward: Option<&mpsc::Sender<Order>>,
        shutdown: F,
    ) -> Result<StageReport>
    where
        F: Future<Output = ()> + Send,
    {
        let stage = self.handler.name();
        let mut report = StageReport::default();
        tokio::pin!(shutdown);

        tracing::info!(stage, "stage is up and running");
        loop {
            let delivery = tokio::select! {
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        tracing::error!(stage, error = %e, "delivery stream failed");
                        return Err(e.into());
                    }
                    None => {
                        tracing::info!(stage, "delivery stream ended");
                        break;
                    }
                },
                () = &mut shutdown => {
                    tracing::info!(stage, "shutdown requested, stopping consumer");
                    break;
                }
            };

            report.received += 1;
            metrics::counter!("stage_deliveries_total", "stage" => stage).increment(1);
            self.handle(delivery, forward, &mut report).await?;
        }

        tracing::info!(
            stage,
            received = report.received,
            processed = report.processed,
            rejected = report.rejected,
            "stage stopped"
        );
        Ok(report)
    }

    async fn handle(
        &self,
        delivery: Delivery,
        forward: Option<&mpsc::Sender<Order>>,
        report: &mut StageReport,
    ) -> Result<()> {
        let stage = self.handler.name();

        let order = match Order::from_wire(&delivery.body) {
            Ok(order) => order,
            Err(e) => {
                tracing::warn!(
                    stage,
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "malformed order body, rejecting delivery"
                );
                delivery.reject(false).await?;
                report.rejected += 1;
                metrics::counter!("stage_deliveries_rejected_total", "stage" => stage)
                    .increment(1);
                return Ok(());
            }
        };

        tracing::info!(
            stage,
            order_id = %order.id,
            user_id = %order.user_id,
            items = order.items.len(),
            total = order.total(),
            redelivered = delivery.redelivered,
            "order received"
        );

        if let Err(e) = self.handler.process(&order).await {
            tracing::warn!(stage, order_id = %order.id, error = %e, "order refused, rejecting delivery");
            delivery.reject(false).await?;
            report.rejected += 1;
            metrics::counter!("stage_deliveries_rejected_total", "stage" => stage).increment(1);
            return Ok(());
        }

        // The delivery stays unacknowledged until the order is in the
        // publisher's hands.
        if let Some(forward) = forward {
            let order_id = order.id;
            if forward.send(order).await.is_err() {
                tracing::error!(stage, %order_id, "publisher stopped, requeueing delivery");
                delivery.reject(true).await?;
                return Err(StageError::PublisherStopped(format!(
                    "could not forward order {order_id}"
                )));
            }
            report.forwarded += 1;
        }

        delivery.ack().await?;
        report.processed += 1;
        Ok(())
    }
}
