//! Payment stage: authorizes payment for orders that passed the inventory
//! check. Terminal stage of the pipeline.

use std::future::Future;

use async_trait::async_trait;
use broker::{
    AckMode, BrokerChannel, ExchangeSpec, INVENTORY_EXCHANGE,
    INVENTORY_INSTOCK_TOPIC, declare_topology,
};
use domain::Order;

use crate::Result;
use crate::services::PaymentService;
use crate::stage::{ConsumerStage, StageHandler, StageReport};

pub struct PaymentStage<P> {
    payments: P,
}

impl<P: PaymentService> PaymentStage<P> {
    pub fn new(payments: P) -> Self {
        Self { payments }
    }
}

#[async_trait]
impl<P: PaymentService> StageHandler for PaymentStage<P> {
    fn name(&self) -> &'static str {
        "payment"
    }

    async fn process(&self, order: &Order) -> Result<()> {
        self.payments.authorize(order).await
    }
}

/// Runs the payment stage on `channel` until `shutdown` resolves or the
/// broker closes the consumer.
#[tracing::instrument(skip_all)]
pub async fn run_payment_stage<C, P, F>(
    channel: C,
    payments: P,
    shutdown: F,
) -> Result<StageReport>
where
    C: BrokerChannel,
    P: PaymentService,
    F: Future<Output = ()> + Send,
{
    declare_topology(&channel, &[ExchangeSpec::durable(INVENTORY_EXCHANGE)]).await?;

    let deliveries = channel
        .bind_consumer_queue(INVENTORY_INSTOCK_TOPIC, INVENTORY_EXCHANGE, AckMode::Manual)
        .await?;

    ConsumerStage::new(PaymentStage::new(payments))
        .run(deliveries, None, shutdown)
        .await
}
