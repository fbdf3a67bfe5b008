//! Integration tests running the inventory and payment stages against the
//! in-memory broker.

use std::time::Duration;

use broker::{
    AckMode, BrokerChannel, BrokerConfig, BrokerError, DeliveryStream, INVENTORY_EXCHANGE,
    INVENTORY_INSTOCK_TOPIC, InMemoryBroker, InMemoryChannel, ORDER_CREATED_TOPIC,
    ORDER_EXCHANGE, OutboundMessage, WirePayload,
};
use domain::{Item, Order, OrderRequest};
use futures_util::StreamExt;
use pipeline::{
    InMemoryInventoryService, InMemoryPaymentService, StageError, StageReport,
    run_inventory_stage, run_payment_stage,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(3);

fn order(user_id: &str) -> Order {
    Order::from_request(OrderRequest {
        user_id: user_id.to_string(),
        items: vec![Item::new("A", 10.0, 2.0), Item::new("B", 4.5, 1.0)],
    })
}

/// Test-side channel with both exchanges declared.
async fn client(broker: &InMemoryBroker) -> InMemoryChannel {
    let channel = broker.channel();
    channel.declare_exchange(ORDER_EXCHANGE, true).await.unwrap();
    channel.declare_exchange(INVENTORY_EXCHANGE, true).await.unwrap();
    channel
}

async fn observe_instock(channel: &InMemoryChannel) -> DeliveryStream {
    channel
        .bind_consumer_queue(INVENTORY_INSTOCK_TOPIC, INVENTORY_EXCHANGE, AckMode::Auto)
        .await
        .unwrap()
}

async fn send(channel: &InMemoryChannel, exchange: &str, routing_key: &str, body: Vec<u8>) {
    channel
        .publish(
            exchange,
            routing_key,
            OutboundMessage::persistent("application/json", body),
        )
        .await
        .unwrap();
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn spawn_inventory(
    broker: &InMemoryBroker,
    inventory: InMemoryInventoryService,
) -> (
    InMemoryChannel,
    oneshot::Sender<()>,
    JoinHandle<pipeline::Result<StageReport>>,
) {
    let channel = broker.channel();
    let (stop_tx, stop_rx) = oneshot::channel();
    let stage_channel = channel.clone();
    let handle = tokio::spawn(async move {
        let config = BrokerConfig::default();
        run_inventory_stage(stage_channel, inventory, &config, async move {
            let _ = stop_rx.await;
        })
        .await
    });
    (channel, stop_tx, handle)
}

fn spawn_payment(
    broker: &InMemoryBroker,
    payments: InMemoryPaymentService,
) -> (oneshot::Sender<()>, JoinHandle<pipeline::Result<StageReport>>) {
    let channel = broker.channel();
    let (stop_tx, stop_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        run_payment_stage(channel, payments, async move {
            let _ = stop_rx.await;
        })
        .await
    });
    (stop_tx, handle)
}

#[tokio::test]
async fn test_inventory_republishes_order_with_identical_fields() {
    let broker = InMemoryBroker::new();
    let client = client(&broker).await;
    let mut instock = observe_instock(&client).await;

    let (_stage_channel, stop, stage) = spawn_inventory(&broker, InMemoryInventoryService::new());
    wait_until(|| broker.queue_count() == 2).await;

    let original = order("u1");
    send(
        &client,
        ORDER_EXCHANGE,
        ORDER_CREATED_TOPIC,
        original.to_wire().unwrap(),
    )
    .await;

    let delivery = tokio::time::timeout(WAIT, instock.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(delivery.exchange, INVENTORY_EXCHANGE);
    assert_eq!(delivery.routing_key, INVENTORY_INSTOCK_TOPIC);
    let forwarded = Order::from_wire(&delivery.body).unwrap();
    assert_eq!(forwarded, original);

    let published = broker.published_to(INVENTORY_EXCHANGE, INVENTORY_INSTOCK_TOPIC);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].content_type, "application/json");
    assert_eq!(published[0].delivery_mode, 2);

    stop.send(()).unwrap();
    let report = stage.await.unwrap().unwrap();
    assert_eq!(report.received, 1);
    assert_eq!(report.processed, 1);
    assert_eq!(report.forwarded, 1);
    assert_eq!(report.rejected, 0);

    let publish = report.publish.unwrap();
    assert_eq!(publish.published, 1);
    assert_eq!(publish.abandoned, 0);
    assert_eq!(broker.acked_count(), 1);
}

#[tokio::test]
async fn test_order_flows_through_inventory_and_payment() {
    let broker = InMemoryBroker::new();
    let client = client(&broker).await;

    let inventory = InMemoryInventoryService::new();
    let payments = InMemoryPaymentService::new();
    let (_inventory_channel, stop_inventory, inventory_stage) =
        spawn_inventory(&broker, inventory.clone());
    let (stop_payment, payment_stage) = spawn_payment(&broker, payments.clone());
    wait_until(|| broker.queue_count() == 2).await;

    let order = order("u7");
    send(
        &client,
        ORDER_EXCHANGE,
        ORDER_CREATED_TOPIC,
        order.to_wire().unwrap(),
    )
    .await;

    wait_until(|| payments.authorized_count() == 1).await;
    assert_eq!(inventory.checked_count(), 1);
    assert!((payments.authorized_total("u7") - order.total()).abs() < f64::EPSILON);

    stop_inventory.send(()).unwrap();
    stop_payment.send(()).unwrap();
    let inventory_report = inventory_stage.await.unwrap().unwrap();
    let payment_report = payment_stage.await.unwrap().unwrap();

    assert_eq!(inventory_report.forwarded, 1);
    assert_eq!(payment_report.processed, 1);
    assert_eq!(payment_report.forwarded, 0);
    assert!(payment_report.publish.is_none());
    assert_eq!(broker.acked_count(), 2);
}

#[tokio::test]
async fn test_out_of_stock_order_is_rejected_and_not_forwarded() {
    let broker = InMemoryBroker::new();
    let client = client(&broker).await;

    let inventory = InMemoryInventoryService::new();
    inventory.set_out_of_stock(true);
    let (_stage_channel, stop, stage) = spawn_inventory(&broker, inventory);
    wait_until(|| broker.queue_count() == 1).await;

    send(
        &client,
        ORDER_EXCHANGE,
        ORDER_CREATED_TOPIC,
        order("u2").to_wire().unwrap(),
    )
    .await;
    wait_until(|| broker.rejected_count() == 1).await;

    stop.send(()).unwrap();
    let report = stage.await.unwrap().unwrap();
    assert_eq!(report.rejected, 1);
    assert_eq!(report.forwarded, 0);
    assert_eq!(report.publish.unwrap().published, 0);
    assert!(
        broker
            .published_to(INVENTORY_EXCHANGE, INVENTORY_INSTOCK_TOPIC)
            .is_empty()
    );
}

#[tokio::test]
async fn test_payment_rejects_malformed_delivery() {
    let broker = InMemoryBroker::new();
    let client = client(&broker).await;

    let payments = InMemoryPaymentService::new();
    let (stop, stage) = spawn_payment(&broker, payments.clone());
    wait_until(|| broker.queue_count() == 1).await;

    send(
        &client,
        INVENTORY_EXCHANGE,
        INVENTORY_INSTOCK_TOPIC,
        b"{\"userId\": 42".to_vec(),
    )
    .await;
    send(
        &client,
        INVENTORY_EXCHANGE,
        INVENTORY_INSTOCK_TOPIC,
        order("u3").to_wire().unwrap(),
    )
    .await;
    wait_until(|| payments.authorized_count() == 1).await;

    stop.send(()).unwrap();
    let report = stage.await.unwrap().unwrap();
    assert_eq!(report.received, 2);
    assert_eq!(report.rejected, 1);
    assert_eq!(report.processed, 1);
    assert_eq!(broker.rejected_count(), 1);
    assert_eq!(broker.acked_count(), 1);
}

#[tokio::test]
async fn test_nacked_forward_is_published_again() {
    let broker = InMemoryBroker::new();
    let client = client(&broker).await;
    let mut instock = observe_instock(&client).await;

    let (stage_channel, stop, stage) = spawn_inventory(&broker, InMemoryInventoryService::new());
    stage_channel.nack_sequence(1);
    wait_until(|| broker.queue_count() == 2).await;

    let original = order("u4");
    send(
        &client,
        ORDER_EXCHANGE,
        ORDER_CREATED_TOPIC,
        original.to_wire().unwrap(),
    )
    .await;

    // The broker routed the first copy before rejecting it; the retry is a
    // second copy of the same order.
    for _ in 0..2 {
        let delivery = tokio::time::timeout(WAIT, instock.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(Order::from_wire(&delivery.body).unwrap().id, original.id);
    }

    stop.send(()).unwrap();
    let report = stage.await.unwrap().unwrap();
    let publish = report.publish.unwrap();
    assert_eq!(publish.published, 2);
    assert_eq!(publish.settled, 2);
    assert_eq!(publish.abandoned, 0);
}

#[tokio::test]
async fn test_publisher_failure_is_reported_as_the_stage_error() {
    let broker = InMemoryBroker::new();
    let client = client(&broker).await;

    let (stage_channel, stop, stage) = spawn_inventory(&broker, InMemoryInventoryService::new());
    wait_until(|| broker.queue_count() == 1).await;
    stage_channel.close();

    send(
        &client,
        ORDER_EXCHANGE,
        ORDER_CREATED_TOPIC,
        order("u5").to_wire().unwrap(),
    )
    .await;
    wait_until(|| broker.acked_count() == 1).await;

    stop.send(()).unwrap();
    let result = stage.await.unwrap();
    assert!(matches!(
        result,
        Err(StageError::Broker(BrokerError::ChannelClosed))
    ));
    assert!(
        broker
            .published_to(INVENTORY_EXCHANGE, INVENTORY_INSTOCK_TOPIC)
            .is_empty()
    );
}
