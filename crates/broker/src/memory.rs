//! In-memory topic broker and confirm-mode channel for tests and benches.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::topology::topic_matches;
use crate::{
    AckMode, BrokerChannel, BrokerError, Confirmation, ConfirmationStream, Delivery,
    DeliveryAcker, DeliveryStream, OutboundMessage, Result,
};

/// A message as it was accepted by the in-memory broker.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub content_type: String,
    pub correlation_id: String,
    pub delivery_mode: u8,
    pub body: Vec<u8>,
}

impl PublishedMessage {
    /// Returns the body as UTF-8 text, replacing invalid sequences.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    delivery_tag: u64,
    exchange: String,
    routing_key: String,
    correlation_id: String,
    redelivered: bool,
    body: Vec<u8>,
}

#[derive(Debug)]
struct QueueState {
    exchange: String,
    binding_key: String,
    next_tag: u64,
    tx: mpsc::UnboundedSender<QueuedMessage>,
}

impl QueueState {
    fn enqueue(&mut self, mut message: QueuedMessage) -> bool {
        self.next_tag += 1;
        message.delivery_tag = self.next_tag;
        self.tx.send(message).is_ok()
    }
}

#[derive(Debug, Default)]
struct InMemoryBrokerState {
    /// Exchange name to its durability.
    exchanges: HashMap<String, bool>,
    queues: HashMap<String, QueueState>,
    next_queue_id: u64,
    published: Vec<PublishedMessage>,
    acked: Vec<(String, u64)>,
    rejected: Vec<(String, u64, bool)>,
    closed: bool,
}

/// In-memory topic broker for testing.
///
/// Routes published messages to every bound queue whose binding key matches
/// the routing key, and records publishes and consumer acknowledgements so
/// tests can inspect them.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<InMemoryBrokerState>>,
}

impl InMemoryBroker {
    /// Creates a new empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new confirm-mode channel on this broker.
    pub fn channel(&self) -> InMemoryChannel {
        InMemoryChannel::new(self.clone())
    }

    /// Returns the number of declared exchanges.
    pub fn exchange_count(&self) -> usize {
        self.lock().exchanges.len()
    }

    /// Returns true if the exchange has been declared.
    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    /// Returns whether the exchange was declared durable, if it exists.
    pub fn exchange_durable(&self, name: &str) -> Option<bool> {
        self.lock().exchanges.get(name).copied()
    }

    /// Returns the number of live consumer queues.
    pub fn queue_count(&self) -> usize {
        self.lock().queues.len()
    }

    /// Returns every message accepted so far, in publish order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Returns the messages accepted for one exchange and routing key.
    pub fn published_to(&self, exchange: &str, routing_key: &str) -> Vec<PublishedMessage> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.exchange == exchange && m.routing_key == routing_key)
            .cloned()
            .collect()
    }

    /// Returns the number of deliveries consumers acknowledged.
    pub fn acked_count(&self) -> usize {
        self.lock().acked.len()
    }

    /// Returns the number of deliveries consumers rejected.
    pub fn rejected_count(&self) -> usize {
        self.lock().rejected.len()
    }

    /// Closes the broker: consumer streams end once drained and further
    /// operations fail with [`BrokerError::ChannelClosed`].
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.queues.clear();
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryBrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn declare(&self, name: &str, durable: bool) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(BrokerError::ChannelClosed);
        }
        match state.exchanges.get(name) {
            Some(existing) if *existing != durable => {
                return Err(BrokerError::ExchangeMismatch(name.to_string()));
            }
            Some(_) => {}
            None => {
                state.exchanges.insert(name.to_string(), durable);
            }
        }
        Ok(())
    }

    fn bind(
        &self,
        routing_key: &str,
        exchange: &str,
    ) -> Result<(String, mpsc::UnboundedReceiver<QueuedMessage>)> {
        let mut state = self.lock();
        if state.closed {
            return Err(BrokerError::ChannelClosed);
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::ExchangeNotFound(exchange.to_string()));
        }

        state.next_queue_id += 1;
        let name = format!("amq.gen-{:06}", state.next_queue_id);
        let (tx, rx) = mpsc::unbounded_channel();
        state.queues.insert(
            name.clone(),
            QueueState {
                exchange: exchange.to_string(),
                binding_key: routing_key.to_string(),
                next_tag: 0,
                tx,
            },
        );
        Ok((name, rx))
    }

    fn route(&self, exchange: &str, routing_key: &str, message: &OutboundMessage) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(BrokerError::ChannelClosed);
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::ExchangeNotFound(exchange.to_string()));
        }

        let queued = QueuedMessage {
            delivery_tag: 0,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            correlation_id: message.correlation_id.to_string(),
            redelivered: false,
            body: message.body.clone(),
        };

        // Queues whose consumer went away are auto-deleted.
        state.queues.retain(|_, queue| {
            if queue.exchange != exchange || !topic_matches(&queue.binding_key, routing_key) {
                return !queue.tx.is_closed();
            }
            queue.enqueue(queued.clone())
        });

        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            content_type: message.content_type.to_string(),
            correlation_id: message.correlation_id.to_string(),
            delivery_mode: message.delivery_mode,
            body: message.body.clone(),
        });
        Ok(())
    }

    fn record_ack(&self, queue: &str, delivery_tag: u64) {
        self.lock().acked.push((queue.to_string(), delivery_tag));
    }

    fn record_reject(&self, queue: &str, message: &QueuedMessage, requeue: bool) {
        let mut state = self.lock();
        state
            .rejected
            .push((queue.to_string(), message.delivery_tag, requeue));
        if requeue && let Some(q) = state.queues.get_mut(queue) {
            let mut again = message.clone();
            again.redelivered = true;
            q.enqueue(again);
        }
    }
}

struct InMemoryAcker {
    broker: InMemoryBroker,
    queue: String,
    message: QueuedMessage,
}

#[async_trait]
impl DeliveryAcker for InMemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.broker.record_ack(&self.queue, self.message.delivery_tag);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.broker.record_reject(&self.queue, &self.message, requeue);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct InMemoryChannelState {
    published: u64,
    nack_tags: HashSet<u64>,
    nack_all: bool,
    fail_next_publishes: u32,
    manual_confirms: bool,
    closed: bool,
}

#[derive(Debug)]
struct InMemoryChannelInner {
    broker: InMemoryBroker,
    state: Mutex<InMemoryChannelState>,
    confirm_tx: mpsc::UnboundedSender<Confirmation>,
    confirm_rx: Mutex<Option<mpsc::UnboundedReceiver<Confirmation>>>,
}

/// A confirm-mode channel on an [`InMemoryBroker`].
///
/// Every publish is positively confirmed unless the test asks otherwise
/// through [`nack_sequence`](Self::nack_sequence), [`set_nack_all`](Self::set_nack_all)
/// or manual confirmation.
#[derive(Debug, Clone)]
pub struct InMemoryChannel {
    inner: Arc<InMemoryChannelInner>,
}

impl InMemoryChannel {
    fn new(broker: InMemoryBroker) -> Self {
        let (confirm_tx, confirm_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(InMemoryChannelInner {
                broker,
                state: Mutex::new(InMemoryChannelState::default()),
                confirm_tx,
                confirm_rx: Mutex::new(Some(confirm_rx)),
            }),
        }
    }

    /// Makes the broker reject the publish with the given sequence number.
    pub fn nack_sequence(&self, delivery_tag: u64) {
        self.lock().nack_tags.insert(delivery_tag);
    }

    /// Makes the broker reject every publish while set.
    pub fn set_nack_all(&self, nack: bool) {
        self.lock().nack_all = nack;
    }

    /// Makes the next `count` publish calls fail locally.
    pub fn fail_next_publishes(&self, count: u32) {
        self.lock().fail_next_publishes = count;
    }

    /// Stops automatic confirmations; the test emits them with [`confirm`](Self::confirm).
    pub fn set_manual_confirms(&self, manual: bool) {
        self.lock().manual_confirms = manual;
    }

    /// Emits a confirmation for a sequence number.
    pub fn confirm(&self, confirmation: Confirmation) {
        let _ = self.inner.confirm_tx.send(confirmation);
    }

    /// Returns the number of publishes the channel has sent.
    pub fn published_count(&self) -> u64 {
        self.lock().published
    }

    /// Closes this channel; later publishes fail with [`BrokerError::ChannelClosed`].
    pub fn close(&self) {
        self.lock().closed = true;
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryChannelState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(&self, name: &str, durable: bool) -> Result<()> {
        if self.lock().closed {
            return Err(BrokerError::ChannelClosed);
        }
        self.inner.broker.declare(name, durable)
    }

    async fn bind_consumer_queue(
        &self,
        routing_key: &str,
        exchange: &str,
        ack_mode: AckMode,
    ) -> Result<DeliveryStream> {
        if self.lock().closed {
            return Err(BrokerError::ChannelClosed);
        }
        let (queue, rx) = self.inner.broker.bind(routing_key, exchange)?;
        tracing::debug!(%queue, %exchange, %routing_key, "in-memory queue bound");

        let broker = self.inner.broker.clone();
        let stream = futures_util::stream::unfold(rx, move |mut rx| {
            let broker = broker.clone();
            let queue = queue.clone();
            async move {
                let message = rx.recv().await?;
                let acker = Arc::new(InMemoryAcker {
                    broker,
                    queue,
                    message: message.clone(),
                });
                let delivery = Delivery::new(
                    message.delivery_tag,
                    message.exchange,
                    message.routing_key,
                    message.body,
                    ack_mode,
                    acker,
                )
                .with_correlation_id(Some(message.correlation_id))
                .with_redelivered(message.redelivered);
                Some((Ok(delivery), rx))
            }
        });
        Ok(Box::pin(stream))
    }

    fn next_publish_seq_no(&self) -> u64 {
        self.lock().published + 1
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(BrokerError::ChannelClosed);
        }
        if state.fail_next_publishes > 0 {
            state.fail_next_publishes -= 1;
            return Err(BrokerError::PublishFailed(
                "injected local publish failure".to_string(),
            ));
        }

        self.inner.broker.route(exchange, routing_key, &message)?;
        state.published += 1;
        let delivery_tag = state.published;

        if !state.manual_confirms {
            let ack = !(state.nack_all || state.nack_tags.remove(&delivery_tag));
            let _ = self.inner.confirm_tx.send(Confirmation { delivery_tag, ack });
        }
        Ok(())
    }

    fn confirmations(&self) -> Result<ConfirmationStream> {
        let rx = self
            .inner
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
