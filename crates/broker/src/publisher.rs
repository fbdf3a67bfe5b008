//! Confirm-tracked publishing with delayed retry of rejected payloads.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::{
    Attempt, BrokerChannel, ConfirmOutcome, ConfirmationStream, ConfirmationTracker,
    OutboundMessage, PendingTable, Result, RetryPath, RetryPolicy, Route, WirePayload,
};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Summary returned once the publish loop stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Publish calls that succeeded, retries included.
    pub published: u64,
    /// Publishes settled by a broker confirmation.
    pub settled: u64,
    /// Publishes still unconfirmed when the loop stopped.
    pub abandoned: usize,
}

struct PublishState<C, T> {
    channel: C,
    route: Route,
    pending: PendingTable<T>,
    tracker: ConfirmationTracker<T>,
}

impl<C: BrokerChannel, T: WirePayload> PublishState<C, T> {
    async fn publish(&mut self, item: Attempt<T>) -> Result<Option<u64>> {
        let body = match item.payload.to_wire() {
            Ok(body) => body,
            Err(e) => {
                metrics::counter!("payload_serialization_failed_total").increment(1);
                tracing::warn!(
                    error = %e,
                    payload = %item.payload.describe(),
                    "failed to serialize payload, dropping"
                );
                return Ok(None);
            }
        };

        let delivery_tag = self.channel.next_publish_seq_no();
        let message = OutboundMessage::persistent(T::CONTENT_TYPE, body);
        let correlation_id = message.correlation_id;

        match self
            .channel
            .publish(&self.route.exchange, &self.route.routing_key, message)
            .await
        {
            Ok(()) => {
                metrics::counter!("broker_publish_total").increment(1);
                tracing::debug!(
                    delivery_tag,
                    %correlation_id,
                    route = %self.route,
                    attempt = item.attempt,
                    "payload published"
                );
                self.pending.track(delivery_tag, item);
                Ok(Some(delivery_tag))
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(error = %e, route = %self.route, "publish channel unusable");
                Err(e)
            }
            Err(e) => {
                metrics::counter!("broker_publish_failed_total").increment(1);
                tracing::warn!(
                    error = %e,
                    payload = %item.payload.describe(),
                    attempt = item.attempt,
                    "publish call failed"
                );
                self.tracker.retry_or_abandon(item);
                Ok(None)
            }
        }
    }

    fn report(&self) -> DrainReport {
        DrainReport {
            published: self.pending.tracked_total(),
            settled: self.pending.settled_total(),
            abandoned: self.pending.len(),
        }
    }
}

/// Publishes payloads of one type to one route and keeps each publish
/// pending until the broker confirms it.
///
/// The publisher owns its pending table. Publishing, retry admission and
/// confirmation handling all happen on the task driving
/// [`publish_all`](Self::publish_all), so the table needs no lock and a
/// confirmation is never processed before its publish was recorded.
pub struct ReliablePublisher<C, T> {
    state: PublishState<C, T>,
    retry_rx: mpsc::Receiver<Attempt<T>>,
    confirmations: ConfirmationStream,
    drain_timeout: Duration,
}

impl<C: BrokerChannel, T: WirePayload> ReliablePublisher<C, T> {
    pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

    /// Creates a publisher, taking over the channel's confirmation stream.
    ///
    /// Confirmations are buffered by the channel from the moment it enters
    /// confirm mode, so none is lost before the publish loop starts.
    pub fn new(channel: C, route: Route, policy: RetryPolicy) -> Result<Self> {
        let confirmations = channel.confirmations()?;
        let (retry, retry_rx) = RetryPath::new(policy);
        Ok(Self {
            state: PublishState {
                channel,
                route,
                pending: PendingTable::new(),
                tracker: ConfirmationTracker::new(retry),
            },
            retry_rx,
            confirmations,
            drain_timeout: Self::DEFAULT_DRAIN_TIMEOUT,
        })
    }

    /// Sets how long shutdown waits for outstanding confirmations.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn route(&self) -> &Route {
        &self.state.route
    }

    pub fn pending(&self) -> &PendingTable<T> {
        &self.state.pending
    }

    /// Publishes a single payload and records it as pending.
    ///
    /// Returns the sequence number, or `None` when the payload was dropped
    /// (unserializable) or handed to the retry path (local publish failure).
    /// Fails only when the channel can no longer be used.
    pub async fn publish(&mut self, payload: T) -> Result<Option<u64>> {
        self.state.publish(Attempt::first(payload)).await
    }

    /// Waits for the next confirmation and applies it to the pending table.
    pub async fn process_next_confirmation(&mut self) -> Option<ConfirmOutcome> {
        let confirmation = self.confirmations.next().await?;
        Some(self.state.tracker.handle(&mut self.state.pending, confirmation))
    }

    /// Receives the next payload re-admitted by the retry path.
    pub async fn next_retry(&mut self) -> Option<Attempt<T>> {
        self.retry_rx.recv().await
    }

    /// Publishes everything arriving on `input` until it closes, settling
    /// confirmations and re-publishing retried payloads along the way.
    ///
    /// Once `input` closes the loop keeps running until every publish is
    /// confirmed and no retry is outstanding, or the drain timeout elapses.
    /// Returns an error only if the channel becomes unusable.
    #[tracing::instrument(skip_all, fields(route = %self.state.route))]
    pub async fn publish_all(self, mut input: mpsc::Receiver<T>) -> Result<DrainReport> {
        let Self {
            mut state,
            mut retry_rx,
            mut confirmations,
            drain_timeout,
        } = self;

        let mut input_open = true;
        let mut drain_deadline: Option<Instant> = None;

        tracing::info!("publisher started");
        loop {
            if !input_open
                && state.pending.is_empty()
                && state.tracker.retry_path().in_flight() == 0
                && retry_rx.is_empty()
            {
                tracing::info!("publisher drained");
                break;
            }

            tokio::select! {
                payload = input.recv(), if input_open => match payload {
                    Some(payload) => {
                        state.publish(Attempt::first(payload)).await?;
                    }
                    None => {
                        input_open = false;
                        drain_deadline = Some(Instant::now() + drain_timeout);
                        tracing::info!(
                            pending = state.pending.len(),
                            "input closed, draining in-flight publishes"
                        );
                    }
                },
                Some(item) = retry_rx.recv() => {
                    state.publish(item).await?;
                }
                confirmation = confirmations.next() => match confirmation {
                    Some(confirmation) => {
                        state.tracker.handle(&mut state.pending, confirmation);
                    }
                    None => {
                        tracing::warn!("confirmation stream ended");
                        break;
                    }
                },
                () = tokio::time::sleep_until(drain_deadline.unwrap_or_else(Instant::now)),
                    if drain_deadline.is_some() =>
                {
                    tracing::warn!(
                        pending = ?state.pending.delivery_tags(),
                        "drain timeout elapsed with unconfirmed publishes"
                    );
                    break;
                }
                () = tokio::time::sleep(DRAIN_POLL_INTERVAL), if !input_open => {}
            }
        }

        let report = state.report();
        if report.abandoned > 0 {
            tracing::warn!(abandoned = report.abandoned, "publisher stopped with pending entries");
        }
        tracing::info!(
            published = report.published,
            settled = report.settled,
            "publisher stopped"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use serde::ser::Error as _;

    use super::*;
    use crate::{BrokerError, InMemoryBroker, InMemoryChannel};

    #[derive(Debug, Clone, PartialEq)]
    struct Parcel {
        id: u32,
        broken: bool,
    }

    impl Parcel {
        fn new(id: u32) -> Self {
            Self { id, broken: false }
        }

        fn broken(id: u32) -> Self {
            Self { id, broken: true }
        }
    }

    impl WirePayload for Parcel {
        fn to_wire(&self) -> std::result::Result<Vec<u8>, serde_json::Error> {
            if self.broken {
                return Err(serde_json::Error::custom("parcel cannot be encoded"));
            }
            serde_json::to_vec(&serde_json::json!({ "id": self.id }))
        }

        fn from_wire(body: &[u8]) -> std::result::Result<Self, serde_json::Error> {
            let value: serde_json::Value = serde_json::from_slice(body)?;
            Ok(Parcel::new(value["id"].as_u64().unwrap_or_default() as u32))
        }

        fn describe(&self) -> String {
            format!("parcel-{}", self.id)
        }
    }

    async fn setup() -> (InMemoryBroker, InMemoryChannel) {
        let broker = InMemoryBroker::new();
        let channel = broker.channel();
        channel.declare_exchange("parcel.exchange", true).await.unwrap();
        (broker, channel)
    }

    fn route() -> Route {
        Route::new("parcel.exchange", "parcel.sent.topic")
    }

    #[tokio::test]
    async fn test_publish_tracks_entry_until_confirmed() {
        let (broker, channel) = setup().await;
        let mut publisher = ReliablePublisher::new(channel, route(), RetryPolicy::default()).unwrap();

        let tag = publisher.publish(Parcel::new(1)).await.unwrap().unwrap();
        assert_eq!(tag, 1);
        assert_eq!(publisher.pending().len(), 1);
        assert_eq!(publisher.pending().get(1).unwrap().payload, Parcel::new(1));

        let outcome = publisher.process_next_confirmation().await.unwrap();
        assert_eq!(outcome, ConfirmOutcome::Acked);
        assert!(publisher.pending().is_empty());

        let published = broker.published_to("parcel.exchange", "parcel.sent.topic");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].content_type, "application/json");
        assert_eq!(published[0].delivery_mode, 2);
        assert_eq!(published[0].body_text(), "{\"id\":1}");
    }

    #[tokio::test]
    async fn test_sequence_numbers_increase_per_publish() {
        let (_broker, channel) = setup().await;
        channel.set_manual_confirms(true);
        let mut publisher = ReliablePublisher::new(channel, route(), RetryPolicy::default()).unwrap();

        for id in 1..=3 {
            publisher.publish(Parcel::new(id)).await.unwrap();
        }
        assert_eq!(publisher.pending().delivery_tags(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unserializable_payload_is_dropped() {
        let (broker, channel) = setup().await;
        let mut publisher = ReliablePublisher::new(channel, route(), RetryPolicy::default()).unwrap();

        let result = publisher.publish(Parcel::broken(1)).await.unwrap();
        assert!(result.is_none());
        assert!(publisher.pending().is_empty());
        assert!(broker.published().is_empty());

        // The dropped payload does not consume a sequence number.
        assert_eq!(publisher.publish(Parcel::new(2)).await.unwrap(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_publish_failure_goes_through_retry_path() {
        let (_broker, channel) = setup().await;
        channel.fail_next_publishes(1);
        let mut publisher =
            ReliablePublisher::new(channel.clone(), route(), RetryPolicy::default()).unwrap();

        assert!(publisher.publish(Parcel::new(5)).await.unwrap().is_none());
        assert!(publisher.pending().is_empty());

        let retry = publisher.next_retry().await.unwrap();
        assert_eq!(retry.payload, Parcel::new(5));
        assert_eq!(retry.attempt, 2);
    }

    #[tokio::test]
    async fn test_closed_channel_is_fatal() {
        let (_broker, channel) = setup().await;
        channel.close();
        let mut publisher =
            ReliablePublisher::new(channel, route(), RetryPolicy::default()).unwrap();

        let result = publisher.publish(Parcel::new(1)).await;
        assert!(matches!(result, Err(BrokerError::ChannelClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_all_republishes_nacked_payload() {
        let (broker, channel) = setup().await;
        channel.nack_sequence(1);
        let publisher =
            ReliablePublisher::new(channel.clone(), route(), RetryPolicy::default()).unwrap();

        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(publisher.publish_all(rx));
        tx.send(Parcel::new(42)).await.unwrap();
        drop(tx);

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.published, 2);
        assert_eq!(report.settled, 2);
        assert_eq!(report.abandoned, 0);

        let published = broker.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].body, published[1].body);
        assert_ne!(published[0].correlation_id, published[1].correlation_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_all_gives_up_after_max_attempts() {
        let (broker, channel) = setup().await;
        channel.set_nack_all(true);
        let publisher =
            ReliablePublisher::new(channel.clone(), route(), RetryPolicy::default()).unwrap();

        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(publisher.publish_all(rx));
        tx.send(Parcel::new(7)).await.unwrap();
        drop(tx);

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.published, 3);
        assert_eq!(report.abandoned, 0);
        assert_eq!(broker.published().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_all_stops_at_drain_timeout() {
        let (_broker, channel) = setup().await;
        channel.set_manual_confirms(true);
        let publisher = ReliablePublisher::new(channel.clone(), route(), RetryPolicy::default())
            .unwrap()
            .with_drain_timeout(Duration::from_secs(1));

        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(publisher.publish_all(rx));
        tx.send(Parcel::new(1)).await.unwrap();
        tx.send(Parcel::new(2)).await.unwrap();
        drop(tx);

        let started = Instant::now();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.published, 2);
        assert_eq!(report.abandoned, 2);
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_all_settles_out_of_order_confirmations() {
        let (_broker, channel) = setup().await;
        channel.set_manual_confirms(true);
        let publisher =
            ReliablePublisher::new(channel.clone(), route(), RetryPolicy::default()).unwrap();

        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(publisher.publish_all(rx));
        for id in 1..=3 {
            tx.send(Parcel::new(id)).await.unwrap();
        }
        drop(tx);

        while channel.published_count() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        channel.confirm(crate::Confirmation::ack(3));
        channel.confirm(crate::Confirmation::ack(1));
        channel.confirm(crate::Confirmation::ack(2));

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.settled, 3);
        assert_eq!(report.abandoned, 0);
    }
}
