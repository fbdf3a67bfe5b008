//! Delayed, bounded re-admission of rejected publishes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::{Attempt, WirePayload};

/// Tunables of the retry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait between a rejection and the re-admission attempt.
    pub delay: Duration,
    /// Number of payloads the retry queue holds before it sheds.
    pub capacity: usize,
    /// Publishes per payload before it is abandoned.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub const DEFAULT_DELAY: Duration = Duration::from_millis(500);
    pub const DEFAULT_CAPACITY: usize = 16;
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    pub fn new(delay: Duration, capacity: usize, max_attempts: u32) -> Self {
        Self {
            delay,
            capacity,
            max_attempts,
        }
    }

    /// Returns true when a payload that just failed `attempt` may be retried.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_DELAY,
            Self::DEFAULT_CAPACITY,
            Self::DEFAULT_MAX_ATTEMPTS,
        )
    }
}

/// Result of offering a payload to the retry queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOffer {
    Accepted,
    /// The queue was at capacity; the payload was dropped.
    DroppedFull,
    /// The consuming side is gone; the payload was dropped.
    DroppedClosed,
}

/// Producer side of the bounded retry queue.
///
/// Offers never block: a full queue sheds the payload with a diagnostic so
/// that confirmation handling keeps flowing.
#[derive(Debug)]
pub struct RetryPath<T> {
    policy: RetryPolicy,
    tx: mpsc::Sender<Attempt<T>>,
    scheduled: Arc<AtomicUsize>,
}

impl<T> Clone for RetryPath<T> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy,
            tx: self.tx.clone(),
            scheduled: Arc::clone(&self.scheduled),
        }
    }
}

impl<T: WirePayload> RetryPath<T> {
    /// Creates the retry queue, returning the producer and the receiving end
    /// the publish loop drains.
    pub fn new(policy: RetryPolicy) -> (Self, mpsc::Receiver<Attempt<T>>) {
        let (tx, rx) = mpsc::channel(policy.capacity.max(1));
        let path = Self {
            policy,
            tx,
            scheduled: Arc::new(AtomicUsize::new(0)),
        };
        (path, rx)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Number of retries sleeping before their admission attempt.
    pub fn in_flight(&self) -> usize {
        self.scheduled.load(Ordering::Acquire)
    }

    /// Tries to enqueue a payload right now without waiting for room.
    pub fn offer(&self, item: Attempt<T>) -> RetryOffer {
        match self.tx.try_send(item) {
            Ok(()) => {
                metrics::counter!("broker_retry_admitted_total").increment(1);
                RetryOffer::Accepted
            }
            Err(TrySendError::Full(item)) => {
                metrics::counter!("broker_retry_dropped_total").increment(1);
                tracing::warn!(
                    payload = %item.payload.describe(),
                    attempt = item.attempt,
                    capacity = self.policy.capacity,
                    "retry queue full, dropping payload"
                );
                RetryOffer::DroppedFull
            }
            Err(TrySendError::Closed(item)) => {
                metrics::counter!("broker_retry_dropped_total").increment(1);
                tracing::warn!(
                    payload = %item.payload.describe(),
                    attempt = item.attempt,
                    "retry queue closed, dropping payload"
                );
                RetryOffer::DroppedClosed
            }
        }
    }

    /// Offers a payload after the policy delay on a background task.
    pub fn schedule(&self, item: Attempt<T>) {
        metrics::counter!("broker_retry_scheduled_total").increment(1);
        self.scheduled.fetch_add(1, Ordering::AcqRel);

        let path = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(path.policy.delay).await;
            let attempt = item.attempt;
            if path.offer(item) == RetryOffer::Accepted {
                tracing::info!(attempt, "payload re-queued for retry");
            }
            path.scheduled.fetch_sub(1, Ordering::AcqRel);
        });
    }
}
