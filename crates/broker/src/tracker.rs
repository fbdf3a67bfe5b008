//! Correlation of broker confirmations with pending publishes.

use crate::{Attempt, Confirmation, PendingTable, RetryPath, WirePayload};

/// What handling one confirmation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// Broker accepted the publish; entry removed.
    Acked,
    /// Broker rejected the publish; entry removed and a delayed retry scheduled.
    RetryScheduled,
    /// Broker rejected the publish and the payload is out of attempts.
    Abandoned,
    /// No pending entry for the sequence number (duplicate or already handled).
    Unknown,
}

/// Settles pending publishes as the broker confirms them.
///
/// Handling never waits: rejected payloads are handed to the retry path's
/// delayed admission, so one nack cannot stall the confirmations behind it.
#[derive(Debug, Clone)]
pub struct ConfirmationTracker<T> {
    retry: RetryPath<T>,
}

impl<T: WirePayload> ConfirmationTracker<T> {
    pub fn new(retry: RetryPath<T>) -> Self {
        Self { retry }
    }

    pub fn retry_path(&self) -> &RetryPath<T> {
        &self.retry
    }

    /// Applies one confirmation to the pending table.
    pub fn handle(
        &self,
        pending: &mut PendingTable<T>,
        confirmation: Confirmation,
    ) -> ConfirmOutcome {
        let delivery_tag = confirmation.delivery_tag;
        let Some(entry) = pending.settle(delivery_tag) else {
            tracing::debug!(delivery_tag, "confirmation for unknown sequence number");
            return ConfirmOutcome::Unknown;
        };

        if confirmation.ack {
            metrics::counter!("broker_confirm_ack_total").increment(1);
            tracing::debug!(delivery_tag, "publish confirmed");
            return ConfirmOutcome::Acked;
        }

        metrics::counter!("broker_confirm_nack_total").increment(1);
        tracing::warn!(
            delivery_tag,
            payload = %entry.payload.describe(),
            attempt = entry.attempt,
            "publish rejected by broker"
        );
        if self.retry_or_abandon(entry) {
            ConfirmOutcome::RetryScheduled
        } else {
            ConfirmOutcome::Abandoned
        }
    }

    /// Schedules another attempt for a failed publish if the policy allows.
    /// Returns false when the payload was abandoned.
    pub fn retry_or_abandon(&self, entry: Attempt<T>) -> bool {
        if self.retry.policy().allows_retry(entry.attempt) {
            self.retry.schedule(entry.next());
            true
        } else {
            metrics::counter!("broker_retry_exhausted_total").increment(1);
            tracing::error!(
                payload = %entry.payload.describe(),
                attempts = entry.attempt,
                "payload abandoned after exhausting retries"
            );
            false
        }
    }
}
