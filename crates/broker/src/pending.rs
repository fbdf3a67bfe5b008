//! Publishes awaiting a broker confirmation.

use std::collections::HashMap;

/// A payload together with the number of times it has been published.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt<T> {
    pub payload: T,
    /// 1 for the first publish, incremented on every retry.
    pub attempt: u32,
}

impl<T> Attempt<T> {
    /// Wraps a payload for its first publish.
    pub fn first(payload: T) -> Self {
        Self {
            payload,
            attempt: 1,
        }
    }

    /// The same payload, counted as one more attempt.
    pub fn next(self) -> Self {
        Self {
            payload: self.payload,
            attempt: self.attempt + 1,
        }
    }
}

/// Sequence number → payload for every publish the broker has not yet
/// confirmed.
///
/// The publisher is the only writer adding entries and confirmation
/// handling the only one removing them, both from the task that owns the
/// table.
#[derive(Debug)]
pub struct PendingTable<T> {
    entries: HashMap<u64, Attempt<T>>,
    tracked_total: u64,
    settled_total: u64,
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            tracked_total: 0,
            settled_total: 0,
        }
    }
}

impl<T> PendingTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a publish that the broker has yet to confirm.
    ///
    /// Sequence numbers are unique per channel, so an existing entry for the
    /// same number indicates a broker or channel bug; the old entry is
    /// returned instead of being silently lost.
    pub fn track(&mut self, delivery_tag: u64, entry: Attempt<T>) -> Option<Attempt<T>> {
        self.tracked_total += 1;
        let previous = self.entries.insert(delivery_tag, entry);
        if previous.is_some() {
            tracing::error!(delivery_tag, "sequence number tracked twice");
        }
        previous
    }

    /// Removes and returns the entry for a confirmed sequence number.
    pub fn settle(&mut self, delivery_tag: u64) -> Option<Attempt<T>> {
        let entry = self.entries.remove(&delivery_tag);
        if entry.is_some() {
            self.settled_total += 1;
        }
        entry
    }

    pub fn contains(&self, delivery_tag: u64) -> bool {
        self.entries.contains_key(&delivery_tag)
    }

    pub fn get(&self, delivery_tag: u64) -> Option<&Attempt<T>> {
        self.entries.get(&delivery_tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total entries ever tracked.
    pub fn tracked_total(&self) -> u64 {
        self.tracked_total
    }

    /// Total entries ever removed by a confirmation.
    pub fn settled_total(&self) -> u64 {
        self.settled_total
    }

    /// Sequence numbers still waiting, lowest first.
    pub fn delivery_tags(&self) -> Vec<u64> {
        let mut tags: Vec<u64> = self.entries.keys().copied().collect();
        tags.sort_unstable();
        tags
    }
}
