//! Outstanding deliveries and the acknowledgement floor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strata_core::Sequence;
use tokio::time::Instant;

/// A consumer sequence paired with the stream sequence it delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceInfo {
    /// Consumer sequence
    pub consumer_seq: Sequence,
    /// Stream sequence
    pub stream_seq: Sequence,
}

/// A delivered, unacknowledged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingEntry {
    pub consumer_seq: Sequence,
    pub deliveries: u64,
    pub deadline: Instant,
}

/// Pending deliveries keyed by stream sequence.
#[derive(Debug, Default)]
pub(crate) struct PendingSet {
    entries: BTreeMap<Sequence, PendingEntry>,
}

impl PendingSet {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, stream_seq: Sequence) -> bool {
        self.entries.contains_key(&stream_seq)
    }

    pub fn get_mut(&mut self, stream_seq: Sequence) -> Option<&mut PendingEntry> {
        self.entries.get_mut(&stream_seq)
    }

    pub fn insert(&mut self, stream_seq: Sequence, entry: PendingEntry) {
        self.entries.insert(stream_seq, entry);
    }

    pub fn remove(&mut self, stream_seq: Sequence) -> Option<PendingEntry> {
        self.entries.remove(&stream_seq)
    }

    /// Remove every entry at or below `stream_seq`, returning their sequences.
    pub fn remove_through(&mut self, stream_seq: Sequence) -> Vec<Sequence> {
        let rest = self.entries.split_off(&stream_seq.saturating_add(1));
        let removed = std::mem::replace(&mut self.entries, rest);
        removed.into_keys().collect()
    }

    /// Stream sequences whose ack deadline has passed, oldest first.
    pub fn expired(&self, now: Instant) -> Vec<Sequence> {
        self.entries.iter().filter(|(_, e)| e.deadline <= now).map(|(seq, _)| *seq).collect()
    }

    /// The nearest ack deadline.
    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.deadline).min()
    }

    /// Acknowledgement floor given the highest delivered pair.
    ///
    /// Everything at or below the floor is settled. The lowest outstanding
    /// entry holds the floor just beneath it.
    pub fn ack_floor(&self, delivered: SequenceInfo) -> SequenceInfo {
        match self.entries.first_key_value() {
            None => delivered,
            Some((stream_seq, entry)) => SequenceInfo {
                consumer_seq: entry.consumer_seq.saturating_sub(1),
                stream_seq: stream_seq.saturating_sub(1),
            },
        }
    }
}
