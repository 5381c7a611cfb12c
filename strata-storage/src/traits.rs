//! Storage traits.
//!
//! A [`StorageBackend`] hands out one [`MessageStore`] per stream. The store
//! is a sequence-ordered log: it assigns sequences on append and otherwise
//! only ever shrinks. Retention decisions belong to the stream that owns the
//! store, never to the store itself.

use crate::{
    error::StorageResult,
    types::{Removed, StorageType},
};
use std::fmt;
use strata_core::{Message, Sequence};

/// Append-only, sequence-ordered message log for a single stream.
///
/// Callers serialize mutation (the owning stream holds it behind a lock), so
/// mutating methods take `&mut self`.
pub trait MessageStore: Send + Sync + fmt::Debug {
    /// Store `message` under the next sequence and return that sequence.
    ///
    /// # Errors
    /// Backend specific, e.g. [`crate::StorageError::CapacityExceeded`].
    fn append(&mut self, message: Message) -> StorageResult<Sequence>;

    /// The lowest-sequence message still retained.
    fn peek_oldest(&self) -> Option<Message>;

    /// Drop the oldest message, returning the payload bytes freed.
    fn evict_oldest(&mut self) -> Option<usize>;

    /// Message stored under `seq`.
    fn get(&self, seq: Sequence) -> Option<Message>;

    /// Remove a single message, returning it.
    fn remove(&mut self, seq: Sequence) -> Option<Message>;

    /// Messages with sequence `>= from`, in order.
    ///
    /// The iterator is lazy and finite; call again to restart.
    fn iter_from(&self, from: Sequence) -> Box<dyn Iterator<Item = Message> + '_>;

    /// Remove every message. The sequence counter is preserved.
    fn purge(&mut self) -> Removed;

    /// Sequence of the oldest retained message, or `last_seq + 1` when empty.
    fn first_seq(&self) -> Sequence;

    /// Highest sequence ever assigned.
    fn last_seq(&self) -> Sequence;

    /// Number of retained messages.
    fn len(&self) -> usize;

    /// Sum of retained payload sizes.
    fn bytes(&self) -> usize;

    /// Number of retained messages with sequence `>= from`.
    fn count_from(&self, from: Sequence) -> usize {
        self.iter_from(from).count()
    }

    /// Whether no messages are retained.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every message with sequence `< below`.
    fn compact(&mut self, below: Sequence) -> Removed {
        let mut removed = Removed::default();
        while self.peek_oldest().is_some_and(|m| m.sequence < below) {
            match self.evict_oldest() {
                Some(bytes) => removed.add(bytes),
                None => break,
            }
        }
        removed
    }
}

/// Factory for per-stream stores.
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Open (or create) the store for `stream`.
    ///
    /// # Errors
    /// [`crate::StorageError::Unsupported`] if the backend cannot provide
    /// `storage`.
    fn open(&self, stream: &str, storage: StorageType) -> StorageResult<Box<dyn MessageStore>>;

    /// Release everything held for `stream`.
    ///
    /// # Errors
    /// Backend specific.
    fn remove(&self, stream: &str) -> StorageResult<()>;
}
