//! In-memory storage backend implementation
//!
//! Messages live in a `BTreeMap` keyed by sequence, which gives ordered
//! iteration, O(log n) interior removal and cheap access to the oldest entry.
//! All stores opened from one [`MemoryBackend`] share its byte budget.

use crate::{
    error::{StorageError, StorageResult},
    traits::{MessageStore, StorageBackend},
    types::{Removed, StorageType},
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use strata_core::{Message, Sequence};
use tracing::debug;

/// In-memory backend configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBackendConfig {
    /// Byte budget shared by every store; `None` is unlimited
    pub max_memory_bytes: Option<usize>,
    /// Serve `file` storage requests from memory instead of refusing them
    pub serve_file_storage: bool,
}

impl Default for MemoryBackendConfig {
    fn default() -> Self {
        Self { max_memory_bytes: None, serve_file_storage: true }
    }
}

impl MemoryBackendConfig {
    /// Create the default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shared byte budget
    #[must_use]
    pub const fn with_max_memory_bytes(mut self, max: usize) -> Self {
        self.max_memory_bytes = Some(max);
        self
    }

    /// Refuse `file` storage requests
    #[must_use]
    pub const fn memory_only(mut self) -> Self {
        self.serve_file_storage = false;
        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    /// Returns [`StorageError::Configuration`] for a zero byte budget.
    pub fn validate(&self) -> StorageResult<()> {
        if self.max_memory_bytes == Some(0) {
            return Err(StorageError::Configuration {
                parameter: "max_memory_bytes",
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Backend handing out [`MemoryStore`]s.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    config: MemoryBackendConfig,
    used: Arc<AtomicUsize>,
}

impl MemoryBackend {
    /// Backend with no byte budget.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend with an explicit configuration.
    ///
    /// # Errors
    /// Returns [`StorageError::Configuration`] if the configuration is invalid.
    pub fn with_config(config: MemoryBackendConfig) -> StorageResult<Self> {
        config.validate()?;
        Ok(Self { config, used: Arc::new(AtomicUsize::new(0)) })
    }

    /// Bytes currently held across all stores.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}

impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open(&self, stream: &str, storage: StorageType) -> StorageResult<Box<dyn MessageStore>> {
        if storage == StorageType::File && !self.config.serve_file_storage {
            return Err(StorageError::Unsupported {
                reason: format!("stream {stream}: file storage is not available"),
            });
        }
        debug!(stream, %storage, "Opening in-memory message store");
        Ok(Box::new(MemoryStore::with_budget(self.config.max_memory_bytes, Arc::clone(&self.used))))
    }

    fn remove(&self, stream: &str) -> StorageResult<()> {
        debug!(stream, "Released in-memory message store");
        Ok(())
    }
}

/// Ordered in-memory message log.
#[derive(Debug)]
pub struct MemoryStore {
    messages: BTreeMap<Sequence, Message>,
    last_seq: Sequence,
    bytes: usize,
    budget: Option<usize>,
    shared_used: Arc<AtomicUsize>,
}

impl MemoryStore {
    /// Standalone store with no byte budget.
    #[must_use]
    pub fn new() -> Self {
        Self::with_budget(None, Arc::new(AtomicUsize::new(0)))
    }

    fn with_budget(budget: Option<usize>, shared_used: Arc<AtomicUsize>) -> Self {
        Self { messages: BTreeMap::new(), last_seq: 0, bytes: 0, budget, shared_used }
    }

    fn release(&mut self, bytes: usize) {
        self.bytes -= bytes;
        self.shared_used.fetch_sub(bytes, Ordering::AcqRel);
    }

    fn reserve(&self, bytes: usize) -> StorageResult<()> {
        let Some(budget) = self.budget else {
            self.shared_used.fetch_add(bytes, Ordering::AcqRel);
            return Ok(());
        };
        self.shared_used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= budget)
            })
            .map(|_| ())
            .map_err(|used| StorageError::CapacityExceeded {
                requested: bytes,
                available: budget.saturating_sub(used),
            })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.shared_used.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

impl MessageStore for MemoryStore {
    fn append(&mut self, mut message: Message) -> StorageResult<Sequence> {
        let seq = self
            .last_seq
            .checked_add(1)
            .ok_or(StorageError::SequenceOverflow { last: self.last_seq })?;
        let size = message.size();
        self.reserve(size)?;

        message.sequence = seq;
        self.messages.insert(seq, message);
        self.last_seq = seq;
        self.bytes += size;
        Ok(seq)
    }

    fn peek_oldest(&self) -> Option<Message> {
        self.messages.first_key_value().map(|(_, m)| m.clone())
    }

    fn evict_oldest(&mut self) -> Option<usize> {
        let (_, message) = self.messages.pop_first()?;
        let size = message.size();
        self.release(size);
        Some(size)
    }

    fn get(&self, seq: Sequence) -> Option<Message> {
        self.messages.get(&seq).cloned()
    }

    fn remove(&mut self, seq: Sequence) -> Option<Message> {
        let message = self.messages.remove(&seq)?;
        self.release(message.size());
        Some(message)
    }

    fn iter_from(&self, from: Sequence) -> Box<dyn Iterator<Item = Message> + '_> {
        Box::new(self.messages.range(from..).map(|(_, m)| m.clone()))
    }

    fn count_from(&self, from: Sequence) -> usize {
        let first = self.first_seq();
        if from <= first {
            return self.messages.len();
        }
        if from > self.last_seq {
            return 0;
        }
        // without interior gaps the count is plain arithmetic
        let span = self.last_seq - first + 1;
        if span == self.messages.len() as u64 {
            return usize::try_from(self.last_seq - from + 1).unwrap_or(usize::MAX);
        }
        self.messages.range(from..).count()
    }

    fn purge(&mut self) -> Removed {
        let removed = Removed { messages: self.messages.len() as u64, bytes: self.bytes as u64 };
        self.messages.clear();
        let bytes = self.bytes;
        self.release(bytes);
        removed
    }

    fn first_seq(&self) -> Sequence {
        self.messages.first_key_value().map_or(self.last_seq + 1, |(seq, _)| *seq)
    }

    fn last_seq(&self) -> Sequence {
        self.last_seq
    }

    fn len(&self) -> usize {
        self.messages.len()
    }

    fn bytes(&self) -> usize {
        self.bytes
    }
}
