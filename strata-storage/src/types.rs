//! Storage-level types shared by all backends.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a stream keeps its messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Persistent storage
    #[default]
    File,
    /// Volatile storage
    Memory,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => f.write_str("file"),
            Self::Memory => f.write_str("memory"),
        }
    }
}

/// Counts returned by bulk removals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Removed {
    /// Messages removed
    pub messages: u64,
    /// Payload bytes freed
    pub bytes: u64,
}

impl Removed {
    /// Fold one removed message of `bytes` size into the totals.
    pub fn add(&mut self, bytes: usize) {
        self.messages += 1;
        self.bytes += bytes as u64;
    }
}
