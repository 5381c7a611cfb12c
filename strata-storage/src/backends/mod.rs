//! Storage backend implementations

pub mod memory;

pub use memory::{MemoryBackend, MemoryBackendConfig, MemoryStore};
