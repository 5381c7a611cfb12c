//! # Strata Storage
//!
//! The message log abstraction streams are built on.
//!
//! - [`MessageStore`]: per-stream append-only log with sequence assignment,
//!   oldest-first eviction, interior removal and restartable iteration
//! - [`StorageBackend`]: opens one store per stream
//! - [`MemoryBackend`]: the embedded, in-process backend
//!
//! ```rust
//! use strata_core::Message;
//! use strata_storage::{MemoryBackend, StorageBackend, StorageType};
//!
//! let backend = MemoryBackend::new();
//! let mut store = backend.open("ORDERS", StorageType::Memory).unwrap();
//! let seq = store.append(Message::new("orders.new", "hi").unwrap()).unwrap();
//! assert_eq!(seq, 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backends;
pub mod error;
pub mod traits;
pub mod types;

pub use backends::{MemoryBackend, MemoryBackendConfig, MemoryStore};
pub use error::{StorageError, StorageResult};
pub use traits::{MessageStore, StorageBackend};
pub use types::{Removed, StorageType};
