//! Storage error types.

use strata_core::{Error, Sequence};
use thiserror::Error;

/// Storage operation result type alias
pub type StorageResult<T> = Result<T, StorageError>;

/// Failures raised by a [`crate::MessageStore`] or [`crate::StorageBackend`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Backend-wide byte budget would be exceeded by the append
    #[error("Storage capacity exceeded: requested {requested} bytes, {available} available")]
    CapacityExceeded {
        /// Bytes the append needed
        requested: usize,
        /// Bytes still free in the backend
        available: usize,
    },

    /// Sequence space exhausted
    #[error("Sequence overflow after {last}")]
    SequenceOverflow {
        /// Last assigned sequence
        last: Sequence,
    },

    /// Backend cannot provide the requested store kind
    #[error("Unsupported storage: {reason}")]
    Unsupported {
        /// Why the request was refused
        reason: String,
    },

    /// Configuration is invalid
    #[error("Invalid storage configuration for {parameter}: {reason}")]
    Configuration {
        /// Offending parameter
        parameter: &'static str,
        /// What was wrong
        reason: String,
    },
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::CapacityExceeded { available, .. } => Self::ResourceLimit {
                resource: "storage bytes".to_string(),
                limit: available.to_string(),
            },
            StorageError::Configuration { .. } => Self::Configuration { message: err.to_string() },
            other => Self::Internal { message: other.to_string() },
        }
    }
}
