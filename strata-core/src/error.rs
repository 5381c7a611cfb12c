//! Error types for the Strata core library.

use crate::protocol::ProtocolError;
use thiserror::Error;

/// Main error type for Strata operations.
///
/// Every variant maps to a numeric API code through [`Error::code`], which is
/// what administrative responses carry in their `error` envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed wire traffic; fatal for the offending connection only
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A named stream, consumer, bucket, key or message does not exist
    #[error("{resource} not found: {name}")]
    NotFound {
        /// Kind of resource ("stream", "consumer", "key", ...)
        resource: &'static str,
        /// Name or identifier that was looked up
        name: String,
    },

    /// Creation collided with an existing resource
    #[error("{resource} already exists: {name}")]
    AlreadyExists {
        /// Kind of resource
        resource: &'static str,
        /// Name of the existing resource
        name: String,
    },

    /// Operation forbidden by configuration (deny_delete, deny_purge, ...)
    #[error("Permission denied: {message}")]
    PermissionDenied {
        /// What was refused
        message: String,
    },

    /// JetStream is switched off for this server
    #[error("JetStream not enabled")]
    Disabled,

    /// Request body or arguments failed validation
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Validation failure description
        message: String,
    },

    /// Subject or subject pattern is not well formed
    #[error("Invalid subject: {subject}")]
    InvalidSubject {
        /// Offending subject
        subject: String,
    },

    /// Resource limits exceeded
    #[error("Resource limit exceeded: {resource} ({limit})")]
    ResourceLimit {
        /// Limit that was hit
        resource: String,
        /// Configured limit
        limit: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        /// Underlying serde message
        message: String,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the bad setting
        message: String,
    },

    /// Socket level failures
    #[error("Network error: {message}")]
    Network {
        /// Underlying I/O message
        message: String,
    },

    /// Internal system errors, including storage failures
    #[error("Internal error: {message}")]
    Internal {
        /// Failure description
        message: String,
    },
}

/// Result type alias for Strata operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for [`Error::NotFound`].
    pub fn not_found(resource: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound { resource, name: name.into() }
    }

    /// Shorthand for [`Error::AlreadyExists`].
    pub fn already_exists(resource: &'static str, name: impl Into<String>) -> Self {
        Self::AlreadyExists { resource, name: name.into() }
    }

    /// Shorthand for [`Error::InvalidRequest`].
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest { message: message.into() }
    }

    /// Shorthand for [`Error::PermissionDenied`].
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied { message: message.into() }
    }

    /// Shorthand for [`Error::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Numeric code used in API error envelopes and status headers.
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::AlreadyExists { .. }
            | Self::InvalidRequest { .. }
            | Self::InvalidSubject { .. }
            | Self::Serialization { .. }
            | Self::Protocol(_) => 400,
            Self::PermissionDenied { .. } => 403,
            Self::ResourceLimit { .. } => 413,
            Self::Disabled => 503,
            Self::Configuration { .. } | Self::Network { .. } | Self::Internal { .. } => 500,
        }
    }

    /// Whether this error must terminate the connection that caused it.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Network { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization { message: err.to_string() }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Network { message: err.to_string() }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::Configuration { message: err.to_string() }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration { message: err.to_string() }
    }
}
