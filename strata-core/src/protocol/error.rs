//! Protocol-specific error types and handling.

use thiserror::Error;

/// Wire protocol violations.
///
/// Every variant is fatal for the connection it occurred on: the server
/// answers with `-ERR` carrying [`ProtocolError::client_message`] and closes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Leading token of a control line is not a known operation.
    #[error("Unknown protocol operation: {op}")]
    UnknownOperation {
        /// Operation token as received.
        op: String,
    },

    /// Operation is known but its arguments are malformed.
    #[error("Invalid arguments for {op}: {reason}")]
    InvalidArguments {
        /// Operation name.
        op: &'static str,
        /// What was wrong.
        reason: String,
    },

    /// CONNECT body is not valid JSON.
    #[error("Invalid CONNECT options: {reason}")]
    InvalidConnect {
        /// Parser message.
        reason: String,
    },

    /// Declared payload exceeds the negotiated maximum.
    #[error("Payload size {actual} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Declared size.
        actual: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Bytes following the payload were not the CRLF terminator.
    #[error("Payload not terminated by CRLF (declared {declared} bytes)")]
    PayloadTerminator {
        /// Declared payload size.
        declared: usize,
    },

    /// Control line grew past the limit without a line terminator.
    #[error("Control line exceeds maximum length {max}")]
    ControlLineTooLong {
        /// Maximum control line length.
        max: usize,
    },

    /// HPUB header block is malformed.
    #[error("Invalid headers: {reason}")]
    InvalidHeaders {
        /// What was wrong.
        reason: String,
    },

    /// Control line or subject is not valid UTF-8.
    #[error("Control line is not valid UTF-8")]
    InvalidUtf8,

    /// A server operation could not be encoded.
    #[error("Encoding failed: {reason}")]
    Encoding {
        /// Serializer message.
        reason: String,
    },
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Text sent to the client inside `-ERR '...'`.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::UnknownOperation { .. } => "Unknown Protocol Operation".to_string(),
            Self::PayloadTooLarge { .. } => "Maximum Payload Violation".to_string(),
            Self::ControlLineTooLong { .. } => "Maximum Control Line Exceeded".to_string(),
            Self::InvalidArguments { op, .. } => format!("Invalid {op} Arguments"),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_messages() {
        let err = ProtocolError::UnknownOperation { op: "BOGUS".into() };
        assert_eq!(err.client_message(), "Unknown Protocol Operation");

        let err = ProtocolError::PayloadTooLarge { actual: 10, max: 5 };
        assert_eq!(err.client_message(), "Maximum Payload Violation");

        let err = ProtocolError::InvalidArguments { op: "PUB", reason: "missing size".into() };
        assert_eq!(err.client_message(), "Invalid PUB Arguments");
    }
}
