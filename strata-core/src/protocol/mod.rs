//! NATS-compatible text wire protocol.
//!
//! Control lines are CRLF-terminated, case-insensitive operations; payloads
//! are framed by the byte count announced on the control line:
//!
//! ```text
//! PUB <subject> [reply-to] <#bytes>\r\n<payload>\r\n
//! HPUB <subject> [reply-to] <#header bytes> <#total bytes>\r\n<headers><payload>\r\n
//! SUB <subject> [queue group] <sid>\r\n
//! UNSUB <sid> [max-msgs]\r\n
//! MSG <subject> <sid> [reply-to] <#bytes>\r\n<payload>\r\n
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use strata_core::protocol::{ClientOp, ProtocolDecoder};
//!
//! let mut decoder = ProtocolDecoder::new();
//! decoder.extend(b"PUB orders.new 5\r\nhello\r\nPING\r\n");
//!
//! assert!(matches!(decoder.decode().unwrap(), Some(ClientOp::Pub { .. })));
//! assert_eq!(decoder.decode().unwrap(), Some(ClientOp::Ping));
//! assert_eq!(decoder.decode().unwrap(), None);
//! ```

pub mod codec;
pub mod error;
pub mod frame;
pub mod headers;

pub use codec::{encode, encode_into, ProtocolDecoder, ProtocolEncoder};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{ClientOp, ConnectOptions, ServerInfo, ServerOp};
pub use headers::Headers;

/// Protocol constants.
pub mod constants {
    /// Protocol level advertised in `INFO`.
    pub const PROTOCOL_LEVEL: u8 = 1;

    /// Status code for "no messages available" on a no-wait pull.
    pub const STATUS_NO_MESSAGES: u16 = 404;

    /// Status code for an expired pull request.
    pub const STATUS_REQUEST_TIMEOUT: u16 = 408;

    /// Status code for "no responders".
    pub const STATUS_NO_RESPONDERS: u16 = 503;
}
