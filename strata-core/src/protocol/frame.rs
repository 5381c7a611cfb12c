//! Protocol operations exchanged between clients and the server.

use super::headers::Headers;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Operations a client may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOp {
    /// `CONNECT {json}`
    Connect(ConnectOptions),
    /// `PING`
    Ping,
    /// `PONG`
    Pong,
    /// `PUB` or `HPUB`
    Pub {
        /// Target subject (not yet validated)
        subject: String,
        /// Optional reply subject
        reply_to: Option<String>,
        /// Header block for `HPUB`
        headers: Option<Headers>,
        /// Message payload
        payload: Bytes,
    },
    /// `SUB <subject> [queue] <sid>`
    Sub {
        /// Subject pattern
        subject: String,
        /// Optional queue group
        queue_group: Option<String>,
        /// Client-chosen subscription id
        sid: String,
    },
    /// `UNSUB <sid> [max_msgs]`
    Unsub {
        /// Subscription id
        sid: String,
        /// Auto-unsubscribe after this many deliveries
        max_msgs: Option<u64>,
    },
}

impl ClientOp {
    /// Operation name, for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connect(_) => "CONNECT",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Pub { headers: None, .. } => "PUB",
            Self::Pub { headers: Some(_), .. } => "HPUB",
            Self::Sub { .. } => "SUB",
            Self::Unsub { .. } => "UNSUB",
        }
    }
}

/// Options negotiated by `CONNECT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Acknowledge every well-formed operation with `+OK`
    pub verbose: bool,
    /// Strict subject checking
    pub pedantic: bool,
    /// Deliver the client's own publishes back to it
    pub echo: bool,
    /// Client accepts `HMSG`
    pub headers: bool,
    /// Client accepts status-only messages
    pub no_responders: bool,
    /// Optional client name
    pub name: Option<String>,
    /// Client library language
    pub lang: Option<String>,
    /// Client library version
    pub version: Option<String>,
    /// Client protocol level
    pub protocol: u8,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            pedantic: false,
            echo: true,
            headers: false,
            no_responders: false,
            name: None,
            lang: None,
            version: None,
            protocol: 0,
        }
    }
}

/// Body of the `INFO` greeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Unique id of this server process
    pub server_id: String,
    /// Configured server name
    pub server_name: String,
    /// Server version
    pub version: String,
    /// Protocol level
    pub proto: u8,
    /// Bound host
    pub host: String,
    /// Bound port
    pub port: u16,
    /// Headers supported
    pub headers: bool,
    /// Maximum accepted payload
    pub max_payload: usize,
    /// JetStream available
    pub jetstream: bool,
    /// Per-connection id, filled in on accept
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<u64>,
}

/// Operations the server writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerOp {
    /// `INFO {json}`
    Info(Box<ServerInfo>),
    /// `MSG` or `HMSG`
    Msg {
        /// Subject the message was published on
        subject: String,
        /// Subscription id it is delivered for
        sid: String,
        /// Reply subject
        reply_to: Option<String>,
        /// Headers (forces `HMSG`)
        headers: Option<Headers>,
        /// Payload
        payload: Bytes,
    },
    /// `PING`
    Ping,
    /// `PONG`
    Pong,
    /// `+OK`
    Ok,
    /// `-ERR '<text>'`
    Err(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_defaults() {
        let opts: ConnectOptions = serde_json::from_str("{}").unwrap();
        assert!(opts.echo);
        assert!(!opts.verbose);
        assert!(!opts.headers);
    }

    #[test]
    fn test_connect_ignores_unknown_fields() {
        let opts: ConnectOptions =
            serde_json::from_str(r#"{"verbose":true,"tls_required":false,"name":"svc"}"#).unwrap();
        assert!(opts.verbose);
        assert_eq!(opts.name.as_deref(), Some("svc"));
    }

    #[test]
    fn test_op_names() {
        let op = ClientOp::Pub {
            subject: "a".into(),
            reply_to: None,
            headers: Some(Headers::new()),
            payload: Bytes::new(),
        };
        assert_eq!(op.name(), "HPUB");
        assert_eq!(ClientOp::Ping.name(), "PING");
    }
}
