//! Message types and utilities.

use crate::{
    protocol::Headers,
    subject::Subject,
    types::{Sequence, Timestamp},
    Result,
};
use bytes::Bytes;
use chrono::Utc;

/// A published message.
///
/// Messages are immutable once stored in a stream; the stream assigns
/// `sequence` on append and leaves it at 0 for messages that are only routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Subject the message was published on
    pub subject: Subject,

    /// Optional reply subject
    pub reply_to: Option<String>,

    /// Optional headers
    pub headers: Option<Headers>,

    /// Message payload (zero-copy)
    pub payload: Bytes,

    /// Time the server received the message
    pub timestamp: Timestamp,

    /// Stream-local sequence, 0 until stored
    pub sequence: Sequence,
}

impl Message {
    /// Create a new message with the given subject and payload.
    ///
    /// # Errors
    /// Returns an error if the subject is not a valid publish subject.
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Result<Self> {
        MessageBuilder::new(subject).payload(payload).build()
    }

    /// Start building a message.
    pub fn builder(subject: impl Into<String>) -> MessageBuilder {
        MessageBuilder::new(subject)
    }

    /// Payload size in bytes; the unit streams account against `max_bytes`.
    #[must_use]
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Header value lookup.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.as_ref().and_then(|h| h.get(key))
    }

    /// Copy of this message carrying the given stream sequence.
    #[must_use]
    pub fn with_sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = sequence;
        self
    }
}

/// Builder for [`Message`].
#[derive(Debug, Default)]
pub struct MessageBuilder {
    subject: String,
    reply_to: Option<String>,
    headers: Option<Headers>,
    payload: Bytes,
    timestamp: Option<Timestamp>,
}

impl MessageBuilder {
    /// Create a builder for the given subject.
    pub fn new(subject: impl Into<String>) -> Self {
        Self { subject: subject.into(), ..Self::default() }
    }

    /// Set the reply subject.
    #[must_use]
    pub fn reply_to(mut self, reply: impl Into<String>) -> Self {
        self.reply_to = Some(reply.into());
        self
    }

    /// Set an optional reply subject.
    #[must_use]
    pub fn maybe_reply_to(mut self, reply: Option<String>) -> Self {
        self.reply_to = reply;
        self
    }

    /// Replace the header set. Empty header sets are dropped.
    #[must_use]
    pub fn headers(mut self, headers: Option<Headers>) -> Self {
        self.headers = headers.filter(|h| !h.is_empty());
        self
    }

    /// Add a single header.
    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.get_or_insert_with(Headers::new).append(key, value);
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Override the receive timestamp.
    #[must_use]
    pub const fn timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Build the message.
    ///
    /// # Errors
    /// Returns an error if the subject is invalid.
    pub fn build(self) -> Result<Message> {
        Ok(Message {
            subject: Subject::new(self.subject)?,
            reply_to: self.reply_to,
            headers: self.headers,
            payload: self.payload,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            sequence: 0,
        })
    }
}
