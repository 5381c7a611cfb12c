//! Administrative API: request subjects, request bodies and JSON responses.
//!
//! Requests arrive as publishes under the API prefix (`$JS.API` by default).
//! The subject selects an [`ApiRequest`]; the payload carries its JSON body.
//! Every response is a JSON object with a `type` field naming the response,
//! plus either the response body or an `error` object.

use crate::{
    config::{ConsumerConfig, StreamConfig},
    consumer::ConsumerInfo,
    stream::StreamInfo,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use strata_core::{types::duration_nanos, Error, Message, Result, Sequence, Timestamp};

const TYPE_PREFIX: &str = "io.nats.jetstream.api.v1";

/// A parsed administrative request subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiRequest {
    /// `INFO`
    AccountInfo,
    /// `STREAM.CREATE.<stream>`
    StreamCreate {
        /// Target stream
        stream: String,
    },
    /// `STREAM.UPDATE.<stream>`
    StreamUpdate {
        /// Target stream
        stream: String,
    },
    /// `STREAM.DELETE.<stream>`
    StreamDelete {
        /// Target stream
        stream: String,
    },
    /// `STREAM.INFO.<stream>`
    StreamInfo {
        /// Target stream
        stream: String,
    },
    /// `STREAM.LIST`
    StreamList,
    /// `STREAM.NAMES`
    StreamNames,
    /// `STREAM.PURGE.<stream>`
    StreamPurge {
        /// Target stream
        stream: String,
    },
    /// `STREAM.MSG.GET.<stream>`
    MsgGet {
        /// Target stream
        stream: String,
    },
    /// `STREAM.MSG.DELETE.<stream>`
    MsgDelete {
        /// Target stream
        stream: String,
    },
    /// `CONSUMER.CREATE.<stream>[.<consumer>[.<filter>]]`
    ConsumerCreate {
        /// Target stream
        stream: String,
        /// Name from the subject
        consumer: Option<String>,
        /// Filter subject from the subject
        filter: Option<String>,
    },
    /// `CONSUMER.DURABLE.CREATE.<stream>.<consumer>`
    DurableCreate {
        /// Target stream
        stream: String,
        /// Durable name
        consumer: String,
    },
    /// `CONSUMER.DELETE.<stream>.<consumer>`
    ConsumerDelete {
        /// Target stream
        stream: String,
        /// Target consumer
        consumer: String,
    },
    /// `CONSUMER.INFO.<stream>.<consumer>`
    ConsumerInfo {
        /// Target stream
        stream: String,
        /// Target consumer
        consumer: String,
    },
    /// `CONSUMER.LIST.<stream>`
    ConsumerList {
        /// Target stream
        stream: String,
    },
    /// `CONSUMER.NAMES.<stream>`
    ConsumerNames {
        /// Target stream
        stream: String,
    },
    /// `CONSUMER.MSG.NEXT.<stream>.<consumer>`
    ConsumerNext {
        /// Target stream
        stream: String,
        /// Target consumer
        consumer: String,
    },
}

impl ApiRequest {
    /// Parse a subject published under `prefix`.
    ///
    /// # Errors
    /// [`Error::InvalidRequest`] for subjects naming no known request.
    pub fn parse(prefix: &str, subject: &str) -> Result<Self> {
        let rest = subject
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('.'))
            .ok_or_else(|| Error::invalid_request(format!("not an API subject: {subject}")))?;
        let tokens: Vec<&str> = rest.split('.').collect();
        let s = |t: &str| t.to_string();

        let request = match tokens.as_slice() {
            ["INFO"] => Self::AccountInfo,
            ["STREAM", "CREATE", stream] => Self::StreamCreate { stream: s(stream) },
            ["STREAM", "UPDATE", stream] => Self::StreamUpdate { stream: s(stream) },
            ["STREAM", "DELETE", stream] => Self::StreamDelete { stream: s(stream) },
            ["STREAM", "INFO", stream] => Self::StreamInfo { stream: s(stream) },
            ["STREAM", "LIST"] => Self::StreamList,
            ["STREAM", "NAMES"] => Self::StreamNames,
            ["STREAM", "PURGE", stream] => Self::StreamPurge { stream: s(stream) },
            ["STREAM", "MSG", "GET", stream] => Self::MsgGet { stream: s(stream) },
            ["STREAM", "MSG", "DELETE", stream] => Self::MsgDelete { stream: s(stream) },
            ["CONSUMER", "CREATE", stream] => {
                Self::ConsumerCreate { stream: s(stream), consumer: None, filter: None }
            },
            ["CONSUMER", "CREATE", stream, consumer] => Self::ConsumerCreate {
                stream: s(stream),
                consumer: Some(s(consumer)),
                filter: None,
            },
            ["CONSUMER", "CREATE", stream, consumer, filter @ ..] => Self::ConsumerCreate {
                stream: s(stream),
                consumer: Some(s(consumer)),
                filter: Some(filter.join(".")),
            },
            ["CONSUMER", "DURABLE", "CREATE", stream, consumer] => {
                Self::DurableCreate { stream: s(stream), consumer: s(consumer) }
            },
            ["CONSUMER", "DELETE", stream, consumer] => {
                Self::ConsumerDelete { stream: s(stream), consumer: s(consumer) }
            },
            ["CONSUMER", "INFO", stream, consumer] => {
                Self::ConsumerInfo { stream: s(stream), consumer: s(consumer) }
            },
            ["CONSUMER", "LIST", stream] => Self::ConsumerList { stream: s(stream) },
            ["CONSUMER", "NAMES", stream] => Self::ConsumerNames { stream: s(stream) },
            ["CONSUMER", "MSG", "NEXT", stream, consumer] => {
                Self::ConsumerNext { stream: s(stream), consumer: s(consumer) }
            },
            _ => return Err(Error::invalid_request(format!("unknown API request: {rest}"))),
        };
        Ok(request)
    }

    /// The `type` field of the response to this request.
    #[must_use]
    pub const fn response_type(&self) -> &'static str {
        match self {
            Self::AccountInfo => "io.nats.jetstream.api.v1.account_info_response",
            Self::StreamCreate { .. } => "io.nats.jetstream.api.v1.stream_create_response",
            Self::StreamUpdate { .. } => "io.nats.jetstream.api.v1.stream_update_response",
            Self::StreamDelete { .. } => "io.nats.jetstream.api.v1.stream_delete_response",
            Self::StreamInfo { .. } => "io.nats.jetstream.api.v1.stream_info_response",
            Self::StreamList => "io.nats.jetstream.api.v1.stream_list_response",
            Self::StreamNames => "io.nats.jetstream.api.v1.stream_names_response",
            Self::StreamPurge { .. } => "io.nats.jetstream.api.v1.stream_purge_response",
            Self::MsgGet { .. } => "io.nats.jetstream.api.v1.stream_msg_get_response",
            Self::MsgDelete { .. } => "io.nats.jetstream.api.v1.stream_msg_delete_response",
            Self::ConsumerCreate { .. } | Self::DurableCreate { .. } => {
                "io.nats.jetstream.api.v1.consumer_create_response"
            },
            Self::ConsumerDelete { .. } => "io.nats.jetstream.api.v1.consumer_delete_response",
            Self::ConsumerInfo { .. } => "io.nats.jetstream.api.v1.consumer_info_response",
            Self::ConsumerList { .. } => "io.nats.jetstream.api.v1.consumer_list_response",
            Self::ConsumerNames { .. } => "io.nats.jetstream.api.v1.consumer_names_response",
            Self::ConsumerNext { .. } => "io.nats.jetstream.api.v1.consumer_getnext_request",
        }
    }
}

/// Decode a JSON body, treating an empty payload as the default value.
///
/// # Errors
/// [`Error::Serialization`] for malformed JSON.
pub fn parse_body<T: serde::de::DeserializeOwned + Default>(payload: &[u8]) -> Result<T> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(payload)?)
}

/// Body of a consumer create request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateConsumerRequest {
    /// Stream the consumer belongs to
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stream_name: String,
    /// Consumer configuration
    pub config: ConsumerConfig,
}

/// Body of a message delete request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MsgDeleteRequest {
    /// Sequence to remove
    pub seq: Sequence,
}

/// Paging parameters of list requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListRequest {
    /// Entries to skip
    pub offset: usize,
}

/// Items per list page.
pub const LIST_LIMIT: usize = 256;

/// Body of a pull request.
///
/// The payload may be empty (one message), a bare number (batch size) or a
/// JSON object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullRequest {
    /// Maximum messages to return
    pub batch: usize,
    /// How long to wait for messages; zero uses the server default
    #[serde(with = "duration_nanos")]
    pub expires: Duration,
    /// Return immediately when nothing is available
    pub no_wait: bool,
}

impl Default for PullRequest {
    fn default() -> Self {
        Self { batch: 1, expires: Duration::ZERO, no_wait: false }
    }
}

impl PullRequest {
    /// Parse a pull payload.
    ///
    /// # Errors
    /// [`Error::InvalidRequest`] for a payload that is neither a number nor
    /// a JSON object.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| Error::invalid_request("pull request is not UTF-8"))?
            .trim();
        if text.is_empty() {
            return Ok(Self::default());
        }
        if let Ok(batch) = text.parse::<usize>() {
            return Ok(Self { batch, ..Self::default() });
        }
        let mut request: Self = serde_json::from_str(text)?;
        if request.batch == 0 {
            request.batch = 1;
        }
        Ok(request)
    }
}

/// Operation requested on a `$KV` subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvOperation {
    /// Store the payload
    Put,
    /// Read the current value
    Get,
    /// Remove the key
    Del,
    /// Remove the key and its history
    Purge,
}

/// Header selecting the KV operation.
pub const KV_OPERATION_HEADER: &str = "KV-Operation";

impl KvOperation {
    /// Operation named by `header`, `PUT` when absent.
    ///
    /// # Errors
    /// [`Error::InvalidRequest`] for an unknown operation.
    pub fn parse(header: Option<&str>) -> Result<Self> {
        match header.map(str::trim) {
            None | Some("") => Ok(Self::Put),
            Some(op) if op.eq_ignore_ascii_case("PUT") => Ok(Self::Put),
            Some(op) if op.eq_ignore_ascii_case("GET") => Ok(Self::Get),
            Some(op) if op.eq_ignore_ascii_case("DEL") => Ok(Self::Del),
            Some(op) if op.eq_ignore_ascii_case("PURGE") => Ok(Self::Purge),
            Some(op) => Err(Error::invalid_request(format!("unknown kv operation: {op}"))),
        }
    }
}

/// Bucket and key addressed by a `$KV` subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvAddress {
    /// Bucket name
    pub bucket: String,
    /// Key, possibly spanning several tokens
    pub key: String,
}

impl KvAddress {
    /// Split `<prefix>.<bucket>.<key>`.
    ///
    /// # Errors
    /// [`Error::InvalidRequest`] when the bucket or key is missing.
    pub fn parse(prefix: &str, subject: &str) -> Result<Self> {
        let (bucket, key) = subject
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('.'))
            .and_then(|rest| rest.split_once('.'))
            .filter(|(bucket, key)| !bucket.is_empty() && !key.is_empty())
            .ok_or_else(|| Error::invalid_request("invalid kv subject"))?;
        Ok(Self { bucket: bucket.to_string(), key: key.to_string() })
    }
}

/// A stored message as returned by `STREAM.MSG.GET`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Original subject
    pub subject: String,
    /// Stream sequence
    pub seq: Sequence,
    /// Base64 encoded header block
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hdrs: Option<String>,
    /// Base64 encoded payload
    #[serde(skip_serializing_if = "String::is_empty")]
    pub data: String,
    /// Receive time
    pub time: Timestamp,
}

impl From<&Message> for StoredMessage {
    fn from(message: &Message) -> Self {
        let hdrs = message.headers.as_ref().map(|headers| {
            let mut buf = BytesMut::with_capacity(headers.encoded_len());
            headers.encode(&mut buf);
            STANDARD.encode(&buf)
        });
        Self {
            subject: message.subject.as_str().to_string(),
            seq: message.sequence,
            hdrs,
            data: STANDARD.encode(&message.payload),
            time: message.timestamp,
        }
    }
}

/// Account level usage and limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    /// Bytes held by memory streams
    pub memory: u64,
    /// Bytes held by file streams
    pub storage: u64,
    /// Stream count
    pub streams: usize,
    /// Consumer count across streams
    pub consumers: usize,
    /// Configured limits
    pub limits: AccountLimits,
}

/// Account limits, -1 meaning unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountLimits {
    /// Maximum streams
    pub max_streams: i64,
    /// Maximum consumers per stream
    pub max_consumers: i64,
}

/// Successful response bodies.
#[derive(Debug, Clone)]
pub enum ApiResponse {
    /// Account usage
    Account(AccountInfo),
    /// Stream configuration and state
    Stream(Box<StreamInfo>),
    /// Page of streams
    StreamList {
        /// Streams on this page
        streams: Vec<StreamInfo>,
        /// Total streams
        total: usize,
        /// Page offset
        offset: usize,
    },
    /// Consumer configuration and state
    Consumer(Box<ConsumerInfo>),
    /// Page of consumers
    ConsumerList {
        /// Consumers on this page
        consumers: Vec<ConsumerInfo>,
        /// Total consumers
        total: usize,
        /// Page offset
        offset: usize,
    },
    /// Page of stream or consumer names
    Names {
        /// `streams` or `consumers`
        field: &'static str,
        /// Names on this page
        names: Vec<String>,
        /// Total names
        total: usize,
        /// Page offset
        offset: usize,
    },
    /// Purge result
    Purged(u64),
    /// Stored message
    Message(Box<StoredMessage>),
    /// Plain success
    Success,
}

impl ApiResponse {
    fn body(&self) -> Result<Value> {
        let value = match self {
            Self::Account(info) => serde_json::to_value(info)?,
            Self::Stream(info) => serde_json::to_value(info)?,
            Self::Consumer(info) => serde_json::to_value(info)?,
            Self::StreamList { streams, total, offset } => json!({
                "total": total,
                "offset": offset,
                "limit": LIST_LIMIT,
                "streams": streams,
            }),
            Self::ConsumerList { consumers, total, offset } => json!({
                "total": total,
                "offset": offset,
                "limit": LIST_LIMIT,
                "consumers": consumers,
            }),
            Self::Names { field, names, total, offset } => {
                let mut body = json!({ "total": total, "offset": offset, "limit": LIST_LIMIT });
                body[*field] = json!(names);
                body
            },
            Self::Purged(purged) => json!({ "success": true, "purged": purged }),
            Self::Message(message) => json!({ "message": message }),
            Self::Success => json!({ "success": true }),
        };
        Ok(value)
    }

    /// Encode with the `type` field for `request`.
    ///
    /// # Errors
    /// [`Error::Serialization`] if the body cannot be encoded.
    pub fn encode(&self, response_type: &str) -> Result<Bytes> {
        let mut body = self.body()?;
        if let Value::Object(map) = &mut body {
            map.insert("type".to_string(), Value::String(response_type.to_string()));
        }
        Ok(Bytes::from(serde_json::to_vec(&body)?))
    }
}

/// Encode an error response.
#[must_use]
pub fn error_response(response_type: &str, error: &Error) -> Bytes {
    let body = json!({
        "type": response_type,
        "error": { "code": error.code(), "description": error.to_string() },
    });
    Bytes::from(body.to_string())
}

/// `type` of error responses for subjects that could not be parsed.
#[must_use]
pub fn generic_response_type() -> String {
    format!("{TYPE_PREFIX}.error_response")
}

/// Name sorted page of `items`.
pub(crate) fn page<T>(items: Vec<T>, offset: usize) -> (Vec<T>, usize) {
    let total = items.len();
    let page = items.into_iter().skip(offset).take(LIST_LIMIT).collect();
    (page, total)
}

/// Fill the stream name from the subject and reject a conflicting body.
pub(crate) fn stream_config_for(subject_name: &str, payload: &[u8]) -> Result<StreamConfig> {
    let mut config: StreamConfig = parse_body(payload)?;
    if config.name.is_empty() {
        config.name = subject_name.to_string();
    } else if config.name != subject_name {
        return Err(Error::invalid_request("stream name in subject does not match request"));
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: &str = "$JS.API";

    #[test]
    fn test_parse_stream_requests() {
        assert_eq!(ApiRequest::parse(P, "$JS.API.INFO").unwrap(), ApiRequest::AccountInfo);
        assert_eq!(
            ApiRequest::parse(P, "$JS.API.STREAM.CREATE.ORDERS").unwrap(),
            ApiRequest::StreamCreate { stream: "ORDERS".into() }
        );
        assert_eq!(ApiRequest::parse(P, "$JS.API.STREAM.NAMES").unwrap(), ApiRequest::StreamNames);
        assert_eq!(
            ApiRequest::parse(P, "$JS.API.STREAM.MSG.GET.ORDERS").unwrap(),
            ApiRequest::MsgGet { stream: "ORDERS".into() }
        );
        assert!(ApiRequest::parse(P, "$JS.API.STREAM.EXPLODE.ORDERS").is_err());
        assert!(ApiRequest::parse(P, "orders.new").is_err());
    }

    #[test]
    fn test_parse_consumer_requests() {
        assert_eq!(
            ApiRequest::parse(P, "$JS.API.CONSUMER.CREATE.ORDERS").unwrap(),
            ApiRequest::ConsumerCreate { stream: "ORDERS".into(), consumer: None, filter: None }
        );
        assert_eq!(
            ApiRequest::parse(P, "$JS.API.CONSUMER.CREATE.ORDERS.c.orders.new").unwrap(),
            ApiRequest::ConsumerCreate {
                stream: "ORDERS".into(),
                consumer: Some("c".into()),
                filter: Some("orders.new".into()),
            }
        );
        assert_eq!(
            ApiRequest::parse(P, "$JS.API.CONSUMER.DURABLE.CREATE.ORDERS.c").unwrap(),
            ApiRequest::DurableCreate { stream: "ORDERS".into(), consumer: "c".into() }
        );
        assert_eq!(
            ApiRequest::parse(P, "$JS.API.CONSUMER.MSG.NEXT.ORDERS.c").unwrap(),
            ApiRequest::ConsumerNext { stream: "ORDERS".into(), consumer: "c".into() }
        );
    }

    #[test]
    fn test_response_envelope() {
        let bytes = ApiResponse::Purged(3)
            .encode(ApiRequest::StreamPurge { stream: "S".into() }.response_type())
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "io.nats.jetstream.api.v1.stream_purge_response");
        assert_eq!(value["purged"], 3);

        let names = ApiResponse::Names {
            field: "streams",
            names: vec!["A".into()],
            total: 1,
            offset: 0,
        };
        let value: Value = serde_json::from_slice(&names.encode("t").unwrap()).unwrap();
        assert_eq!(value["streams"][0], "A");
    }

    #[test]
    fn test_error_envelope() {
        let bytes = error_response("t", &Error::not_found("stream", "X"));
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["error"]["code"], 404);
        assert!(value["error"]["description"].as_str().unwrap().contains('X'));
    }

    #[test]
    fn test_pull_request_forms() {
        assert_eq!(PullRequest::parse(b"").unwrap().batch, 1);
        assert_eq!(PullRequest::parse(b"10").unwrap().batch, 10);
        let request = PullRequest::parse(br#"{"batch":5,"expires":2000000000,"no_wait":true}"#).unwrap();
        assert_eq!(request.batch, 5);
        assert_eq!(request.expires, Duration::from_secs(2));
        assert!(request.no_wait);
        assert!(PullRequest::parse(b"nonsense").is_err());
    }

    #[test]
    fn test_kv_operation_and_address() {
        assert_eq!(KvOperation::parse(None).unwrap(), KvOperation::Put);
        assert_eq!(KvOperation::parse(Some("del")).unwrap(), KvOperation::Del);
        assert!(KvOperation::parse(Some("EXPLODE")).is_err());

        let address = KvAddress::parse("$KV", "$KV.config.app.theme").unwrap();
        assert_eq!(address.bucket, "config");
        assert_eq!(address.key, "app.theme");
        assert!(KvAddress::parse("$KV", "$KV.config").is_err());
    }

    #[test]
    fn test_stored_message_encodes_base64() {
        let message = Message::builder("s").header("a", "b").payload("hi").build().unwrap();
        let stored = StoredMessage::from(&message.with_sequence(7));
        assert_eq!(stored.seq, 7);
        assert_eq!(stored.data, "aGk=");
        assert!(stored.hdrs.is_some());
    }

    #[test]
    fn test_stream_config_name_from_subject() {
        assert_eq!(stream_config_for("S", b"").unwrap().name, "S");
        assert!(stream_config_for("S", br#"{"name":"T"}"#).is_err());
    }
}
