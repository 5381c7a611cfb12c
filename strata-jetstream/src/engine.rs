//! The engine: registry of streams, consumers and buckets, and dispatcher for
//! administrative, acknowledgement and key-value subjects.

use crate::{
    ack::{AckKind, AckSubject},
    api::{
        error_response, generic_response_type, page, parse_body, stream_config_for, AccountInfo,
        AccountLimits, ApiRequest, ApiResponse, CreateConsumerRequest, KvAddress, KvOperation,
        ListRequest, MsgDeleteRequest, PullRequest, StoredMessage, KV_OPERATION_HEADER,
    },
    config::{ConsumerConfig, StreamConfig},
    consumer::{Consumer, Delivery},
    kv::KvBucket,
    stream::{MsgGetRequest, PubAck, PurgeRequest, Stream, StreamInfo},
};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use strata_core::{
    config::JetStreamConfig,
    protocol::{constants, Headers},
    subject::overlaps,
    ConnectionId, Error, Message, Result,
};
use strata_storage::{StorageBackend, StorageType};
use tracing::{debug, info, warn};

/// Outcome of an administrative request.
#[derive(Debug)]
pub enum ApiReply {
    /// A JSON response for the reply subject
    Json(Bytes),
    /// A pull request to be served asynchronously
    Pull(PullTicket),
}

/// A pull request accepted for a consumer.
#[derive(Debug, Clone)]
pub struct PullTicket {
    /// Consumer to pull from
    pub consumer: Arc<Consumer>,
    /// Batch and wait parameters, already clamped
    pub request: PullRequest,
}

impl PullTicket {
    /// Status sent when the pull ends without messages.
    #[must_use]
    pub fn empty_status(&self) -> Headers {
        if self.request.no_wait {
            Headers::with_status(constants::STATUS_NO_MESSAGES, "No Messages")
        } else {
            Headers::with_status(constants::STATUS_REQUEST_TIMEOUT, "Request Timeout")
        }
    }
}

/// Streams, consumers and key-value buckets of one server.
#[derive(Debug)]
pub struct JetStreamEngine {
    config: JetStreamConfig,
    backend: Arc<dyn StorageBackend>,
    streams: DashMap<String, Arc<Stream>>,
    buckets: DashMap<String, Arc<KvBucket>>,
    ephemerals: DashMap<ConnectionId, Vec<(String, String)>>,
    admin: Mutex<()>,
}

fn under(prefix: &str, subject: &str) -> bool {
    subject.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('.'))
}

impl JetStreamEngine {
    /// Create an engine storing streams in `backend`.
    pub fn new(config: JetStreamConfig, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            config,
            backend,
            streams: DashMap::new(),
            buckets: DashMap::new(),
            ephemerals: DashMap::new(),
            admin: Mutex::new(()),
        }
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &JetStreamConfig {
        &self.config
    }

    /// Whether the engine serves requests.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.config.enabled {
            Ok(())
        } else {
            Err(Error::Disabled)
        }
    }

    /// Whether `subject` is an administrative request.
    #[must_use]
    pub fn is_api_subject(&self, subject: &str) -> bool {
        under(&self.config.api_prefix, subject)
    }

    /// Whether `subject` is an acknowledgement.
    #[must_use]
    pub fn is_ack_subject(&self, subject: &str) -> bool {
        under(&self.config.ack_prefix, subject)
    }

    /// Whether `subject` is a key-value request.
    #[must_use]
    pub fn is_kv_subject(&self, subject: &str) -> bool {
        under(&self.config.kv_prefix, subject)
    }

    fn reserved_patterns(&self) -> [String; 3] {
        [
            format!("{}.>", self.config.api_prefix),
            format!("{}.>", self.config.ack_prefix),
            format!("{}.>", self.config.kv_prefix),
        ]
    }

    // ---- streams ----

    /// Create a stream.
    ///
    /// # Errors
    /// - [`Error::InvalidRequest`] for an invalid configuration or subjects
    ///   overlapping the reserved namespaces
    /// - [`Error::AlreadyExists`] when the name is taken
    /// - [`Error::ResourceLimit`] when `max_streams` is reached
    pub fn create_stream(&self, config: StreamConfig) -> Result<Arc<Stream>> {
        self.ensure_enabled()?;
        let config = config.normalize()?;
        let reserved = self.reserved_patterns();
        if let Some(subject) =
            config.subjects.iter().find(|s| reserved.iter().any(|r| overlaps(s, r)))
        {
            return Err(Error::invalid_request(format!(
                "stream subject '{subject}' overlaps a reserved namespace"
            )));
        }

        let _admin = self.admin.lock();
        if self.streams.contains_key(&config.name) {
            return Err(Error::already_exists("stream", &config.name));
        }
        if self.config.max_streams > 0 && self.streams.len() >= self.config.max_streams {
            return Err(Error::ResourceLimit {
                resource: "streams".to_string(),
                limit: self.config.max_streams.to_string(),
            });
        }
        let store = self.backend.open(&config.name, config.storage)?;
        let stream = Stream::new(config, store);
        self.streams.insert(stream.name().to_string(), Arc::clone(&stream));
        info!(stream = %stream.name(), subjects = ?stream.config().subjects, "Created stream");
        Ok(stream)
    }

    /// Stream by name.
    ///
    /// # Errors
    /// [`Error::NotFound`] if no such stream exists.
    pub fn stream(&self, name: &str) -> Result<Arc<Stream>> {
        self.ensure_enabled()?;
        self.streams
            .get(name)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| Error::not_found("stream", name))
    }

    /// Replace a stream's configuration.
    ///
    /// # Errors
    /// [`Error::NotFound`] for a missing stream, [`Error::InvalidRequest`]
    /// for a rejected change.
    pub fn update_stream(&self, config: StreamConfig) -> Result<StreamInfo> {
        let stream = self.stream(&config.name)?;
        stream.update(config)
    }

    /// Delete a stream and its consumers.
    ///
    /// # Errors
    /// [`Error::NotFound`] for a missing stream, [`Error::PermissionDenied`]
    /// when the stream denies deletes.
    pub fn delete_stream(&self, name: &str) -> Result<()> {
        let stream = self.stream(name)?;
        let _admin = self.admin.lock();
        stream.delete()?;
        self.streams.remove(name);
        if let Err(err) = self.backend.remove(name) {
            warn!(stream = name, error = %err, "Failed to release stream storage");
        }
        info!(stream = name, "Deleted stream");
        Ok(())
    }

    /// Stream configuration and state, after applying age limits.
    ///
    /// # Errors
    /// [`Error::NotFound`] for a missing stream.
    pub fn stream_info(&self, name: &str) -> Result<StreamInfo> {
        let stream = self.stream(name)?;
        stream.expire();
        Ok(stream.info())
    }

    /// All streams sorted by name.
    #[must_use]
    pub fn streams(&self) -> Vec<Arc<Stream>> {
        let mut all: Vec<Arc<Stream>> = self.streams.iter().map(|s| Arc::clone(s.value())).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Sorted stream names.
    #[must_use]
    pub fn stream_names(&self) -> Vec<String> {
        self.streams().iter().map(|s| s.name().to_string()).collect()
    }

    /// Purge a stream, returning the number of removed messages.
    ///
    /// # Errors
    /// [`Error::NotFound`], [`Error::PermissionDenied`] or
    /// [`Error::InvalidRequest`].
    pub fn purge_stream(&self, name: &str, request: &PurgeRequest) -> Result<u64> {
        self.stream(name)?.purge(request)
    }

    /// Look up a stored message.
    ///
    /// # Errors
    /// [`Error::NotFound`] for a missing stream or message.
    pub fn get_message(&self, name: &str, request: &MsgGetRequest) -> Result<Message> {
        let stream = self.stream(name)?;
        stream.expire();
        stream.get_message(request)
    }

    /// Remove one message.
    ///
    /// # Errors
    /// [`Error::NotFound`] or [`Error::PermissionDenied`].
    pub fn delete_message(&self, name: &str, seq: u64) -> Result<()> {
        self.stream(name)?.delete_message(seq)
    }

    /// Store a plain publish in every stream capturing its subject.
    ///
    /// Returns one result per capturing stream; an empty vector means no
    /// stream was interested.
    pub fn ingest(&self, message: &Message) -> Vec<Result<PubAck>> {
        if !self.config.enabled {
            return Vec::new();
        }
        let subject = message.subject.as_str();
        let targets: Vec<Arc<Stream>> = self
            .streams
            .iter()
            .filter(|s| s.value().captures(subject))
            .map(|s| Arc::clone(s.value()))
            .collect();
        targets.iter().map(|stream| stream.ingest(message.clone())).collect()
    }

    // ---- consumers ----

    /// Create a consumer on `stream`.
    ///
    /// Ephemeral consumers are recorded against `owner` and removed by
    /// [`JetStreamEngine::release_connection`].
    ///
    /// # Errors
    /// [`Error::NotFound`] for a missing stream, [`Error::ResourceLimit`]
    /// when `max_consumers` is reached, or any consumer creation error.
    pub fn create_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
        owner: Option<ConnectionId>,
    ) -> Result<Arc<Consumer>> {
        let stream = self.stream(stream)?;
        // limit check and attach happen under one lock
        let _admin = self.admin.lock();
        if self.config.max_consumers > 0 && stream.consumer_count() >= self.config.max_consumers {
            return Err(Error::ResourceLimit {
                resource: format!("consumers on stream {}", stream.name()),
                limit: self.config.max_consumers.to_string(),
            });
        }
        let consumer = Consumer::create(&stream, config, owner)?;
        if let Some(owner) = consumer.owner() {
            self.ephemerals
                .entry(owner)
                .or_default()
                .push((stream.name().to_string(), consumer.name().to_string()));
        }
        Ok(consumer)
    }

    /// Consumer by stream and name.
    ///
    /// # Errors
    /// [`Error::NotFound`] for a missing stream or consumer.
    pub fn consumer(&self, stream: &str, name: &str) -> Result<Arc<Consumer>> {
        self.stream(stream)?.consumer(name).ok_or_else(|| Error::not_found("consumer", name))
    }

    /// Delete a consumer.
    ///
    /// # Errors
    /// [`Error::NotFound`] for a missing stream or consumer.
    pub fn delete_consumer(&self, stream: &str, name: &str) -> Result<()> {
        let consumer = self
            .stream(stream)?
            .detach(name)
            .ok_or_else(|| Error::not_found("consumer", name))?;
        consumer.mark_deleted();
        if let Some(owner) = consumer.owner() {
            let emptied = self.ephemerals.get_mut(&owner).is_some_and(|mut owned| {
                owned.retain(|(s, c)| !(s == stream && c == name));
                owned.is_empty()
            });
            if emptied {
                self.ephemerals.remove_if(&owner, |_, owned| owned.is_empty());
            }
        }
        debug!(stream, consumer = name, "Deleted consumer");
        Ok(())
    }

    /// Wait for messages on a consumer.
    ///
    /// # Errors
    /// [`Error::NotFound`] when the consumer disappears, or
    /// [`Error::ResourceLimit`] when too many pulls are parked.
    pub async fn fetch(&self, ticket: &PullTicket) -> Result<Vec<Delivery>> {
        if let Some(stream) = self.streams.get(ticket.consumer.stream_name()) {
            stream.expire();
        }
        let request = &ticket.request;
        ticket.consumer.next_batch(request.batch, request.expires, request.no_wait).await
    }

    /// Clamp a pull request to the configured limits.
    #[must_use]
    pub fn pull_ticket(&self, consumer: Arc<Consumer>, mut request: PullRequest) -> PullTicket {
        request.batch = request.batch.clamp(1, self.config.max_batch.max(1));
        if request.expires.is_zero() {
            request.expires = self.config.default_pull_wait;
        }
        PullTicket { consumer, request }
    }

    /// Reply subject carried by a delivered message.
    #[must_use]
    pub fn ack_reply(&self, delivery: &Delivery) -> String {
        delivery.ack.format(&self.config.ack_prefix)
    }

    /// Settle a delivery from a publish on its ack subject.
    ///
    /// # Errors
    /// [`Error::InvalidSubject`] for a malformed subject,
    /// [`Error::InvalidRequest`] for a bad payload, [`Error::NotFound`] for a
    /// missing consumer.
    pub fn ack(&self, subject: &str, payload: &[u8]) -> Result<()> {
        self.ensure_enabled()?;
        let ack = AckSubject::parse(&self.config.ack_prefix, subject)?;
        let kind = AckKind::parse(payload)?;
        let consumer = self.consumer(&ack.stream, &ack.consumer)?;
        consumer.process_ack(ack.stream_seq, kind);
        Ok(())
    }

    /// Delete every ephemeral consumer owned by `connection`.
    pub fn release_connection(&self, connection: ConnectionId) -> usize {
        let Some((_, owned)) = self.ephemerals.remove(&connection) else { return 0 };
        let mut released = 0;
        for (stream, consumer) in owned {
            if self.delete_consumer(&stream, &consumer).is_ok() {
                released += 1;
            }
        }
        if released > 0 {
            debug!(%connection, released, "Released ephemeral consumers");
        }
        released
    }

    // ---- key-value ----

    /// Bucket by name.
    ///
    /// # Errors
    /// [`Error::NotFound`] if the bucket was never written.
    pub fn bucket(&self, name: &str) -> Result<Arc<KvBucket>> {
        self.ensure_enabled()?;
        self.buckets
            .get(name)
            .map(|b| Arc::clone(b.value()))
            .ok_or_else(|| Error::not_found("bucket", name))
    }

    /// Bucket by name, created on first use.
    ///
    /// # Errors
    /// [`Error::InvalidRequest`] for an invalid bucket name.
    pub fn bucket_or_create(&self, name: &str) -> Result<Arc<KvBucket>> {
        self.ensure_enabled()?;
        if let Some(bucket) = self.buckets.get(name) {
            return Ok(Arc::clone(bucket.value()));
        }
        let bucket = Arc::new(KvBucket::new(name)?);
        let bucket = self.buckets.entry(name.to_string()).or_insert(bucket);
        Ok(Arc::clone(bucket.value()))
    }

    /// Sorted bucket names.
    #[must_use]
    pub fn bucket_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buckets.iter().map(|b| b.key().clone()).collect();
        names.sort();
        names
    }

    /// Serve a publish on a key-value subject and return the response body.
    ///
    /// # Errors
    /// [`Error::InvalidRequest`] for a malformed subject or operation,
    /// [`Error::NotFound`] for reads and deletes of absent buckets or keys.
    pub fn handle_kv(&self, message: &Message) -> Result<Bytes> {
        self.ensure_enabled()?;
        let address = KvAddress::parse(&self.config.kv_prefix, message.subject.as_str())?;
        let operation = KvOperation::parse(message.header(KV_OPERATION_HEADER))?;
        let success = || Bytes::from(json!({ "success": true }).to_string());
        match operation {
            KvOperation::Put => {
                let revision =
                    self.bucket_or_create(&address.bucket)?.put(&address.key, message.payload.clone())?;
                Ok(Bytes::from(json!({ "seq": revision }).to_string()))
            },
            KvOperation::Get => self.bucket(&address.bucket)?.get(&address.key),
            KvOperation::Del => {
                self.bucket(&address.bucket)?.delete(&address.key)?;
                Ok(success())
            },
            KvOperation::Purge => {
                self.bucket(&address.bucket)?.purge(&address.key)?;
                Ok(success())
            },
        }
    }

    // ---- administrative API ----

    /// Usage across all streams.
    #[must_use]
    pub fn account_info(&self) -> AccountInfo {
        let mut info = AccountInfo {
            limits: AccountLimits {
                max_streams: limit_or_unlimited(self.config.max_streams),
                max_consumers: limit_or_unlimited(self.config.max_consumers),
            },
            ..AccountInfo::default()
        };
        for stream in self.streams() {
            let state = stream.state();
            match stream.config().storage {
                StorageType::Memory => info.memory += state.bytes,
                StorageType::File => info.storage += state.bytes,
            }
            info.streams += 1;
            info.consumers += state.consumer_count;
        }
        info
    }

    /// Serve a publish on an administrative subject.
    ///
    /// Failures are encoded as error responses, so the reply is always
    /// something to send back.
    pub fn handle(&self, subject: &str, payload: &[u8], owner: Option<ConnectionId>) -> ApiReply {
        let request = match ApiRequest::parse(&self.config.api_prefix, subject) {
            Ok(request) => request,
            Err(err) => return ApiReply::Json(error_response(&generic_response_type(), &err)),
        };
        let response_type = request.response_type();
        let outcome = self
            .ensure_enabled()
            .and_then(|()| self.dispatch(&request, payload, owner));
        match outcome {
            Ok(Dispatched::Pull(ticket)) => ApiReply::Pull(ticket),
            Ok(Dispatched::Response(response)) => match response.encode(response_type) {
                Ok(bytes) => ApiReply::Json(bytes),
                Err(err) => ApiReply::Json(error_response(response_type, &err)),
            },
            Err(err) => {
                debug!(subject, error = %err, "API request failed");
                ApiReply::Json(error_response(response_type, &err))
            },
        }
    }

    fn dispatch(
        &self,
        request: &ApiRequest,
        payload: &[u8],
        owner: Option<ConnectionId>,
    ) -> Result<Dispatched> {
        let response = match request {
            ApiRequest::AccountInfo => ApiResponse::Account(self.account_info()),
            ApiRequest::StreamCreate { stream } => {
                let config = stream_config_for(stream, payload)?;
                ApiResponse::Stream(Box::new(self.create_stream(config)?.info()))
            },
            ApiRequest::StreamUpdate { stream } => {
                let config = stream_config_for(stream, payload)?;
                ApiResponse::Stream(Box::new(self.update_stream(config)?))
            },
            ApiRequest::StreamDelete { stream } => {
                self.delete_stream(stream)?;
                ApiResponse::Success
            },
            ApiRequest::StreamInfo { stream } => {
                ApiResponse::Stream(Box::new(self.stream_info(stream)?))
            },
            ApiRequest::StreamList => {
                let list: ListRequest = parse_body(payload)?;
                let infos = self.streams().iter().map(|s| s.info()).collect();
                let (streams, total) = page(infos, list.offset);
                ApiResponse::StreamList { streams, total, offset: list.offset }
            },
            ApiRequest::StreamNames => {
                let list: ListRequest = parse_body(payload)?;
                let (names, total) = page(self.stream_names(), list.offset);
                ApiResponse::Names { field: "streams", names, total, offset: list.offset }
            },
            ApiRequest::StreamPurge { stream } => {
                let purge: PurgeRequest = parse_body(payload)?;
                ApiResponse::Purged(self.purge_stream(stream, &purge)?)
            },
            ApiRequest::MsgGet { stream } => {
                let get: MsgGetRequest = parse_body(payload)?;
                let message = self.get_message(stream, &get)?;
                ApiResponse::Message(Box::new(StoredMessage::from(&message)))
            },
            ApiRequest::MsgDelete { stream } => {
                let delete: MsgDeleteRequest = parse_body(payload)?;
                self.delete_message(stream, delete.seq)?;
                ApiResponse::Success
            },
            ApiRequest::ConsumerCreate { stream, consumer, filter } => {
                let body: CreateConsumerRequest = parse_body(payload)?;
                let config =
                    consumer_config_for(stream, body, consumer.as_deref(), filter.as_deref(), false)?;
                let consumer = self.create_consumer(stream, config, owner)?;
                ApiResponse::Consumer(Box::new(consumer.info()))
            },
            ApiRequest::DurableCreate { stream, consumer } => {
                let body: CreateConsumerRequest = parse_body(payload)?;
                let config = consumer_config_for(stream, body, Some(consumer), None, true)?;
                let consumer = self.create_consumer(stream, config, owner)?;
                ApiResponse::Consumer(Box::new(consumer.info()))
            },
            ApiRequest::ConsumerDelete { stream, consumer } => {
                self.delete_consumer(stream, consumer)?;
                ApiResponse::Success
            },
            ApiRequest::ConsumerInfo { stream, consumer } => {
                ApiResponse::Consumer(Box::new(self.consumer(stream, consumer)?.info()))
            },
            ApiRequest::ConsumerList { stream } => {
                let list: ListRequest = parse_body(payload)?;
                let infos = self.stream(stream)?.consumers().iter().map(|c| c.info()).collect();
                let (consumers, total) = page(infos, list.offset);
                ApiResponse::ConsumerList { consumers, total, offset: list.offset }
            },
            ApiRequest::ConsumerNames { stream } => {
                let list: ListRequest = parse_body(payload)?;
                let names =
                    self.stream(stream)?.consumers().iter().map(|c| c.name().to_string()).collect();
                let (names, total) = page(names, list.offset);
                ApiResponse::Names { field: "consumers", names, total, offset: list.offset }
            },
            ApiRequest::ConsumerNext { stream, consumer } => {
                let consumer = self.consumer(stream, consumer)?;
                let request = PullRequest::parse(payload)?;
                return Ok(Dispatched::Pull(self.pull_ticket(consumer, request)));
            },
        };
        Ok(Dispatched::Response(response))
    }
}

enum Dispatched {
    Response(ApiResponse),
    Pull(PullTicket),
}

fn limit_or_unlimited(limit: usize) -> i64 {
    if limit == 0 {
        -1
    } else {
        i64::try_from(limit).unwrap_or(i64::MAX)
    }
}

/// Merge the names carried by the subject into the request body.
fn consumer_config_for(
    stream: &str,
    body: CreateConsumerRequest,
    name: Option<&str>,
    filter: Option<&str>,
    durable: bool,
) -> Result<ConsumerConfig> {
    if !body.stream_name.is_empty() && body.stream_name != stream {
        return Err(Error::invalid_request("stream name in subject does not match request"));
    }
    let mut config = body.config;
    if let Some(name) = name {
        let conflicting = [config.durable_name.as_deref(), config.name.as_deref()]
            .into_iter()
            .flatten()
            .any(|existing| existing != name);
        if conflicting {
            return Err(Error::invalid_request("consumer name in subject does not match request"));
        }
        if durable {
            config.durable_name = Some(name.to_string());
        } else if config.durable_name.is_none() {
            config.name = Some(name.to_string());
        }
    }
    if let Some(filter) = filter {
        match config.filter_subject.as_deref() {
            Some(existing) if existing != filter => {
                return Err(Error::invalid_request(
                    "filter subject in subject does not match request",
                ));
            },
            _ => config.filter_subject = Some(filter.to_string()),
        }
    }
    Ok(config)
}
