//! Core broker implementation.
//!
//! [`BrokerState`] is the state every session shares: the JetStream engine,
//! the subscription index and the live-connection set. Every publish, from a
//! socket or from [`BrokerHandle::publish`], goes through
//! [`BrokerState::publish`], which intercepts the reserved namespaces before
//! storing and fanning out.

use crate::network::{Connection, ConnectionManager, TcpServer};
use crate::routing::SubscriptionIndex;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_core::{
    config::{ConfigValidator, StrataConfig},
    protocol::{constants, Headers, ServerInfo},
    subject::validate_subject,
    Message, Result,
};
use strata_jetstream::{ApiReply, JetStreamEngine, PubAck, PullTicket};
use strata_storage::{MemoryBackend, MemoryBackendConfig};
use tracing::{debug, info};

/// State shared by the listener, every session and in-process publishers.
#[derive(Debug)]
pub struct BrokerState {
    config: StrataConfig,
    server_id: String,
    engine: Arc<JetStreamEngine>,
    index: SubscriptionIndex,
    connections: ConnectionManager,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
}

impl BrokerState {
    /// Shared state with a memory-backed engine.
    ///
    /// `jetstream.max_memory` becomes the backend's shared byte budget.
    ///
    /// # Errors
    /// [`strata_core::Error::Configuration`] if the backend rejects the budget.
    pub fn new(config: StrataConfig) -> Result<Arc<Self>> {
        let mut backend_config = MemoryBackendConfig::new();
        if config.jetstream.max_memory > 0 {
            backend_config = backend_config.with_max_memory_bytes(config.jetstream.max_memory);
        }
        let backend = MemoryBackend::with_config(backend_config)?;
        let engine = JetStreamEngine::new(config.jetstream.clone(), Arc::new(backend));
        Ok(Self::with_engine(config, Arc::new(engine)))
    }

    /// Shared state around an existing engine.
    #[must_use]
    pub fn with_engine(config: StrataConfig, engine: Arc<JetStreamEngine>) -> Arc<Self> {
        let connections = ConnectionManager::new(config.server.max_connections);
        Arc::new(Self {
            config,
            server_id: uuid::Uuid::new_v4().simple().to_string().to_uppercase(),
            engine,
            index: SubscriptionIndex::new(),
            connections,
            messages_in: AtomicU64::new(0),
            messages_out: AtomicU64::new(0),
        })
    }

    /// Server configuration.
    #[must_use]
    pub const fn config(&self) -> &StrataConfig {
        &self.config
    }

    /// Server id announced in `INFO`.
    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// The JetStream engine.
    #[must_use]
    pub const fn engine(&self) -> &Arc<JetStreamEngine> {
        &self.engine
    }

    /// The subscription index.
    #[must_use]
    pub const fn index(&self) -> &SubscriptionIndex {
        &self.index
    }

    /// The live-connection set.
    #[must_use]
    pub const fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// `INFO` body for client `client_id`.
    #[must_use]
    pub fn server_info(&self, client_id: u64) -> ServerInfo {
        let server = &self.config.server;
        ServerInfo {
            server_id: self.server_id.clone(),
            server_name: server.server_name.clone(),
            version: strata_core::VERSION.to_string(),
            proto: constants::PROTOCOL_LEVEL,
            host: server.host.clone(),
            port: server.port,
            headers: true,
            max_payload: server.max_payload,
            jetstream: self.engine.is_enabled(),
            client_id: Some(client_id),
        }
    }

    /// Deliver `message` to every matching plain subscription and to one
    /// member of each matching queue group.
    ///
    /// The publisher itself is skipped when it disabled `echo`.
    pub fn route_message(&self, message: &Message, origin: Option<&Connection>) -> usize {
        let skip = origin.filter(|c| !c.echo()).map(Connection::id);
        let delivered = self.index.route(message.subject.as_str(), message, skip);
        self.messages_out.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Accept a publish.
    ///
    /// Administrative, acknowledgement and key-value subjects go to the
    /// engine and never reach subscribers. Everything else is stored in any
    /// stream that captures it, then fanned out; a publisher that set a
    /// reply subject gets the stream's acknowledgement there.
    pub fn publish(self: &Arc<Self>, message: Message, origin: Option<&Arc<Connection>>) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
        let subject = message.subject.as_str();

        if self.engine.is_api_subject(subject) {
            self.handle_api(&message, origin);
        } else if self.engine.is_ack_subject(subject) {
            if let Err(e) = self.engine.ack(subject, &message.payload) {
                debug!(subject, error = %e, "Acknowledgement rejected");
            }
        } else if self.engine.is_kv_subject(subject) {
            self.handle_kv(&message, origin);
        } else {
            let acks = self.engine.ingest(&message);
            self.route_message(&message, origin.map(Arc::as_ref));
            if let (Some(reply), Some(ack)) = (message.reply_to.as_deref(), acks.into_iter().next()) {
                self.reply(reply, pub_ack_body(ack), None);
            }
        }
    }

    /// Send a response to an inbox. Responses reach only the inbox's
    /// subscribers.
    pub fn reply(&self, inbox: &str, payload: Bytes, headers: Option<Headers>) -> usize {
        match Message::builder(inbox).headers(headers).payload(payload).build() {
            Ok(message) => self.route_message(&message, None),
            Err(e) => {
                debug!(inbox, error = %e, "Dropping reply to invalid subject");
                0
            },
        }
    }

    fn handle_api(self: &Arc<Self>, message: &Message, origin: Option<&Arc<Connection>>) {
        let owner = origin.map(|c| c.id());
        let reply = self.engine.handle(message.subject.as_str(), &message.payload, owner);
        let Some(inbox) = message.reply_to.clone() else {
            debug!(subject = %message.subject, "API request without reply subject");
            return;
        };
        if validate_subject(&inbox).is_err() {
            debug!(subject = %message.subject, inbox, "API request with invalid reply subject");
            return;
        }
        match reply {
            ApiReply::Json(body) => {
                self.reply(&inbox, body, None);
            },
            ApiReply::Pull(ticket) => self.spawn_pull(ticket, inbox, origin),
        }
    }

    fn spawn_pull(
        self: &Arc<Self>,
        ticket: PullTicket,
        inbox: String,
        origin: Option<&Arc<Connection>>,
    ) {
        let state = Arc::clone(self);
        let task = tokio::spawn(async move {
            match state.engine.fetch(&ticket).await {
                Ok(batch) if batch.is_empty() => {
                    state.reply(&inbox, Bytes::new(), Some(ticket.empty_status()));
                },
                Ok(batch) => {
                    for delivery in batch {
                        let ack_reply = state.engine.ack_reply(&delivery);
                        let mut message = delivery.message;
                        message.reply_to = Some(ack_reply);
                        let delivered = state.index.route(&inbox, &message, None);
                        state.messages_out.fetch_add(delivered as u64, Ordering::Relaxed);
                    }
                },
                Err(e) => {
                    debug!(consumer = ticket.consumer.name(), error = %e, "Pull request failed");
                    state.reply(&inbox, Bytes::new(), Some(Headers::with_status(e.code(), e.to_string())));
                },
            }
        });
        if let Some(connection) = origin {
            connection.track_pull(task.abort_handle());
        }
    }

    fn handle_kv(&self, message: &Message, origin: Option<&Arc<Connection>>) {
        let outcome = self.engine.handle_kv(message);
        match (outcome, message.reply_to.as_deref()) {
            (Ok(body), Some(inbox)) => {
                self.reply(inbox, body, None);
            },
            (Ok(_), None) => {},
            (Err(e), Some(inbox)) => {
                debug!(subject = %message.subject, error = %e, "KV request failed");
                self.reply(inbox, Bytes::new(), Some(Headers::with_status(e.code(), e.to_string())));
            },
            (Err(e), None) => {
                debug!(subject = %message.subject, error = %e, "KV request failed");
                if let Some(connection) = origin {
                    connection.send_error(e.to_string());
                }
            },
        }
    }

    /// Drop everything a closing connection owns: its subscriptions, its
    /// ephemeral consumers and its entry in the live set. Safe to call more
    /// than once.
    pub fn release(&self, connection: &Connection) {
        connection.close();
        let subscriptions = connection.take_subscriptions();
        for subscription in &subscriptions {
            self.index.remove(subscription);
        }
        let consumers = self.engine.release_connection(connection.id());
        if self.connections.remove_connection(connection.id()).is_some() {
            info!(
                connection = %connection.id(),
                subscriptions = subscriptions.len(),
                consumers,
                "Connection released"
            );
        }
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            client_count: self.connections.connection_count(),
            total_connections: self.connections.total_connections(),
            subscriptions: self.index.len(),
            streams: self.engine.stream_names().len(),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
        }
    }
}

fn pub_ack_body(ack: Result<PubAck>) -> Bytes {
    match ack {
        Ok(ack) => serde_json::to_vec(&ack).map_or_else(|_| Bytes::new(), Bytes::from),
        Err(e) => Bytes::from(
            serde_json::json!({ "error": { "code": e.code(), "description": e.to_string() } })
                .to_string(),
        ),
    }
}

/// Main broker instance.
#[derive(Debug)]
pub struct Broker {
    state: Arc<BrokerState>,
}

impl Broker {
    /// Create a broker from a validated configuration.
    ///
    /// # Errors
    /// [`strata_core::Error::Configuration`] if `config` is invalid.
    pub fn new(config: StrataConfig) -> Result<Self> {
        ConfigValidator::validate(&config)?;
        Ok(Self { state: BrokerState::new(config)? })
    }

    /// Create a broker around an existing engine.
    ///
    /// # Errors
    /// [`strata_core::Error::Configuration`] if `config` is invalid.
    pub fn with_engine(config: StrataConfig, engine: Arc<JetStreamEngine>) -> Result<Self> {
        ConfigValidator::validate(&config)?;
        Ok(Self { state: BrokerState::with_engine(config, engine) })
    }

    /// Shared state.
    #[must_use]
    pub const fn state(&self) -> &Arc<BrokerState> {
        &self.state
    }

    /// Bind the listener and begin accepting connections.
    ///
    /// # Errors
    /// [`strata_core::Error::Network`] if the address cannot be bound.
    pub async fn start(&self) -> Result<BrokerHandle> {
        let server = TcpServer::start(Arc::clone(&self.state)).await?;
        info!(address = %server.local_addr(), server_id = self.state.server_id(), "Broker started");
        Ok(BrokerHandle { state: Arc::clone(&self.state), server })
    }
}

/// Handle for interacting with a running broker.
#[derive(Debug)]
pub struct BrokerHandle {
    state: Arc<BrokerState>,
    server: TcpServer,
}

impl BrokerHandle {
    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Publish a message as an in-process client.
    pub fn publish(&self, message: Message) {
        self.state.publish(message, None);
    }

    /// The JetStream engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<JetStreamEngine> {
        self.state.engine()
    }

    /// Get broker statistics.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        self.state.stats()
    }

    /// Stop accepting, close every connection and wait for the sessions.
    ///
    /// # Errors
    /// [`strata_core::Error::Internal`] if the accept loop panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        self.server.stop().await?;
        info!("Broker stopped");
        Ok(())
    }
}

/// Broker runtime statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerStats {
    /// Number of connected clients
    pub client_count: usize,
    /// Connections accepted since start
    pub total_connections: u64,
    /// Live subscriptions
    pub subscriptions: usize,
    /// Streams
    pub streams: usize,
    /// Publishes accepted
    pub messages_in: u64,
    /// Frames delivered to subscribers
    pub messages_out: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::Subscription;
    use strata_jetstream::{ConsumerConfig, StreamConfig};
    use tokio::sync::mpsc;

    fn subscribe(state: &BrokerState, subject: &str) -> (Arc<Connection>, mpsc::Receiver<Bytes>) {
        let (conn, rx) = Connection::detached(64);
        let sub = Arc::new(Subscription::new(Arc::clone(&conn), "1", subject, None));
        conn.remember(Arc::clone(&sub));
        state.index().insert(sub);
        (conn, rx)
    }

    fn frame_text(frame: &Bytes) -> String {
        String::from_utf8_lossy(frame).into_owned()
    }

    #[tokio::test]
    async fn test_publish_stores_then_fans_out() {
        let state = BrokerState::new(StrataConfig::default()).unwrap();
        state.engine().create_stream(StreamConfig::new("ORDERS", ["orders.*"])).unwrap();
        let (_sub, mut rx) = subscribe(&state, "orders.>");
        let (_inbox, mut acks) = subscribe(&state, "_INBOX.1");

        let message = Message::builder("orders.new").reply_to("_INBOX.1").payload("{}").build().unwrap();
        state.publish(message, None);

        assert_eq!(frame_text(&rx.recv().await.unwrap()), "MSG orders.new 1 _INBOX.1 2\r\n{}\r\n");
        let ack = frame_text(&acks.recv().await.unwrap());
        assert!(ack.ends_with("{\"stream\":\"ORDERS\",\"seq\":1}\r\n"), "{ack}");
        assert_eq!(state.stats().messages_in, 1);
    }

    #[tokio::test]
    async fn test_api_subjects_are_not_fanned_out() {
        let state = BrokerState::new(StrataConfig::default()).unwrap();
        let (_all, mut rx) = subscribe(&state, ">");
        let (_inbox, mut replies) = subscribe(&state, "_INBOX.api");

        let request = Message::builder("$JS.API.STREAM.CREATE.S")
            .reply_to("_INBOX.api")
            .payload(r#"{"subjects":["s.>"]}"#)
            .build()
            .unwrap();
        state.publish(request, None);

        // the `>` subscriber sees only the response on the inbox
        let seen = frame_text(&rx.recv().await.unwrap());
        assert!(seen.starts_with("MSG _INBOX.api"), "{seen}");
        let reply = frame_text(&replies.recv().await.unwrap());
        assert!(reply.contains("stream_create_response"), "{reply}");
        assert!(state.engine().stream("S").is_ok());
    }

    #[tokio::test]
    async fn test_pull_delivers_with_ack_reply() {
        let state = BrokerState::new(StrataConfig::default()).unwrap();
        state.engine().create_stream(StreamConfig::new("S", ["s"])).unwrap();
        state.engine().create_consumer("S", ConsumerConfig::durable("c"), None).unwrap();
        state.publish(Message::new("s", "one").unwrap(), None);
        let (_inbox, mut rx) = subscribe(&state, "_INBOX.pull");

        let request = Message::builder("$JS.API.CONSUMER.MSG.NEXT.S.c")
            .reply_to("_INBOX.pull")
            .payload(r#"{"batch":1,"no_wait":true}"#)
            .build()
            .unwrap();
        state.publish(request, None);

        let frame = frame_text(&rx.recv().await.unwrap());
        assert!(frame.starts_with("MSG s 1 $JS.ACK.S.c.1.1.1."), "{frame}");
    }

    #[tokio::test]
    async fn test_pull_to_wildcard_inbox_is_dropped() {
        let state = BrokerState::new(StrataConfig::default()).unwrap();
        state.engine().create_stream(StreamConfig::new("S", ["s"])).unwrap();
        state.engine().create_consumer("S", ConsumerConfig::durable("c"), None).unwrap();
        state.publish(Message::new("s", "one").unwrap(), None);
        let (_inbox, mut rx) = subscribe(&state, "r.*");

        let request = Message::builder("$JS.API.CONSUMER.MSG.NEXT.S.c")
            .reply_to("r.*")
            .payload(r#"{"batch":1,"no_wait":true}"#)
            .build()
            .unwrap();
        state.publish(request, None);
        tokio::task::yield_now().await;

        assert!(rx.try_recv().is_err());
        let consumer = state.engine().consumer("S", "c").unwrap();
        assert_eq!(consumer.state().num_pending, 1);
    }

    #[tokio::test]
    async fn test_release_drops_everything_once() {
        let state = BrokerState::new(StrataConfig::default()).unwrap();
        state.engine().create_stream(StreamConfig::new("S", ["s"])).unwrap();
        let (conn, _rx) = subscribe(&state, "a.b");
        state.connections().add_connection(Arc::clone(&conn)).unwrap();
        state
            .engine()
            .create_consumer("S", ConsumerConfig::default(), Some(conn.id()))
            .unwrap();

        state.release(&conn);
        state.release(&conn);
        assert!(conn.is_closed());
        assert!(state.index().is_empty());
        assert_eq!(state.engine().stream("S").unwrap().consumer_count(), 0);
        assert_eq!(state.connections().connection_count(), 0);
    }

    #[test]
    fn test_max_memory_caps_stream_storage() {
        let mut config = StrataConfig::default();
        config.jetstream.max_memory = 16;
        let state = BrokerState::new(config).unwrap();
        state.engine().create_stream(StreamConfig::new("S", ["s"])).unwrap();

        let big = Message::new("s", vec![b'x'; 100]).unwrap();
        let results = state.engine().ingest(&big);
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(strata_core::Error::ResourceLimit { .. })));
    }

    #[tokio::test]
    async fn test_kv_error_without_reply_goes_to_publisher() {
        let state = BrokerState::new(StrataConfig::default()).unwrap();
        let (conn, mut rx) = Connection::detached(4);
        let request = Message::builder("$KV.missing.key").header("KV-Operation", "GET").build().unwrap();
        state.publish(request, Some(&conn));
        assert!(frame_text(&rx.recv().await.unwrap()).starts_with("-ERR '"));
    }
}
