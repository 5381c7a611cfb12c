//! Client connection state.
//!
//! A [`Connection`] is the shared half of a client session: its negotiated
//! options, its subscriptions keyed by sid, and the bounded queue of encoded
//! frames drained by the connection's writer task. Anything that wants to
//! talk to the client (fan-out, pull deliveries, API replies) goes through
//! [`Connection::send`], which never blocks: a full queue marks the client a
//! slow consumer and closes it.

use crate::routing::Subscription;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_core::{
    protocol::{encode, ConnectOptions, ServerOp},
    ConnectionId, Error, Message, Result,
};
use tokio::sync::{mpsc, Notify};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Statistics for a client connection.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// Number of bytes received
    pub bytes_received: u64,
    /// Number of bytes queued for the client
    pub bytes_sent: u64,
    /// Number of operations received
    pub messages_received: u64,
    /// Number of frames queued for the client
    pub messages_sent: u64,
    /// How long the connection has been open
    pub connected_for: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
}

/// Represents a client connection to the server.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    client_id: u64,
    remote_addr: Option<SocketAddr>,
    options: RwLock<ConnectOptions>,
    outbound: mpsc::Sender<Bytes>,
    closed: AtomicBool,
    close_signal: Notify,
    subscriptions: Mutex<HashMap<String, Arc<Subscription>>>,
    pulls: Mutex<Vec<AbortHandle>>,
    counters: Counters,
    connected_at: Instant,
}

impl Connection {
    /// Create a connection whose frames are drained from the returned
    /// receiver. At most `capacity` frames may be queued.
    #[must_use]
    pub fn new(
        client_id: u64,
        remote_addr: Option<SocketAddr>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let connection = Arc::new(Self {
            id: ConnectionId::new(),
            client_id,
            remote_addr,
            options: RwLock::new(ConnectOptions::default()),
            outbound,
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
            subscriptions: Mutex::new(HashMap::new()),
            pulls: Mutex::new(Vec::new()),
            counters: Counters::default(),
            connected_at: Instant::now(),
        });
        (connection, rx)
    }

    /// A connection without a socket, for in-process clients.
    #[must_use]
    pub fn detached(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        Self::new(0, None, capacity)
    }

    /// Get the connection ID.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Numeric id announced to the client in `INFO`.
    #[must_use]
    pub const fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Peer address, if the connection has a socket.
    #[must_use]
    pub const fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Options from the client's `CONNECT`.
    #[must_use]
    pub fn options(&self) -> ConnectOptions {
        self.options.read().clone()
    }

    /// Replace the negotiated options.
    pub fn set_options(&self, options: ConnectOptions) {
        *self.options.write() = options;
    }

    /// Client name from `CONNECT`.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.options.read().name.clone()
    }

    /// Whether the client wants `+OK` after each operation.
    #[must_use]
    pub fn is_verbose(&self) -> bool {
        self.options.read().verbose
    }

    /// Whether the client receives its own publishes.
    #[must_use]
    pub fn echo(&self) -> bool {
        self.options.read().echo
    }

    /// Queue a frame for the client.
    ///
    /// Returns `false` when the connection is closed or the frame was dropped.
    /// A full queue closes the connection.
    pub fn send(&self, op: &ServerOp) -> bool {
        if self.is_closed() {
            return false;
        }
        let frame = match encode(op) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(connection = %self.id, error = %e, "Failed to encode frame");
                return false;
            },
        };
        let len = frame.len() as u64;
        match self.outbound.try_send(frame) {
            Ok(()) => {
                self.counters.bytes_sent.fetch_add(len, Ordering::Relaxed);
                self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            },
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection = %self.id, "Slow consumer, closing connection");
                self.close();
                false
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close();
                false
            },
        }
    }

    /// Queue a `MSG` (or `HMSG` when the client negotiated headers) for `sid`.
    pub fn deliver(&self, sid: &str, message: &Message) -> bool {
        let headers = if self.options.read().headers { message.headers.clone() } else { None };
        self.send(&ServerOp::Msg {
            subject: message.subject.as_str().to_string(),
            sid: sid.to_string(),
            reply_to: message.reply_to.clone(),
            headers,
            payload: message.payload.clone(),
        })
    }

    /// Send `-ERR '<text>'`.
    pub fn send_error(&self, text: impl Into<String>) -> bool {
        self.send(&ServerOp::Err(text.into()))
    }

    /// Record bytes read from the socket.
    pub fn record_bytes_received(&self, bytes: usize) {
        self.counters.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record one decoded operation.
    pub fn record_op(&self) {
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Get connection statistics.
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            connected_for: self.connected_at.elapsed(),
        }
    }

    // ---- subscriptions ----

    /// Register `subscription` under its sid, returning the one it replaces.
    pub fn remember(&self, subscription: Arc<Subscription>) -> Option<Arc<Subscription>> {
        self.subscriptions.lock().insert(subscription.sid().to_string(), subscription)
    }

    /// Subscription registered under `sid`.
    #[must_use]
    pub fn subscription(&self, sid: &str) -> Option<Arc<Subscription>> {
        self.subscriptions.lock().get(sid).cloned()
    }

    /// Drop `sid` if it still refers to subscription `id`.
    pub fn forget(&self, sid: &str, id: u64) -> Option<Arc<Subscription>> {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.get(sid).is_some_and(|s| s.id() == id) {
            subscriptions.remove(sid)
        } else {
            None
        }
    }

    /// Remove and return every subscription.
    pub fn take_subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions.lock().drain().map(|(_, s)| s).collect()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    // ---- lifecycle ----

    /// Track a pull request task so closing the connection aborts it.
    pub fn track_pull(&self, handle: AbortHandle) {
        let mut pulls = self.pulls.lock();
        pulls.retain(|h| !h.is_finished());
        if self.is_closed() {
            handle.abort();
        } else {
            pulls.push(handle);
        }
    }

    /// Mark the connection closed and abort its pull requests.
    ///
    /// Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        for pull in self.pulls.lock().drain(..) {
            pull.abort();
        }
        self.close_signal.notify_waiters();
        debug!(connection = %self.id, "Connection marked closed");
        true
    }

    /// Whether [`Connection::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolve once the connection is closed.
    pub async fn closed(&self) {
        loop {
            let notified = self.close_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}

/// Live-connection set of a server.
#[derive(Debug)]
pub struct ConnectionManager {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    max_connections: usize,
    connection_counter: AtomicU64,
}

impl ConnectionManager {
    /// Create a new connection manager.
    #[must_use]
    pub fn new(max_connections: usize) -> Self {
        Self { connections: DashMap::new(), max_connections, connection_counter: AtomicU64::new(0) }
    }

    /// Next client id for `INFO`. Ids start at 1.
    pub fn next_client_id(&self) -> u64 {
        self.connection_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Add a new connection to the manager.
    ///
    /// # Errors
    /// [`Error::ResourceLimit`] if the connection limit is reached.
    pub fn add_connection(&self, connection: Arc<Connection>) -> Result<()> {
        if !self.can_accept_connection() {
            return Err(Error::ResourceLimit {
                resource: "connections".to_string(),
                limit: self.max_connections.to_string(),
            });
        }
        self.connections.insert(connection.id(), connection);
        Ok(())
    }

    /// Remove a connection from the manager.
    pub fn remove_connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.remove(&id).map(|(_, connection)| connection)
    }

    /// Get a connection by ID.
    #[must_use]
    pub fn get_connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Get the current number of active connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get the total number of connections ever accepted.
    #[must_use]
    pub fn total_connections(&self) -> u64 {
        self.connection_counter.load(Ordering::Relaxed)
    }

    /// Check if the manager can accept new connections.
    #[must_use]
    pub fn can_accept_connection(&self) -> bool {
        self.connections.len() < self.max_connections
    }

    /// Get all active connection IDs.
    #[must_use]
    pub fn get_all_connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Close every live connection. Sessions notice and clean up.
    pub fn close_all(&self) -> usize {
        self.connections.iter().filter(|entry| entry.value().close()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_queues_frames() {
        let (conn, mut rx) = Connection::detached(4);
        assert!(conn.send(&ServerOp::Pong));
        assert_eq!(&rx.recv().await.unwrap()[..], b"PONG\r\n");

        let stats = conn.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.bytes_sent, 6);
    }

    #[tokio::test]
    async fn test_slow_consumer_is_closed() {
        let (conn, _rx) = Connection::detached(2);
        assert!(conn.send(&ServerOp::Ping));
        assert!(conn.send(&ServerOp::Ping));
        assert!(!conn.send(&ServerOp::Ping));
        assert!(conn.is_closed());
        assert!(!conn.send(&ServerOp::Ping));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_wakes_waiters() {
        let (conn, _rx) = Connection::detached(1);
        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.closed().await })
        };
        tokio::task::yield_now().await;
        assert!(conn.close());
        assert!(!conn.close());
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_aborts_pulls() {
        let (conn, _rx) = Connection::detached(1);
        let task = tokio::spawn(std::future::pending::<()>());
        conn.track_pull(task.abort_handle());
        conn.close();
        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_headers_only_when_negotiated() {
        let (conn, mut rx) = Connection::detached(4);
        let message = Message::builder("s").header("k", "v").payload("x").build().unwrap();

        conn.deliver("1", &message);
        assert_eq!(&rx.recv().await.unwrap()[..], b"MSG s 1 1\r\nx\r\n");

        conn.set_options(ConnectOptions { headers: true, ..ConnectOptions::default() });
        conn.deliver("1", &message);
        assert!(rx.recv().await.unwrap().starts_with(b"HMSG s 1 "));
    }

    #[test]
    fn test_subscription_registry() {
        let (conn, _rx) = Connection::detached(1);
        let first = Arc::new(Subscription::new(Arc::clone(&conn), "1", "a", None));
        let second = Arc::new(Subscription::new(Arc::clone(&conn), "1", "b", None));
        assert!(conn.remember(Arc::clone(&first)).is_none());
        assert!(conn.remember(Arc::clone(&second)).is_some());

        assert!(conn.forget("1", first.id()).is_none());
        assert_eq!(conn.subscription("1").unwrap().subject(), "b");
        assert_eq!(conn.take_subscriptions().len(), 1);
        assert_eq!(conn.subscription_count(), 0);
    }

    #[test]
    fn test_connection_manager_capacity_limit() {
        let manager = ConnectionManager::new(1);
        let (first, _rx1) = Connection::new(manager.next_client_id(), None, 1);
        let (second, _rx2) = Connection::new(manager.next_client_id(), None, 1);

        assert!(manager.add_connection(Arc::clone(&first)).is_ok());
        assert!(!manager.can_accept_connection());
        assert!(matches!(manager.add_connection(second), Err(Error::ResourceLimit { .. })));
        assert_eq!(manager.total_connections(), 2);
        assert_eq!(first.client_id(), 1);

        assert_eq!(manager.close_all(), 1);
        assert!(first.is_closed());
        assert!(manager.remove_connection(first.id()).is_some());
        assert_eq!(manager.connection_count(), 0);
    }
}
