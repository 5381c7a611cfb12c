//! Async TCP listener with graceful shutdown.

use crate::broker::BrokerState;
use crate::network::{Connection, Session};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use strata_core::{Error, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for sessions to finish.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts client connections and runs a [`Session`] for each.
#[derive(Debug)]
pub struct TcpListener {
    state: Arc<BrokerState>,
    listener: TokioTcpListener,
    local_addr: SocketAddr,
}

impl TcpListener {
    /// Bind the configured address.
    ///
    /// # Errors
    /// [`Error::Network`] if the address cannot be bound.
    pub async fn bind(state: Arc<BrokerState>) -> Result<Self> {
        let address = state.config().server.bind_address();
        let listener = TokioTcpListener::bind(&address).await.map_err(|e| Error::Network {
            message: format!("Failed to bind to {address}: {e}"),
        })?;
        let local_addr = listener.local_addr()?;
        info!(
            address = %local_addr,
            max_connections = state.config().server.max_connections,
            "TCP listener bound"
        );
        Ok(Self { state, listener, local_addr })
    }

    /// Address actually bound, useful when the configured port is 0.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` fires, then close every
    /// connection and wait for the sessions to finish.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    self.handle_accept_result(accepted, &mut sessions).await;
                }
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                _ = shutdown.recv() => {
                    info!("Received shutdown signal, stopping listener");
                    break;
                }
            }
        }
        let Self { state, listener, .. } = self;
        drop(listener);
        Self::shutdown_all_connections(&state, sessions).await;
        info!("TCP listener stopped");
    }

    async fn handle_accept_result(
        &self,
        accepted: std::io::Result<(TcpStream, SocketAddr)>,
        sessions: &mut JoinSet<()>,
    ) {
        match accepted {
            Ok((stream, addr)) => self.process_new_connection(stream, addr, sessions),
            Err(e) => {
                error!(error = %e, "Error accepting connection");
                // Brief delay to prevent tight error loop
                tokio::time::sleep(Duration::from_millis(100)).await;
            },
        }
    }

    fn process_new_connection(
        &self,
        mut stream: TcpStream,
        addr: SocketAddr,
        sessions: &mut JoinSet<()>,
    ) {
        let connections = self.state.connections();
        if !connections.can_accept_connection() {
            warn!(%addr, max = self.state.config().server.max_connections, "Rejecting connection at capacity");
            sessions.spawn(async move {
                let _ = stream.write_all(b"-ERR 'Maximum Connections Exceeded'\r\n").await;
            });
            return;
        }

        if let Err(e) = self.configure_socket(&stream) {
            warn!(%addr, error = %e, "Failed to configure socket");
        }

        let server = &self.state.config().server;
        let (connection, outbound) =
            Connection::new(connections.next_client_id(), Some(addr), server.outbound_capacity);
        if let Err(e) = connections.add_connection(Arc::clone(&connection)) {
            warn!(%addr, error = %e, "Failed to register connection");
            return;
        }
        info!(
            connection = %connection.id(),
            %addr,
            total = connections.connection_count(),
            "Accepted connection"
        );
        let session = Session::new(Arc::clone(&self.state), connection);
        sessions.spawn(session.run(stream, outbound));
    }

    /// Low latency and keep-alive probes, per the server configuration.
    fn configure_socket(&self, stream: &TcpStream) -> std::io::Result<()> {
        use socket2::{SockRef, TcpKeepalive};

        stream.set_nodelay(true)?;
        let keep_alive = &self.state.config().server.keep_alive;
        if keep_alive.enabled {
            let idle = Duration::from_secs(u64::from(keep_alive.idle_time));
            let params = TcpKeepalive::new().with_time(idle).with_interval(Duration::from_secs(10));
            SockRef::from(stream).set_tcp_keepalive(&params)?;
        }
        Ok(())
    }

    async fn shutdown_all_connections(state: &BrokerState, mut sessions: JoinSet<()>) {
        let closed = state.connections().close_all();
        info!(connections = closed, "Shutting down active connections");

        let drained = timeout(SHUTDOWN_TIMEOUT, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(timeout = ?SHUTDOWN_TIMEOUT, "Connection shutdown timed out");
            sessions.abort_all();
        }
        debug!("All sessions finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::config::StrataConfig;

    fn local_config() -> StrataConfig {
        let mut config = StrataConfig::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config
    }

    #[tokio::test]
    async fn test_bind_reports_ephemeral_port() {
        let listener = TcpListener::bind(BrokerState::new(local_config()).unwrap()).await.unwrap();
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_invalid_address() {
        let mut config = local_config();
        // RFC 5737 test-net address, never assigned locally
        config.server.host = "192.0.2.1".to_string();
        let result = TcpListener::bind(BrokerState::new(config).unwrap()).await;
        assert!(matches!(result, Err(Error::Network { .. })));
    }

    #[tokio::test]
    async fn test_capacity_rejection() {
        let mut config = local_config();
        config.server.max_connections = 1;
        let state = BrokerState::new(config).unwrap();
        let listener = TcpListener::bind(Arc::clone(&state)).await.unwrap();
        let addr = listener.local_addr();
        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(listener.run(rx));

        let _first = TcpStream::connect(addr).await.unwrap();
        while state.connections().connection_count() == 0 {
            tokio::task::yield_now().await;
        }
        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut second, &mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf).contains("Maximum Connections Exceeded"));

        tx.send(()).unwrap();
        task.await.unwrap();
        assert_eq!(state.connections().connection_count(), 0);
    }
}
