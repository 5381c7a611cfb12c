//! TCP server lifecycle.
//!
//! [`TcpServer`] binds the listener, runs its accept loop and a periodic
//! metrics logger in background tasks, and owns the shutdown signal both
//! tasks listen on.

use crate::broker::BrokerState;
use crate::network::TcpListener;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use strata_core::{Error, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

/// Interval of the connection metrics log line.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// A running TCP server.
#[derive(Debug)]
pub struct TcpServer {
    local_addr: SocketAddr,
    shutdown_tx: Option<broadcast::Sender<()>>,
    server_task: Option<JoinHandle<()>>,
    metrics_task: Option<JoinHandle<()>>,
}

impl TcpServer {
    /// Bind the configured address and start accepting.
    ///
    /// # Errors
    /// [`Error::Network`] if the address cannot be bound.
    pub async fn start(state: Arc<BrokerState>) -> Result<Self> {
        let listener = TcpListener::bind(Arc::clone(&state)).await?;
        let local_addr = listener.local_addr();

        let (shutdown_tx, _) = broadcast::channel(1);
        let server_task = tokio::spawn(listener.run(shutdown_tx.subscribe()));
        let metrics_task = tokio::spawn(Self::metrics_collection_task(state, shutdown_tx.subscribe()));

        info!(address = %local_addr, "TCP server started");
        Ok(Self {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            server_task: Some(server_task),
            metrics_task: Some(metrics_task),
        })
    }

    /// Address the server is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Check if the server is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.server_task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the TCP server gracefully.
    ///
    /// # Errors
    /// [`Error::Network`] if the server was already stopped,
    /// [`Error::Internal`] if the accept loop panicked.
    pub async fn stop(&mut self) -> Result<()> {
        let shutdown_tx = self
            .shutdown_tx
            .take()
            .ok_or_else(|| Error::Network { message: "Server is not running".to_string() })?;
        // a send error only means both tasks have already exited
        let _ = shutdown_tx.send(());

        if let Some(task) = self.server_task.take() {
            task.await.map_err(|e| Error::internal(format!("accept loop failed: {e}")))?;
        }
        if let Some(task) = self.metrics_task.take() {
            task.abort();
        }
        info!("TCP server stopped");
        Ok(())
    }

    async fn metrics_collection_task(state: Arc<BrokerState>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(METRICS_INTERVAL);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = state.stats();
                    info!(
                        active = stats.client_count,
                        total = stats.total_connections,
                        subscriptions = stats.subscriptions,
                        messages_in = stats.messages_in,
                        messages_out = stats.messages_out,
                        "Connection metrics"
                    );
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}
