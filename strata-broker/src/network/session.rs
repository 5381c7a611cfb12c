//! Per-connection command loop.
//!
//! A session reads bytes into the decoder's buffer, dispatches each decoded
//! operation, and leaves writing to a separate task that drains the
//! connection's outbound queue. Protocol violations are answered with
//! `-ERR` and close the connection; bad subjects only earn an `-ERR`.

use crate::broker::BrokerState;
use crate::network::Connection;
use crate::routing::Subscription;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use strata_core::{
    protocol::{ClientOp, Headers, ProtocolDecoder, ProtocolResult, ServerOp},
    subject::{validate_pattern, validate_subject},
    Message,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Frames coalesced into one socket write.
const WRITE_BATCH: usize = 64 * 1024;

/// How long a closing connection may spend flushing queued frames.
const FLUSH_GRACE: Duration = Duration::from_secs(5);

/// One client's command loop.
#[derive(Debug)]
pub struct Session {
    state: Arc<BrokerState>,
    connection: Arc<Connection>,
    decoder: ProtocolDecoder,
}

impl Session {
    /// Create a session for a registered connection.
    #[must_use]
    pub fn new(state: Arc<BrokerState>, connection: Arc<Connection>) -> Self {
        let decoder = ProtocolDecoder::with_max_payload(state.config().server.max_payload);
        Self { state, connection, decoder }
    }

    /// Serve the client until either side closes, then release everything
    /// the connection owns.
    pub async fn run<S>(mut self, stream: S, outbound: mpsc::Receiver<Bytes>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);
        let mut writer_task =
            tokio::spawn(write_loop(Arc::clone(&self.connection), writer, outbound));

        let info = self.state.server_info(self.connection.client_id());
        self.connection.send(&ServerOp::Info(Box::new(info)));

        let reason = self.read_loop(&mut reader).await;
        self.state.release(&self.connection);
        if tokio::time::timeout(FLUSH_GRACE, &mut writer_task).await.is_err() {
            writer_task.abort();
        }
        info!(
            connection = %self.connection.id(),
            name = self.connection.name().as_deref().unwrap_or(""),
            reason,
            "Connection closed"
        );
    }

    async fn read_loop<R>(&mut self, reader: &mut R) -> &'static str
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let read = tokio::select! {
                read = reader.read_buf(self.decoder.buffer_mut()) => read,
                () = self.connection.closed() => return "closed by server",
            };
            match read {
                Ok(0) => return "client closed",
                Ok(n) => self.connection.record_bytes_received(n),
                Err(e) => {
                    debug!(connection = %self.connection.id(), error = %e, "Read failed");
                    return "read error";
                },
            }
            if let Err(e) = self.drain() {
                warn!(connection = %self.connection.id(), error = %e, "Protocol error");
                self.connection.send_error(e.client_message());
                return "protocol error";
            }
        }
    }

    fn drain(&mut self) -> ProtocolResult<()> {
        while let Some(op) = self.decoder.decode()? {
            self.connection.record_op();
            trace!(connection = %self.connection.id(), op = op.name(), "Received");
            self.dispatch(op);
            if self.connection.is_closed() {
                break;
            }
        }
        Ok(())
    }

    fn dispatch(&self, op: ClientOp) {
        match op {
            ClientOp::Connect(options) => {
                debug!(
                    connection = %self.connection.id(),
                    name = options.name.as_deref().unwrap_or(""),
                    lang = options.lang.as_deref().unwrap_or(""),
                    "Client connected"
                );
                self.connection.set_options(options);
                self.ok();
            },
            ClientOp::Ping => {
                self.connection.send(&ServerOp::Pong);
            },
            ClientOp::Pong => {},
            ClientOp::Sub { subject, queue_group, sid } => self.subscribe(subject, queue_group, sid),
            ClientOp::Unsub { sid, max_msgs } => self.unsubscribe(&sid, max_msgs),
            ClientOp::Pub { subject, reply_to, headers, payload } => {
                self.publish(subject, reply_to, headers, payload);
            },
        }
    }

    fn ok(&self) {
        if self.connection.is_verbose() {
            self.connection.send(&ServerOp::Ok);
        }
    }

    fn subscribe(&self, subject: String, queue_group: Option<String>, sid: String) {
        if validate_pattern(&subject).is_err() {
            self.connection.send_error("Invalid Subject");
            return;
        }
        let index = self.state.index();
        let subscription =
            Arc::new(Subscription::new(Arc::clone(&self.connection), sid, subject, queue_group));
        if let Some(previous) = self.connection.remember(Arc::clone(&subscription)) {
            index.remove(&previous);
        }
        index.insert(subscription);
        self.ok();
    }

    fn unsubscribe(&self, sid: &str, max_msgs: Option<u64>) {
        if let Some(subscription) = self.connection.subscription(sid) {
            let keep = max_msgs.is_some_and(|max| max > 0 && !subscription.set_max_msgs(max));
            if !keep {
                self.connection.forget(sid, subscription.id());
                self.state.index().remove(&subscription);
            }
        }
        self.ok();
    }

    fn publish(
        &self,
        subject: String,
        reply_to: Option<String>,
        headers: Option<Headers>,
        payload: Bytes,
    ) {
        if validate_subject(&subject).is_err() {
            self.connection.send_error("Invalid Publish Subject");
            return;
        }
        if reply_to.as_deref().is_some_and(|reply| validate_subject(reply).is_err()) {
            self.connection.send_error("Invalid Subject");
            return;
        }
        let message = match Message::builder(subject)
            .maybe_reply_to(reply_to)
            .headers(headers)
            .payload(payload)
            .build()
        {
            Ok(message) => message,
            Err(e) => {
                self.connection.send_error(e.to_string());
                return;
            },
        };
        self.state.publish(message, Some(&self.connection));
        self.ok();
    }
}

async fn write_loop<W>(connection: Arc<Connection>, mut writer: W, mut outbound: mpsc::Receiver<Bytes>)
where
    W: AsyncWrite + Unpin,
{
    let mut batch = BytesMut::with_capacity(WRITE_BATCH);
    loop {
        let frame = tokio::select! {
            biased;
            frame = outbound.recv() => frame,
            () = connection.closed() => None,
        };
        let Some(frame) = frame else { break };
        batch.extend_from_slice(&frame);
        while batch.len() < WRITE_BATCH {
            match outbound.try_recv() {
                Ok(frame) => batch.extend_from_slice(&frame),
                Err(_) => break,
            }
        }
        if let Err(e) = writer.write_all(&batch).await {
            debug!(connection = %connection.id(), error = %e, "Write failed");
            connection.close();
            return;
        }
        batch.clear();
    }

    // frames queued before the close, such as a final -ERR
    while let Ok(frame) = outbound.try_recv() {
        batch.extend_from_slice(&frame);
    }
    if !batch.is_empty() {
        let _ = writer.write_all(&batch).await;
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::config::StrataConfig;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader, DuplexStream};

    struct Client {
        reader: BufReader<tokio::io::ReadHalf<DuplexStream>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
        }

        async fn line(&mut self) -> String {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            line
        }
    }

    async fn connect(state: &Arc<BrokerState>) -> (Client, Arc<Connection>) {
        let (server_side, client_side) = duplex(64 * 1024);
        let (connection, outbound) =
            Connection::new(state.connections().next_client_id(), None, 1024);
        state.connections().add_connection(Arc::clone(&connection)).unwrap();
        tokio::spawn(Session::new(Arc::clone(state), Arc::clone(&connection)).run(server_side, outbound));

        let (read, write) = tokio::io::split(client_side);
        let mut client = Client { reader: BufReader::new(read), writer: write };
        assert!(client.line().await.starts_with("INFO {"));
        (client, connection)
    }

    #[tokio::test]
    async fn test_ping_and_verbose() {
        let state = BrokerState::new(StrataConfig::default()).unwrap();
        let (mut client, _) = connect(&state).await;

        client.send("PING\r\n").await;
        assert_eq!(client.line().await, "PONG\r\n");

        client.send("CONNECT {\"verbose\":true}\r\nSUB a 1\r\n").await;
        assert_eq!(client.line().await, "+OK\r\n");
        assert_eq!(client.line().await, "+OK\r\n");
    }

    #[tokio::test]
    async fn test_sub_pub_and_unsub_max() {
        let state = BrokerState::new(StrataConfig::default()).unwrap();
        let (mut client, connection) = connect(&state).await;

        client.send("SUB foo.* 7\r\nUNSUB 7 2\r\n").await;
        client.send("PUB foo.a 2\r\nhi\r\nPUB foo.b r.1 0\r\n\r\nPUB foo.c 1\r\nx\r\nPING\r\n").await;
        assert_eq!(client.line().await, "MSG foo.a 7 2\r\n");
        assert_eq!(client.line().await, "hi\r\n");
        assert_eq!(client.line().await, "MSG foo.b 7 r.1 0\r\n");
        assert_eq!(client.line().await, "\r\n");
        assert_eq!(client.line().await, "PONG\r\n");
        assert_eq!(connection.subscription_count(), 0);
        assert!(state.index().is_empty());
    }

    #[tokio::test]
    async fn test_no_echo() {
        let state = BrokerState::new(StrataConfig::default()).unwrap();
        let (mut client, _) = connect(&state).await;

        client.send("CONNECT {\"echo\":false}\r\nSUB x 1\r\nPUB x 1\r\na\r\nPING\r\n").await;
        assert_eq!(client.line().await, "PONG\r\n");
    }

    #[tokio::test]
    async fn test_invalid_subject_is_not_fatal() {
        let state = BrokerState::new(StrataConfig::default()).unwrap();
        let (mut client, connection) = connect(&state).await;

        client.send("SUB a..b 1\r\nPUB a.* 0\r\n\r\nPING\r\n").await;
        assert_eq!(client.line().await, "-ERR 'Invalid Subject'\r\n");
        assert_eq!(client.line().await, "-ERR 'Invalid Publish Subject'\r\n");
        assert_eq!(client.line().await, "PONG\r\n");
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn test_wildcard_reply_subject_is_rejected() {
        let state = BrokerState::new(StrataConfig::default()).unwrap();
        let (mut client, connection) = connect(&state).await;

        client.send("SUB r.* 1\r\nPUB a r.* 1\r\nx\r\nPUB a r.> 0\r\n\r\nPING\r\n").await;
        assert_eq!(client.line().await, "-ERR 'Invalid Subject'\r\n");
        assert_eq!(client.line().await, "-ERR 'Invalid Subject'\r\n");
        assert_eq!(client.line().await, "PONG\r\n");
        assert!(!connection.is_closed());
        assert_eq!(state.stats().messages_in, 0);
    }

    #[tokio::test]
    async fn test_protocol_error_closes() {
        let state = BrokerState::new(StrataConfig::default()).unwrap();
        let (mut client, connection) = connect(&state).await;

        client.send("SUB a 1\r\nBOGUS\r\n").await;
        assert_eq!(client.line().await, "-ERR 'Unknown Protocol Operation'\r\n");
        assert_eq!(client.line().await, "");
        assert!(connection.is_closed());
        assert!(state.index().is_empty());
        assert_eq!(state.connections().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_oversize_payload_is_fatal() {
        let mut config = StrataConfig::default();
        config.server.max_payload = 4;
        let state = BrokerState::new(config).unwrap();
        let (mut client, _) = connect(&state).await;

        client.send("PUB a 5\r\nhello\r\n").await;
        assert_eq!(client.line().await, "-ERR 'Maximum Payload Violation'\r\n");
    }
}
