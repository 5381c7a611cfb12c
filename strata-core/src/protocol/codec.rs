//! Streaming decoder for client operations and encoder for server operations.

use super::{
    error::{ProtocolError, ProtocolResult},
    frame::{ClientOp, ConnectOptions, ServerOp},
    headers::Headers,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Default upper bound on a single control line.
pub const MAX_CONTROL_LINE: usize = 4096;

/// Default maximum payload accepted by the decoder.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

const CRLF: &[u8] = b"\r\n";

/// A `PUB`/`HPUB` control line whose payload has not fully arrived yet.
#[derive(Debug)]
struct PendingPayload {
    subject: String,
    reply_to: Option<String>,
    header_len: Option<usize>,
    total_len: usize,
}

/// Decoder statistics for monitoring and debugging.
#[derive(Debug, Default, Clone, Copy)]
pub struct DecoderStats {
    /// Operations successfully decoded
    pub ops_decoded: u64,

    /// Payload bytes decoded
    pub payload_bytes: u64,

    /// Peak buffer size observed
    pub peak_buffer_size: usize,
}

/// Incremental decoder for the client side of the text protocol.
///
/// Bytes are appended with [`ProtocolDecoder::extend`] (or read straight into
/// [`ProtocolDecoder::buffer_mut`]) and complete operations pulled out with
/// [`ProtocolDecoder::decode`]. Partial input is kept until more arrives.
#[derive(Debug)]
pub struct ProtocolDecoder {
    buffer: BytesMut,
    pending: Option<PendingPayload>,
    max_payload: usize,
    max_control_line: usize,
    stats: DecoderStats,
}

impl ProtocolDecoder {
    /// Create a decoder with the default payload limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    /// Create a decoder rejecting payloads larger than `max_payload`.
    #[must_use]
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            pending: None,
            max_payload,
            max_control_line: MAX_CONTROL_LINE,
            stats: DecoderStats::default(),
        }
    }

    /// Override the control line limit.
    pub const fn set_max_control_line(&mut self, max: usize) {
        self.max_control_line = max;
    }

    /// Append raw bytes read from the socket.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        self.stats.peak_buffer_size = self.stats.peak_buffer_size.max(self.buffer.len());
    }

    /// Direct access to the read buffer for `AsyncReadExt::read_buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Bytes buffered but not yet decoded.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decoder statistics.
    #[must_use]
    pub const fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Decode the next complete operation, if one is buffered.
    ///
    /// # Errors
    /// Any [`ProtocolError`]; the stream cannot be resynchronised afterwards
    /// and the connection must be closed.
    pub fn decode(&mut self) -> ProtocolResult<Option<ClientOp>> {
        loop {
            if let Some(pending) = &self.pending {
                let needed = pending.total_len + CRLF.len();
                if self.buffer.len() < needed {
                    self.buffer.reserve(needed - self.buffer.len());
                    return Ok(None);
                }
                if &self.buffer[pending.total_len..needed] != CRLF {
                    return Err(ProtocolError::PayloadTerminator { declared: pending.total_len });
                }
                let Some(pending) = self.pending.take() else { return Ok(None) };
                let mut payload = self.buffer.split_to(pending.total_len).freeze();
                self.buffer.advance(CRLF.len());

                let headers = match pending.header_len {
                    Some(len) => {
                        let block = payload.split_to(len);
                        Some(Headers::decode(&block)?)
                    },
                    None => None,
                };

                self.stats.ops_decoded += 1;
                self.stats.payload_bytes += payload.len() as u64;
                return Ok(Some(ClientOp::Pub {
                    subject: pending.subject,
                    reply_to: pending.reply_to,
                    headers,
                    payload,
                }));
            }

            let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') else {
                if self.buffer.len() > self.max_control_line {
                    return Err(ProtocolError::ControlLineTooLong { max: self.max_control_line });
                }
                return Ok(None);
            };
            if newline > self.max_control_line {
                return Err(ProtocolError::ControlLineTooLong { max: self.max_control_line });
            }

            let line = self.buffer.split_to(newline + 1);
            let line = std::str::from_utf8(&line).map_err(|_| ProtocolError::InvalidUtf8)?;
            let line = line.trim_end_matches(['\r', '\n']);
            if line.trim().is_empty() {
                continue;
            }

            if let Some(op) = self.parse_control_line(line)? {
                self.stats.ops_decoded += 1;
                return Ok(Some(op));
            }
        }
    }

    /// Parse one control line. Returns `None` when a payload must follow.
    fn parse_control_line(&mut self, line: &str) -> ProtocolResult<Option<ClientOp>> {
        let line = line.trim_start();
        let (op, rest) = line.split_once([' ', '\t']).unwrap_or((line, ""));
        let args: Vec<&str> = rest.split_whitespace().collect();

        match op.to_ascii_uppercase().as_str() {
            "PING" => Ok(Some(ClientOp::Ping)),
            "PONG" => Ok(Some(ClientOp::Pong)),
            "CONNECT" => {
                let body = rest.trim();
                let opts: ConnectOptions = if body.is_empty() {
                    ConnectOptions::default()
                } else {
                    serde_json::from_str(body)
                        .map_err(|e| ProtocolError::InvalidConnect { reason: e.to_string() })?
                };
                Ok(Some(ClientOp::Connect(opts)))
            },
            "PUB" => {
                let (subject, reply_to, size) = match args.as_slice() {
                    [subject, size] => (*subject, None, *size),
                    [subject, reply, size] => (*subject, Some((*reply).to_string()), *size),
                    _ => return Err(invalid("PUB", "expected <subject> [reply] <size>")),
                };
                let total_len = self.parse_size("PUB", size)?;
                self.pending = Some(PendingPayload {
                    subject: subject.to_string(),
                    reply_to,
                    header_len: None,
                    total_len,
                });
                Ok(None)
            },
            "HPUB" => {
                let (subject, reply_to, hdr, total) = match args.as_slice() {
                    [subject, hdr, total] => (*subject, None, *hdr, *total),
                    [subject, reply, hdr, total] => {
                        (*subject, Some((*reply).to_string()), *hdr, *total)
                    },
                    _ => {
                        return Err(invalid("HPUB", "expected <subject> [reply] <hdr> <size>"));
                    },
                };
                let header_len = self.parse_size("HPUB", hdr)?;
                let total_len = self.parse_size("HPUB", total)?;
                if header_len > total_len {
                    return Err(invalid("HPUB", "header size exceeds total size"));
                }
                self.pending = Some(PendingPayload {
                    subject: subject.to_string(),
                    reply_to,
                    header_len: Some(header_len),
                    total_len,
                });
                Ok(None)
            },
            "SUB" => {
                let (subject, queue_group, sid) = match args.as_slice() {
                    [subject, sid] => (*subject, None, *sid),
                    [subject, queue, sid] => (*subject, Some((*queue).to_string()), *sid),
                    _ => return Err(invalid("SUB", "expected <subject> [queue] <sid>")),
                };
                Ok(Some(ClientOp::Sub {
                    subject: subject.to_string(),
                    queue_group,
                    sid: sid.to_string(),
                }))
            },
            "UNSUB" => {
                let (sid, max_msgs) = match args.as_slice() {
                    [sid] => (*sid, None),
                    [sid, max] => {
                        let max = max
                            .parse::<u64>()
                            .map_err(|_| invalid("UNSUB", "max_msgs is not a number"))?;
                        (*sid, Some(max))
                    },
                    _ => return Err(invalid("UNSUB", "expected <sid> [max_msgs]")),
                };
                Ok(Some(ClientOp::Unsub { sid: sid.to_string(), max_msgs }))
            },
            _ => Err(ProtocolError::UnknownOperation { op: op.to_string() }),
        }
    }

    fn parse_size(&self, op: &'static str, raw: &str) -> ProtocolResult<usize> {
        let size = raw.parse::<usize>().map_err(|_| invalid(op, "size is not a number"))?;
        if size > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge { actual: size, max: self.max_payload });
        }
        Ok(size)
    }
}

impl Default for ProtocolDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(op: &'static str, reason: &str) -> ProtocolError {
    ProtocolError::InvalidArguments { op, reason: reason.to_string() }
}

/// Encoder for server operations with buffer reuse.
#[derive(Debug)]
pub struct ProtocolEncoder {
    buffer: BytesMut,
}

impl ProtocolEncoder {
    /// Create a new encoder.
    #[must_use]
    pub fn new() -> Self {
        Self { buffer: BytesMut::with_capacity(8192) }
    }

    /// Encode a single operation into a standalone frame.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Encoding`] if the `INFO` body fails to serialize.
    pub fn encode(&mut self, op: &ServerOp) -> ProtocolResult<Bytes> {
        encode_into(op, &mut self.buffer)?;
        Ok(self.buffer.split().freeze())
    }
}

impl Default for ProtocolEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode `op` into a freshly allocated frame.
///
/// # Errors
/// Returns [`ProtocolError::Encoding`] if the `INFO` body fails to serialize.
pub fn encode(op: &ServerOp) -> ProtocolResult<Bytes> {
    let mut buf = BytesMut::new();
    encode_into(op, &mut buf)?;
    Ok(buf.freeze())
}

/// Append the wire form of `op` to `buf`.
///
/// # Errors
/// Returns [`ProtocolError::Encoding`] if the `INFO` body fails to serialize.
pub fn encode_into(op: &ServerOp, buf: &mut BytesMut) -> ProtocolResult<()> {
    match op {
        ServerOp::Info(info) => {
            let json = serde_json::to_vec(info)
                .map_err(|e| ProtocolError::Encoding { reason: e.to_string() })?;
            buf.reserve(json.len() + 7);
            buf.put_slice(b"INFO ");
            buf.put_slice(&json);
            buf.put_slice(CRLF);
        },
        ServerOp::Msg { subject, sid, reply_to, headers, payload } => {
            let reply = reply_to.as_deref().map_or(String::new(), |r| format!(" {r}"));
            match headers {
                Some(headers) => {
                    let hdr_len = headers.encoded_len();
                    let line = format!(
                        "HMSG {subject} {sid}{reply} {hdr_len} {}\r\n",
                        hdr_len + payload.len()
                    );
                    buf.reserve(line.len() + hdr_len + payload.len() + 2);
                    buf.put_slice(line.as_bytes());
                    headers.encode(buf);
                },
                None => {
                    let line = format!("MSG {subject} {sid}{reply} {}\r\n", payload.len());
                    buf.reserve(line.len() + payload.len() + 2);
                    buf.put_slice(line.as_bytes());
                },
            }
            buf.put_slice(payload);
            buf.put_slice(CRLF);
        },
        ServerOp::Ping => buf.put_slice(b"PING\r\n"),
        ServerOp::Pong => buf.put_slice(b"PONG\r\n"),
        ServerOp::Ok => buf.put_slice(b"+OK\r\n"),
        ServerOp::Err(text) => {
            buf.put_slice(b"-ERR '");
            buf.put_slice(text.as_bytes());
            buf.put_slice(b"'\r\n");
        },
    }
    Ok(())
}
