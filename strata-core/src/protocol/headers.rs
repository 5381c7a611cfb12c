//! NATS/1.0 header blocks carried by `HPUB` and `HMSG`.
//!
//! ```text
//! NATS/1.0[ <status>[ <description>]]\r\n
//! Key: Value\r\n
//! ...
//! \r\n
//! ```

use super::error::{ProtocolError, ProtocolResult};
use bytes::{BufMut, BytesMut};
use std::collections::BTreeMap;

/// Version line prefix of every header block.
pub const HEADER_VERSION: &str = "NATS/1.0";

/// Message headers plus an optional inline status line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    status: Option<u16>,
    description: Option<String>,
    entries: BTreeMap<String, Vec<String>>,
}

impl Headers {
    /// Create an empty header set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a status-only header block, e.g. `NATS/1.0 404 No Messages`.
    #[must_use]
    pub fn with_status(code: u16, description: impl Into<String>) -> Self {
        Self { status: Some(code), description: Some(description.into()), entries: BTreeMap::new() }
    }

    /// Status code from the version line, if any.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        self.status
    }

    /// Status description from the version line, if any.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Append a value for `key`.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.entry(key.into()).or_default().push(value.into());
    }

    /// Replace all values for `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), vec![value.into()]);
    }

    /// First value for `key`; exact match first, then ASCII case-insensitive.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .or_else(|| {
                self.entries.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)).map(|(_, v)| v)
            })
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Whether no status and no entries are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.entries.is_empty()
    }

    /// Iterate over `(key, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(k, values)| values.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    /// Size of the encoded block in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let mut len = HEADER_VERSION.len() + 2;
        if let Some(code) = self.status {
            len += 1 + code.to_string().len();
            if let Some(desc) = &self.description {
                len += 1 + desc.len();
            }
        }
        for (k, v) in self.iter() {
            len += k.len() + 2 + v.len() + 2;
        }
        len + 2
    }

    /// Write the encoded block, including the terminating blank line.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_slice(HEADER_VERSION.as_bytes());
        if let Some(code) = self.status {
            buf.put_u8(b' ');
            buf.put_slice(code.to_string().as_bytes());
            if let Some(desc) = &self.description {
                buf.put_u8(b' ');
                buf.put_slice(desc.as_bytes());
            }
        }
        buf.put_slice(b"\r\n");
        for (k, v) in self.iter() {
            buf.put_slice(k.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(v.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
    }

    /// Parse a header block as sent by a client.
    ///
    /// # Errors
    /// Returns [`ProtocolError::InvalidHeaders`] when the version line is
    /// missing or a line lacks a `:` separator.
    pub fn decode(raw: &[u8]) -> ProtocolResult<Self> {
        let text = std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8)?;
        let mut lines = text.split("\r\n");

        let version = lines.next().unwrap_or_default();
        let rest = version.strip_prefix(HEADER_VERSION).ok_or_else(|| {
            ProtocolError::InvalidHeaders { reason: format!("bad version line '{version}'") }
        })?;

        let mut headers = Self::new();
        let rest = rest.trim();
        if !rest.is_empty() {
            let (code, desc) = rest.split_once(' ').unwrap_or((rest, ""));
            let code = code.parse::<u16>().map_err(|_| ProtocolError::InvalidHeaders {
                reason: format!("bad status '{code}'"),
            })?;
            headers.status = Some(code);
            if !desc.is_empty() {
                headers.description = Some(desc.to_string());
            }
        }

        for line in lines.filter(|l| !l.is_empty()) {
            let (key, value) = line.split_once(':').ok_or_else(|| ProtocolError::InvalidHeaders {
                reason: format!("missing ':' in '{line}'"),
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ProtocolError::InvalidHeaders { reason: "empty header name".into() });
            }
            headers.append(key, value.trim());
        }
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_matches_len() {
        let mut headers = Headers::new();
        headers.insert("KV-Operation", "DEL");
        headers.append("X-Trace", "a");
        headers.append("X-Trace", "b");

        let mut buf = BytesMut::new();
        headers.encode(&mut buf);
        assert_eq!(buf.len(), headers.encoded_len());
        assert_eq!(&buf[..], b"NATS/1.0\r\nKV-Operation: DEL\r\nX-Trace: a\r\nX-Trace: b\r\n\r\n");
    }

    #[test]
    fn test_status_line() {
        let headers = Headers::with_status(404, "No Messages");
        let mut buf = BytesMut::new();
        headers.encode(&mut buf);
        assert_eq!(&buf[..], b"NATS/1.0 404 No Messages\r\n\r\n");

        let decoded = Headers::decode(&buf).unwrap();
        assert_eq!(decoded.status(), Some(404));
        assert_eq!(decoded.description(), Some("No Messages"));
    }

    #[test]
    fn test_decode_case_insensitive_lookup() {
        let headers = Headers::decode(b"NATS/1.0\r\nkv-operation: purge\r\n\r\n").unwrap();
        assert_eq!(headers.get("KV-Operation"), Some("purge"));
        assert_eq!(headers.get("Missing"), None);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Headers::decode(b"HTTP/1.1\r\n\r\n").is_err());
        assert!(Headers::decode(b"NATS/1.0\r\nnocolon\r\n\r\n").is_err());
    }
}
