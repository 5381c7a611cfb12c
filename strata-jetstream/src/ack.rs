//! Acknowledgement subjects and payloads.
//!
//! Every delivered message carries a reply subject of the form
//! `<prefix>.<stream>.<consumer>.<deliveries>.<stream_seq>.<consumer_seq>.<timestamp>.<pending>`.
//! Publishing to it with one of the [`AckKind`] payloads settles the delivery.

use serde::Deserialize;
use std::{fmt, time::Duration};
use strata_core::{Error, Result, Sequence};

/// Parsed acknowledgement reply subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckSubject {
    /// Stream name
    pub stream: String,
    /// Consumer name
    pub consumer: String,
    /// Delivery attempt of this message, starting at 1
    pub deliveries: u64,
    /// Stream sequence of the message
    pub stream_seq: Sequence,
    /// Consumer sequence of the message
    pub consumer_seq: Sequence,
    /// Message timestamp in unix nanoseconds
    pub timestamp: u64,
    /// Messages still pending for the consumer at delivery time
    pub pending: u64,
}

impl AckSubject {
    /// Render under `prefix`.
    #[must_use]
    pub fn format(&self, prefix: &str) -> String {
        format!(
            "{prefix}.{}.{}.{}.{}.{}.{}.{}",
            self.stream,
            self.consumer,
            self.deliveries,
            self.stream_seq,
            self.consumer_seq,
            self.timestamp,
            self.pending
        )
    }

    /// Parse a subject published under `prefix`.
    ///
    /// # Errors
    /// [`Error::InvalidSubject`] if the subject is not a well formed ack
    /// subject for `prefix`.
    pub fn parse(prefix: &str, subject: &str) -> Result<Self> {
        let invalid = || Error::InvalidSubject { subject: subject.to_string() };
        let rest = subject
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('.'))
            .ok_or_else(invalid)?;
        let parts: Vec<&str> = rest.split('.').collect();
        let [stream, consumer, deliveries, sseq, cseq, ts, pending] = parts.as_slice() else {
            return Err(invalid());
        };
        let num = |s: &str| s.parse::<u64>().map_err(|_| invalid());
        Ok(Self {
            stream: (*stream).to_string(),
            consumer: (*consumer).to_string(),
            deliveries: num(deliveries)?,
            stream_seq: num(sseq)?,
            consumer_seq: num(cseq)?,
            timestamp: num(ts)?,
            pending: num(pending)?,
        })
    }
}

/// What an acknowledgement asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Processed; forget the message
    Ack,
    /// Not processed; redeliver, optionally after a delay
    Nak(Option<Duration>),
    /// Still working; restart the ack timer
    Progress,
    /// Never redeliver
    Term,
}

#[derive(Deserialize)]
struct NakDelay {
    delay: i64,
}

impl AckKind {
    /// Interpret an acknowledgement payload. An empty payload is an ack.
    ///
    /// # Errors
    /// [`Error::InvalidRequest`] for unrecognised payloads.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| Error::invalid_request("ack payload is not UTF-8"))?
            .trim();
        let (verb, rest) = text.split_once(char::is_whitespace).unwrap_or((text, ""));
        match verb {
            "" | "+ACK" => Ok(Self::Ack),
            "+WPI" => Ok(Self::Progress),
            "+TERM" => Ok(Self::Term),
            "-NAK" => {
                let rest = rest.trim();
                if rest.is_empty() {
                    return Ok(Self::Nak(None));
                }
                let delay: NakDelay = serde_json::from_str(rest)?;
                let delay = u64::try_from(delay.delay).ok().filter(|d| *d > 0);
                Ok(Self::Nak(delay.map(Duration::from_nanos)))
            },
            other => Err(Error::invalid_request(format!("unknown ack payload '{other}'"))),
        }
    }
}

impl fmt::Display for AckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack => f.write_str("+ACK"),
            Self::Nak(None) => f.write_str("-NAK"),
            Self::Nak(Some(delay)) => write!(f, "-NAK {{\"delay\":{}}}", delay.as_nanos()),
            Self::Progress => f.write_str("+WPI"),
            Self::Term => f.write_str("+TERM"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_subject_roundtrip() {
        let ack = AckSubject {
            stream: "ORDERS".into(),
            consumer: "worker".into(),
            deliveries: 2,
            stream_seq: 17,
            consumer_seq: 9,
            timestamp: 1_700_000_000_000_000_000,
            pending: 3,
        };
        let subject = ack.format("$JS.ACK");
        assert_eq!(subject, "$JS.ACK.ORDERS.worker.2.17.9.1700000000000000000.3");
        assert_eq!(AckSubject::parse("$JS.ACK", &subject).unwrap(), ack);
    }

    #[test]
    fn test_ack_subject_rejects_malformed() {
        assert!(AckSubject::parse("$JS.ACK", "$JS.ACK.ORDERS.worker.1.2").is_err());
        assert!(AckSubject::parse("$JS.ACK", "$JS.ACK.ORDERS.worker.x.2.3.4.5").is_err());
        assert!(AckSubject::parse("$JS.ACK", "$JS.ACKORDERS.worker.1.2.3.4.5").is_err());
        assert!(AckSubject::parse("$JS.ACK", "other.ORDERS.worker.1.2.3.4.5").is_err());
    }

    #[test]
    fn test_ack_kinds() {
        assert_eq!(AckKind::parse(b"").unwrap(), AckKind::Ack);
        assert_eq!(AckKind::parse(b"+ACK").unwrap(), AckKind::Ack);
        assert_eq!(AckKind::parse(b"-NAK").unwrap(), AckKind::Nak(None));
        assert_eq!(
            AckKind::parse(br#"-NAK {"delay":5000000000}"#).unwrap(),
            AckKind::Nak(Some(Duration::from_secs(5)))
        );
        assert_eq!(AckKind::parse(b"+WPI").unwrap(), AckKind::Progress);
        assert_eq!(AckKind::parse(b"+TERM").unwrap(), AckKind::Term);
        assert!(AckKind::parse(b"+NOPE").is_err());
    }

    #[test]
    fn test_ack_kind_display_parses_back() {
        let nak = AckKind::Nak(Some(Duration::from_millis(250)));
        assert_eq!(AckKind::parse(nak.to_string().as_bytes()).unwrap(), nak);
    }
}
