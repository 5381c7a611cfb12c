//! Common types used throughout the Strata system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Timestamp type for message ordering and expiration.
pub type Timestamp = DateTime<Utc>;

/// Stream-local message sequence number. Sequences start at 1; 0 means "none".
pub type Sequence = u64;

/// Unique identifier for a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a new connection ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Nanoseconds since the Unix epoch, saturating at zero for earlier instants.
#[must_use]
pub fn unix_nanos(ts: &Timestamp) -> u64 {
    ts.timestamp_nanos_opt().and_then(|n| u64::try_from(n).ok()).unwrap_or_default()
}

/// Serde helpers for [`std::time::Duration`] as integer milliseconds (config files).
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a duration as milliseconds.
    ///
    /// # Errors
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize milliseconds into a duration.
    ///
    /// # Errors
    /// Propagates deserializer errors.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serde helpers for [`std::time::Duration`] as integer nanoseconds (JetStream JSON).
///
/// Negative or missing values decode to zero, which JetStream treats as
/// "unset".
pub mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a duration as nanoseconds.
    ///
    /// # Errors
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX))
    }

    /// Deserialize nanoseconds into a duration.
    ///
    /// # Errors
    /// Propagates deserializer errors.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = Option::<i64>::deserialize(deserializer)?.unwrap_or_default();
        Ok(Duration::from_nanos(u64::try_from(nanos).unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Serialize, Deserialize)]
    struct Holder {
        #[serde(with = "duration_nanos", default)]
        wait: Duration,
    }

    #[test]
    fn test_connection_id_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn test_duration_nanos_round_trip() {
        let json = serde_json::to_string(&Holder { wait: Duration::from_secs(30) }).unwrap();
        assert_eq!(json, r#"{"wait":30000000000}"#);
    }

    #[test]
    fn test_duration_nanos_negative_is_zero() {
        let holder: Holder = serde_json::from_str(r#"{"wait":-1}"#).unwrap();
        assert_eq!(holder.wait, Duration::ZERO);
        let holder: Holder = serde_json::from_str("{}").unwrap();
        assert_eq!(holder.wait, Duration::ZERO);
    }

    #[test]
    fn test_unix_nanos() {
        let ts = DateTime::<Utc>::from_timestamp(1, 5).unwrap();
        assert_eq!(unix_nanos(&ts), 1_000_000_005);
    }
}
