//! Stream and consumer configuration types.
//!
//! Field names and enum spellings follow the JetStream JSON API so standard
//! clients can create streams and consumers unchanged. Durations travel as
//! integer nanoseconds; `-1` (or `0` where noted) means "unlimited".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strata_core::{
    subject::{matches, validate_pattern},
    types::duration_nanos,
    Error, Result,
};
use strata_storage::StorageType;

/// Default time a delivered message may stay unacknowledged.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Default cap on outstanding unacknowledged deliveries.
pub const DEFAULT_MAX_ACK_PENDING: i64 = 1000;

/// Default cap on concurrently waiting pull requests.
pub const DEFAULT_MAX_WAITING: i64 = 512;

/// When messages leave a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Only the configured limits remove messages
    #[default]
    Limits,
    /// Removed once every consumer has acknowledged
    Interest,
    /// Removed on the first acknowledgement
    #[serde(alias = "work_queue")]
    Workqueue,
}

/// What happens when an append would exceed a limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscardPolicy {
    /// Evict the oldest messages
    #[default]
    Old,
    /// Reject the new message
    New,
}

/// Where a new consumer starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    /// From the first retained message
    #[default]
    All,
    /// From the last message
    Last,
    /// Only messages stored after creation
    New,
    /// From `opt_start_seq`
    ByStartSequence,
    /// From the first message at or after `opt_start_time`
    ByStartTime,
    /// The newest message of every subject, then everything newer
    LastPerSubject,
}

/// How deliveries are acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    /// Deliveries are never acknowledged
    None,
    /// Acknowledging a sequence acknowledges everything before it
    All,
    /// Every delivery is acknowledged individually
    #[default]
    Explicit,
}

/// Pacing of historical replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPolicy {
    /// As fast as the client pulls
    #[default]
    Instant,
    /// At the original publish cadence
    Original,
}

/// Stream configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Unique stream name
    pub name: String,

    /// Free-form description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Subject patterns captured by this stream; defaults to the name
    pub subjects: Vec<String>,

    /// Retention policy
    pub retention: RetentionPolicy,

    /// Maximum consumers, -1 unlimited
    pub max_consumers: i64,

    /// Maximum retained messages, -1 unlimited
    pub max_msgs: i64,

    /// Maximum retained payload bytes, -1 unlimited
    pub max_bytes: i64,

    /// Maximum message age, 0 unlimited
    #[serde(with = "duration_nanos")]
    pub max_age: Duration,

    /// Largest accepted payload, -1 unlimited
    pub max_msg_size: i64,

    /// Storage kind
    pub storage: StorageType,

    /// Replica count; only 1 is supported
    pub num_replicas: usize,

    /// Behaviour when a limit is reached
    pub discard: DiscardPolicy,

    /// Refuse stream and message deletion
    pub deny_delete: bool,

    /// Refuse purges
    pub deny_purge: bool,

    /// Honour `Nats-Rollup` headers
    pub allow_rollup_hdrs: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: None,
            subjects: Vec::new(),
            retention: RetentionPolicy::Limits,
            max_consumers: -1,
            max_msgs: -1,
            max_bytes: -1,
            max_age: Duration::ZERO,
            max_msg_size: -1,
            storage: StorageType::File,
            num_replicas: 1,
            discard: DiscardPolicy::Old,
            deny_delete: false,
            deny_purge: false,
            allow_rollup_hdrs: false,
        }
    }
}

/// A positive limit, or `None` for "unlimited".
pub(crate) fn limit(value: i64) -> Option<u64> {
    u64::try_from(value).ok().filter(|v| *v > 0)
}

impl StreamConfig {
    /// Config with the given name and subjects, everything else default.
    pub fn new(name: impl Into<String>, subjects: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            subjects: subjects.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Message count limit.
    #[must_use]
    pub fn msgs_limit(&self) -> Option<u64> {
        limit(self.max_msgs)
    }

    /// Byte limit.
    #[must_use]
    pub fn bytes_limit(&self) -> Option<u64> {
        limit(self.max_bytes)
    }

    /// Age limit.
    #[must_use]
    pub fn age_limit(&self) -> Option<Duration> {
        (!self.max_age.is_zero()).then_some(self.max_age)
    }

    /// Per-message size limit.
    #[must_use]
    pub fn msg_size_limit(&self) -> Option<u64> {
        limit(self.max_msg_size)
    }

    /// Whether any of this stream's subjects accepts `subject`.
    #[must_use]
    pub fn captures(&self, subject: &str) -> bool {
        self.subjects.iter().any(|pattern| matches(pattern, subject))
    }

    /// Fill defaults and check the configuration.
    ///
    /// # Errors
    /// Returns [`Error::InvalidRequest`] for a bad name, subject pattern or
    /// replica count.
    pub fn normalize(mut self) -> Result<Self> {
        validate_name("stream", &self.name)?;
        if self.subjects.is_empty() {
            self.subjects.push(self.name.clone());
        }
        for subject in &self.subjects {
            validate_pattern(subject).map_err(|_| {
                Error::invalid_request(format!("invalid stream subject '{subject}'"))
            })?;
        }
        if self.num_replicas == 0 {
            self.num_replicas = 1;
        }
        if self.num_replicas > 1 {
            return Err(Error::invalid_request("replicas > 1 not supported in embedded mode"));
        }
        if self.max_msg_size == 0 {
            self.max_msg_size = -1;
        }
        Ok(self)
    }
}

/// Consumer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Durable name; absent for ephemeral consumers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durable_name: Option<String>,

    /// Explicit consumer name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Free-form description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Starting point
    pub deliver_policy: DeliverPolicy,

    /// Start sequence for [`DeliverPolicy::ByStartSequence`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opt_start_seq: Option<u64>,

    /// Start time for [`DeliverPolicy::ByStartTime`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opt_start_time: Option<DateTime<Utc>>,

    /// Acknowledgement mode
    pub ack_policy: AckPolicy,

    /// Redelivery timeout
    #[serde(with = "duration_nanos")]
    pub ack_wait: Duration,

    /// Delivery attempts before giving up, -1 unlimited
    pub max_deliver: i64,

    /// Only deliver messages matching this pattern
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_subject: Option<String>,

    /// Replay pacing
    pub replay_policy: ReplayPolicy,

    /// Concurrent pull requests allowed
    pub max_waiting: i64,

    /// Outstanding unacknowledged deliveries allowed
    pub max_ack_pending: i64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            durable_name: None,
            name: None,
            description: None,
            deliver_policy: DeliverPolicy::All,
            opt_start_seq: None,
            opt_start_time: None,
            ack_policy: AckPolicy::Explicit,
            ack_wait: DEFAULT_ACK_WAIT,
            max_deliver: -1,
            filter_subject: None,
            replay_policy: ReplayPolicy::Instant,
            max_waiting: DEFAULT_MAX_WAITING,
            max_ack_pending: DEFAULT_MAX_ACK_PENDING,
        }
    }
}

impl ConsumerConfig {
    /// Durable consumer with default settings.
    pub fn durable(name: impl Into<String>) -> Self {
        Self { durable_name: Some(name.into()), ..Self::default() }
    }

    /// Name the consumer is registered under, if it has one.
    #[must_use]
    pub fn consumer_name(&self) -> Option<&str> {
        self.durable_name.as_deref().or(self.name.as_deref())
    }

    /// Maximum delivery attempts.
    #[must_use]
    pub fn deliver_limit(&self) -> Option<u64> {
        limit(self.max_deliver)
    }

    /// Maximum outstanding acknowledgements.
    #[must_use]
    pub fn ack_pending_limit(&self) -> Option<usize> {
        limit(self.max_ack_pending).and_then(|v| usize::try_from(v).ok())
    }

    /// Maximum concurrent pull requests.
    #[must_use]
    pub fn waiting_limit(&self) -> Option<usize> {
        limit(self.max_waiting).and_then(|v| usize::try_from(v).ok())
    }

    /// Whether this consumer tracks acknowledgements.
    #[must_use]
    pub fn tracks_acks(&self) -> bool {
        self.ack_policy != AckPolicy::None
    }

    /// Whether `subject` passes the filter.
    #[must_use]
    pub fn accepts(&self, subject: &str) -> bool {
        self.filter_subject.as_deref().map_or(true, |f| matches(f, subject))
    }

    /// Fill defaults and check the configuration.
    ///
    /// # Errors
    /// Returns [`Error::InvalidRequest`] on conflicting names, a bad filter or
    /// missing start options.
    pub fn normalize(mut self) -> Result<Self> {
        match (&self.durable_name, &self.name) {
            (Some(durable), Some(name)) if durable != name => {
                return Err(Error::invalid_request("consumer name does not match durable name"));
            },
            (Some(durable), _) => validate_name("consumer", durable)?,
            (None, Some(name)) => validate_name("consumer", name)?,
            (None, None) => {},
        }
        if let Some(filter) = &self.filter_subject {
            if filter.is_empty() {
                self.filter_subject = None;
            } else {
                validate_pattern(filter).map_err(|_| {
                    Error::invalid_request(format!("invalid filter subject '{filter}'"))
                })?;
            }
        }
        match self.deliver_policy {
            DeliverPolicy::ByStartSequence if self.opt_start_seq.unwrap_or(0) == 0 => {
                return Err(Error::invalid_request("deliver policy requires opt_start_seq"));
            },
            DeliverPolicy::ByStartTime if self.opt_start_time.is_none() => {
                return Err(Error::invalid_request("deliver policy requires opt_start_time"));
            },
            _ => {},
        }
        if self.ack_wait.is_zero() {
            self.ack_wait = DEFAULT_ACK_WAIT;
        }
        if self.max_ack_pending == 0 {
            self.max_ack_pending = DEFAULT_MAX_ACK_PENDING;
        }
        if self.max_waiting == 0 {
            self.max_waiting = DEFAULT_MAX_WAITING;
        }
        if self.max_deliver == 0 {
            self.max_deliver = -1;
        }
        Ok(self)
    }
}

/// Stream, consumer and bucket names are single subject tokens.
///
/// # Errors
/// Returns [`Error::InvalidRequest`] when `name` is empty or contains `.`,
/// `*`, `>`, a path separator or whitespace.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.len() > 255
        || name.chars().any(|c| matches!(c, '.' | '*' | '>' | '/' | '\\') || c.is_whitespace());
    if bad {
        return Err(Error::invalid_request(format!("invalid {kind} name '{name}'")));
    }
    Ok(())
}
