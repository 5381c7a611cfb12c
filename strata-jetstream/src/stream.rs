//! Streams: a message store plus configuration, counters and consumers.
//!
//! Every mutation happens under the stream's own write lock, which is what
//! serializes sequence assignment. Independent streams never share a lock.
//!
//! Retention runs after every append in a fixed order: message count, then
//! bytes, then age. The byte limit never evicts the message that was just
//! stored, even when it alone exceeds the limit.

use crate::{
    config::{DiscardPolicy, RetentionPolicy, StreamConfig},
    consumer::Consumer,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use strata_core::{subject::matches, Error, Message, Result, Sequence, Timestamp};
use strata_storage::{MessageStore, Removed};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Header requesting a rollup of earlier messages.
pub const ROLLUP_HEADER: &str = "Nats-Rollup";

/// Live counters of a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamState {
    /// Retained messages
    pub messages: u64,
    /// Retained payload bytes
    pub bytes: u64,
    /// Oldest retained sequence (`last_seq + 1` when empty)
    pub first_seq: Sequence,
    /// Timestamp of the oldest retained message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_ts: Option<Timestamp>,
    /// Highest sequence ever assigned
    pub last_seq: Sequence,
    /// Timestamp of the most recent append
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ts: Option<Timestamp>,
    /// Attached consumers
    pub consumer_count: usize,
}

/// Configuration, creation time and state of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Current configuration
    pub config: StreamConfig,
    /// Creation time
    pub created: Timestamp,
    /// Current state
    pub state: StreamState,
}

/// Acknowledgement returned to a publisher whose message was stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubAck {
    /// Stream that stored the message
    pub stream: String,
    /// Assigned sequence
    pub seq: Sequence,
}

/// Parameters of a purge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PurgeRequest {
    /// Only purge messages on matching subjects
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Purge messages below this sequence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<Sequence>,
    /// Keep this many of the newest messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep: Option<u64>,
}

/// Parameters of a direct message lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MsgGetRequest {
    /// Exact sequence, or the lower bound for `next_by_subj`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<Sequence>,
    /// Newest message on this subject
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_by_subj: Option<String>,
    /// First message at or after `seq` on this subject
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_by_subj: Option<String>,
}

#[derive(Debug)]
struct StreamInner {
    config: StreamConfig,
    store: Box<dyn MessageStore>,
    last_ts: Option<Timestamp>,
    /// Bumped by removals that may sit above a consumer's cursor. Head
    /// evictions and acknowledgement retention never do.
    reshapes: u64,
}

/// Cached count of the messages a filtered consumer has yet to see.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PendingTally {
    from: Sequence,
    through: Sequence,
    count: u64,
    reshapes: u64,
}

impl StreamInner {
    fn state(&self, consumer_count: usize) -> StreamState {
        StreamState {
            messages: self.store.len() as u64,
            bytes: self.store.bytes() as u64,
            first_seq: self.store.first_seq(),
            first_ts: self.store.peek_oldest().map(|m| m.timestamp),
            last_seq: self.store.last_seq(),
            last_ts: self.last_ts,
            consumer_count,
        }
    }

    /// Count, then bytes, then age.
    fn enforce_limits(&mut self, now: DateTime<Utc>) -> Removed {
        let mut removed = Removed::default();

        if self.config.discard == DiscardPolicy::Old {
            if let Some(max) = self.config.msgs_limit() {
                while self.store.len() as u64 > max {
                    let Some(bytes) = self.store.evict_oldest() else { break };
                    removed.add(bytes);
                }
            }
            if let Some(max) = self.config.bytes_limit() {
                while self.store.bytes() as u64 > max && self.store.len() > 1 {
                    let Some(bytes) = self.store.evict_oldest() else { break };
                    removed.add(bytes);
                }
            }
        }

        let aged = self.expire_aged(now);
        removed.messages += aged.messages;
        removed.bytes += aged.bytes;
        removed
    }

    fn expire_aged(&mut self, now: DateTime<Utc>) -> Removed {
        let mut removed = Removed::default();
        let Some(max_age) = self.config.age_limit() else { return removed };
        let Ok(max_age) = chrono::Duration::from_std(max_age) else { return removed };
        let cutoff = now - max_age;
        while self.store.peek_oldest().is_some_and(|m| m.timestamp < cutoff) {
            let Some(bytes) = self.store.evict_oldest() else { break };
            removed.add(bytes);
        }
        removed
    }

    fn check_discard_new(&self, size: usize) -> Result<()> {
        if self.config.discard != DiscardPolicy::New {
            return Ok(());
        }
        if let Some(max) = self.config.msgs_limit() {
            if self.store.len() as u64 >= max {
                return Err(Error::ResourceLimit {
                    resource: "maximum messages".to_string(),
                    limit: max.to_string(),
                });
            }
        }
        if let Some(max) = self.config.bytes_limit() {
            if (self.store.bytes() + size) as u64 > max {
                return Err(Error::ResourceLimit {
                    resource: "maximum bytes".to_string(),
                    limit: max.to_string(),
                });
            }
        }
        Ok(())
    }

    fn rollup(&mut self, kept: Sequence, subject: Option<&str>) -> Removed {
        let doomed: Vec<Sequence> = self
            .store
            .iter_from(0)
            .filter(|m| m.sequence < kept && subject.map_or(true, |s| m.subject.as_str() == s))
            .map(|m| m.sequence)
            .collect();
        let mut removed = Removed::default();
        for seq in doomed {
            if let Some(m) = self.store.remove(seq) {
                removed.add(m.size());
            }
        }
        if removed.messages > 0 {
            self.reshapes += 1;
        }
        removed
    }

    fn count_filtered(&self, from: Sequence, until: Sequence, filter: &str) -> u64 {
        let count = self
            .store
            .iter_from(from)
            .take_while(|m| m.sequence < until)
            .filter(|m| matches(filter, m.subject.as_str()))
            .count();
        count as u64
    }
}

/// A named, append-only, retention-limited message log.
#[derive(Debug)]
pub struct Stream {
    name: String,
    created: Timestamp,
    inner: RwLock<StreamInner>,
    consumers: DashMap<String, Arc<Consumer>>,
    new_messages: Notify,
    deleted: AtomicBool,
}

impl Stream {
    /// Wrap a store with an already normalized configuration.
    pub fn new(config: StreamConfig, store: Box<dyn MessageStore>) -> Arc<Self> {
        Arc::new(Self {
            name: config.name.clone(),
            created: Utc::now(),
            inner: RwLock::new(StreamInner { config, store, last_ts: None, reshapes: 0 }),
            consumers: DashMap::new(),
            new_messages: Notify::new(),
            deleted: AtomicBool::new(false),
        })
    }

    /// Stream name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creation time.
    #[must_use]
    pub const fn created(&self) -> Timestamp {
        self.created
    }

    /// Copy of the current configuration.
    #[must_use]
    pub fn config(&self) -> StreamConfig {
        self.inner.read().config.clone()
    }

    /// Retention policy.
    #[must_use]
    pub fn retention(&self) -> RetentionPolicy {
        self.inner.read().config.retention
    }

    /// Whether the stream captures `subject`.
    #[must_use]
    pub fn captures(&self, subject: &str) -> bool {
        self.inner.read().config.captures(subject)
    }

    /// Current counters.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.inner.read().state(self.consumers.len())
    }

    /// Configuration, creation time and state.
    #[must_use]
    pub fn info(&self) -> StreamInfo {
        let inner = self.inner.read();
        StreamInfo {
            config: inner.config.clone(),
            created: self.created,
            state: inner.state(self.consumers.len()),
        }
    }

    /// Whether the stream has been deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_deleted() {
            return Err(Error::not_found("stream", &self.name));
        }
        Ok(())
    }

    /// Store a message and apply retention.
    ///
    /// # Errors
    /// - [`Error::ResourceLimit`] for oversized payloads or, under
    ///   `discard: new`, a full stream
    /// - [`Error::PermissionDenied`] for a rollup header on a stream without
    ///   `allow_rollup_hdrs`
    /// - storage failures
    pub fn ingest(&self, message: Message) -> Result<PubAck> {
        self.ensure_live()?;
        let rollup = message.header(ROLLUP_HEADER).map(str::to_ascii_lowercase);
        let subject = message.subject.as_str().to_string();
        let size = message.size();
        let timestamp = message.timestamp;

        let mut inner = self.inner.write();
        if let Some(max) = inner.config.msg_size_limit() {
            if size as u64 > max {
                return Err(Error::ResourceLimit {
                    resource: "maximum message size".to_string(),
                    limit: max.to_string(),
                });
            }
        }
        if rollup.is_some() && !inner.config.allow_rollup_hdrs {
            return Err(Error::permission_denied("rollup not permitted"));
        }
        inner.check_discard_new(size)?;

        let seq = inner.store.append(message)?;
        inner.last_ts = Some(timestamp);

        let rolled = match rollup.as_deref() {
            Some("sub") => inner.rollup(seq, Some(&subject)),
            Some("all") => inner.rollup(seq, None),
            Some(other) => {
                debug!(stream = %self.name, rollup = other, "Ignoring unknown rollup value");
                Removed::default()
            },
            None => Removed::default(),
        };
        let trimmed = inner.enforce_limits(Utc::now());
        drop(inner);

        if rolled.messages + trimmed.messages > 0 {
            trace!(
                stream = %self.name,
                seq,
                evicted = rolled.messages + trimmed.messages,
                "Applied retention"
            );
        }
        self.new_messages.notify_waiters();
        Ok(PubAck { stream: self.name.clone(), seq })
    }

    /// Drop messages older than `max_age`.
    pub fn expire(&self) -> u64 {
        if self.inner.read().config.age_limit().is_none() {
            return 0;
        }
        self.inner.write().expire_aged(Utc::now()).messages
    }

    /// Replace the configuration. Existing messages are not re-trimmed.
    ///
    /// # Errors
    /// [`Error::InvalidRequest`] when the name, retention or storage changes.
    pub fn update(&self, config: StreamConfig) -> Result<StreamInfo> {
        self.ensure_live()?;
        let config = config.normalize()?;
        {
            let mut inner = self.inner.write();
            if config.name != self.name {
                return Err(Error::invalid_request("stream name may not change"));
            }
            if config.retention != inner.config.retention {
                return Err(Error::invalid_request("stream retention may not change"));
            }
            if config.storage != inner.config.storage {
                return Err(Error::invalid_request("stream storage may not change"));
            }
            inner.config = config;
        }
        Ok(self.info())
    }

    /// Remove messages according to `request`; returns the number purged.
    ///
    /// # Errors
    /// [`Error::PermissionDenied`] if the stream denies purges,
    /// [`Error::InvalidRequest`] if both `seq` and `keep` are given.
    pub fn purge(&self, request: &PurgeRequest) -> Result<u64> {
        self.ensure_live()?;
        if request.seq.is_some() && request.keep.is_some() {
            return Err(Error::invalid_request("purge: seq and keep are mutually exclusive"));
        }
        let mut inner = self.inner.write();
        if inner.config.deny_purge {
            return Err(Error::permission_denied("stream purge not permitted"));
        }

        let filter = request.filter.as_deref().filter(|f| !f.is_empty() && *f != ">");
        let removed = match (filter, request.seq, request.keep) {
            (None, None, None) => inner.store.purge(),
            (None, Some(below), None) => inner.store.compact(below),
            _ => {
                let candidates: Vec<Sequence> = inner
                    .store
                    .iter_from(0)
                    .filter(|m| filter.map_or(true, |f| matches(f, m.subject.as_str())))
                    .map(|m| m.sequence)
                    .collect();
                let doomed: &[Sequence] = match (request.seq, request.keep) {
                    (Some(below), _) => {
                        let end = candidates.partition_point(|s| *s < below);
                        &candidates[..end]
                    },
                    (None, Some(keep)) => {
                        let keep = usize::try_from(keep).unwrap_or(usize::MAX);
                        &candidates[..candidates.len().saturating_sub(keep)]
                    },
                    (None, None) => &candidates,
                };
                let mut removed = Removed::default();
                for seq in doomed {
                    if let Some(m) = inner.store.remove(*seq) {
                        removed.add(m.size());
                    }
                }
                removed
            },
        };
        if removed.messages > 0 {
            inner.reshapes += 1;
        }
        drop(inner);
        debug!(stream = %self.name, purged = removed.messages, "Purged stream");
        Ok(removed.messages)
    }

    /// Look up a stored message.
    ///
    /// # Errors
    /// [`Error::NotFound`] when nothing matches, [`Error::InvalidRequest`]
    /// when the request names no selector.
    pub fn get_message(&self, request: &MsgGetRequest) -> Result<Message> {
        self.ensure_live()?;
        let inner = self.inner.read();
        let found = match (request.seq, &request.last_by_subj, &request.next_by_subj) {
            (_, Some(subject), _) => {
                inner.store.iter_from(0).filter(|m| matches(subject, m.subject.as_str())).last()
            },
            (seq, None, Some(subject)) => inner
                .store
                .iter_from(seq.unwrap_or(0))
                .find(|m| matches(subject, m.subject.as_str())),
            (Some(seq), None, None) => inner.store.get(seq),
            (None, None, None) => {
                return Err(Error::invalid_request("message get requires seq or subject"));
            },
        };
        found.ok_or_else(|| {
            let key = match (&request.last_by_subj, &request.next_by_subj, request.seq) {
                (Some(subject), _, _) | (None, Some(subject), _) => subject.clone(),
                (None, None, seq) => seq.unwrap_or_default().to_string(),
            };
            Error::not_found("message", key)
        })
    }

    /// Remove a single message.
    ///
    /// # Errors
    /// [`Error::PermissionDenied`] if the stream denies deletes,
    /// [`Error::NotFound`] if `seq` is not stored.
    pub fn delete_message(&self, seq: Sequence) -> Result<()> {
        self.ensure_live()?;
        let mut inner = self.inner.write();
        if inner.config.deny_delete {
            return Err(Error::permission_denied("message delete not permitted"));
        }
        inner.store.remove(seq).ok_or_else(|| Error::not_found("message", seq.to_string()))?;
        inner.reshapes += 1;
        Ok(())
    }

    /// Tear the stream down and detach every consumer.
    ///
    /// # Errors
    /// [`Error::PermissionDenied`] if the stream denies deletes.
    pub fn delete(&self) -> Result<()> {
        {
            let mut inner = self.inner.write();
            if inner.config.deny_delete {
                return Err(Error::permission_denied("stream delete not permitted"));
            }
            if self.deleted.swap(true, Ordering::AcqRel) {
                return Err(Error::not_found("stream", &self.name));
            }
            inner.store.purge();
        }
        for entry in &self.consumers {
            entry.value().mark_deleted();
        }
        self.consumers.clear();
        self.new_messages.notify_waiters();
        Ok(())
    }

    // ---- consumer registry ----

    /// Number of attached consumers.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Attached consumer by name.
    #[must_use]
    pub fn consumer(&self, name: &str) -> Option<Arc<Consumer>> {
        self.consumers.get(name).map(|c| Arc::clone(c.value()))
    }

    /// Snapshot of attached consumers sorted by name.
    #[must_use]
    pub fn consumers(&self) -> Vec<Arc<Consumer>> {
        let mut all: Vec<Arc<Consumer>> =
            self.consumers.iter().map(|c| Arc::clone(c.value())).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub(crate) fn attach(&self, consumer: Arc<Consumer>) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        self.ensure_live()?;
        match self.consumers.entry(consumer.name().to_string()) {
            Entry::Occupied(_) => Err(Error::already_exists("consumer", consumer.name())),
            Entry::Vacant(slot) => {
                slot.insert(consumer);
                Ok(())
            },
        }
    }

    pub(crate) fn detach(&self, name: &str) -> Option<Arc<Consumer>> {
        self.consumers.remove(name).map(|(_, c)| c)
    }

    // ---- reads used by consumers ----

    /// Message stored under `seq`.
    #[must_use]
    pub fn message(&self, seq: Sequence) -> Option<Message> {
        self.inner.read().store.get(seq)
    }

    /// Highest assigned sequence.
    #[must_use]
    pub fn last_seq(&self) -> Sequence {
        self.inner.read().store.last_seq()
    }

    /// First message with sequence `>= from` accepted by `filter`.
    #[must_use]
    pub fn next_matching(&self, from: Sequence, filter: Option<&str>) -> Option<Message> {
        let inner = self.inner.read();
        let found = inner
            .store
            .iter_from(from)
            .find(|m| filter.map_or(true, |f| matches(f, m.subject.as_str())));
        found
    }

    /// Messages with sequence `>= from` accepted by `filter`.
    #[must_use]
    pub fn count_matching(&self, from: Sequence, filter: Option<&str>) -> u64 {
        let inner = self.inner.read();
        match filter {
            None => inner.store.count_from(from) as u64,
            Some(filter) => inner.count_filtered(from, Sequence::MAX, filter),
        }
    }

    /// Like [`Stream::count_matching`], but a filtered count reuses `tally`
    /// and only scans what changed since it was taken: messages the cursor
    /// moved past and messages appended since.
    pub(crate) fn pending_after(
        &self,
        from: Sequence,
        filter: Option<&str>,
        tally: &mut Option<PendingTally>,
    ) -> u64 {
        let inner = self.inner.read();
        let Some(filter) = filter else {
            return inner.store.count_from(from) as u64;
        };
        let last = inner.store.last_seq();
        let count = match *tally {
            Some(t)
                if t.reshapes == inner.reshapes
                    && t.from <= from
                    && t.from >= inner.store.first_seq()
                    && t.through <= last =>
            {
                let passed = inner.count_filtered(t.from, from.min(t.through + 1), filter);
                let appended = inner.count_filtered(from.max(t.through + 1), Sequence::MAX, filter);
                t.count.saturating_sub(passed) + appended
            },
            _ => inner.count_filtered(from, Sequence::MAX, filter),
        };
        *tally = Some(PendingTally { from, through: last, count, reshapes: inner.reshapes });
        count
    }

    /// Sequence of the newest message accepted by `filter`.
    #[must_use]
    pub fn last_matching(&self, filter: Option<&str>) -> Option<Sequence> {
        let inner = self.inner.read();
        let last = inner
            .store
            .iter_from(0)
            .filter(|m| filter.map_or(true, |f| matches(f, m.subject.as_str())))
            .map(|m| m.sequence)
            .last();
        last
    }

    /// First sequence whose message was received at or after `time`.
    #[must_use]
    pub fn seq_at_or_after(&self, time: Timestamp) -> Sequence {
        let inner = self.inner.read();
        let found = inner.store.iter_from(0).find(|m| m.timestamp >= time).map(|m| m.sequence);
        found.unwrap_or_else(|| inner.store.last_seq() + 1)
    }

    /// Newest sequence per subject accepted by `filter`.
    #[must_use]
    pub fn last_per_subject(&self, filter: Option<&str>) -> BTreeSet<Sequence> {
        let inner = self.inner.read();
        let mut newest: BTreeMap<String, Sequence> = BTreeMap::new();
        for m in inner.store.iter_from(0) {
            if filter.map_or(true, |f| matches(f, m.subject.as_str())) {
                newest.insert(m.subject.into_string(), m.sequence);
            }
        }
        newest.into_values().collect()
    }

    /// Future resolving on the next append or on deletion.
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.new_messages.notified()
    }

    /// Apply interest/work-queue retention after `seqs` were acknowledged.
    ///
    /// Must not be called while holding a consumer lock.
    pub(crate) fn acknowledged(&self, seqs: &[Sequence]) {
        if seqs.is_empty() {
            return;
        }
        let retention = self.retention();
        let removable: Vec<Sequence> = match retention {
            RetentionPolicy::Limits => return,
            RetentionPolicy::Workqueue => seqs.to_vec(),
            RetentionPolicy::Interest => {
                let subjects: Vec<(Sequence, String)> = {
                    let inner = self.inner.read();
                    seqs.iter()
                        .filter_map(|seq| inner.store.get(*seq).map(|m| (*seq, m.subject.into_string())))
                        .collect()
                };
                let consumers = self.consumers();
                subjects
                    .into_iter()
                    .filter(|(seq, subject)| consumers.iter().all(|c| c.has_acked(*seq, subject)))
                    .map(|(seq, _)| seq)
                    .collect()
            },
        };
        if removable.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        for seq in removable {
            inner.store.remove(seq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use strata_storage::MemoryStore;

    fn stream(config: StreamConfig) -> Arc<Stream> {
        Stream::new(config.normalize().unwrap(), Box::new(MemoryStore::new()))
    }

    fn msg(subject: &str, payload: &str) -> Message {
        Message::new(subject, payload.to_string()).unwrap()
    }

    #[test]
    fn test_ingest_assigns_sequences_and_counters() {
        let s = stream(StreamConfig::new("ORDERS", ["orders.*"]));
        assert_eq!(s.ingest(msg("orders.new", "abc")).unwrap().seq, 1);
        assert_eq!(s.ingest(msg("orders.cancel", "de")).unwrap().seq, 2);

        let state = s.state();
        assert_eq!(state.messages, 2);
        assert_eq!(state.bytes, 5);
        assert_eq!(state.first_seq, 1);
        assert_eq!(state.last_seq, 2);
        assert!(state.first_ts.is_some());
    }

    #[test]
    fn test_max_msgs_keeps_newest() {
        let k = 4;
        let s = stream(StreamConfig { max_msgs: k, ..StreamConfig::new("S", ["s"]) });
        for i in 0..k + 5 {
            s.ingest(msg("s", &i.to_string())).unwrap();
        }
        let state = s.state();
        assert_eq!(state.messages, k as u64);
        assert_eq!(state.last_seq, (k + 5) as u64);
        assert_eq!(state.first_seq, 6);
        assert_eq!(s.message(6).unwrap().payload, "5");
    }

    #[test]
    fn test_max_bytes_never_evicts_newest() {
        let s = stream(StreamConfig { max_bytes: 10, ..StreamConfig::new("S", ["s"]) });
        s.ingest(msg("s", "aaaa")).unwrap();
        s.ingest(msg("s", "bbbb")).unwrap();
        assert_eq!(s.state().bytes, 8);

        s.ingest(msg("s", "cccc")).unwrap();
        let state = s.state();
        assert!(state.bytes <= 10);
        assert_eq!(state.first_seq, 2);

        s.ingest(msg("s", "a message far larger than the limit")).unwrap();
        let state = s.state();
        assert_eq!(state.messages, 1);
        assert_eq!(state.first_seq, 4);
        assert_eq!(state.last_seq, 4);
    }

    #[test]
    fn test_max_age_evicts_old_messages() {
        let s = stream(StreamConfig {
            max_age: Duration::from_secs(60),
            ..StreamConfig::new("S", ["s"])
        });
        let old = Message::builder("s")
            .payload("old")
            .timestamp(Utc::now() - chrono::Duration::minutes(5))
            .build()
            .unwrap();
        s.ingest(old).unwrap();
        assert_eq!(s.state().messages, 0);

        s.ingest(msg("s", "fresh")).unwrap();
        assert_eq!(s.state().messages, 1);
        assert_eq!(s.expire(), 0);
    }

    #[test]
    fn test_discard_new_rejects() {
        let s = stream(StreamConfig {
            max_msgs: 2,
            discard: DiscardPolicy::New,
            ..StreamConfig::new("S", ["s"])
        });
        s.ingest(msg("s", "1")).unwrap();
        s.ingest(msg("s", "2")).unwrap();
        assert!(matches!(s.ingest(msg("s", "3")), Err(Error::ResourceLimit { .. })));
        assert_eq!(s.state().last_seq, 2);
    }

    #[test]
    fn test_max_msg_size() {
        let s = stream(StreamConfig { max_msg_size: 3, ..StreamConfig::new("S", ["s"]) });
        assert!(s.ingest(msg("s", "abc")).is_ok());
        assert!(s.ingest(msg("s", "abcd")).is_err());
    }

    #[test]
    fn test_rollup() {
        let s = stream(StreamConfig { allow_rollup_hdrs: true, ..StreamConfig::new("S", ["s.*"]) });
        s.ingest(msg("s.a", "1")).unwrap();
        s.ingest(msg("s.b", "2")).unwrap();
        s.ingest(msg("s.a", "3")).unwrap();
        let rollup = Message::builder("s.a").header(ROLLUP_HEADER, "sub").payload("4").build().unwrap();
        s.ingest(rollup).unwrap();
        let state = s.state();
        assert_eq!(state.messages, 2);
        assert!(s.message(2).is_some());
        assert!(s.message(4).is_some());

        let all = Message::builder("s.b").header(ROLLUP_HEADER, "all").build().unwrap();
        s.ingest(all).unwrap();
        assert_eq!(s.state().messages, 1);
    }

    #[test]
    fn test_rollup_requires_permission() {
        let s = stream(StreamConfig::new("S", ["s"]));
        let rollup = Message::builder("s").header(ROLLUP_HEADER, "all").build().unwrap();
        assert!(matches!(s.ingest(rollup), Err(Error::PermissionDenied { .. })));
    }

    #[test]
    fn test_purge_variants() {
        let s = stream(StreamConfig::new("S", ["s.*"]));
        for i in 0..10 {
            let subject = if i % 2 == 0 { "s.even" } else { "s.odd" };
            s.ingest(msg(subject, "x")).unwrap();
        }
        let purged = s
            .purge(&PurgeRequest { filter: Some("s.even".into()), keep: Some(1), seq: None })
            .unwrap();
        assert_eq!(purged, 4);
        assert_eq!(s.purge(&PurgeRequest { seq: Some(4), ..PurgeRequest::default() }).unwrap(), 2);
        assert_eq!(s.state().first_seq, 4);
        assert_eq!(s.purge(&PurgeRequest::default()).unwrap(), 4);

        let state = s.state();
        assert_eq!(state.messages, 0);
        assert_eq!(state.last_seq, 10);
        assert_eq!(state.first_seq, 11);
    }

    #[test]
    fn test_deny_flags() {
        let s = stream(StreamConfig {
            deny_purge: true,
            deny_delete: true,
            ..StreamConfig::new("S", ["s"])
        });
        s.ingest(msg("s", "x")).unwrap();
        assert!(matches!(s.purge(&PurgeRequest::default()), Err(Error::PermissionDenied { .. })));
        assert!(matches!(s.delete_message(1), Err(Error::PermissionDenied { .. })));
        assert!(matches!(s.delete(), Err(Error::PermissionDenied { .. })));
        assert!(!s.is_deleted());
    }

    #[test]
    fn test_get_message_selectors() {
        let s = stream(StreamConfig::new("S", ["s.*"]));
        s.ingest(msg("s.a", "1")).unwrap();
        s.ingest(msg("s.b", "2")).unwrap();
        s.ingest(msg("s.a", "3")).unwrap();

        let by_seq = s.get_message(&MsgGetRequest { seq: Some(2), ..MsgGetRequest::default() });
        assert_eq!(by_seq.unwrap().payload, "2");
        let last = s.get_message(&MsgGetRequest {
            last_by_subj: Some("s.a".into()),
            ..MsgGetRequest::default()
        });
        assert_eq!(last.unwrap().sequence, 3);
        let next = s.get_message(&MsgGetRequest {
            seq: Some(2),
            next_by_subj: Some("s.a".into()),
            ..MsgGetRequest::default()
        });
        assert_eq!(next.unwrap().sequence, 3);
        assert!(matches!(
            s.get_message(&MsgGetRequest { seq: Some(9), ..MsgGetRequest::default() }),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_update_is_not_retroactive() {
        let s = stream(StreamConfig::new("S", ["s"]));
        for _ in 0..5 {
            s.ingest(msg("s", "x")).unwrap();
        }
        s.update(StreamConfig { max_msgs: 2, ..StreamConfig::new("S", ["s"]) }).unwrap();
        assert_eq!(s.state().messages, 5);
        s.ingest(msg("s", "x")).unwrap();
        assert_eq!(s.state().messages, 2);

        let changed = StreamConfig {
            retention: RetentionPolicy::Workqueue,
            ..StreamConfig::new("S", ["s"])
        };
        assert!(s.update(changed).is_err());
    }

    #[test]
    fn test_delete_marks_stream() {
        let s = stream(StreamConfig::new("S", ["s"]));
        s.ingest(msg("s", "x")).unwrap();
        s.delete().unwrap();
        assert!(s.is_deleted());
        assert!(matches!(s.ingest(msg("s", "x")), Err(Error::NotFound { .. })));
        assert!(s.delete().is_err());
    }

    #[test]
    fn test_concurrent_ingest_sequences_are_dense() {
        let s = stream(StreamConfig::new("S", ["s"]));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&s);
                std::thread::spawn(move || {
                    (0..250).map(|_| s.ingest(msg("s", "x")).unwrap().seq).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seqs: Vec<Sequence> =
            threads.into_iter().flat_map(|t| t.join().unwrap()).collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=2000).collect::<Vec<_>>());
    }
}
