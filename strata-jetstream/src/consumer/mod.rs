//! Consumers: cursors over a stream with acknowledgement tracking.
//!
//! A consumer hands out messages in stream order through [`Consumer::next_batch`].
//! Under an acking policy every delivered message stays pending until it is
//! acknowledged, terminated or exhausts `max_deliver`. Pending entries whose
//! ack deadline passes are redelivered ahead of new messages.
//!
//! Waiting for work never polls: a pull parks on the stream's append
//! notification, the consumer's ack notification, the earliest ack deadline
//! and the request deadline, whichever fires first.
//!
//! Locking: the consumer lock may be held while reading the stream, never the
//! other way round.

mod pending;

pub use pending::SequenceInfo;

use crate::{
    ack::{AckKind, AckSubject},
    config::{AckPolicy, ConsumerConfig, DeliverPolicy, RetentionPolicy},
    stream::{PendingTally, Stream},
};
use parking_lot::Mutex;
use pending::{PendingEntry, PendingSet};
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use strata_core::{
    subject::overlaps, types::unix_nanos, ConnectionId, Error, Message, Result, Sequence,
    Timestamp,
};
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, warn};

/// A message handed to a puller.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The stored message
    pub message: Message,
    /// Coordinates encoded into the ack reply subject
    pub ack: AckSubject,
}

/// Live counters of a consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerState {
    /// Highest delivered pair
    pub delivered: SequenceInfo,
    /// Everything at or below this pair is settled
    pub ack_floor: SequenceInfo,
    /// Delivered, unacknowledged messages
    pub num_ack_pending: usize,
    /// Redeliveries performed
    pub num_redelivered: u64,
    /// Pull requests currently parked
    pub num_waiting: usize,
    /// Matching messages not yet delivered
    pub num_pending: u64,
    /// Messages given up on (`+TERM` or `max_deliver` exhausted)
    pub num_terminated: u64,
}

/// Consumer configuration plus state, as reported by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    /// Owning stream
    pub stream_name: String,
    /// Consumer name
    pub name: String,
    /// Creation time
    pub created: Timestamp,
    /// Configuration
    pub config: ConsumerConfig,
    /// Live counters
    #[serde(flatten)]
    pub state: ConsumerState,
}

#[derive(Debug)]
struct ConsumerInner {
    config: ConsumerConfig,
    /// Next stream sequence to consider for new deliveries
    cursor: Sequence,
    /// Seeded by `last_per_subject`, drained before the cursor
    backlog: VecDeque<Sequence>,
    delivered: SequenceInfo,
    pending: PendingSet,
    num_redelivered: u64,
    num_terminated: u64,
    tally: Option<PendingTally>,
}

impl ConsumerInner {
    /// Messages not yet delivered: the backlog plus everything from the cursor on.
    fn num_pending(&mut self, stream: &Stream) -> u64 {
        let filter = self.config.filter_subject.as_deref();
        stream.pending_after(self.cursor, filter, &mut self.tally) + self.backlog.len() as u64
    }

    fn ack_floor(&self) -> SequenceInfo {
        if self.config.tracks_acks() {
            self.pending.ack_floor(self.delivered)
        } else {
            self.delivered
        }
    }
}

/// A pull consumer bound to one stream.
#[derive(Debug)]
pub struct Consumer {
    name: String,
    stream_name: String,
    stream: Weak<Stream>,
    created: Timestamp,
    owner: Option<ConnectionId>,
    inner: Mutex<ConsumerInner>,
    acks: Notify,
    deleted: AtomicBool,
    waiting: AtomicUsize,
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Consumer {
    /// Create a consumer and attach it to `stream`.
    ///
    /// Consumers without a durable name are ephemeral; they get a generated
    /// name when none is supplied and are tied to `owner`.
    ///
    /// # Errors
    /// - [`Error::InvalidRequest`] for an invalid configuration, a
    ///   non-acking consumer on a work-queue stream, or a work-queue filter
    ///   overlapping an existing consumer
    /// - [`Error::ResourceLimit`] when the stream's `max_consumers` is reached
    /// - [`Error::AlreadyExists`] when the name is taken
    pub fn create(
        stream: &Arc<Stream>,
        config: ConsumerConfig,
        owner: Option<ConnectionId>,
    ) -> Result<Arc<Self>> {
        let mut config = config.normalize()?;
        let stream_config = stream.config();

        if let Some(max) = crate::config::limit(stream_config.max_consumers) {
            if stream.consumer_count() as u64 >= max {
                return Err(Error::ResourceLimit {
                    resource: format!("consumers on stream {}", stream.name()),
                    limit: max.to_string(),
                });
            }
        }
        if stream_config.retention == RetentionPolicy::Workqueue {
            check_work_queue(stream, &config)?;
        }

        let name = match config.consumer_name() {
            Some(name) => name.to_string(),
            None => {
                let generated = uuid::Uuid::new_v4().simple().to_string();
                let name = generated[..12].to_string();
                config.name = Some(name.clone());
                name
            },
        };
        let owner = if config.durable_name.is_some() { None } else { owner };

        let filter = config.filter_subject.clone();
        let mut backlog = VecDeque::new();
        let last_seq = stream.last_seq();
        let cursor = match config.deliver_policy {
            DeliverPolicy::All => 0,
            DeliverPolicy::Last => {
                stream.last_matching(filter.as_deref()).unwrap_or(last_seq + 1)
            },
            DeliverPolicy::New => last_seq + 1,
            DeliverPolicy::ByStartSequence => config.opt_start_seq.unwrap_or(1),
            DeliverPolicy::ByStartTime => match config.opt_start_time {
                Some(time) => stream.seq_at_or_after(time),
                None => last_seq + 1,
            },
            DeliverPolicy::LastPerSubject => {
                backlog.extend(stream.last_per_subject(filter.as_deref()));
                last_seq + 1
            },
        };

        let consumer = Arc::new(Self {
            name,
            stream_name: stream.name().to_string(),
            stream: Arc::downgrade(stream),
            created: chrono::Utc::now(),
            owner,
            inner: Mutex::new(ConsumerInner {
                config,
                cursor,
                backlog,
                delivered: SequenceInfo::default(),
                pending: PendingSet::default(),
                num_redelivered: 0,
                num_terminated: 0,
                tally: None,
            }),
            acks: Notify::new(),
            deleted: AtomicBool::new(false),
            waiting: AtomicUsize::new(0),
        });
        stream.attach(Arc::clone(&consumer))?;
        debug!(stream = %consumer.stream_name, consumer = %consumer.name, "Created consumer");
        Ok(consumer)
    }

    /// Consumer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the stream this consumer reads.
    #[must_use]
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Connection owning an ephemeral consumer.
    #[must_use]
    pub const fn owner(&self) -> Option<ConnectionId> {
        self.owner
    }

    /// Whether the consumer has no durable name.
    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        self.inner.lock().config.durable_name.is_none()
    }

    /// Copy of the configuration.
    #[must_use]
    pub fn config(&self) -> ConsumerConfig {
        self.inner.lock().config.clone()
    }

    /// Whether the consumer has been deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
        self.acks.notify_waiters();
    }

    fn live_stream(&self) -> Result<Arc<Stream>> {
        if self.is_deleted() {
            return Err(Error::not_found("consumer", &self.name));
        }
        match self.stream.upgrade() {
            Some(stream) if !stream.is_deleted() => Ok(stream),
            _ => Err(Error::not_found("stream", &self.stream_name)),
        }
    }

    /// Current counters.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        let mut inner = self.inner.lock();
        let num_pending = match self.stream.upgrade() {
            Some(stream) => inner.num_pending(&stream),
            None => inner.backlog.len() as u64,
        };
        ConsumerState {
            delivered: inner.delivered,
            ack_floor: inner.ack_floor(),
            num_ack_pending: inner.pending.len(),
            num_redelivered: inner.num_redelivered,
            num_waiting: self.waiting.load(Ordering::Acquire),
            num_pending,
            num_terminated: inner.num_terminated,
        }
    }

    /// Configuration and counters.
    #[must_use]
    pub fn info(&self) -> ConsumerInfo {
        ConsumerInfo {
            stream_name: self.stream_name.clone(),
            name: self.name.clone(),
            created: self.created,
            config: self.config(),
            state: self.state(),
        }
    }

    /// Whether the consumer is done with `stream_seq` on `subject`.
    ///
    /// Messages outside the filter count as settled.
    pub(crate) fn has_acked(&self, stream_seq: Sequence, subject: &str) -> bool {
        let inner = self.inner.lock();
        if !inner.config.accepts(subject) {
            return true;
        }
        stream_seq < inner.cursor
            && !inner.pending.contains(stream_seq)
            && !inner.backlog.contains(&stream_seq)
    }

    fn enter_waiting(&self, limit: Option<usize>) -> Result<WaitingGuard<'_>> {
        let admitted = self.waiting.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            limit.map_or(Some(n + 1), |max| (n < max).then_some(n + 1))
        });
        match admitted {
            Ok(_) => Ok(WaitingGuard(&self.waiting)),
            Err(n) => Err(Error::ResourceLimit {
                resource: format!("pull requests on consumer {}", self.name),
                limit: n.to_string(),
            }),
        }
    }

    /// Fetch up to `max` messages.
    ///
    /// Returns as soon as at least one message is available. With `no_wait`
    /// an empty batch is returned immediately; otherwise the call parks for
    /// up to `max_wait` and returns an empty batch on timeout.
    ///
    /// # Errors
    /// - [`Error::NotFound`] when the consumer or its stream is deleted
    /// - [`Error::ResourceLimit`] when `max_waiting` pulls are already parked
    pub async fn next_batch(
        &self,
        max: usize,
        max_wait: Duration,
        no_wait: bool,
    ) -> Result<Vec<Delivery>> {
        let limit = self.inner.lock().config.waiting_limit();
        let _guard = self.enter_waiting(limit)?;
        let max = max.max(1);
        let deadline = Instant::now() + max_wait;

        loop {
            let stream = self.live_stream()?;
            let appended = stream.notified();
            let acked = self.acks.notified();
            tokio::pin!(appended, acked);
            appended.as_mut().enable();
            acked.as_mut().enable();

            let (batch, ack_deadline) = self.collect(&stream, max);
            if !batch.is_empty() || no_wait {
                return Ok(batch);
            }

            tokio::select! {
                () = &mut appended => {},
                () = &mut acked => {},
                () = tokio::time::sleep_until(ack_deadline.unwrap_or(deadline)), if ack_deadline.is_some() => {},
                () = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    /// Gather redeliveries then new messages. Returns the batch and the
    /// nearest remaining ack deadline.
    fn collect(&self, stream: &Stream, max: usize) -> (Vec<Delivery>, Option<Instant>) {
        let now = Instant::now();
        let mut batch = Vec::new();
        let mut settled = Vec::new();
        let mut inner = self.inner.lock();
        let ack_wait = inner.config.ack_wait;
        let deliver_limit = inner.config.deliver_limit();
        let tracks_acks = inner.config.tracks_acks();

        for seq in inner.pending.expired(now) {
            if batch.len() >= max {
                break;
            }
            let Some(entry) = inner.pending.get_mut(seq).copied() else { continue };
            if deliver_limit.is_some_and(|limit| entry.deliveries >= limit) {
                inner.pending.remove(seq);
                inner.num_terminated += 1;
                warn!(
                    stream = %self.stream_name,
                    consumer = %self.name,
                    seq,
                    deliveries = entry.deliveries,
                    "Maximum deliveries exceeded"
                );
                continue;
            }
            let Some(message) = stream.message(seq) else {
                inner.pending.remove(seq);
                continue;
            };
            let deliveries = entry.deliveries + 1;
            if let Some(slot) = inner.pending.get_mut(seq) {
                slot.deliveries = deliveries;
                slot.deadline = now + ack_wait;
            }
            inner.num_redelivered += 1;
            batch.push(self.delivery(message, entry.consumer_seq, deliveries));
        }

        let redelivered = batch.len();
        let filter = inner.config.filter_subject.clone();
        let pending_limit = inner.config.ack_pending_limit();
        while batch.len() < max {
            if tracks_acks && pending_limit.is_some_and(|limit| inner.pending.len() >= limit) {
                break;
            }
            let message = match inner.backlog.pop_front() {
                Some(seq) => match stream.message(seq) {
                    Some(message) => message,
                    None => continue,
                },
                None => match stream.next_matching(inner.cursor, filter.as_deref()) {
                    Some(message) => {
                        inner.cursor = message.sequence + 1;
                        message
                    },
                    None => break,
                },
            };
            let seq = message.sequence;
            inner.delivered = SequenceInfo {
                consumer_seq: inner.delivered.consumer_seq + 1,
                stream_seq: seq,
            };
            let consumer_seq = inner.delivered.consumer_seq;
            if tracks_acks {
                inner.pending.insert(
                    seq,
                    PendingEntry { consumer_seq, deliveries: 1, deadline: now + ack_wait },
                );
            } else {
                settled.push(seq);
            }
            batch.push(self.delivery(message, consumer_seq, 1));
        }

        if !batch.is_empty() {
            let mut remaining = inner.num_pending(stream);
            for delivery in batch[redelivered..].iter_mut().rev() {
                delivery.ack.pending = remaining;
                remaining += 1;
            }
            for delivery in &mut batch[..redelivered] {
                delivery.ack.pending = remaining;
            }
        }
        let ack_deadline = inner.pending.earliest_deadline();
        drop(inner);

        stream.acknowledged(&settled);
        (batch, ack_deadline)
    }

    fn delivery(&self, message: Message, consumer_seq: Sequence, deliveries: u64) -> Delivery {
        let ack = AckSubject {
            stream: self.stream_name.clone(),
            consumer: self.name.clone(),
            deliveries,
            stream_seq: message.sequence,
            consumer_seq,
            timestamp: unix_nanos(&message.timestamp),
            pending: 0,
        };
        Delivery { message, ack }
    }

    /// Settle the delivery of `stream_seq`.
    ///
    /// Unknown or already settled sequences are ignored. Under
    /// [`AckPolicy::All`] an ack also settles everything before it.
    pub fn process_ack(&self, stream_seq: Sequence, kind: AckKind) {
        let mut inner = self.inner.lock();
        let mut settled = Vec::new();
        match kind {
            AckKind::Ack if inner.config.ack_policy == AckPolicy::All => {
                settled = inner.pending.remove_through(stream_seq);
            },
            AckKind::Ack => {
                if inner.pending.remove(stream_seq).is_some() {
                    settled.push(stream_seq);
                }
            },
            AckKind::Term => {
                if inner.pending.remove(stream_seq).is_some() {
                    inner.num_terminated += 1;
                    settled.push(stream_seq);
                }
            },
            AckKind::Nak(delay) => {
                if let Some(entry) = inner.pending.get_mut(stream_seq) {
                    entry.deadline = Instant::now() + delay.unwrap_or_default();
                }
            },
            AckKind::Progress => {
                let ack_wait = inner.config.ack_wait;
                if let Some(entry) = inner.pending.get_mut(stream_seq) {
                    entry.deadline = Instant::now() + ack_wait;
                }
            },
        }
        drop(inner);

        self.acks.notify_waiters();
        if !settled.is_empty() {
            if let Some(stream) = self.stream.upgrade() {
                stream.acknowledged(&settled);
            }
        }
    }

    /// Acknowledge `stream_seq`.
    pub fn ack(&self, stream_seq: Sequence) {
        self.process_ack(stream_seq, AckKind::Ack);
    }

    /// Request redelivery of `stream_seq`, optionally after `delay`.
    pub fn nak(&self, stream_seq: Sequence, delay: Option<Duration>) {
        self.process_ack(stream_seq, AckKind::Nak(delay));
    }

    /// Never redeliver `stream_seq`.
    pub fn term(&self, stream_seq: Sequence) {
        self.process_ack(stream_seq, AckKind::Term);
    }

    /// Restart the ack timer of `stream_seq`.
    pub fn in_progress(&self, stream_seq: Sequence) {
        self.process_ack(stream_seq, AckKind::Progress);
    }
}

fn check_work_queue(stream: &Stream, config: &ConsumerConfig) -> Result<()> {
    if !config.tracks_acks() {
        return Err(Error::invalid_request("work queue consumers must acknowledge"));
    }
    for existing in stream.consumers() {
        if Some(existing.name()) == config.consumer_name() {
            continue;
        }
        let theirs = existing.config().filter_subject;
        let overlap = match (config.filter_subject.as_deref(), theirs.as_deref()) {
            (Some(ours), Some(theirs)) => overlaps(ours, theirs),
            _ => true,
        };
        if overlap {
            return Err(Error::invalid_request(
                "work queue consumers must have non-overlapping filter subjects",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use strata_storage::MemoryStore;

    fn stream(config: StreamConfig) -> Arc<Stream> {
        Stream::new(config.normalize().unwrap(), Box::new(MemoryStore::new()))
    }

    fn publish(stream: &Stream, subject: &str, n: usize) {
        for i in 0..n {
            stream.ingest(Message::new(subject, i.to_string()).unwrap()).unwrap();
        }
    }

    fn seqs(batch: &[Delivery]) -> Vec<Sequence> {
        batch.iter().map(|d| d.ack.stream_seq).collect()
    }

    #[tokio::test]
    async fn test_delivers_in_order() {
        let s = stream(StreamConfig::new("S", ["s.*"]));
        publish(&s, "s.a", 3);
        let c = Consumer::create(&s, ConsumerConfig::durable("c"), None).unwrap();

        let batch = c.next_batch(10, Duration::from_millis(10), true).await.unwrap();
        assert_eq!(seqs(&batch), vec![1, 2, 3]);
        assert_eq!(batch[0].ack.consumer_seq, 1);
        assert_eq!(batch[0].ack.pending, 2);
        assert_eq!(batch[2].ack.pending, 0);
        assert_eq!(c.state().num_ack_pending, 3);
    }

    #[tokio::test]
    async fn test_filtered_pending_follows_stream_changes() {
        let s = stream(StreamConfig { max_msgs: 8, ..StreamConfig::new("S", ["s.*"]) });
        for _ in 0..3 {
            publish(&s, "s.a", 1);
            publish(&s, "s.b", 1);
        }
        let config = ConsumerConfig {
            filter_subject: Some("s.a".to_string()),
            ..ConsumerConfig::durable("c")
        };
        let c = Consumer::create(&s, config, None).unwrap();
        assert_eq!(c.state().num_pending, 3);

        let batch = c.next_batch(1, Duration::ZERO, true).await.unwrap();
        assert_eq!(seqs(&batch), vec![1]);
        assert_eq!(batch[0].ack.pending, 2);
        assert_eq!(c.state().num_pending, 2);

        publish(&s, "s.a", 1);
        publish(&s, "s.b", 1);
        assert_eq!(c.state().num_pending, 3);

        // interior delete above the cursor
        s.delete_message(5).unwrap();
        assert_eq!(c.state().num_pending, 2);

        // head eviction past the cursor drops seq 3
        for _ in 0..2 {
            publish(&s, "s.a", 1);
            publish(&s, "s.b", 1);
        }
        assert_eq!(s.state().first_seq, 4);
        assert_eq!(c.state().num_pending, 3);
        assert_eq!(c.state().num_pending, s.count_matching(2, Some("s.a")));

        let batch = c.next_batch(10, Duration::ZERO, true).await.unwrap();
        assert_eq!(seqs(&batch), vec![7, 9, 11]);
        assert_eq!(c.state().num_pending, 0);
    }

    #[tokio::test]
    async fn test_ack_floor_gap() {
        let s = stream(StreamConfig::new("S", ["s"]));
        publish(&s, "s", 5);
        let c = Consumer::create(&s, ConsumerConfig::durable("c"), None).unwrap();
        c.next_batch(5, Duration::ZERO, true).await.unwrap();

        c.ack(1);
        c.ack(2);
        c.ack(5);
        assert_eq!(c.state().ack_floor, SequenceInfo { consumer_seq: 2, stream_seq: 2 });
        c.ack(3);
        c.ack(4);
        let state = c.state();
        assert_eq!(state.ack_floor, SequenceInfo { consumer_seq: 5, stream_seq: 5 });
        assert_eq!(state.num_ack_pending, 0);
    }

    #[tokio::test]
    async fn test_ack_all_policy() {
        let s = stream(StreamConfig::new("S", ["s"]));
        publish(&s, "s", 4);
        let config = ConsumerConfig { ack_policy: AckPolicy::All, ..ConsumerConfig::durable("c") };
        let c = Consumer::create(&s, config, None).unwrap();
        c.next_batch(4, Duration::ZERO, true).await.unwrap();
        c.ack(3);
        let state = c.state();
        assert_eq!(state.num_ack_pending, 1);
        assert_eq!(state.ack_floor.stream_seq, 3);
    }

    #[tokio::test]
    async fn test_ack_none_settles_on_delivery() {
        let s = stream(StreamConfig::new("S", ["s"]));
        publish(&s, "s", 2);
        let config = ConsumerConfig { ack_policy: AckPolicy::None, ..ConsumerConfig::durable("c") };
        let c = Consumer::create(&s, config, None).unwrap();
        c.next_batch(2, Duration::ZERO, true).await.unwrap();
        let state = c.state();
        assert_eq!(state.num_ack_pending, 0);
        assert_eq!(state.ack_floor.stream_seq, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_after_ack_wait() {
        let s = stream(StreamConfig::new("S", ["s"]));
        publish(&s, "s", 1);
        let config = ConsumerConfig {
            ack_wait: Duration::from_secs(2),
            ..ConsumerConfig::durable("c")
        };
        let c = Consumer::create(&s, config, None).unwrap();

        let first = c.next_batch(1, Duration::from_secs(1), false).await.unwrap();
        assert_eq!(first[0].ack.deliveries, 1);

        // parks until the ack deadline passes, then redelivers
        let again = c.next_batch(1, Duration::from_secs(10), false).await.unwrap();
        assert_eq!(seqs(&again), vec![1]);
        assert_eq!(again[0].ack.deliveries, 2);
        assert_eq!(again[0].ack.consumer_seq, 1);
        assert_eq!(c.state().num_redelivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_deliver_terminates() {
        let s = stream(StreamConfig::new("S", ["s"]));
        publish(&s, "s", 1);
        let config = ConsumerConfig {
            ack_wait: Duration::from_secs(1),
            max_deliver: 2,
            ..ConsumerConfig::durable("c")
        };
        let c = Consumer::create(&s, config, None).unwrap();
        c.next_batch(1, Duration::ZERO, true).await.unwrap();
        c.next_batch(1, Duration::from_secs(5), false).await.unwrap();

        let last = c.next_batch(1, Duration::from_secs(5), false).await.unwrap();
        assert!(last.is_empty());
        let state = c.state();
        assert_eq!(state.num_terminated, 1);
        assert_eq!(state.num_ack_pending, 0);
        assert_eq!(s.state().messages, 1);
    }

    #[tokio::test]
    async fn test_nak_redelivers_immediately() {
        let s = stream(StreamConfig::new("S", ["s"]));
        publish(&s, "s", 1);
        let c = Consumer::create(&s, ConsumerConfig::durable("c"), None).unwrap();
        c.next_batch(1, Duration::ZERO, true).await.unwrap();
        c.nak(1, None);
        let again = c.next_batch(1, Duration::ZERO, true).await.unwrap();
        assert_eq!(again[0].ack.deliveries, 2);
        c.term(1);
        assert_eq!(c.state().num_terminated, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_ack_pending_backpressure() {
        let s = stream(StreamConfig::new("S", ["s"]));
        publish(&s, "s", 5);
        let config = ConsumerConfig { max_ack_pending: 2, ..ConsumerConfig::durable("c") };
        let c = Consumer::create(&s, config, None).unwrap();

        assert_eq!(seqs(&c.next_batch(5, Duration::ZERO, true).await.unwrap()), vec![1, 2]);
        assert!(c.next_batch(5, Duration::ZERO, true).await.unwrap().is_empty());

        c.ack(1);
        assert_eq!(seqs(&c.next_batch(5, Duration::ZERO, true).await.unwrap()), vec![3]);
    }

    #[tokio::test]
    async fn test_pull_wakes_on_publish() {
        let s = stream(StreamConfig::new("S", ["s"]));
        let c = Consumer::create(&s, ConsumerConfig::durable("c"), None).unwrap();
        let puller = {
            let c = Arc::clone(&c);
            tokio::spawn(async move { c.next_batch(1, Duration::from_secs(30), false).await })
        };
        tokio::task::yield_now().await;
        publish(&s, "s", 1);
        let batch = puller.await.unwrap().unwrap();
        assert_eq!(seqs(&batch), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_times_out_empty() {
        let s = stream(StreamConfig::new("S", ["s"]));
        let c = Consumer::create(&s, ConsumerConfig::durable("c"), None).unwrap();
        let batch = c.next_batch(1, Duration::from_secs(1), false).await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(c.state().num_waiting, 0);
    }

    #[tokio::test]
    async fn test_deliver_policies() {
        let s = stream(StreamConfig::new("S", ["s.*"]));
        publish(&s, "s.a", 2);
        publish(&s, "s.b", 2);

        let last = ConsumerConfig { deliver_policy: DeliverPolicy::Last, ..ConsumerConfig::durable("last") };
        let c = Consumer::create(&s, last, None).unwrap();
        assert_eq!(seqs(&c.next_batch(10, Duration::ZERO, true).await.unwrap()), vec![4]);

        let new = ConsumerConfig { deliver_policy: DeliverPolicy::New, ..ConsumerConfig::durable("new") };
        let c = Consumer::create(&s, new, None).unwrap();
        assert!(c.next_batch(10, Duration::ZERO, true).await.unwrap().is_empty());
        publish(&s, "s.a", 1);
        assert_eq!(seqs(&c.next_batch(10, Duration::ZERO, true).await.unwrap()), vec![5]);

        let by_seq = ConsumerConfig {
            deliver_policy: DeliverPolicy::ByStartSequence,
            opt_start_seq: Some(3),
            ..ConsumerConfig::durable("seq")
        };
        let c = Consumer::create(&s, by_seq, None).unwrap();
        assert_eq!(seqs(&c.next_batch(10, Duration::ZERO, true).await.unwrap()), vec![3, 4, 5]);

        let per_subject = ConsumerConfig {
            deliver_policy: DeliverPolicy::LastPerSubject,
            ..ConsumerConfig::durable("lps")
        };
        let c = Consumer::create(&s, per_subject, None).unwrap();
        assert_eq!(seqs(&c.next_batch(10, Duration::ZERO, true).await.unwrap()), vec![4, 5]);
    }

    #[tokio::test]
    async fn test_filter_subject() {
        let s = stream(StreamConfig::new("S", ["s.*"]));
        publish(&s, "s.a", 1);
        publish(&s, "s.b", 1);
        let config = ConsumerConfig {
            filter_subject: Some("s.b".into()),
            ..ConsumerConfig::durable("c")
        };
        let c = Consumer::create(&s, config, None).unwrap();
        assert_eq!(seqs(&c.next_batch(10, Duration::ZERO, true).await.unwrap()), vec![2]);
    }

    #[tokio::test]
    async fn test_work_queue_removes_on_ack() {
        let s = stream(StreamConfig {
            retention: RetentionPolicy::Workqueue,
            ..StreamConfig::new("Q", ["q.*"])
        });
        publish(&s, "q.a", 2);
        let c = Consumer::create(&s, ConsumerConfig::durable("w"), None).unwrap();
        c.next_batch(2, Duration::ZERO, true).await.unwrap();
        c.ack(1);
        assert_eq!(s.state().messages, 1);

        let overlapping = Consumer::create(&s, ConsumerConfig::durable("w2"), None);
        assert!(matches!(overlapping, Err(Error::InvalidRequest { .. })));
        let no_ack = ConsumerConfig {
            ack_policy: AckPolicy::None,
            filter_subject: Some("q.z".into()),
            ..ConsumerConfig::durable("w3")
        };
        assert!(Consumer::create(&s, no_ack, None).is_err());
    }

    #[tokio::test]
    async fn test_interest_waits_for_every_consumer() {
        let s = stream(StreamConfig {
            retention: RetentionPolicy::Interest,
            ..StreamConfig::new("I", ["i"])
        });
        let a = Consumer::create(&s, ConsumerConfig::durable("a"), None).unwrap();
        let b = Consumer::create(&s, ConsumerConfig::durable("b"), None).unwrap();
        publish(&s, "i", 1);

        a.next_batch(1, Duration::ZERO, true).await.unwrap();
        b.next_batch(1, Duration::ZERO, true).await.unwrap();
        a.ack(1);
        assert_eq!(s.state().messages, 1);
        b.ack(1);
        assert_eq!(s.state().messages, 0);
    }

    #[tokio::test]
    async fn test_max_waiting() {
        let s = stream(StreamConfig::new("S", ["s"]));
        let config = ConsumerConfig { max_waiting: 1, ..ConsumerConfig::durable("c") };
        let c = Consumer::create(&s, config, None).unwrap();
        let parked = {
            let c = Arc::clone(&c);
            tokio::spawn(async move { c.next_batch(1, Duration::from_secs(30), false).await })
        };
        while c.state().num_waiting == 0 {
            tokio::task::yield_now().await;
        }
        let rejected = c.next_batch(1, Duration::ZERO, true).await;
        assert!(matches!(rejected, Err(Error::ResourceLimit { .. })));
        parked.abort();
    }

    #[tokio::test]
    async fn test_duplicate_and_generated_names() {
        let s = stream(StreamConfig::new("S", ["s"]));
        Consumer::create(&s, ConsumerConfig::durable("c"), None).unwrap();
        assert!(matches!(
            Consumer::create(&s, ConsumerConfig::durable("c"), None),
            Err(Error::AlreadyExists { .. })
        ));
        let owner = ConnectionId::new();
        let eph = Consumer::create(&s, ConsumerConfig::default(), Some(owner)).unwrap();
        assert!(eph.is_ephemeral());
        assert_eq!(eph.owner(), Some(owner));
        assert_eq!(eph.name().len(), 12);
    }

    #[tokio::test]
    async fn test_deleted_stream_fails_pull() {
        let s = stream(StreamConfig::new("S", ["s"]));
        let c = Consumer::create(&s, ConsumerConfig::durable("c"), None).unwrap();
        s.delete().unwrap();
        assert!(matches!(
            c.next_batch(1, Duration::ZERO, true).await,
            Err(Error::NotFound { .. })
        ));
    }
}
