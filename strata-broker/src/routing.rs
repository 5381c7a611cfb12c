//! Subject routing.
//!
//! Subscriptions live in a token trie: a publish on `a.b.c` visits the
//! literal branch, the `*` branch and the `>` branch at each level, so the
//! cost of a lookup follows the subject depth rather than the number of
//! subscriptions. Queue groups are resolved at lookup time by picking one
//! member per group in round-robin order.

use crate::network::connection::Connection;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use strata_core::{subject::tokens, ConnectionId, Message};
use tracing::trace;

/// Subscriptions selected for one publish.
pub type Targets = SmallVec<[Arc<Subscription>; 8]>;

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

/// Outcome of claiming a delivery slot on a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    /// Deliver; more may follow
    Deliver,
    /// Deliver; this was the last one allowed
    Last,
    /// Auto-unsubscribe limit already reached
    Exhausted,
}

/// A client's interest in a subject pattern.
pub struct Subscription {
    id: u64,
    sid: String,
    subject: String,
    queue_group: Option<String>,
    client: Arc<Connection>,
    delivered: AtomicU64,
    max_msgs: AtomicU64,
}

impl Subscription {
    /// Create a subscription owned by `client`.
    #[must_use]
    pub fn new(
        client: Arc<Connection>,
        sid: impl Into<String>,
        subject: impl Into<String>,
        queue_group: Option<String>,
    ) -> Self {
        Self {
            id: NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed),
            sid: sid.into(),
            subject: subject.into(),
            queue_group,
            client,
            delivered: AtomicU64::new(0),
            max_msgs: AtomicU64::new(0),
        }
    }

    /// Server-wide unique id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Client-chosen subscription id.
    #[must_use]
    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Subject pattern.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Queue group, if any.
    #[must_use]
    pub fn queue_group(&self) -> Option<&str> {
        self.queue_group.as_deref()
    }

    /// Owning connection.
    #[must_use]
    pub const fn client(&self) -> &Arc<Connection> {
        &self.client
    }

    /// Messages delivered so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }

    /// Limit deliveries to `max` in total. Returns `true` when that many
    /// were already delivered and the subscription should go now.
    pub fn set_max_msgs(&self, max: u64) -> bool {
        self.max_msgs.store(max, Ordering::Release);
        max > 0 && self.delivered() >= max
    }

    pub(crate) fn claim(&self) -> Claim {
        let max = self.max_msgs.load(Ordering::Acquire);
        if max == 0 {
            self.delivered.fetch_add(1, Ordering::AcqRel);
            return Claim::Deliver;
        }
        match self.delivered.fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
            (d < max).then_some(d + 1)
        }) {
            Ok(previous) if previous + 1 == max => Claim::Last,
            Ok(_) => Claim::Deliver,
            Err(_) => Claim::Exhausted,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the client holds this subscription, so print only its id
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("sid", &self.sid)
            .field("subject", &self.subject)
            .field("queue_group", &self.queue_group)
            .field("client", &self.client.id())
            .field("delivered", &self.delivered())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Node {
    children: HashMap<String, Node>,
    subscriptions: Vec<Arc<Subscription>>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.subscriptions.is_empty()
    }

    fn collect(&self, tokens: &[&str], out: &mut Targets) {
        let Some((head, rest)) = tokens.split_first() else {
            out.extend(self.subscriptions.iter().cloned());
            return;
        };
        // a wildcard token in the looked-up subject only meets the wildcard branches
        if !matches!(*head, "*" | ">") {
            if let Some(node) = self.children.get(*head) {
                node.collect(rest, out);
            }
        }
        if let Some(node) = self.children.get("*") {
            node.collect(rest, out);
        }
        if let Some(node) = self.children.get(">") {
            out.extend(node.subscriptions.iter().cloned());
        }
    }

    fn remove(&mut self, tokens: &[&str], id: u64) -> bool {
        let Some((head, rest)) = tokens.split_first() else {
            let before = self.subscriptions.len();
            self.subscriptions.retain(|s| s.id != id);
            return self.subscriptions.len() < before;
        };
        let Some(child) = self.children.get_mut(*head) else { return false };
        let removed = child.remove(rest, id);
        if child.is_empty() {
            self.children.remove(*head);
        }
        removed
    }
}

/// Token trie of every live subscription on the server.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    root: RwLock<Node>,
    count: AtomicUsize,
    cursor: AtomicUsize,
}

impl SubscriptionIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription. The pattern must already be validated.
    pub fn insert(&self, subscription: Arc<Subscription>) {
        let mut root = self.root.write();
        let mut node = &mut *root;
        for token in tokens(subscription.subject()) {
            node = node.children.entry(token.to_string()).or_default();
        }
        node.subscriptions.push(subscription);
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn remove(&self, subscription: &Subscription) -> bool {
        let path: Vec<&str> = tokens(subscription.subject()).collect();
        let removed = self.root.write().remove(&path, subscription.id);
        if removed {
            self.count.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Whether the index holds no subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every subscription whose pattern matches `subject`.
    #[must_use]
    pub fn matching(&self, subject: &str) -> Targets {
        let path: SmallVec<[&str; 8]> = tokens(subject).collect();
        let mut out = Targets::new();
        self.root.read().collect(&path, &mut out);
        out
    }

    /// Matching subscriptions with each queue group narrowed to one member.
    #[must_use]
    pub fn select(&self, subject: &str) -> Targets {
        let matched = self.matching(subject);
        if matched.iter().all(|s| s.queue_group.is_none()) {
            return matched;
        }

        let mut targets = Targets::new();
        let mut groups: SmallVec<[(&str, SmallVec<[&Arc<Subscription>; 4]>); 2]> =
            SmallVec::new();
        for subscription in &matched {
            match subscription.queue_group() {
                None => targets.push(Arc::clone(subscription)),
                Some(group) => match groups.iter_mut().find(|(name, _)| *name == group) {
                    Some((_, members)) => members.push(subscription),
                    None => groups.push((group, SmallVec::from_elem(subscription, 1))),
                },
            }
        }
        for (_, members) in groups {
            let pick = self.cursor.fetch_add(1, Ordering::Relaxed) % members.len();
            targets.push(Arc::clone(members[pick]));
        }
        targets
    }

    /// Deliver `message` to the subscriptions of `subject`.
    ///
    /// `subject` is usually the message's own subject; pull deliveries and
    /// API responses use the requester's inbox instead while the frame keeps
    /// the original subject. Publishes from `skip` are not echoed back to it.
    /// Returns the number of frames queued.
    pub fn route(&self, subject: &str, message: &Message, skip: Option<ConnectionId>) -> usize {
        let mut delivered = 0;
        for subscription in self.select(subject) {
            if skip.is_some_and(|id| subscription.client.id() == id) {
                continue;
            }
            let claim = subscription.claim();
            if claim == Claim::Exhausted {
                continue;
            }
            if subscription.client.deliver(subscription.sid(), message) {
                delivered += 1;
            }
            if claim == Claim::Last {
                self.remove(&subscription);
                subscription.client.forget(subscription.sid(), subscription.id());
                trace!(sid = subscription.sid(), "Auto-unsubscribe limit reached");
            }
        }
        delivered
    }
}
