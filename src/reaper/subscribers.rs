//! Subscriber bookkeeping and non-blocking fan-out.
//!
//! Subscription changes are queued by callers and applied by the reaper at
//! the start of a tick, so the live registry never contends with producers.
//! Delivery uses `try_send` only: a full queue counts as a failure, and a
//! subscriber that fails `eviction_threshold` deliveries in a row is removed
//! and its sender dropped, which closes the consumer's receiver.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

/// Names one registered queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A queued registry mutation.
pub enum SubscriptionChange<T> {
    Subscribe(SubscriptionId, mpsc::Sender<Arc<T>>),
    Unsubscribe(SubscriptionId),
}

struct Subscriber<T> {
    queue: mpsc::Sender<Arc<T>>,
    failures: u32,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
    pub evicted: usize,
    pub disconnected: usize,
}

/// Live set of subscribers for one snapshot kind.
///
/// A subscriber is its queue: subscribing an already registered channel
/// again makes the new id an alias of the existing registration, and either
/// id unsubscribes it.
pub struct SubscriberRegistry<T> {
    kind: &'static str,
    subscribers: HashMap<SubscriptionId, Subscriber<T>>,
    aliases: HashMap<SubscriptionId, SubscriptionId>,
    eviction_threshold: u32,
}

impl<T> SubscriberRegistry<T> {
    /// `kind` labels log lines, e.g. `"raw"` or `"processed"`.
    pub fn new(kind: &'static str, eviction_threshold: u32) -> Self {
        Self {
            kind,
            subscribers: HashMap::new(),
            aliases: HashMap::new(),
            eviction_threshold,
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Whether `id`, or the registration it aliases, is live.
    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.subscribers.contains_key(&self.resolve(id))
    }

    fn resolve(&self, id: SubscriptionId) -> SubscriptionId {
        self.aliases.get(&id).copied().unwrap_or(id)
    }

    /// Applies one change. Subscribing a channel that is already registered
    /// keeps the existing registration and aliases the new id to it.
    pub fn apply(&mut self, change: SubscriptionChange<T>) {
        match change {
            SubscriptionChange::Subscribe(id, queue) => {
                let existing = self
                    .subscribers
                    .iter()
                    .find(|(_, existing)| existing.queue.same_channel(&queue))
                    .map(|(&primary, _)| primary);
                if let Some(primary) = existing {
                    tracing::debug!(
                        kind = self.kind,
                        subscription = %id,
                        existing = %primary,
                        "Queue already subscribed"
                    );
                    self.aliases.insert(id, primary);
                    return;
                }
                tracing::debug!(kind = self.kind, subscription = %id, "Subscriber added");
                self.subscribers.insert(id, Subscriber { queue, failures: 0 });
            }
            SubscriptionChange::Unsubscribe(id) => {
                let primary = self.resolve(id);
                if self.subscribers.remove(&primary).is_some() {
                    tracing::debug!(kind = self.kind, subscription = %id, "Subscriber removed");
                }
                self.aliases.retain(|_, target| *target != primary);
            }
        }
    }

    /// Applies every queued change without waiting. Returns how many were
    /// applied.
    pub fn drain(&mut self, requests: &mut mpsc::Receiver<SubscriptionChange<T>>) -> usize {
        let mut applied = 0;
        loop {
            match requests.try_recv() {
                Ok(change) => {
                    self.apply(change);
                    applied += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return applied,
            }
        }
    }

    /// Offers `snapshot` to every subscriber without blocking.
    pub fn broadcast(&mut self, snapshot: &Arc<T>) -> BroadcastReport {
        let kind = self.kind;
        let threshold = self.eviction_threshold;
        let mut report = BroadcastReport::default();

        self.subscribers
            .retain(|id, subscriber| match subscriber.queue.try_send(Arc::clone(snapshot)) {
                Ok(()) => {
                    subscriber.failures = 0;
                    report.delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    subscriber.failures += 1;
                    report.dropped += 1;
                    if subscriber.failures >= threshold {
                        tracing::error!(
                            kind = kind,
                            subscription = %id,
                            failures = subscriber.failures,
                            "Subscriber dropped metrics too many times in a row, closing its queue"
                        );
                        report.evicted += 1;
                        false
                    } else {
                        tracing::warn!(
                            kind = kind,
                            subscription = %id,
                            failures = subscriber.failures,
                            "Subscriber queue is full, dropping metrics rather than blocking"
                        );
                        true
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(kind = kind, subscription = %id, "Subscriber went away");
                    report.disconnected += 1;
                    false
                }
            });

        if report.evicted + report.disconnected > 0 {
            let subscribers = &self.subscribers;
            self.aliases.retain(|_, primary| subscribers.contains_key(primary));
        }
        report
    }
}
