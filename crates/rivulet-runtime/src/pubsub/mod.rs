//! In-process topic broker shared by all running pipelines.
//!
//! Publishers register the topics they write to; subscribers attach either
//! to a literal topic or to a wildcard pattern (see [`crate::pattern`]).
//! Pattern subscribers are attached to every matching topic that exists at
//! subscribe time and to every matching topic registered later.
//!
//! Delivery never blocks the publisher: each subscriber owns a bounded
//! queue and a message that does not fit is dropped for that subscriber.
//!
//! ```rust
//! use rivulet_core::Record;
//! use rivulet_runtime::pubsub::{Broker, Message, SubscriberId};
//!
//! # tokio_test_block(async {
//! let broker = Broker::default();
//! let mut sub = broker
//!     .subscribe(SubscriberId::operator("rule1", "src", 0), "sensors/+/temp", 16)
//!     .unwrap();
//! broker.register_publisher("sensors/d1/temp");
//! broker.publish("sensors/d1/temp", Record::new().with_field("v", 21.5).into_shared());
//! assert!(matches!(sub.recv().await, Some(Message::Record(_))));
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

mod subscription;

pub use subscription::{Message, SharedFault, SubscriberId, Subscription};

use crate::metrics::Metrics;
use crate::pattern::{PatternError, TopicPattern};
use rivulet_core::SharedRecord;
use rustc_hash::FxHashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, trace, warn};

/// Per-topic registration: publisher reference count plus attached queues.
#[derive(Default)]
struct TopicEntry {
    publishers: usize,
    consumers: FxHashMap<SubscriberId, mpsc::Sender<Message>>,
}

impl TopicEntry {
    fn is_unused(&self) -> bool {
        self.publishers == 0 && self.consumers.is_empty()
    }
}

struct PatternEntry {
    pattern: TopicPattern,
    tx: mpsc::Sender<Message>,
}

#[derive(Default)]
struct BrokerState {
    topics: FxHashMap<String, TopicEntry>,
    patterns: FxHashMap<SubscriberId, PatternEntry>,
    /// (subscriber, topic or pattern) -> number of pending stale unsubscribes
    replaced: FxHashMap<(SubscriberId, String), usize>,
}

impl BrokerState {
    /// Get the entry for `topic`, creating it and attaching every matching
    /// pattern subscriber if it does not exist yet.
    fn ensure_topic(&mut self, topic: &str) -> &mut TopicEntry {
        let patterns = &self.patterns;
        self.topics.entry(topic.to_string()).or_insert_with(|| {
            let mut entry = TopicEntry::default();
            for (id, p) in patterns {
                if p.pattern.matches(topic) {
                    debug!(
                        "Attaching pattern subscriber {} ({}) to topic {}",
                        id, p.pattern, topic
                    );
                    entry.consumers.insert(id.clone(), p.tx.clone());
                }
            }
            entry
        })
    }

    /// Remove the registration of `topic` if nothing references it.
    /// Returns whether it was removed.
    fn remove_if_unused(&mut self, topic: &str) -> bool {
        if self.topics.get(topic).is_some_and(TopicEntry::is_unused) {
            self.topics.remove(topic);
            debug!("Removed registration for topic {}", topic);
            true
        } else {
            false
        }
    }
}

/// Topic-addressed publish/subscribe broker.
///
/// All registry mutation happens under one lock held only for bookkeeping;
/// publishing takes the read side and never waits on a subscriber.
pub struct Broker {
    state: RwLock<BrokerState>,
    metrics: Metrics,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(Metrics::new())
    }
}

impl Broker {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            state: RwLock::new(BrokerState::default()),
            metrics,
        }
    }

    /// Take a publisher reference on `topic`, creating its registration if
    /// needed. Pattern subscriptions created earlier are attached on creation.
    pub fn register_publisher(&self, topic: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let entry = state.ensure_topic(topic);
        entry.publishers += 1;
        debug!(
            "Registered publisher on topic {} (publishers: {})",
            topic, entry.publishers
        );
    }

    /// Drop a publisher reference; the registration goes away once it has
    /// neither publishers nor subscribers.
    pub fn unregister_publisher(&self, topic: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        match state.topics.get_mut(topic) {
            Some(entry) if entry.publishers > 0 => {
                entry.publishers -= 1;
                debug!(
                    "Unregistered publisher on topic {} (publishers: {})",
                    topic, entry.publishers
                );
            }
            _ => {
                warn!("Unregister publisher for topic {} without registration", topic);
                return;
            }
        }
        if state.remove_if_unused(topic) {
            self.metrics.forget_topic(topic);
        }
    }

    /// Subscribe `id` to a literal topic or a wildcard pattern.
    ///
    /// A malformed pattern fails before anything is registered. Subscribing
    /// again with an id that is already attached replaces the previous
    /// queue; the previous holder's later `unsubscribe` is then absorbed.
    pub fn subscribe(
        &self,
        id: SubscriberId,
        topic: &str,
        capacity: usize,
    ) -> Result<Subscription, PatternError> {
        let pattern = if TopicPattern::is_wildcard(topic) {
            Some(TopicPattern::compile(topic)?)
        } else {
            None
        };

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

        // topic string the replaced holder will later unsubscribe with
        let replaced: Option<String> = match pattern {
            Some(pattern) => {
                let previous = state.patterns.insert(
                    id.clone(),
                    PatternEntry {
                        pattern: pattern.clone(),
                        tx: tx.clone(),
                    },
                );
                let mut detached = Vec::new();
                if let Some(previous) = &previous {
                    // detach the old queue everywhere before re-attaching
                    for (name, entry) in state.topics.iter_mut() {
                        if entry
                            .consumers
                            .get(&id)
                            .is_some_and(|c| c.same_channel(&previous.tx))
                        {
                            entry.consumers.remove(&id);
                            detached.push(name.clone());
                        }
                    }
                }
                for (name, entry) in state.topics.iter_mut() {
                    if pattern.matches(name) {
                        entry.consumers.insert(id.clone(), tx.clone());
                    }
                }
                for name in detached {
                    if state.remove_if_unused(&name) {
                        self.metrics.forget_topic(&name);
                    }
                }
                previous.map(|p| p.pattern.as_str().to_string())
            }
            None => state
                .ensure_topic(topic)
                .consumers
                .insert(id.clone(), tx)
                .map(|_| topic.to_string()),
        };

        self.metrics.active_subscriptions.inc();
        if let Some(stale) = replaced {
            warn!(
                "Subscriber {} already attached to {}, replacing its queue with one on {}",
                id, stale, topic
            );
            *state.replaced.entry((id.clone(), stale)).or_insert(0) += 1;
            self.metrics.active_subscriptions.dec();
        } else {
            info!("Subscriber {} attached to {}", id, topic);
        }

        Ok(Subscription::new(id, topic.to_string(), rx))
    }

    /// Detach `id` from `topic` (or from every topic, when `topic` is the
    /// pattern it subscribed with) and close its queue.
    pub fn unsubscribe(&self, id: &SubscriberId, topic: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

        let key = (id.clone(), topic.to_string());
        if let Some(pending) = state.replaced.get_mut(&key) {
            *pending -= 1;
            if *pending == 0 {
                state.replaced.remove(&key);
            }
            warn!(
                "Stale unsubscribe of {} from {} after replacement, keeping the newer queue",
                id, topic
            );
            return;
        }

        let is_pattern = state
            .patterns
            .get(id)
            .is_some_and(|p| p.pattern.as_str() == topic);

        let removed = if is_pattern {
            state.patterns.remove(id);
            let mut emptied = Vec::new();
            for (name, entry) in state.topics.iter_mut() {
                if entry.consumers.remove(id).is_some() && entry.is_unused() {
                    emptied.push(name.clone());
                }
            }
            for name in emptied {
                if state.remove_if_unused(&name) {
                    self.metrics.forget_topic(&name);
                }
            }
            true
        } else {
            let removed = state
                .topics
                .get_mut(topic)
                .and_then(|entry| entry.consumers.remove(id))
                .is_some();
            if state.remove_if_unused(topic) {
                self.metrics.forget_topic(topic);
            }
            removed
        };

        if removed {
            self.metrics.active_subscriptions.dec();
            info!("Subscriber {} detached from {}", id, topic);
        } else {
            debug!("Unsubscribe of {} from {}: not attached", id, topic);
        }
    }

    /// Broadcast one record to every current subscriber of `topic`.
    pub fn publish(&self, topic: &str, record: SharedRecord) {
        self.fan_out(topic, Message::Record(record));
    }

    /// Broadcast a list of records as a single message.
    pub fn publish_batch(&self, topic: &str, records: Vec<SharedRecord>) {
        if records.is_empty() {
            return;
        }
        self.fan_out(topic, Message::Batch(records.into()));
    }

    /// Broadcast a fault so consumers see it inline with the data.
    pub fn publish_error<E>(&self, topic: &str, err: E)
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.fan_out(topic, Message::Error(Arc::new(err)));
    }

    fn fan_out(&self, topic: &str, msg: Message) {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = state.topics.get(topic) else {
            return;
        };
        self.metrics.published_total.with_label_values(&[topic]).inc();

        for (id, tx) in &entry.consumers {
            match tx.try_send(msg.clone()) {
                Ok(()) => trace!("Broadcast on topic {} to {} done", topic, id),
                Err(TrySendError::Full(_)) => {
                    self.metrics.dropped_total.with_label_values(&[topic]).inc();
                    warn!("Topic {} dropped message to {}: queue full", topic, id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Topic {} skipped {}: receiver gone", topic, id);
                }
            }
        }
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let mut topics: Vec<String> = state.topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.topics.contains_key(topic)
    }

    pub fn publisher_count(&self, topic: &str) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.topics.get(topic).map_or(0, |e| e.publishers)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.topics.get(topic).map_or(0, |e| e.consumers.len())
    }

    /// Number of live pattern subscriptions.
    pub fn pattern_count(&self) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.patterns.len()
    }
}
