//! Subscriber identities, delivered messages and receive handles

use rivulet_core::SharedRecord;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// A fault forwarded inline through a topic.
pub type SharedFault = Arc<dyn std::error::Error + Send + Sync>;

/// What a subscriber receives from its queue.
#[derive(Debug, Clone)]
pub enum Message {
    /// One record
    Record(SharedRecord),
    /// A list of records published together, occupying one queue slot
    Batch(Arc<[SharedRecord]>),
    /// An error published on the topic by an upstream node
    Error(SharedFault),
}

impl Message {
    /// Number of records carried (errors carry none).
    pub fn record_count(&self) -> usize {
        match self {
            Message::Record(_) => 1,
            Message::Batch(records) => records.len(),
            Message::Error(_) => 0,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Message::Error(_))
    }
}

/// Identity of a subscriber: one operator instance of one rule, or an
/// internal consumer such as a lookup table feeder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(String);

impl SubscriberId {
    /// Id of an operator instance inside a rule.
    pub fn operator(rule_id: &str, op_id: &str, instance: u32) -> Self {
        Self(format!("{}_{}_{}", rule_id, op_id, instance))
    }

    /// Free-form id for internal consumers.
    pub fn system(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Receive end of a broker subscription.
///
/// The queue is closed when the subscriber is unsubscribed (or replaced by
/// a newer subscription with the same id), at which point `recv` returns
/// `None` once buffered messages are drained.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    topic: String,
    rx: mpsc::Receiver<Message>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriberId, topic: String, rx: mpsc::Receiver<Message>) -> Self {
        Self { id, topic, rx }
    }

    pub fn id(&self) -> &SubscriberId {
        &self.id
    }

    /// Topic or pattern this subscription was created with.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Receive the next message, or `None` when the queue closes or the
    /// cancellation signal flips to `true`. A dropped signal sender counts
    /// as cancellation.
    pub async fn recv_until(&mut self, cancel: &mut watch::Receiver<bool>) -> Option<Message> {
        loop {
            if *cancel.borrow_and_update() {
                return None;
            }
            tokio::select! {
                biased;

                changed = cancel.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                msg = self.rx.recv() => return msg,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Number of messages waiting in the queue.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
