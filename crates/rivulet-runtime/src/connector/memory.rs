//! In-process connectors backed by the topic broker
//!
//! [`MemorySink`] publishes pipeline output on a broker topic and
//! [`MemorySource`] feeds a pipeline from a topic or pattern, which is how
//! one rule consumes the results of another. [`MemoryConnectionFactory`]
//! exposes both through the connection manager under the `memory` type.

use super::catalog::{ConnectionProps, Selector};
use super::managed::{Connection, ConnectionFactory};
use super::types::{ConnectorError, SinkConnector, SourceConnector};
use crate::pattern::TopicPattern;
use crate::pubsub::{Broker, Message, SubscriberId, Subscription};
use async_trait::async_trait;
use rivulet_core::{Record, Value, TOPIC_META};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Connector type name of the in-process bus.
pub const MEMORY_CONNECTOR: &str = "memory";

/// Sink that publishes records on a broker topic.
pub struct MemorySink {
    name: String,
    broker: Arc<Broker>,
    topic: String,
    connected: AtomicBool,
}

impl MemorySink {
    pub fn new(name: &str, broker: Arc<Broker>, topic: &str) -> Self {
        Self {
            name: name.to_string(),
            broker,
            topic: topic.to_string(),
            connected: AtomicBool::new(false),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn stamp(&self, record: &Record) -> Record {
        let mut record = record.clone();
        record
            .meta
            .insert(TOPIC_META.to_string(), Value::Str(self.topic.clone()));
        record
    }
}

#[async_trait]
impl SinkConnector for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self) -> Result<(), ConnectorError> {
        if TopicPattern::is_wildcard(&self.topic) {
            return Err(ConnectorError::ConfigError(format!(
                "cannot publish to wildcard topic '{}'",
                self.topic
            )));
        }
        if !self.connected.swap(true, Ordering::AcqRel) {
            self.broker.register_publisher(&self.topic);
        }
        Ok(())
    }

    async fn send(&self, record: &Record) -> Result<(), ConnectorError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(ConnectorError::NotConnected);
        }
        self.broker.publish(&self.topic, self.stamp(record).into_shared());
        Ok(())
    }

    async fn send_batch(&self, records: &[Record]) -> Result<(), ConnectorError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(ConnectorError::NotConnected);
        }
        let shared = records.iter().map(|r| self.stamp(r).into_shared()).collect();
        self.broker.publish_batch(&self.topic, shared);
        Ok(())
    }

    async fn flush(&self) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.broker.unregister_publisher(&self.topic);
        }
        Ok(())
    }
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        if *self.connected.get_mut() {
            self.broker.unregister_publisher(&self.topic);
        }
    }
}

/// Source that forwards broker messages from a topic or pattern into a
/// pipeline channel.
///
/// The forwarding task ends on [`stop`](SourceConnector::stop), on the
/// pipeline cancellation signal, when the pipeline channel closes or when
/// the subscription is closed, and always unsubscribes before it exits.
pub struct MemorySource {
    name: String,
    broker: Arc<Broker>,
    id: SubscriberId,
    topic: String,
    capacity: usize,
    cancel: Option<watch::Receiver<bool>>,
    stop: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl MemorySource {
    pub fn new(
        name: &str,
        broker: Arc<Broker>,
        id: SubscriberId,
        topic: &str,
        capacity: usize,
    ) -> Self {
        Self {
            name: name.to_string(),
            broker,
            id,
            topic: topic.to_string(),
            capacity,
            cancel: None,
            stop: None,
            task: None,
        }
    }

    /// Tie the forwarding task to a pipeline cancellation signal.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl SourceConnector for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self, tx: mpsc::Sender<Message>) -> Result<(), ConnectorError> {
        if self.is_running() {
            warn!("Memory source {} already running", self.name);
            return Ok(());
        }

        let subscription = self
            .broker
            .subscribe(self.id.clone(), &self.topic, self.capacity)?;
        let (stop_tx, stop_rx) = watch::channel(false);
        self.stop = Some(stop_tx);
        self.task = Some(tokio::spawn(forward(
            self.broker.clone(),
            subscription,
            tx,
            stop_rx,
            self.cancel.clone(),
        )));
        debug!("Memory source {} started on {}", self.name, self.topic);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ConnectorError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| ConnectorError::ReceiveFailed(format!("source task failed: {}", e)))?;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

/// Resolves once the flag is true or its sender is gone.
async fn flipped(flag: &mut watch::Receiver<bool>) {
    while !*flag.borrow_and_update() {
        if flag.changed().await.is_err() {
            return;
        }
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>, cancel: &mut Option<watch::Receiver<bool>>) {
    match cancel {
        Some(cancel) => {
            tokio::select! {
                _ = flipped(stop) => {}
                _ = flipped(cancel) => {}
            }
        }
        None => flipped(stop).await,
    }
}

async fn forward(
    broker: Arc<Broker>,
    mut subscription: Subscription,
    tx: mpsc::Sender<Message>,
    mut stop: watch::Receiver<bool>,
    mut cancel: Option<watch::Receiver<bool>>,
) {
    loop {
        let msg = tokio::select! {
            biased;

            _ = stopped(&mut stop, &mut cancel) => break,
            msg = subscription.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        trace!(
            "Memory source {} forwarding {} records",
            subscription.id(),
            msg.record_count()
        );

        tokio::select! {
            biased;

            _ = stopped(&mut stop, &mut cancel) => break,
            sent = tx.send(msg) => {
                if sent.is_err() {
                    debug!("Pipeline channel of {} closed", subscription.id());
                    break;
                }
            }
        }
    }

    broker.unsubscribe(subscription.id(), subscription.topic());
    debug!("Memory source {} stopped", subscription.id());
}

/// A shared handle on the in-process bus, optionally scoped under a topic
/// prefix.
pub struct MemoryConnection {
    selector: Selector,
    broker: Arc<Broker>,
    prefix: Option<String>,
    capacity: usize,
}

impl MemoryConnection {
    /// Resolve `topic` under this connection's prefix.
    pub fn topic(&self, topic: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, topic),
            None => topic.to_string(),
        }
    }

    pub fn source(&self, name: &str, id: SubscriberId, topic: &str) -> MemorySource {
        MemorySource::new(name, self.broker.clone(), id, &self.topic(topic), self.capacity)
    }

    pub fn sink(&self, name: &str, topic: &str) -> MemorySink {
        MemorySink::new(name, self.broker.clone(), &self.topic(topic))
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn selector(&self) -> &Selector {
        &self.selector
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        debug!("Memory connection {} closed", self.selector);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Factory for [`MemoryConnection`]s.
///
/// Properties: `prefix` (string without wildcards) and `capacity`
/// (positive integer, subscriber queue size for sources).
pub struct MemoryConnectionFactory {
    broker: Arc<Broker>,
    default_capacity: usize,
}

impl MemoryConnectionFactory {
    pub fn new(broker: Arc<Broker>, default_capacity: usize) -> Self {
        Self {
            broker,
            default_capacity,
        }
    }
}

#[async_trait]
impl ConnectionFactory for MemoryConnectionFactory {
    fn validate(&self, props: &ConnectionProps) -> Result<(), ConnectorError> {
        if let Some(prefix) = props.get("prefix") {
            match prefix.as_str() {
                Some(p) if !p.is_empty() && !TopicPattern::is_wildcard(p) => {}
                _ => {
                    return Err(ConnectorError::ConfigError(format!(
                        "prefix must be a non-empty topic without wildcards, got {}",
                        prefix
                    )))
                }
            }
        }
        if let Some(capacity) = props.get("capacity") {
            match capacity.as_int() {
                Some(c) if c > 0 => {}
                _ => {
                    return Err(ConnectorError::ConfigError(format!(
                        "capacity must be a positive integer, got {}",
                        capacity
                    )))
                }
            }
        }
        Ok(())
    }

    async fn connect(
        &self,
        selector: &Selector,
        props: &ConnectionProps,
    ) -> Result<Arc<dyn Connection>, ConnectorError> {
        let capacity = props
            .get("capacity")
            .and_then(Value::as_int)
            .and_then(|c| usize::try_from(c).ok())
            .unwrap_or(self.default_capacity);
        Ok(Arc::new(MemoryConnection {
            selector: selector.clone(),
            broker: self.broker.clone(),
            prefix: props
                .get("prefix")
                .and_then(Value::as_str)
                .map(|p| p.trim_end_matches('/').to_string()),
            capacity,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use std::time::Duration;

    fn broker() -> Arc<Broker> {
        Arc::new(Broker::new(Metrics::new()))
    }

    #[tokio::test]
    async fn test_sink_to_source() {
        let broker = broker();
        let mut source = MemorySource::new(
            "src",
            broker.clone(),
            SubscriberId::operator("r2", "src", 0),
            "out/+",
            8,
        );
        let (tx, mut rx) = mpsc::channel(8);
        source.start(tx).await.unwrap();
        assert!(source.is_running());

        let mut sink = MemorySink::new("sink", broker.clone(), "out/r1");
        assert!(matches!(
            sink.send(&Record::new()).await,
            Err(ConnectorError::NotConnected)
        ));
        sink.connect().await.unwrap();
        sink.send(&Record::new().with_field("v", 1i64)).await.unwrap();

        let Some(Message::Record(record)) = rx.recv().await else {
            panic!("expected a record");
        };
        assert_eq!(record.get_int("v"), Some(1));
        assert_eq!(record.topic(), Some("out/r1"));

        source.stop().await.unwrap();
        assert!(!source.is_running());
        assert_eq!(broker.pattern_count(), 0);

        sink.close().await.unwrap();
        assert!(!broker.has_topic("out/r1"));
    }

    #[tokio::test]
    async fn test_sink_batch_is_one_message() {
        let broker = broker();
        let mut sub = broker
            .subscribe(SubscriberId::system("watcher"), "t", 4)
            .unwrap();
        let mut sink = MemorySink::new("sink", broker.clone(), "t");
        sink.connect().await.unwrap();
        sink.send_batch(&[Record::new(), Record::new()]).await.unwrap();

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.record_count(), 2);
    }

    #[tokio::test]
    async fn test_sink_rejects_wildcard_topic() {
        let mut sink = MemorySink::new("sink", broker(), "a/+");
        assert!(matches!(
            sink.connect().await,
            Err(ConnectorError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_source_cancellation_unsubscribes() {
        let broker = broker();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut source = MemorySource::new(
            "src",
            broker.clone(),
            SubscriberId::operator("r", "src", 0),
            "in",
            8,
        )
        .with_cancel(cancel_rx);
        let (tx, _rx) = mpsc::channel(8);
        source.start(tx).await.unwrap();
        assert_eq!(broker.subscriber_count("in"), 1);

        cancel_tx.send(true).unwrap();
        for _ in 0..200 {
            if !broker.has_topic("in") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!broker.has_topic("in"));
        source.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_source_invalid_pattern() {
        let mut source = MemorySource::new(
            "src",
            broker(),
            SubscriberId::system("s"),
            "a/#/b",
            8,
        );
        let (tx, _rx) = mpsc::channel(8);
        assert!(matches!(
            source.start(tx).await,
            Err(ConnectorError::Pattern(_))
        ));
        assert!(!source.is_running());
    }

    #[tokio::test]
    async fn test_memory_connection_prefix() {
        let broker = broker();
        let factory = MemoryConnectionFactory::new(broker.clone(), 16);
        let mut props = ConnectionProps::default();
        props.insert("prefix".into(), Value::from("edge/"));
        factory.validate(&props).unwrap();

        let selector = Selector::parse("memory.edge").unwrap();
        let conn = factory.connect(&selector, &props).await.unwrap();
        let memory = conn.as_any().downcast_ref::<MemoryConnection>().unwrap();
        assert_eq!(memory.topic("temp"), "edge/temp");
        assert_eq!(memory.sink("s", "temp").topic(), "edge/temp");
    }

    #[test]
    fn test_memory_factory_validation() {
        let factory = MemoryConnectionFactory::new(broker(), 16);
        let mut props = ConnectionProps::default();
        props.insert("prefix".into(), Value::from("a/#"));
        assert!(factory.validate(&props).is_err());

        let mut props = ConnectionProps::default();
        props.insert("capacity".into(), Value::Int(0));
        assert!(factory.validate(&props).is_err());
    }
}
