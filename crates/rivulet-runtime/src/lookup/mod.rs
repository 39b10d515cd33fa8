//! Shared lookup tables.
//!
//! A lookup table caches every record published on a topic, indexed by a
//! fixed list of key fields. Rules that declare the same (topic, keys) pair
//! share one table and one feeder task; the feeder is started by the first
//! `acquire` and stopped by the last `release`.

mod table;

pub use table::{composite_key, Table};

use crate::metrics::Metrics;
use crate::pattern::PatternError;
use crate::pubsub::{Broker, Message, SubscriberId, Subscription};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default queue capacity of a feeder subscription.
pub const DEFAULT_FEEDER_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TableKey {
    topic: String,
    keys: Vec<String>,
}

struct Feeder {
    subscriber: SubscriberId,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct TableEntry {
    table: Arc<Table>,
    refs: usize,
    feeder: Feeder,
}

/// Registry of shared lookup tables.
///
/// `acquire` and `release` must be called from within a Tokio runtime; the
/// feeder of a new table is spawned on the current runtime.
pub struct TableStore {
    broker: Arc<Broker>,
    tables: Mutex<FxHashMap<TableKey, TableEntry>>,
    generation: AtomicU64,
    feeder_capacity: usize,
    metrics: Metrics,
}

impl TableStore {
    pub fn new(broker: Arc<Broker>, metrics: Metrics) -> Self {
        Self::with_capacity(broker, metrics, DEFAULT_FEEDER_CAPACITY)
    }

    pub fn with_capacity(broker: Arc<Broker>, metrics: Metrics, feeder_capacity: usize) -> Self {
        Self {
            broker,
            tables: Mutex::new(FxHashMap::default()),
            generation: AtomicU64::new(0),
            feeder_capacity: feeder_capacity.max(1),
            metrics,
        }
    }

    /// Get the table for `(topic, keys)`, creating it and starting its
    /// feeder if none exists. Returns the table and whether it was created
    /// by this call.
    ///
    /// An invalid `topic` pattern fails without registering anything.
    pub fn acquire(&self, topic: &str, keys: &[&str]) -> Result<(Arc<Table>, bool), PatternError> {
        let key = TableKey {
            topic: topic.to_string(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
        };

        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = tables.get_mut(&key) {
            entry.refs += 1;
            debug!(
                "Lookup table {} {:?} acquired, {} references",
                topic, keys, entry.refs
            );
            return Ok((entry.table.clone(), false));
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let subscriber = SubscriberId::system(format!(
            "$$table_{}_{}_{}",
            topic,
            keys.join(","),
            generation
        ));
        let subscription = self
            .broker
            .subscribe(subscriber.clone(), topic, self.feeder_capacity)?;

        let table = Arc::new(Table::new(topic, key.keys.clone()));
        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(feed(table.clone(), subscription, cancel_rx));

        tables.insert(
            key,
            TableEntry {
                table: table.clone(),
                refs: 1,
                feeder: Feeder {
                    subscriber,
                    cancel,
                    task,
                },
            },
        );
        self.metrics.lookup_tables.inc();
        info!("Lookup table {} {:?} created", topic, keys);

        Ok((table, true))
    }

    /// Drop one reference to `(topic, keys)`. The last release unsubscribes
    /// the feeder, stops it and forgets the table. Returns false when no
    /// such table is registered.
    pub fn release(&self, topic: &str, keys: &[&str]) -> bool {
        let key = TableKey {
            topic: topic.to_string(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
        };

        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = tables.get_mut(&key) else {
            warn!("Release of unknown lookup table {} {:?}", topic, keys);
            return false;
        };

        entry.refs -= 1;
        if entry.refs > 0 {
            debug!(
                "Lookup table {} {:?} released, {} references left",
                topic, keys, entry.refs
            );
            return true;
        }

        if let Some(entry) = tables.remove(&key) {
            self.stop_feeder(topic, entry.feeder);
            self.metrics.lookup_tables.dec();
            info!("Lookup table {} {:?} dropped", topic, keys);
        }
        true
    }

    /// Reference count of `(topic, keys)`, zero when absent.
    pub fn ref_count(&self, topic: &str, keys: &[&str]) -> usize {
        let key = TableKey {
            topic: topic.to_string(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
        };
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.get(&key).map_or(0, |e| e.refs)
    }

    pub fn table_count(&self) -> usize {
        self.tables.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn stop_feeder(&self, topic: &str, feeder: Feeder) {
        self.broker.unsubscribe(&feeder.subscriber, topic);
        // the receiver may already be gone if the feeder ended on its own
        let _ = feeder.cancel.send(true);
        drop(feeder.task);
    }
}

impl Drop for TableStore {
    fn drop(&mut self) {
        let tables = std::mem::take(self.tables.get_mut().unwrap_or_else(|e| e.into_inner()));
        for (key, entry) in tables {
            self.stop_feeder(&key.topic, entry.feeder);
            self.metrics.lookup_tables.dec();
        }
    }
}

async fn feed(table: Arc<Table>, mut subscription: Subscription, mut cancel: watch::Receiver<bool>) {
    debug!("Feeder {} started", subscription.id());
    while let Some(msg) = subscription.recv_until(&mut cancel).await {
        match msg {
            Message::Record(record) => table.insert(record),
            Message::Batch(records) => {
                for record in records.iter() {
                    table.insert(record.clone());
                }
            }
            Message::Error(e) => {
                warn!("Lookup table {} received error: {}", table.topic(), e);
            }
        }
    }
    debug!("Feeder {} stopped", subscription.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivulet_core::{Record, Value};
    use std::time::Duration;

    fn store() -> (Arc<Broker>, TableStore) {
        let metrics = Metrics::new();
        let broker = Arc::new(Broker::new(metrics.clone()));
        (broker.clone(), TableStore::new(broker, metrics))
    }

    async fn wait_for_len(table: &Table, len: usize) {
        for _ in 0..200 {
            if table.len() >= len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("table never reached {} rows (has {})", len, table.len());
    }

    #[tokio::test]
    async fn test_acquire_shares_table() {
        let (broker, store) = store();

        let (t1, created1) = store.acquire("dim", &["id"]).unwrap();
        let (t2, created2) = store.acquire("dim", &["id"]).unwrap();
        assert!(created1);
        assert!(!created2);
        assert!(Arc::ptr_eq(&t1, &t2));
        assert_eq!(store.ref_count("dim", &["id"]), 2);
        assert_eq!(broker.subscriber_count("dim"), 1);

        // different key set is a different table
        let (t3, created3) = store.acquire("dim", &["name"]).unwrap();
        assert!(created3);
        assert!(!Arc::ptr_eq(&t1, &t3));
        assert_eq!(store.table_count(), 2);
    }

    #[tokio::test]
    async fn test_feeder_fills_table() {
        let (broker, store) = store();
        let (table, _) = store.acquire("dim", &["id"]).unwrap();

        broker.register_publisher("dim");
        broker.publish("dim", Record::new().with_field("id", 1i64).with_field("n", "a").into_shared());
        broker.publish_batch(
            "dim",
            vec![
                Record::new().with_field("id", 2i64).into_shared(),
                Record::new().with_field("id", 1i64).with_field("n", "b").into_shared(),
            ],
        );
        broker.publish_error("dim", std::io::Error::other("upstream"));

        wait_for_len(&table, 3).await;
        let hits = table.read(&["id"], &[Value::Int(1)]);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].get_str("n"), Some("a"));
        assert_eq!(hits[1].get_str("n"), Some("b"));
    }

    #[tokio::test]
    async fn test_last_release_unsubscribes() {
        let (broker, store) = store();
        store.acquire("dim", &["id"]).unwrap();
        store.acquire("dim", &["id"]).unwrap();

        assert!(store.release("dim", &["id"]));
        assert_eq!(broker.subscriber_count("dim"), 1);
        assert!(store.release("dim", &["id"]));
        assert_eq!(broker.subscriber_count("dim"), 0);
        assert!(!broker.has_topic("dim"));
        assert_eq!(store.table_count(), 0);

        assert!(!store.release("dim", &["id"]));
    }

    #[tokio::test]
    async fn test_invalid_pattern_registers_nothing() {
        let (broker, store) = store();
        assert!(store.acquire("a/#/b", &["id"]).is_err());
        assert_eq!(store.table_count(), 0);
        assert!(broker.topics().is_empty());
    }

    #[tokio::test]
    async fn test_reacquire_after_release_starts_fresh() {
        let (broker, store) = store();
        let (first, _) = store.acquire("dim", &["id"]).unwrap();
        broker.register_publisher("dim");
        broker.publish("dim", Record::new().with_field("id", 1i64).into_shared());
        wait_for_len(&first, 1).await;

        store.release("dim", &["id"]);
        let (second, created) = store.acquire("dim", &["id"]).unwrap();
        assert!(created);
        assert!(second.is_empty());
    }
}
