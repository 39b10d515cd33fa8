//! Records flowing between pipeline nodes

use crate::value::Value;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Type alias for IndexMap with FxBuildHasher for faster hashing of record fields.
pub type FxIndexMap<K, V> = IndexMap<K, V, FxBuildHasher>;

/// A shared reference to a Record.
///
/// Fan-out hands the same allocation to every subscriber instead of
/// deep-cloning the payload per consumer.
pub type SharedRecord = Arc<Record>;

/// Metadata key holding the concrete topic a record was published on.
pub const TOPIC_META: &str = "topic";

/// One tuple of a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Event time of the record (defaults to creation time)
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Payload fields in insertion order
    pub data: FxIndexMap<String, Value>,
    /// Transport metadata (topic, source offsets, ...)
    #[serde(default)]
    pub meta: FxIndexMap<String, Value>,
}

impl Default for Record {
    fn default() -> Self {
        Self::new()
    }
}

impl Record {
    pub fn new() -> Self {
        Self {
            timestamp: Utc::now(),
            data: IndexMap::with_hasher(FxBuildHasher),
            meta: IndexMap::with_hasher(FxBuildHasher),
        }
    }

    /// Creates a record from a pre-built field map.
    pub fn from_fields(data: FxIndexMap<String, Value>) -> Self {
        Self {
            timestamp: Utc::now(),
            data,
            meta: IndexMap::with_hasher(FxBuildHasher),
        }
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = ts;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.data.get(key).and_then(|v| v.as_int())
    }

    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.data.get(key).and_then(|v| v.as_float())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// The topic this record was delivered from, if stamped.
    pub fn topic(&self) -> Option<&str> {
        self.meta.get(TOPIC_META).and_then(|v| v.as_str())
    }

    pub fn into_shared(self) -> SharedRecord {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_getters() {
        let r = Record::new()
            .with_field("id", 7i64)
            .with_field("temp", 21.5)
            .with_field("zone", "north")
            .with_meta(TOPIC_META, "h/d1/s1");

        assert_eq!(r.get_int("id"), Some(7));
        assert_eq!(r.get_float("temp"), Some(21.5));
        assert_eq!(r.get_str("zone"), Some("north"));
        assert_eq!(r.topic(), Some("h/d1/s1"));
        assert_eq!(r.get("missing"), None);
    }

    #[test]
    fn test_field_order_preserved() {
        let r = Record::new()
            .with_field("b", 1i64)
            .with_field("a", 2i64)
            .with_field("c", 3i64);
        let keys: Vec<&str> = r.data.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_json_without_meta_defaults() {
        let r: Record =
            serde_json::from_str(r#"{"timestamp":"2024-01-01T00:00:00Z","data":{"a":1}}"#)
                .unwrap();
        assert_eq!(r.get_int("a"), Some(1));
        assert!(r.meta.is_empty());
        assert_eq!(r.topic(), None);
    }
}
