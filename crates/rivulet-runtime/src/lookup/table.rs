//! Keyed in-memory table fed from a broker topic.

use rivulet_core::{SharedRecord, Value};
use rustc_hash::FxHashMap;
use std::fmt::Write as _;
use std::sync::RwLock;
use tracing::debug;

/// Build the canonical composite key for a sequence of key values.
///
/// Each part is length-prefixed so that no choice of values can collide
/// with another. Values render through `Display`, which quotes and escapes
/// strings at any depth, so `Int(1)` and `Float(1.0)` produce the same key
/// while distinct arrays and maps never do.
pub fn composite_key<'a>(values: impl IntoIterator<Item = &'a Value>) -> String {
    let mut key = String::new();
    for value in values {
        let part = value.to_string();
        // writing into a String cannot fail
        let _ = write!(key, "{}:{}|", part.len(), part);
    }
    key
}

/// An in-memory table indexed by a fixed, ordered set of key fields.
///
/// Every inserted record is appended to the bucket of its composite key;
/// duplicates are retained in insertion order. Exactly one feeder writes,
/// any number of lookup operators read concurrently.
pub struct Table {
    topic: String,
    key_fields: Vec<String>,
    rows: RwLock<FxHashMap<String, Vec<SharedRecord>>>,
}

impl Table {
    pub fn new(topic: impl Into<String>, key_fields: Vec<String>) -> Self {
        Self {
            topic: topic.into(),
            key_fields,
            rows: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn key_fields(&self) -> &[String] {
        &self.key_fields
    }

    /// Append `record` to the bucket of its key. Missing key fields index
    /// as `null`.
    pub fn insert(&self, record: SharedRecord) {
        let key = composite_key(
            self.key_fields
                .iter()
                .map(|f| record.get(f).unwrap_or(&Value::Null)),
        );
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        rows.entry(key).or_default().push(record);
    }

    /// Point lookup. `key_fields` must name exactly the table's key set
    /// (in any order) with `key_values` in the same order; anything else,
    /// and any key without rows, yields an empty result.
    pub fn read(&self, key_fields: &[&str], key_values: &[Value]) -> Vec<SharedRecord> {
        if key_fields.len() != key_values.len() || key_fields.len() != self.key_fields.len() {
            debug!(
                "Lookup on table {} with keys {:?} does not match key set {:?}",
                self.topic, key_fields, self.key_fields
            );
            return Vec::new();
        }

        let mut ordered = Vec::with_capacity(self.key_fields.len());
        for field in &self.key_fields {
            match key_fields.iter().position(|k| *k == field.as_str()) {
                Some(i) => ordered.push(&key_values[i]),
                None => {
                    debug!(
                        "Lookup on table {} misses key field {}",
                        self.topic, field
                    );
                    return Vec::new();
                }
            }
        }

        let key = composite_key(ordered);
        let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
        rows.get(&key).cloned().unwrap_or_default()
    }

    /// Total number of stored records.
    pub fn len(&self) -> usize {
        let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
        rows.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
