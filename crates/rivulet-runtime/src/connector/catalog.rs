//! Connection selectors and the configured connection catalog

use super::types::ConnectorError;
use indexmap::IndexMap;
use rivulet_core::{FxIndexMap, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Properties of one configured connection.
pub type ConnectionProps = FxIndexMap<String, Value>;

/// A `type.key` reference to a configured connection, e.g. `mqtt.local`.
///
/// The selector is split at the first `.`, so keys may themselves contain
/// dots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Selector {
    raw: String,
    split: usize,
}

impl Selector {
    pub fn parse(selector: &str) -> Result<Self, ConnectorError> {
        match selector.find('.') {
            Some(split) if split > 0 && split + 1 < selector.len() => Ok(Self {
                raw: selector.to_string(),
                split,
            }),
            _ => Err(ConnectorError::InvalidSelector(selector.to_string())),
        }
    }

    pub fn connector_type(&self) -> &str {
        &self.raw[..self.split]
    }

    pub fn key(&self) -> &str {
        &self.raw[self.split + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for Selector {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Configured connections, grouped by connector type then key.
///
/// Deserializes from the `connections` section of the runtime
/// configuration:
///
/// ```yaml
/// connections:
///   mqtt:
///     local:
///       server: tcp://127.0.0.1:1883
///       qos: 1
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectorCatalog {
    types: IndexMap<String, IndexMap<String, ConnectionProps>>,
}

impl ConnectorCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, connector_type: &str, key: &str, props: ConnectionProps) -> Self {
        self.insert(connector_type, key, props);
        self
    }

    /// Define or replace the properties of `connector_type.key`.
    pub fn insert(&mut self, connector_type: &str, key: &str, props: ConnectionProps) {
        self.types
            .entry(connector_type.to_string())
            .or_default()
            .insert(key.to_string(), props);
    }

    pub fn get(&self, selector: &Selector) -> Option<&ConnectionProps> {
        self.types
            .get(selector.connector_type())
            .and_then(|keys| keys.get(selector.key()))
    }

    pub fn remove(&mut self, selector: &Selector) -> Option<ConnectionProps> {
        let keys = self.types.get_mut(selector.connector_type())?;
        let removed = keys.shift_remove(selector.key());
        if keys.is_empty() {
            self.types.shift_remove(selector.connector_type());
        }
        removed
    }

    /// All configured selectors in declaration order.
    pub fn selectors(&self) -> Vec<String> {
        self.types
            .iter()
            .flat_map(|(ty, keys)| keys.keys().map(move |k| format!("{}.{}", ty, k)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.types.values().map(IndexMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
