//! Rivulet Runtime - shared substrate of rivulet pipelines
//!
//! This crate provides the components that running rules share:
//! an in-process topic broker with MQTT-style wildcards, lookup tables fed
//! from broker topics, reference-counted external connections and
//! checkpointed operator state.

pub mod config;
pub mod connector;
pub mod lookup;
pub mod metrics;
pub mod pattern;
pub mod persistence;
pub mod pubsub;
pub mod runtime;

pub use config::{BrokerConfig, ConfigError, RuntimeConfig};
pub use connector::{
    Connection, ConnectionFactory, ConnectionManager, ConnectorCatalog, ConnectorError, Selector,
};
pub use lookup::{Table, TableStore};
pub use metrics::Metrics;
pub use pattern::{PatternError, TopicPattern};
pub use pubsub::{Broker, Message, SubscriberId, Subscription};
pub use runtime::{Runtime, RuntimeError};

// Persistence exports (always available, RocksDB backend requires "persistence" feature)
#[cfg(feature = "persistence")]
pub use persistence::RocksDbKv;
pub use persistence::{
    create_store, CheckpointCoordinator, CheckpointStore, KvCheckpointStore,
    MemoryCheckpointStore, OperatorState, Qos, StateConfig, StoreError,
};
