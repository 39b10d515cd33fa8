//! Process-wide assembly of the shared components

use crate::config::{ConfigError, RuntimeConfig};
use crate::connector::{ConnectionManager, MemoryConnectionFactory, MEMORY_CONNECTOR};
use crate::lookup::TableStore;
use crate::metrics::Metrics;
use crate::persistence::{
    create_store_with, open_backend, CheckpointStore, KvBackend, Qos, StoreError, StoreOptions,
};
use crate::pubsub::Broker;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// The shared substrate of all pipelines in one process: the broker, the
/// lookup tables fed from it, the shared connections and the state
/// backend. Build one at start-up and hand it to pipelines by `Arc`.
pub struct Runtime {
    config: RuntimeConfig,
    metrics: Metrics,
    broker: Arc<Broker>,
    tables: TableStore,
    connections: ConnectionManager,
    state_backend: Arc<dyn KvBackend>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self, StoreError> {
        let metrics = Metrics::new();
        let broker = Arc::new(Broker::new(metrics.clone()));
        let tables = TableStore::with_capacity(
            broker.clone(),
            metrics.clone(),
            config.broker.feeder_capacity,
        );
        let connections = ConnectionManager::new(config.connections.clone(), metrics.clone());
        connections.register(
            MEMORY_CONNECTOR,
            Arc::new(MemoryConnectionFactory::new(
                broker.clone(),
                config.broker.default_queue_capacity,
            )),
        );
        let state_backend = open_backend(&config.state)?;

        info!(
            "Runtime started ({:?} state backend, {} configured connections)",
            config.state.backend,
            config.connections.len()
        );
        Ok(Self {
            config,
            metrics,
            broker,
            tables,
            connections,
            state_backend,
        })
    }

    /// Load the configuration file at `path` and build the runtime.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let config = RuntimeConfig::load(path)?;
        Ok(Self::new(config)?)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn tables(&self) -> &TableStore {
        &self.tables
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Queue capacity for subscribers that do not choose their own.
    pub fn default_queue_capacity(&self) -> usize {
        self.config.broker.default_queue_capacity
    }

    /// Checkpoint store of `rule_id` for the rule's delivery guarantee.
    /// Durable stores share the runtime's backend and restore whatever a
    /// previous run of the rule left behind.
    pub fn state_store(
        &self,
        rule_id: &str,
        qos: Qos,
    ) -> Result<Arc<dyn CheckpointStore>, StoreError> {
        let options =
            StoreOptions::from_config(&self.config.state).with_metrics(self.metrics.clone());
        create_store_with(rule_id, qos, self.state_backend.clone(), options)
    }

    /// Close all shared connections and flush the state backend.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        self.connections.shutdown().await;
        self.state_backend.flush()?;
        info!("Runtime stopped");
        Ok(())
    }
}

/// Failure to build a [`Runtime`] from a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
