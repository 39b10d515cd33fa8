//! Connectors and shared connections
//!
//! Rules refer to external systems through selectors such as `mqtt.local`.
//! The [`ConnectionManager`] resolves a selector against the configured
//! [`ConnectorCatalog`], creates the physical connection through the
//! [`ConnectionFactory`] registered for its type, and shares it between all
//! rules holding the selector.
//!
//! # Architecture
//!
//! ```text
//! rule A ──acquire("mqtt.local")──┐
//!                                 ├──> ConnectionManager ──> one Connection
//! rule B ──acquire("mqtt.local")──┘        (refcount 2)
//! ```
//!
//! # Available Connectors
//!
//! | Connector | Type | Description |
//! |-----------|------|-------------|
//! | `MemorySource`/`MemorySink` | `memory` | In-process topic broker |
//!
//! # Example
//!
//! ```rust
//! use rivulet_runtime::connector::{
//!     ConnectionManager, ConnectorCatalog, MemoryConnection, MemoryConnectionFactory,
//! };
//! use rivulet_runtime::pubsub::Broker;
//! use rivulet_runtime::Metrics;
//! use std::sync::Arc;
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let broker = Arc::new(Broker::default());
//! let catalog = ConnectorCatalog::new().with("memory", "edge", Default::default());
//! let manager = ConnectionManager::new(catalog, Metrics::new());
//! manager.register("memory", Arc::new(MemoryConnectionFactory::new(broker, 64)));
//!
//! let conn = manager.acquire("memory.edge").await.unwrap();
//! let memory = conn.as_any().downcast_ref::<MemoryConnection>().unwrap();
//! let _sink = memory.sink("alerts", "alerts/high");
//! manager.release("memory.edge").await.unwrap();
//! # });
//! ```

mod catalog;
mod managed;
mod managed_registry;
mod memory;
mod types;

pub use catalog::{ConnectionProps, ConnectorCatalog, Selector};
pub use managed::{Connection, ConnectionFactory};
pub use managed_registry::{ConnectionManager, ConnectionStatus};
pub use memory::{
    MemoryConnection, MemoryConnectionFactory, MemorySink, MemorySource, MEMORY_CONNECTOR,
};
pub use types::{ConnectorError, SinkConnector, SourceConnector};
