//! Prometheus metrics for the rivulet runtime

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics shared by the broker, lookup store, connection manager and
/// checkpoint stores of one runtime.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    pub published_total: IntCounterVec,
    pub dropped_total: IntCounterVec,
    pub active_subscriptions: IntGauge,
    pub lookup_tables: IntGauge,
    pub shared_connections: IntGauge,
    pub checkpoints_committed: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let published_total = IntCounterVec::new(
            Opts::new("rivulet_broker_published_total", "Messages published per topic"),
            &["topic"],
        )
        .expect("failed to create published_total counter");

        let dropped_total = IntCounterVec::new(
            Opts::new(
                "rivulet_broker_dropped_total",
                "Deliveries dropped because a subscriber queue was full",
            ),
            &["topic"],
        )
        .expect("failed to create dropped_total counter");

        let active_subscriptions = IntGauge::new(
            "rivulet_broker_subscriptions",
            "Number of live broker subscriptions",
        )
        .expect("failed to create active_subscriptions gauge");

        let lookup_tables = IntGauge::new("rivulet_lookup_tables", "Number of live lookup tables")
            .expect("failed to create lookup_tables gauge");

        let shared_connections = IntGauge::new(
            "rivulet_shared_connections",
            "Number of live shared physical connections",
        )
        .expect("failed to create shared_connections gauge");

        let checkpoints_committed = IntCounterVec::new(
            Opts::new(
                "rivulet_checkpoints_committed_total",
                "Checkpoints committed per rule",
            ),
            &["rule"],
        )
        .expect("failed to create checkpoints_committed counter");

        registry
            .register(Box::new(published_total.clone()))
            .expect("failed to register published_total");
        registry
            .register(Box::new(dropped_total.clone()))
            .expect("failed to register dropped_total");
        registry
            .register(Box::new(active_subscriptions.clone()))
            .expect("failed to register active_subscriptions");
        registry
            .register(Box::new(lookup_tables.clone()))
            .expect("failed to register lookup_tables");
        registry
            .register(Box::new(shared_connections.clone()))
            .expect("failed to register shared_connections");
        registry
            .register(Box::new(checkpoints_committed.clone()))
            .expect("failed to register checkpoints_committed");

        Self {
            registry: Arc::new(registry),
            published_total,
            dropped_total,
            active_subscriptions,
            lookup_tables,
            shared_connections,
            checkpoints_committed,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Drop the per-topic series of a topic whose registration is gone, so
    /// label cardinality follows the live topics.
    pub fn forget_topic(&self, topic: &str) {
        // absent when nothing was ever published on the topic
        let _ = self.published_total.remove_label_values(&[topic]);
        let _ = self.dropped_total.remove_label_values(&[topic]);
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
