//! Shared connection registry: one physical connection per selector
//!
//! Every rule that refers to `mqtt.local` shares one connection. The first
//! `acquire` connects, later ones bump a reference count, and the last
//! `release` closes. The registry lock only guards bookkeeping; physical
//! connect and close run with the lock released, so a slow broker never
//! stalls acquires of unrelated selectors.

use super::catalog::{ConnectionProps, ConnectorCatalog, Selector};
use super::managed::{Connection, ConnectionFactory};
use super::types::ConnectorError;
use crate::metrics::Metrics;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Observable state of one selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// First acquirer is connecting; others wait.
    Connecting,
    Connected { refs: usize },
    /// Last releaser is closing; acquirers wait for it to finish.
    Closing,
}

enum SlotState {
    Connecting,
    Ready(Arc<dyn Connection>),
    Closing,
}

struct Slot {
    state: SlotState,
    refs: usize,
    /// Bumped when the slot becomes ready; dropped with the slot. Either
    /// event wakes waiting acquirers.
    epoch: watch::Sender<()>,
}

impl Slot {
    fn status(&self) -> ConnectionStatus {
        match self.state {
            SlotState::Connecting => ConnectionStatus::Connecting,
            SlotState::Ready(_) => ConnectionStatus::Connected { refs: self.refs },
            SlotState::Closing => ConnectionStatus::Closing,
        }
    }
}

enum Step {
    Ready(Arc<dyn Connection>),
    Wait(watch::Receiver<()>),
    Connect(Arc<dyn ConnectionFactory>, ConnectionProps),
}

/// Removes a slot left in a transient state when the future driving the
/// connect or close is dropped or fails.
struct SlotGuard<'a> {
    manager: &'a ConnectionManager,
    selector: &'a Selector,
    armed: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut slots = self.manager.slots.lock().unwrap_or_else(|e| e.into_inner());
            if slots
                .get(self.selector)
                .is_some_and(|s| !matches!(s.state, SlotState::Ready(_)))
            {
                slots.remove(self.selector);
            }
        }
    }
}

/// Reference-counted registry of shared connections.
pub struct ConnectionManager {
    factories: RwLock<FxHashMap<String, Arc<dyn ConnectionFactory>>>,
    catalog: RwLock<ConnectorCatalog>,
    slots: Mutex<FxHashMap<Selector, Slot>>,
    metrics: Metrics,
}

impl ConnectionManager {
    pub fn new(catalog: ConnectorCatalog, metrics: Metrics) -> Self {
        Self {
            factories: RwLock::new(FxHashMap::default()),
            catalog: RwLock::new(catalog),
            slots: Mutex::new(FxHashMap::default()),
            metrics,
        }
    }

    /// Associate `connector_type` with its factory, replacing any previous
    /// one. Live connections are unaffected.
    pub fn register(&self, connector_type: &str, factory: Arc<dyn ConnectionFactory>) {
        let mut factories = self.factories.write().unwrap_or_else(|e| e.into_inner());
        if factories.insert(connector_type.to_string(), factory).is_some() {
            warn!("Connection factory for type {} replaced", connector_type);
        } else {
            debug!("Connection factory for type {} registered", connector_type);
        }
    }

    /// Define or replace the properties of a selector. Applies to the next
    /// physical connect, not to a live connection.
    pub fn define(&self, selector: &str, props: ConnectionProps) -> Result<(), ConnectorError> {
        let selector = Selector::parse(selector)?;
        let mut catalog = self.catalog.write().unwrap_or_else(|e| e.into_inner());
        catalog.insert(selector.connector_type(), selector.key(), props);
        Ok(())
    }

    /// Snapshot of the configured connections.
    pub fn catalog(&self) -> ConnectorCatalog {
        self.catalog.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Get the shared connection for `selector`, connecting if needed.
    ///
    /// Concurrent acquirers of a selector that is connecting or closing
    /// wait for that to finish. Configuration, validation and connect
    /// failures leave nothing registered.
    pub async fn acquire(&self, selector: &str) -> Result<Arc<dyn Connection>, ConnectorError> {
        let selector = Selector::parse(selector)?;
        loop {
            match self.begin_acquire(&selector)? {
                Step::Ready(conn) => return Ok(conn),
                Step::Wait(mut epoch) => {
                    // an error means the slot went away; retry either way
                    let _ = epoch.changed().await;
                }
                Step::Connect(factory, props) => {
                    return self.connect(&selector, factory, props).await;
                }
            }
        }
    }

    fn begin_acquire(&self, selector: &Selector) -> Result<Step, ConnectorError> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(slot) = slots.get_mut(selector) {
            return Ok(match &slot.state {
                SlotState::Ready(conn) => {
                    slot.refs += 1;
                    debug!(
                        "Connection {} acquired, {} references",
                        selector, slot.refs
                    );
                    Step::Ready(conn.clone())
                }
                SlotState::Connecting | SlotState::Closing => Step::Wait(slot.epoch.subscribe()),
            });
        }

        let factory = self
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(selector.connector_type())
            .cloned()
            .ok_or_else(|| ConnectorError::UnknownType(selector.connector_type().to_string()))?;
        let props = self
            .catalog
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(selector)
            .cloned()
            .ok_or_else(|| ConnectorError::UnknownConnection(selector.to_string()))?;

        let (epoch, _) = watch::channel(());
        slots.insert(
            selector.clone(),
            Slot {
                state: SlotState::Connecting,
                refs: 0,
                epoch,
            },
        );
        Ok(Step::Connect(factory, props))
    }

    async fn connect(
        &self,
        selector: &Selector,
        factory: Arc<dyn ConnectionFactory>,
        props: ConnectionProps,
    ) -> Result<Arc<dyn Connection>, ConnectorError> {
        let mut guard = SlotGuard {
            manager: self,
            selector,
            armed: true,
        };

        factory.validate(&props)?;
        let conn = factory.connect(selector, &props).await.map_err(|e| {
            warn!("Connection {} failed: {}", selector, e);
            e
        })?;

        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let Some(slot) = slots.get_mut(selector) else {
            // only this future removes a connecting slot
            return Err(ConnectorError::ConnectionFailed(format!(
                "registration for {} vanished while connecting",
                selector
            )));
        };
        slot.state = SlotState::Ready(conn.clone());
        slot.refs = 1;
        slot.epoch.send_replace(());
        guard.armed = false;
        drop(slots);

        self.metrics.shared_connections.inc();
        info!("Connection {} established", selector);
        Ok(conn)
    }

    /// Drop one reference to `selector`. The last release closes the
    /// physical connection and forgets it, even if the close fails.
    pub async fn release(&self, selector: &str) -> Result<(), ConnectorError> {
        let selector = Selector::parse(selector)?;

        let conn = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let slot = slots
                .get_mut(&selector)
                .ok_or_else(|| ConnectorError::NotAcquired(selector.to_string()))?;
            let SlotState::Ready(conn) = &slot.state else {
                return Err(ConnectorError::NotAcquired(selector.to_string()));
            };
            let conn = conn.clone();

            slot.refs -= 1;
            if slot.refs > 0 {
                debug!(
                    "Connection {} released, {} references left",
                    selector, slot.refs
                );
                return Ok(());
            }
            slot.state = SlotState::Closing;
            conn
        };

        // removes the closing slot and wakes waiters on every exit path
        let _guard = SlotGuard {
            manager: self,
            selector: &selector,
            armed: true,
        };
        self.metrics.shared_connections.dec();

        match conn.close().await {
            Ok(()) => {
                info!("Connection {} closed", selector);
                Ok(())
            }
            Err(e) => {
                error!("Error closing connection {}: {}", selector, e);
                Err(e)
            }
        }
    }

    /// Health check of an acquired connection.
    pub async fn ping(&self, selector: &str) -> Result<(), ConnectorError> {
        let selector = Selector::parse(selector)?;
        let conn = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            match slots.get(&selector).map(|s| &s.state) {
                Some(SlotState::Ready(conn)) => conn.clone(),
                _ => return Err(ConnectorError::NotAcquired(selector.to_string())),
            }
        };
        conn.ping().await
    }

    pub fn status_of(&self, selector: &str) -> Option<ConnectionStatus> {
        let selector = Selector::parse(selector).ok()?;
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(&selector).map(Slot::status)
    }

    /// State of every registered selector, sorted by selector.
    pub fn status(&self) -> Vec<(String, ConnectionStatus)> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = slots
            .iter()
            .map(|(sel, slot)| (sel.to_string(), slot.status()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Close every live connection regardless of its reference count.
    /// Intended for process teardown.
    pub async fn shutdown(&self) {
        let live: Vec<(Selector, Arc<dyn Connection>)> = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots
                .iter_mut()
                .filter_map(|(sel, slot)| {
                    let conn = match &slot.state {
                        SlotState::Ready(conn) => conn.clone(),
                        _ => return None,
                    };
                    slot.state = SlotState::Closing;
                    Some((sel.clone(), conn))
                })
                .collect()
        };

        for (selector, conn) in live {
            let _guard = SlotGuard {
                manager: self,
                selector: &selector,
                armed: true,
            };
            self.metrics.shared_connections.dec();
            if let Err(e) = conn.close().await {
                error!("Error closing connection {}: {}", selector, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        connects: AtomicUsize,
        closes: AtomicUsize,
    }

    struct TestConn {
        selector: Selector,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl Connection for TestConn {
        fn selector(&self) -> &Selector {
            &self.selector
        }

        async fn close(&self) -> Result<(), ConnectorError> {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct TestFactory {
        counters: Arc<Counters>,
        fail: bool,
    }

    #[async_trait]
    impl ConnectionFactory for TestFactory {
        fn validate(&self, props: &ConnectionProps) -> Result<(), ConnectorError> {
            if props.contains_key("invalid") {
                return Err(ConnectorError::ConfigError("invalid property".into()));
            }
            Ok(())
        }

        async fn connect(
            &self,
            selector: &Selector,
            _props: &ConnectionProps,
        ) -> Result<Arc<dyn Connection>, ConnectorError> {
            self.counters.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ConnectorError::ConnectionFailed("refused".into()));
            }
            Ok(Arc::new(TestConn {
                selector: selector.clone(),
                counters: self.counters.clone(),
            }))
        }
    }

    fn manager(fail: bool) -> (ConnectionManager, Arc<Counters>) {
        let mut bad = ConnectionProps::default();
        bad.insert("invalid".into(), true.into());
        let catalog = ConnectorCatalog::new()
            .with("test", "a", ConnectionProps::default())
            .with("test", "bad", bad);
        let counters = Arc::new(Counters::default());
        let manager = ConnectionManager::new(catalog, Metrics::new());
        manager.register(
            "test",
            Arc::new(TestFactory {
                counters: counters.clone(),
                fail,
            }),
        );
        (manager, counters)
    }

    #[tokio::test]
    async fn test_shared_connection_refcount() {
        let (manager, counters) = manager(false);

        let c1 = manager.acquire("test.a").await.unwrap();
        let c2 = manager.acquire("test.a").await.unwrap();
        assert!(Arc::ptr_eq(&c1, &c2));
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
        assert_eq!(
            manager.status_of("test.a"),
            Some(ConnectionStatus::Connected { refs: 2 })
        );

        manager.release("test.a").await.unwrap();
        assert_eq!(counters.closes.load(Ordering::SeqCst), 0);
        manager.release("test.a").await.unwrap();
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert!(manager.status().is_empty());
    }

    #[tokio::test]
    async fn test_downcast_connection() {
        let (manager, _) = manager(false);
        let conn = manager.acquire("test.a").await.unwrap();
        let concrete = conn.as_any().downcast_ref::<TestConn>().unwrap();
        assert_eq!(concrete.selector().as_str(), "test.a");
        manager.ping("test.a").await.unwrap();
    }

    #[tokio::test]
    async fn test_configuration_errors_register_nothing() {
        let (manager, counters) = manager(false);

        assert!(matches!(
            manager.acquire("test").await,
            Err(ConnectorError::InvalidSelector(_))
        ));
        assert!(matches!(
            manager.acquire("kafka.a").await,
            Err(ConnectorError::UnknownType(_))
        ));
        assert!(matches!(
            manager.acquire("test.missing").await,
            Err(ConnectorError::UnknownConnection(_))
        ));
        assert!(matches!(
            manager.acquire("test.bad").await,
            Err(ConnectorError::ConfigError(_))
        ));

        assert_eq!(counters.connects.load(Ordering::SeqCst), 0);
        assert!(manager.status().is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_no_entry() {
        let (manager, counters) = manager(true);
        assert!(matches!(
            manager.acquire("test.a").await,
            Err(ConnectorError::ConnectionFailed(_))
        ));
        assert!(manager.status().is_empty());

        // a later attempt connects again
        assert!(manager.acquire("test.a").await.is_err());
        assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_release_without_acquire() {
        let (manager, _) = manager(false);
        assert!(matches!(
            manager.release("test.a").await,
            Err(ConnectorError::NotAcquired(_))
        ));
        assert!(matches!(
            manager.ping("test.a").await,
            Err(ConnectorError::NotAcquired(_))
        ));
    }

    #[tokio::test]
    async fn test_define_makes_selector_available() {
        let (manager, counters) = manager(false);
        manager.define("test.late", ConnectionProps::default()).unwrap();
        manager.acquire("test.late").await.unwrap();
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
        assert!(manager.catalog().selectors().contains(&"test.late".to_string()));
    }

    #[tokio::test]
    async fn test_shutdown_closes_live_connections() {
        let (manager, counters) = manager(false);
        manager.acquire("test.a").await.unwrap();
        manager.acquire("test.a").await.unwrap();
        manager.shutdown().await;
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert!(manager.status().is_empty());
    }
}
