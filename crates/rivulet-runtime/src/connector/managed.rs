//! Shared connection traits
//!
//! A [`Connection`] is one physical link to an external system, shared by
//! every rule that refers to the same selector. A [`ConnectionFactory`]
//! creates connections of one connector type.

use super::catalog::{ConnectionProps, Selector};
use super::types::ConnectorError;
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

/// A physical connection owned by the [`ConnectionManager`].
///
/// Callers get it as `Arc<dyn Connection>` and downcast through
/// [`as_any`](Self::as_any) to the concrete client type.
///
/// [`ConnectionManager`]: super::ConnectionManager
#[async_trait]
pub trait Connection: Send + Sync {
    /// Selector this connection was created for.
    fn selector(&self) -> &Selector;

    /// Health check of the underlying link.
    async fn ping(&self) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Close the physical connection. Called exactly once, by the last
    /// releaser.
    async fn close(&self) -> Result<(), ConnectorError>;

    fn as_any(&self) -> &dyn Any;
}

/// Creates connections for one connector type.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Check `props` before any connect attempt.
    fn validate(&self, _props: &ConnectionProps) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Establish the physical connection for `selector`.
    async fn connect(
        &self,
        selector: &Selector,
        props: &ConnectionProps,
    ) -> Result<Arc<dyn Connection>, ConnectorError>;
}
