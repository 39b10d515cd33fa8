//! Core connector traits and error definitions

use crate::pattern::PatternError;
use crate::pubsub::Message;
use async_trait::async_trait;
use rivulet_core::Record;
use tokio::sync::mpsc;

/// Trait for source connectors that feed records into a pipeline.
///
/// # Lifecycle
///
/// 1. Create the connector
/// 2. Call [`start`](Self::start) with the pipeline channel
/// 3. The connector forwards messages asynchronously
/// 4. Call [`stop`](Self::stop) to shut it down
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Returns the name/identifier of this connector instance.
    fn name(&self) -> &str;

    /// Start receiving and forward every message to `tx`.
    async fn start(&mut self, tx: mpsc::Sender<Message>) -> Result<(), ConnectorError>;

    /// Stop the connector. Messages still queued may be lost.
    async fn stop(&mut self) -> Result<(), ConnectorError>;

    fn is_running(&self) -> bool;
}

/// Trait for sink connectors that emit records out of a pipeline.
///
/// `send` takes `&self` so one sink can be driven from several tasks.
#[async_trait]
pub trait SinkConnector: Send + Sync {
    fn name(&self) -> &str;

    /// Establish the connection. Sinks that connect eagerly may keep the
    /// default no-op.
    async fn connect(&mut self) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Emit one record.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::NotConnected` if `connect` has not run.
    async fn send(&self, record: &Record) -> Result<(), ConnectorError>;

    /// Emit several records; defaults to one `send` per record.
    async fn send_batch(&self, records: &[Record]) -> Result<(), ConnectorError> {
        for record in records {
            self.send(record).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), ConnectorError>;

    async fn close(&self) -> Result<(), ConnectorError>;
}

/// Errors raised by connectors and the shared connection manager.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// Physical connection could not be established or closed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Invalid or incomplete connection properties.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Operation attempted before `connect`/`start`.
    #[error("Not connected")]
    NotConnected,

    /// Selector is not of the form `type.key`.
    #[error("Invalid connection selector '{0}': expected '<type>.<key>'")]
    InvalidSelector(String),

    /// No factory registered for the connector type.
    #[error("No connection factory registered for type '{0}'")]
    UnknownType(String),

    /// The catalog has no properties for the selector.
    #[error("No connection configured for '{0}'")]
    UnknownConnection(String),

    /// Release or ping of a selector the caller does not hold.
    #[error("Connection '{0}' is not acquired")]
    NotAcquired(String),

    #[error(transparent)]
    Pattern(#[from] PatternError),
}

impl ConnectorError {
    /// Whether the error stems from configuration rather than from the
    /// external system.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            ConnectorError::ConfigError(_)
                | ConnectorError::InvalidSelector(_)
                | ConnectorError::UnknownType(_)
                | ConnectorError::UnknownConnection(_)
                | ConnectorError::Pattern(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConnectorError::InvalidSelector("mqtt".into());
        assert_eq!(
            err.to_string(),
            "Invalid connection selector 'mqtt': expected '<type>.<key>'"
        );
        assert!(err.is_config());
        assert!(!ConnectorError::ConnectionFailed("refused".into()).is_config());
    }

    #[test]
    fn test_pattern_error_converts() {
        let err: ConnectorError = PatternError::Empty.into();
        assert!(matches!(err, ConnectorError::Pattern(PatternError::Empty)));
        assert!(err.is_config());
    }
}
