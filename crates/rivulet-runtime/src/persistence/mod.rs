//! Checkpoint state for rules
//!
//! Operators of a rule save their state under a checkpoint id; once every
//! operator has saved, the checkpoint is committed and becomes the point a
//! restarted rule resumes from.
//!
//! Two stores implement [`CheckpointStore`]: [`MemoryCheckpointStore`] for
//! best-effort rules and [`KvCheckpointStore`] for rules that must survive
//! a restart. [`create_store`] picks one from the rule's [`Qos`].
//!
//! # Example
//! ```
//! use rivulet_core::Value;
//! use rivulet_runtime::persistence::{create_store, OperatorState, Qos, StateConfig};
//!
//! let store = create_store("rule1", Qos::AtMostOnce, &StateConfig::default()).unwrap();
//! let mut state = OperatorState::default();
//! state.insert("count".into(), Value::Int(3));
//! store.save_state(1, "agg", state.clone()).unwrap();
//! store.save_checkpoint(1).unwrap();
//! assert_eq!(store.get_op_state("agg").unwrap(), Some(state));
//! ```

mod backend;
mod coordinator;
mod store;

#[cfg(feature = "persistence")]
pub use backend::RocksDbKv;
pub use backend::{FileKv, KvBackend, MemoryKv};
pub use coordinator::CheckpointCoordinator;
pub use store::{KvCheckpointStore, MemoryCheckpointStore};

use crate::metrics::Metrics;
use rivulet_core::{FxIndexMap, Value};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// State of one operator at one checkpoint.
pub type OperatorState = FxIndexMap<String, Value>;

/// States of all operators at one checkpoint, keyed by operator id.
pub type CheckpointStates = FxIndexMap<String, OperatorState>;

/// Error type for checkpoint store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Checkpoint ids must increase strictly.
    #[error("checkpoint {checkpoint_id} is not newer than committed checkpoint {last_committed}")]
    StaleCheckpoint { checkpoint_id: u64, last_committed: u64 },

    /// Commit of an id without any staged state.
    #[error("checkpoint {0} has no saved state")]
    CheckpointNotFound(u64),

    #[error("checkpoint {checkpoint_id} is missing state of operator {operator_id}")]
    MissingOperatorState {
        checkpoint_id: u64,
        operator_id: String,
    },

    /// Persisted data contradicts itself.
    #[error("corrupted state: {0}")]
    Corrupted(String),

    #[error("unsupported state backend: {0}")]
    Unsupported(String),

    /// The id cannot name a storage namespace of its own.
    #[error("invalid rule id '{0}': must be non-empty without ':', '/', '\\' or a '..' segment")]
    InvalidRuleId(String),
}

/// Check that `rule_id` maps to exactly one storage namespace: keys are
/// `<rule>:...` and the file backend turns `:` into directories.
pub fn validate_rule_id(rule_id: &str) -> Result<(), StoreError> {
    let invalid = rule_id.is_empty()
        || rule_id.contains([':', '/', '\\', '\0'])
        || rule_id == "."
        || rule_id == "..";
    if invalid {
        return Err(StoreError::InvalidRuleId(rule_id.to_string()));
    }
    Ok(())
}

/// Delivery guarantee of a rule, which decides how its state is stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Qos {
    /// Best effort; state lives in memory only.
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn is_durable(self) -> bool {
        !matches!(self, Qos::AtMostOnce)
    }
}

impl TryFrom<u8> for Qos {
    type Error = StoreError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(StoreError::Unsupported(format!("qos level {}", other))),
        }
    }
}

/// Which [`KvBackend`] durable stores write to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    File,
    Rocksdb,
}

/// `state` section of the runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub backend: BackendKind,
    /// Directory of the file and rocksdb backends
    pub data_dir: PathBuf,
    /// Committed checkpoints retained per rule
    pub max_checkpoints: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            data_dir: PathBuf::from("data/state"),
            max_checkpoints: 3,
        }
    }
}

/// Per-store settings.
#[derive(Clone)]
pub struct StoreOptions {
    pub max_checkpoints: usize,
    /// Operators that must have saved state before a commit
    pub required_operators: Option<Vec<String>>,
    metrics: Option<Metrics>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_checkpoints: 3,
            required_operators: None,
            metrics: None,
        }
    }
}

impl StoreOptions {
    pub fn from_config(config: &StateConfig) -> Self {
        Self::default().with_max_checkpoints(config.max_checkpoints)
    }

    pub fn with_max_checkpoints(mut self, max_checkpoints: usize) -> Self {
        self.max_checkpoints = max_checkpoints;
        self
    }

    pub fn with_required_operators<I, S>(mut self, operators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_operators = Some(operators.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub(crate) fn record_commit(&self, rule_id: &str) {
        if let Some(metrics) = &self.metrics {
            metrics
                .checkpoints_committed
                .with_label_values(&[rule_id])
                .inc();
        }
    }
}

/// Checkpointed state of one rule.
pub trait CheckpointStore: Send + Sync {
    fn rule_id(&self) -> &str;

    /// Upsert `state` of `operator_id` under the in-flight `checkpoint_id`.
    fn save_state(
        &self,
        checkpoint_id: u64,
        operator_id: &str,
        state: OperatorState,
    ) -> Result<(), StoreError>;

    /// Commit every state staged under `checkpoint_id`. Nothing is
    /// committed when this fails.
    fn save_checkpoint(&self, checkpoint_id: u64) -> Result<(), StoreError>;

    /// State of `operator_id` from the newest committed checkpoint that
    /// has one.
    fn get_op_state(&self, operator_id: &str) -> Result<Option<OperatorState>, StoreError>;

    /// Committed checkpoint ids, ascending.
    fn checkpoints(&self) -> Vec<u64>;

    /// Operator states recorded under `checkpoint_id`, committed or not.
    fn checkpoint_states(&self, checkpoint_id: u64) -> Option<CheckpointStates>;

    /// Ids with saved state that are not committed, ascending.
    fn in_flight(&self) -> Vec<u64>;

    /// Drop an in-flight checkpoint. Returns false when there is none.
    fn discard(&self, checkpoint_id: u64) -> Result<bool, StoreError>;

    /// Delete all stored state of the rule.
    fn clean(&self) -> Result<(), StoreError>;
}

/// Open the backend described by `config`.
pub fn open_backend(config: &StateConfig) -> Result<Arc<dyn KvBackend>, StoreError> {
    match config.backend {
        BackendKind::Memory => Ok(Arc::new(MemoryKv::new())),
        BackendKind::File => Ok(Arc::new(FileKv::open(&config.data_dir)?)),
        #[cfg(feature = "persistence")]
        BackendKind::Rocksdb => Ok(Arc::new(RocksDbKv::open(&config.data_dir)?)),
        #[cfg(not(feature = "persistence"))]
        BackendKind::Rocksdb => Err(StoreError::Unsupported(
            "rocksdb backend requires the `persistence` feature".to_string(),
        )),
    }
}

/// Create the store of `rule_id` for its delivery guarantee, opening a
/// fresh backend for durable stores.
pub fn create_store(
    rule_id: &str,
    qos: Qos,
    config: &StateConfig,
) -> Result<Arc<dyn CheckpointStore>, StoreError> {
    validate_rule_id(rule_id)?;
    let options = StoreOptions::from_config(config);
    if !qos.is_durable() {
        return Ok(Arc::new(MemoryCheckpointStore::new(rule_id, options)));
    }
    create_store_with(rule_id, qos, open_backend(config)?, options)
}

/// Create the store of `rule_id` on an already opened backend.
pub fn create_store_with(
    rule_id: &str,
    qos: Qos,
    backend: Arc<dyn KvBackend>,
    options: StoreOptions,
) -> Result<Arc<dyn CheckpointStore>, StoreError> {
    validate_rule_id(rule_id)?;
    if qos.is_durable() {
        Ok(Arc::new(KvCheckpointStore::open(rule_id, backend, options)?))
    } else {
        Ok(Arc::new(MemoryCheckpointStore::new(rule_id, options)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_levels() {
        assert_eq!(Qos::try_from(0).unwrap(), Qos::AtMostOnce);
        assert_eq!(Qos::try_from(1).unwrap(), Qos::AtLeastOnce);
        assert_eq!(Qos::try_from(2).unwrap(), Qos::ExactlyOnce);
        assert!(Qos::try_from(3).is_err());
        assert!(!Qos::AtMostOnce.is_durable());
        assert!(Qos::ExactlyOnce.is_durable());
    }

    #[test]
    fn test_rule_id_validation() {
        for ok in ["rule1", "r", "temp-sensor_2", "a.b", "..a"] {
            assert!(validate_rule_id(ok).is_ok(), "{}", ok);
        }
        for bad in ["", "r:x", "a/b", "../escaped", "a\\b", ".", "..", "nul\0"] {
            assert!(
                matches!(validate_rule_id(bad), Err(StoreError::InvalidRuleId(ref id)) if id == bad),
                "{:?}",
                bad
            );
        }
    }

    #[test]
    fn test_invalid_rule_id_rejected_for_every_qos() {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryKv::new());
        for qos in [Qos::AtMostOnce, Qos::AtLeastOnce, Qos::ExactlyOnce] {
            assert!(matches!(
                create_store_with("r:x", qos, backend.clone(), StoreOptions::default()),
                Err(StoreError::InvalidRuleId(_))
            ));
            assert!(matches!(
                create_store("", qos, &StateConfig::default()),
                Err(StoreError::InvalidRuleId(_))
            ));
        }
        assert!(backend.scan("r:").unwrap().is_empty());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StateConfig {
            backend: BackendKind::File,
            data_dir: dir.path().to_path_buf(),
            max_checkpoints: 3,
        };

        let mut state = OperatorState::default();
        state.insert("sum".into(), Value::Float(2.5));

        let store = create_store("rule1", Qos::AtLeastOnce, &config).unwrap();
        store.save_state(1, "agg", state.clone()).unwrap();
        store.save_checkpoint(1).unwrap();
        drop(store);

        let reopened = create_store("rule1", Qos::AtLeastOnce, &config).unwrap();
        assert_eq!(reopened.checkpoints(), vec![1]);
        assert_eq!(reopened.get_op_state("agg").unwrap(), Some(state));
    }

    #[test]
    fn test_memory_qos_is_not_durable() {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryKv::new());
        let store =
            create_store_with("r", Qos::AtMostOnce, backend.clone(), StoreOptions::default())
                .unwrap();
        let mut state = OperatorState::default();
        state.insert("n".into(), Value::Int(1));
        store.save_state(1, "op", state).unwrap();
        store.save_checkpoint(1).unwrap();
        assert!(backend.get("r:checkpoints").unwrap().is_none());
    }

    #[cfg(not(feature = "persistence"))]
    #[test]
    fn test_rocksdb_requires_feature() {
        let config = StateConfig {
            backend: BackendKind::Rocksdb,
            ..StateConfig::default()
        };
        assert!(matches!(
            open_backend(&config),
            Err(StoreError::Unsupported(_))
        ));
    }

    #[test]
    fn test_commit_metric() {
        let metrics = Metrics::new();
        let store = MemoryCheckpointStore::new("r", StoreOptions::default().with_metrics(metrics.clone()));
        store.save_state(1, "op", OperatorState::default()).unwrap();
        store.save_checkpoint(1).unwrap();
        assert_eq!(
            metrics.checkpoints_committed.with_label_values(&["r"]).get(),
            1
        );
    }
}
