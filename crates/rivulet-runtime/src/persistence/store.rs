//! Checkpoint store implementations
//!
//! Both stores share one in-memory model of committed
//! checkpoint ids and per-checkpoint operator states. The durable store
//! mirrors every change into a [`KvBackend`] and rebuilds the log from it
//! on construction.

use super::backend::KvBackend;
use super::{
    validate_rule_id, CheckpointStates, CheckpointStore, OperatorState, StoreError, StoreOptions,
};
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Outcome of a commit: ids whose states were garbage collected.
struct Committed {
    removed: Vec<u64>,
}

#[derive(Debug, Clone, Default)]
struct CheckpointLog {
    /// Committed ids, ascending
    committed: Vec<u64>,
    /// States of committed and in-flight checkpoints
    states: BTreeMap<u64, CheckpointStates>,
}

impl CheckpointLog {
    fn last_committed(&self) -> Option<u64> {
        self.committed.last().copied()
    }

    fn check_fresh(&self, checkpoint_id: u64) -> Result<(), StoreError> {
        match self.last_committed() {
            Some(last) if checkpoint_id <= last => Err(StoreError::StaleCheckpoint {
                checkpoint_id,
                last_committed: last,
            }),
            _ => Ok(()),
        }
    }

    fn stage(&mut self, checkpoint_id: u64, operator_id: &str, state: OperatorState) {
        self.states
            .entry(checkpoint_id)
            .or_default()
            .insert(operator_id.to_string(), state);
    }

    fn validate_commit(&self, checkpoint_id: u64, options: &StoreOptions) -> Result<(), StoreError> {
        self.check_fresh(checkpoint_id)?;
        let staged = self
            .states
            .get(&checkpoint_id)
            .ok_or(StoreError::CheckpointNotFound(checkpoint_id))?;
        if let Some(required) = &options.required_operators {
            if let Some(missing) = required.iter().find(|op| !staged.contains_key(*op)) {
                return Err(StoreError::MissingOperatorState {
                    checkpoint_id,
                    operator_id: missing.clone(),
                });
            }
        }
        Ok(())
    }

    /// Commit a validated id and collect garbage.
    fn commit(&mut self, checkpoint_id: u64, max_checkpoints: usize) -> Committed {
        self.committed.push(checkpoint_id);

        let mut removed = Vec::new();
        let keep = max_checkpoints.max(1);
        while self.committed.len() > keep {
            let oldest = self.committed.remove(0);
            self.states.remove(&oldest);
            removed.push(oldest);
        }
        removed.extend(self.prune_in_flight());
        Committed { removed }
    }

    /// Drop in-flight states older than the newest committed checkpoint.
    fn prune_in_flight(&mut self) -> Vec<u64> {
        let Some(last) = self.last_committed() else {
            return Vec::new();
        };
        let committed: FxHashSet<u64> = self.committed.iter().copied().collect();
        let stale: Vec<u64> = self
            .states
            .range(..last)
            .map(|(id, _)| *id)
            .filter(|id| !committed.contains(id))
            .collect();
        for id in &stale {
            self.states.remove(id);
        }
        stale
    }

    fn op_state(&self, operator_id: &str) -> Option<OperatorState> {
        self.committed
            .iter()
            .rev()
            .find_map(|id| self.states.get(id).and_then(|s| s.get(operator_id)))
            .cloned()
    }

    fn discard(&mut self, checkpoint_id: u64) -> bool {
        if self.committed.contains(&checkpoint_id) {
            return false;
        }
        self.states.remove(&checkpoint_id).is_some()
    }

    fn states_of(&self, checkpoint_id: u64) -> Option<CheckpointStates> {
        self.states.get(&checkpoint_id).cloned()
    }

    fn in_flight(&self) -> Vec<u64> {
        self.states
            .keys()
            .copied()
            .filter(|id| !self.committed.contains(id))
            .collect()
    }
}

/// Best-effort checkpoint store kept in process memory. State is lost when
/// the process exits.
pub struct MemoryCheckpointStore {
    rule_id: String,
    options: StoreOptions,
    log: Mutex<CheckpointLog>,
}

impl MemoryCheckpointStore {
    pub fn new(rule_id: &str, options: StoreOptions) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            options,
            log: Mutex::new(CheckpointLog::default()),
        }
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn rule_id(&self) -> &str {
        &self.rule_id
    }

    fn save_state(
        &self,
        checkpoint_id: u64,
        operator_id: &str,
        state: OperatorState,
    ) -> Result<(), StoreError> {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.check_fresh(checkpoint_id)?;
        log.stage(checkpoint_id, operator_id, state);
        Ok(())
    }

    fn save_checkpoint(&self, checkpoint_id: u64) -> Result<(), StoreError> {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.validate_commit(checkpoint_id, &self.options)?;
        let committed = log.commit(checkpoint_id, self.options.max_checkpoints);
        self.options.record_commit(&self.rule_id);
        debug!(
            "Rule {} committed checkpoint {} (gc {:?})",
            self.rule_id, checkpoint_id, committed.removed
        );
        Ok(())
    }

    fn get_op_state(&self, operator_id: &str) -> Result<Option<OperatorState>, StoreError> {
        let log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        Ok(log.op_state(operator_id))
    }

    fn checkpoints(&self) -> Vec<u64> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).committed.clone()
    }

    fn checkpoint_states(&self, checkpoint_id: u64) -> Option<CheckpointStates> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .states_of(checkpoint_id)
    }

    fn in_flight(&self) -> Vec<u64> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).in_flight()
    }

    fn discard(&self, checkpoint_id: u64) -> Result<bool, StoreError> {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        Ok(log.discard(checkpoint_id))
    }

    fn clean(&self) -> Result<(), StoreError> {
        *self.log.lock().unwrap_or_else(|e| e.into_inner()) = CheckpointLog::default();
        info!("Cleaned state of rule {}", self.rule_id);
        Ok(())
    }
}

/// Durable checkpoint store on a [`KvBackend`].
///
/// Layout under the rule namespace:
///
/// - `<rule>:cp:<id>`: JSON map operator id → state for checkpoint `id`
/// - `<rule>:checkpoints`: JSON list of committed ids, ascending
///
/// Writing the committed list is the commit point, so a failed commit
/// leaves the previously committed list untouched.
pub struct KvCheckpointStore {
    rule_id: String,
    options: StoreOptions,
    backend: Arc<dyn KvBackend>,
    log: Mutex<CheckpointLog>,
}

impl KvCheckpointStore {
    /// Open the store for `rule_id`, restoring committed checkpoints and
    /// in-flight states left by a previous instance.
    ///
    /// Fails with [`StoreError::InvalidRuleId`] when the id would share or
    /// escape its namespace.
    pub fn open(
        rule_id: &str,
        backend: Arc<dyn KvBackend>,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        validate_rule_id(rule_id)?;
        let store = Self {
            rule_id: rule_id.to_string(),
            options,
            backend,
            log: Mutex::new(CheckpointLog::default()),
        };
        let log = store.restore()?;
        info!(
            "Rule {} restored {} committed checkpoints ({} states)",
            rule_id,
            log.committed.len(),
            log.states.len()
        );
        *store.log.lock().unwrap_or_else(|e| e.into_inner()) = log;
        Ok(store)
    }

    fn list_key(&self) -> String {
        format!("{}:checkpoints", self.rule_id)
    }

    fn states_prefix(&self) -> String {
        format!("{}:cp:", self.rule_id)
    }

    fn states_key(&self, checkpoint_id: u64) -> String {
        format!("{}{}", self.states_prefix(), checkpoint_id)
    }

    fn restore(&self) -> Result<CheckpointLog, StoreError> {
        let mut log = CheckpointLog::default();

        if let Some(data) = self.backend.get(&self.list_key())? {
            let mut committed: Vec<u64> = serde_json::from_slice(&data)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            committed.sort_unstable();
            committed.dedup();
            log.committed = committed;
        }

        let prefix = self.states_prefix();
        for (key, data) in self.backend.scan(&prefix)? {
            let Some(id) = key.strip_prefix(&prefix).and_then(|s| s.parse::<u64>().ok()) else {
                warn!("Rule {} ignores unexpected state key {}", self.rule_id, key);
                continue;
            };
            let states: CheckpointStates = serde_json::from_slice(&data)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            log.states.insert(id, states);
        }

        let missing: Vec<u64> = log
            .committed
            .iter()
            .copied()
            .filter(|id| !log.states.contains_key(id))
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::Corrupted(format!(
                "rule {} lists committed checkpoints {:?} without state",
                self.rule_id, missing
            )));
        }

        // leftovers of a collection that did not finish
        for id in log.prune_in_flight() {
            self.delete_states(id);
        }
        Ok(log)
    }

    fn write_states(&self, checkpoint_id: u64, states: &CheckpointStates) -> Result<(), StoreError> {
        let data =
            serde_json::to_vec(states).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.backend.put(&self.states_key(checkpoint_id), &data)
    }

    fn delete_states(&self, checkpoint_id: u64) {
        if let Err(e) = self.backend.delete(&self.states_key(checkpoint_id)) {
            // restore collects it again later
            warn!(
                "Rule {} failed to delete state of checkpoint {}: {}",
                self.rule_id, checkpoint_id, e
            );
        }
    }
}

impl CheckpointStore for KvCheckpointStore {
    fn rule_id(&self) -> &str {
        &self.rule_id
    }

    fn save_state(
        &self,
        checkpoint_id: u64,
        operator_id: &str,
        state: OperatorState,
    ) -> Result<(), StoreError> {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.check_fresh(checkpoint_id)?;

        let mut next = log.states.get(&checkpoint_id).cloned().unwrap_or_default();
        next.insert(operator_id.to_string(), state);
        self.write_states(checkpoint_id, &next)?;
        log.states.insert(checkpoint_id, next);
        Ok(())
    }

    fn save_checkpoint(&self, checkpoint_id: u64) -> Result<(), StoreError> {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.validate_commit(checkpoint_id, &self.options)?;

        let mut next = log.clone();
        let committed = next.commit(checkpoint_id, self.options.max_checkpoints);
        let data = serde_json::to_vec(&next.committed)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.backend.put(&self.list_key(), &data)?;
        self.backend.flush()?;
        *log = next;
        drop(log);

        for id in &committed.removed {
            self.delete_states(*id);
        }
        self.options.record_commit(&self.rule_id);
        debug!(
            "Rule {} committed checkpoint {} (gc {:?})",
            self.rule_id, checkpoint_id, committed.removed
        );
        Ok(())
    }

    fn get_op_state(&self, operator_id: &str) -> Result<Option<OperatorState>, StoreError> {
        let log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        Ok(log.op_state(operator_id))
    }

    fn checkpoints(&self) -> Vec<u64> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).committed.clone()
    }

    fn checkpoint_states(&self, checkpoint_id: u64) -> Option<CheckpointStates> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .states_of(checkpoint_id)
    }

    fn in_flight(&self) -> Vec<u64> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).in_flight()
    }

    fn discard(&self, checkpoint_id: u64) -> Result<bool, StoreError> {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        if !log.states.contains_key(&checkpoint_id) || log.committed.contains(&checkpoint_id) {
            return Ok(false);
        }
        self.backend.delete(&self.states_key(checkpoint_id))?;
        Ok(log.discard(checkpoint_id))
    }

    fn clean(&self) -> Result<(), StoreError> {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        self.backend.clear_namespace(&self.rule_id)?;
        self.backend.flush()?;
        *log = CheckpointLog::default();
        info!("Cleaned state of rule {}", self.rule_id);
        Ok(())
    }
}
