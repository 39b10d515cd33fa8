//! Checkpoint coordination for one rule
//!
//! The coordinator hands out checkpoint ids, collects the state of every
//! operator for the current id and commits once all of them reported.

use super::{CheckpointStore, OperatorState, StoreError};
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct Pending {
    checkpoint_id: u64,
    acked: FxHashSet<String>,
}

/// Drives checkpoints of one rule against its [`CheckpointStore`].
pub struct CheckpointCoordinator {
    store: Arc<dyn CheckpointStore>,
    operators: Vec<String>,
    next_id: u64,
    pending: Option<Pending>,
    interval: Duration,
    last_checkpoint: Instant,
}

impl CheckpointCoordinator {
    /// Create a coordinator expecting acknowledgements from `operators`.
    ///
    /// Checkpoints a previous run left in flight are discarded, and ids
    /// continue after every id the store has seen, so a new checkpoint
    /// never merges into stale operator state.
    pub fn new<I, S>(store: Arc<dyn CheckpointStore>, operators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let in_flight = store.in_flight();
        for &id in &in_flight {
            match store.discard(id) {
                Ok(_) => info!(
                    "Rule {} discarded unfinished checkpoint {}",
                    store.rule_id(),
                    id
                ),
                Err(e) => warn!(
                    "Rule {} failed to discard unfinished checkpoint {}: {}",
                    store.rule_id(),
                    id,
                    e
                ),
            }
        }
        let last_seen = store
            .checkpoints()
            .last()
            .copied()
            .into_iter()
            .chain(in_flight.last().copied())
            .max();
        let next_id = last_seen.map_or(1, |id| id + 1);
        Self {
            store,
            operators: operators.into_iter().map(Into::into).collect(),
            next_id,
            pending: None,
            interval: Duration::from_secs(60),
            last_checkpoint: Instant::now(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Check if it's time to trigger a checkpoint
    pub fn should_checkpoint(&self) -> bool {
        self.last_checkpoint.elapsed() >= self.interval
    }

    /// Start a new checkpoint and return its id. A checkpoint still
    /// collecting acknowledgements is superseded and discarded.
    pub fn trigger(&mut self) -> Result<u64, StoreError> {
        if let Some(pending) = self.pending.take() {
            warn!(
                "Rule {} checkpoint {} superseded after {}/{} acknowledgements",
                self.store.rule_id(),
                pending.checkpoint_id,
                pending.acked.len(),
                self.operators.len()
            );
            self.store.discard(pending.checkpoint_id)?;
        }

        let checkpoint_id = self.next_id;
        self.next_id += 1;
        self.last_checkpoint = Instant::now();
        self.pending = Some(Pending {
            checkpoint_id,
            acked: FxHashSet::default(),
        });
        debug!(
            "Rule {} triggered checkpoint {}",
            self.store.rule_id(),
            checkpoint_id
        );
        Ok(checkpoint_id)
    }

    /// Record the state of `operator_id` for `checkpoint_id`. Returns the
    /// id when this acknowledgement completed and committed the checkpoint.
    ///
    /// Acknowledgements for a checkpoint that is no longer pending are
    /// ignored.
    pub fn ack(
        &mut self,
        checkpoint_id: u64,
        operator_id: &str,
        state: OperatorState,
    ) -> Result<Option<u64>, StoreError> {
        let Some(pending) = self
            .pending
            .as_mut()
            .filter(|p| p.checkpoint_id == checkpoint_id)
        else {
            debug!(
                "Rule {} ignores late acknowledgement of checkpoint {} from {}",
                self.store.rule_id(),
                checkpoint_id,
                operator_id
            );
            return Ok(None);
        };

        self.store.save_state(checkpoint_id, operator_id, state)?;
        pending.acked.insert(operator_id.to_string());

        let complete = self.operators.iter().all(|op| pending.acked.contains(op));
        if !complete {
            return Ok(None);
        }

        self.store.save_checkpoint(checkpoint_id)?;
        self.pending = None;
        info!(
            "Rule {} completed checkpoint {}",
            self.store.rule_id(),
            checkpoint_id
        );
        Ok(Some(checkpoint_id))
    }

    /// Id of the checkpoint collecting acknowledgements, if any.
    pub fn pending(&self) -> Option<u64> {
        self.pending.as_ref().map(|p| p.checkpoint_id)
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }
}
