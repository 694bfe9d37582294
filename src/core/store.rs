use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    core::indices::{push_unique, remove_from, replace_in, VecIndex},
    operation::{Batch, OperationItem},
    types::{BatchId, BoosterId, OperationId, OperationStatus, Revision},
};

/// Rejected store mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Id is already in use (or was used earlier in this process).
    #[error("operation id already in use: {0}")]
    AlreadyExists(OperationId),
    /// No operation with this id.
    #[error("operation not found: {0}")]
    MissingOperation(OperationId),
    /// No batch with this id.
    #[error("batch not found: {0}")]
    MissingBatch(BatchId),
    /// Batch id is already in use.
    #[error("batch id already in use: {0}")]
    BatchExists(BatchId),
    /// Terminal items only change through the override path.
    #[error("operation {0} is terminal")]
    TerminalLocked(OperationId),
    /// Batch membership is fixed at creation.
    #[error("operation {id} cannot change batch membership to {batch_id:?}")]
    RetroactiveBatch {
        /// Operation id.
        id: OperationId,
        /// Requested batch.
        batch_id: Option<BatchId>,
    },
    /// Batch counters disagree with its members.
    #[error("batch {batch_id} counts invalid: total {total_count}, queued {queued_count}, members {members}")]
    BatchCounts {
        /// Batch id.
        batch_id: BatchId,
        /// Requested size.
        total_count: u32,
        /// Accepted size.
        queued_count: u32,
        /// Items referencing the batch.
        members: usize,
    },
}

/// One accepted mutation, drained by the runtime to drive aggregation and notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// Item inserted.
    Inserted {
        /// Item id.
        id: OperationId,
        /// Owning batch.
        batch_id: Option<BatchId>,
    },
    /// Item updated in place.
    Updated {
        /// Item id.
        id: OperationId,
        /// Owning batch.
        batch_id: Option<BatchId>,
        /// Status after the update.
        status: OperationStatus,
    },
    /// Item moved to a backend id.
    Rekeyed {
        /// Previous id.
        from: OperationId,
        /// New id.
        to: OperationId,
    },
    /// Item evicted.
    Removed {
        /// Item id.
        id: OperationId,
        /// Owning batch.
        batch_id: Option<BatchId>,
    },
    /// Batch created with its members.
    BatchCreated {
        /// Batch id.
        batch_id: BatchId,
    },
    /// Batch counters changed.
    BatchUpdated {
        /// Batch id.
        batch_id: BatchId,
    },
    /// Batch moved to a backend id.
    BatchRekeyed {
        /// Previous id.
        from: BatchId,
        /// New id.
        to: BatchId,
    },
}

/// Serialized form of the whole store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshotV1 {
    /// Revision at export.
    pub revision: Revision,
    /// Next local operation counter.
    pub next_local_op: u64,
    /// Next local batch counter.
    pub next_local_batch: u64,
    /// Items in insertion order.
    pub items: Vec<OperationItem>,
    /// Batches in creation order.
    pub batches: Vec<Batch>,
    /// Local operation id to current id.
    pub aliases: Vec<(OperationId, OperationId)>,
    /// Local batch id to current id.
    pub batch_aliases: Vec<(BatchId, BatchId)>,
    /// Ids removed earlier, never reused.
    pub retired: Vec<OperationId>,
}

/// The single authoritative representation of all known operations and batches.
#[derive(Debug, Default)]
pub struct QueueStateStore {
    records: HashMap<OperationId, OperationItem>,
    order: Vec<OperationId>,
    by_booster: VecIndex<BoosterId>,
    by_batch: VecIndex<BatchId>,
    batches: HashMap<BatchId, Batch>,
    batch_order: Vec<BatchId>,
    aliases: HashMap<OperationId, OperationId>,
    batch_aliases: HashMap<BatchId, BatchId>,
    retired: HashSet<OperationId>,
    pending_changes: Vec<StoreChange>,
    revision: Revision,
    next_local_op: u64,
    next_local_batch: u64,
}

impl QueueStateStore {
    /// Empty store; local counters start at 1.
    pub fn new() -> Self {
        Self {
            next_local_op: 1,
            next_local_batch: 1,
            ..Self::default()
        }
    }

    /// Rebuilds the store and its indices from a snapshot.
    pub fn from_snapshot(snapshot: StoreSnapshotV1) -> Result<Self, StoreError> {
        let mut store = Self {
            revision: snapshot.revision,
            next_local_op: snapshot.next_local_op.max(1),
            next_local_batch: snapshot.next_local_batch.max(1),
            aliases: snapshot.aliases.into_iter().collect(),
            batch_aliases: snapshot.batch_aliases.into_iter().collect(),
            retired: snapshot.retired.into_iter().collect(),
            ..Self::default()
        };

        for batch in snapshot.batches {
            if store.batches.contains_key(&batch.batch_id) {
                return Err(StoreError::BatchExists(batch.batch_id));
            }
            store.batch_order.push(batch.batch_id.clone());
            store.batches.insert(batch.batch_id.clone(), batch);
        }

        for item in snapshot.items {
            if store.records.contains_key(&item.id) {
                return Err(StoreError::AlreadyExists(item.id));
            }
            if let Some(batch_id) = &item.batch_id {
                if !store.batches.contains_key(batch_id) {
                    return Err(StoreError::MissingBatch(batch_id.clone()));
                }
            }
            store.insert_indices(&item);
            store.order.push(item.id.clone());
            store.records.insert(item.id.clone(), item);
        }

        Ok(store)
    }

    /// Full copy of the store for persistence.
    pub fn export_snapshot(&self) -> StoreSnapshotV1 {
        StoreSnapshotV1 {
            revision: self.revision,
            next_local_op: self.next_local_op,
            next_local_batch: self.next_local_batch,
            items: self.list().into_iter().cloned().collect(),
            batches: self
                .batch_order
                .iter()
                .filter_map(|id| self.batches.get(id).cloned())
                .collect(),
            aliases: self
                .aliases
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            batch_aliases: self
                .batch_aliases
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            retired: self.retired.iter().cloned().collect(),
        }
    }

    /// Allocates a fresh local operation id.
    pub fn next_operation_id(&mut self) -> OperationId {
        loop {
            let id = format!("local-op-{}", self.next_local_op);
            self.next_local_op += 1;
            if !self.id_in_use(&id) {
                return id;
            }
        }
    }

    /// Allocates a fresh local batch id.
    pub fn next_batch_id(&mut self) -> BatchId {
        loop {
            let id = format!("local-batch-{}", self.next_local_batch);
            self.next_local_batch += 1;
            if !self.batches.contains_key(&id) && !self.batch_aliases.contains_key(&id) {
                return id;
            }
        }
    }

    /// Inserts a standalone item or updates an existing one.
    ///
    /// Returns `Ok(false)` when the item is identical to what is stored.
    pub fn upsert(&mut self, item: OperationItem) -> Result<bool, StoreError> {
        self.upsert_inner(item, false)
    }

    /// Replaces a terminal item. Only the reconciler's override path calls this.
    pub(crate) fn upsert_override(&mut self, item: OperationItem) -> Result<bool, StoreError> {
        self.upsert_inner(item, true)
    }

    /// Creates a batch together with all of its members.
    pub fn insert_batch(&mut self, batch: Batch, items: Vec<OperationItem>) -> Result<(), StoreError> {
        if self.batches.contains_key(&batch.batch_id) || self.batch_aliases.contains_key(&batch.batch_id) {
            return Err(StoreError::BatchExists(batch.batch_id));
        }
        if batch.queued_count as usize != items.len() || batch.total_count < batch.queued_count {
            return Err(StoreError::BatchCounts {
                batch_id: batch.batch_id,
                total_count: batch.total_count,
                queued_count: batch.queued_count,
                members: items.len(),
            });
        }

        let mut seen = HashSet::new();
        for item in &items {
            if item.batch_id.as_deref() != Some(batch.batch_id.as_str()) {
                return Err(StoreError::RetroactiveBatch {
                    id: item.id.clone(),
                    batch_id: item.batch_id.clone(),
                });
            }
            if self.id_in_use(&item.id) || !seen.insert(item.id.clone()) {
                return Err(StoreError::AlreadyExists(item.id.clone()));
            }
        }

        let batch_id = batch.batch_id.clone();
        self.batch_order.push(batch_id.clone());
        self.batches.insert(batch_id.clone(), batch);
        self.record(StoreChange::BatchCreated {
            batch_id: batch_id.clone(),
        });

        for item in items {
            let id = item.id.clone();
            self.insert_indices(&item);
            self.order.push(id.clone());
            self.records.insert(id.clone(), item);
            self.record(StoreChange::Inserted {
                id,
                batch_id: Some(batch_id.clone()),
            });
        }
        Ok(())
    }

    /// Replaces batch counters. Membership stays fixed.
    pub fn update_batch(&mut self, batch: Batch) -> Result<bool, StoreError> {
        let members = self.by_batch.get(&batch.batch_id).map_or(0, Vec::len);
        let existing = self
            .batches
            .get(&batch.batch_id)
            .ok_or_else(|| StoreError::MissingBatch(batch.batch_id.clone()))?;
        if *existing == batch {
            return Ok(false);
        }
        let evicted = existing.evicted.len();
        if batch.total_count < batch.queued_count || batch.queued_count as usize != members + evicted {
            return Err(StoreError::BatchCounts {
                batch_id: batch.batch_id,
                total_count: batch.total_count,
                queued_count: batch.queued_count,
                members: members + evicted,
            });
        }

        let batch_id = batch.batch_id.clone();
        self.batches.insert(batch_id.clone(), batch);
        self.record(StoreChange::BatchUpdated { batch_id });
        Ok(true)
    }

    /// Moves an item to its backend id, keeping the old id resolvable.
    pub fn rekey(&mut self, from: &str, to: &str) -> Result<(), StoreError> {
        let current = self
            .resolve(from)
            .ok_or_else(|| StoreError::MissingOperation(from.to_string()))?
            .clone();
        if current == to {
            return Ok(());
        }
        if self.id_in_use(to) {
            return Err(StoreError::AlreadyExists(to.to_string()));
        }

        let mut item = self
            .records
            .remove(&current)
            .ok_or_else(|| StoreError::MissingOperation(current.clone()))?;
        item.id = to.to_string();
        item.submission = crate::operation::SubmissionState::Confirmed;

        replace_in(&mut self.by_booster, &item.booster_id, &current, to);
        if let Some(batch_id) = &item.batch_id {
            replace_in(&mut self.by_batch, batch_id, &current, to);
        }
        if let Some(slot) = self.order.iter_mut().find(|x| **x == current) {
            *slot = to.to_string();
        }
        for target in self.aliases.values_mut().filter(|v| **v == current) {
            *target = to.to_string();
        }
        self.aliases.insert(current.clone(), to.to_string());
        self.records.insert(to.to_string(), item);

        self.record(StoreChange::Rekeyed {
            from: current,
            to: to.to_string(),
        });
        Ok(())
    }

    /// Moves a batch and its members to the backend batch id.
    pub fn rekey_batch(&mut self, from: &str, to: &str) -> Result<(), StoreError> {
        let current = self
            .resolve_batch(from)
            .ok_or_else(|| StoreError::MissingBatch(from.to_string()))?
            .clone();
        if current == to {
            return Ok(());
        }
        if self.batches.contains_key(to) || self.batch_aliases.contains_key(to) {
            return Err(StoreError::BatchExists(to.to_string()));
        }

        let mut batch = self
            .batches
            .remove(&current)
            .ok_or_else(|| StoreError::MissingBatch(current.clone()))?;
        batch.batch_id = to.to_string();
        self.batches.insert(to.to_string(), batch);

        if let Some(members) = self.by_batch.remove(&current) {
            for id in &members {
                if let Some(item) = self.records.get_mut(id) {
                    item.batch_id = Some(to.to_string());
                }
            }
            self.by_batch.insert(to.to_string(), members);
        }
        if let Some(slot) = self.batch_order.iter_mut().find(|x| **x == current) {
            *slot = to.to_string();
        }
        for target in self.batch_aliases.values_mut().filter(|v| **v == current) {
            *target = to.to_string();
        }
        self.batch_aliases.insert(current.clone(), to.to_string());

        self.record(StoreChange::BatchRekeyed {
            from: current,
            to: to.to_string(),
        });
        Ok(())
    }

    /// Evicts an item. Batch totals stay historical.
    pub fn remove(&mut self, id: &str) -> Result<OperationItem, StoreError> {
        let current = self
            .resolve(id)
            .ok_or_else(|| StoreError::MissingOperation(id.to_string()))?
            .clone();
        let item = self
            .records
            .remove(&current)
            .ok_or_else(|| StoreError::MissingOperation(current.clone()))?;

        remove_from(&mut self.by_booster, &item.booster_id, &current);
        if let Some(batch_id) = &item.batch_id {
            remove_from(&mut self.by_batch, batch_id, &current);
            if let Some(batch) = self.batches.get_mut(batch_id) {
                batch.evicted.push(item.status);
            }
        }
        if let Some(pos) = self.order.iter().position(|x| *x == current) {
            self.order.remove(pos);
        }
        self.retired.insert(current.clone());

        self.record(StoreChange::Removed {
            id: current,
            batch_id: item.batch_id.clone(),
        });
        Ok(item)
    }

    /// Current id for `id`, following local-id aliases.
    pub fn resolve(&self, id: &str) -> Option<&OperationId> {
        if let Some(rec) = self.records.get(id) {
            return Some(&rec.id);
        }
        self.aliases
            .get(id)
            .and_then(|target| self.records.get(target))
            .map(|rec| &rec.id)
    }

    /// Current batch id for `batch_id`, following local-id aliases.
    pub fn resolve_batch(&self, batch_id: &str) -> Option<&BatchId> {
        if let Some(batch) = self.batches.get(batch_id) {
            return Some(&batch.batch_id);
        }
        self.batch_aliases
            .get(batch_id)
            .and_then(|target| self.batches.get(target))
            .map(|batch| &batch.batch_id)
    }

    /// Item by local or backend id.
    pub fn get(&self, id: &str) -> Option<&OperationItem> {
        self.resolve(id).and_then(|current| self.records.get(current))
    }

    /// Owned copy of [`Self::get`].
    pub fn get_cloned(&self, id: &str) -> Option<OperationItem> {
        self.get(id).cloned()
    }

    /// Batch by local or backend id.
    pub fn get_batch(&self, batch_id: &str) -> Option<&Batch> {
        self.resolve_batch(batch_id)
            .and_then(|current| self.batches.get(current))
    }

    /// Items in insertion order.
    pub fn list(&self) -> Vec<&OperationItem> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .collect()
    }

    /// Owned copy of [`Self::list`].
    pub fn list_cloned(&self) -> Vec<OperationItem> {
        self.list().into_iter().cloned().collect()
    }

    /// Batches in creation order.
    pub fn batches(&self) -> Vec<&Batch> {
        self.batch_order
            .iter()
            .filter_map(|id| self.batches.get(id))
            .collect()
    }

    /// Items still in the store that belong to `batch_id`.
    pub fn batch_members(&self, batch_id: &str) -> Vec<&OperationItem> {
        let Some(current) = self.resolve_batch(batch_id) else {
            return Vec::new();
        };
        self.by_batch
            .get(current)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.records.get(id))
            .collect()
    }

    /// All items for `booster_id`, oldest first.
    pub fn by_booster(&self, booster_id: &str) -> Vec<&OperationItem> {
        self.by_booster
            .get(booster_id)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.records.get(id))
            .collect()
    }

    /// The `Queued` or `Processing` item targeting `booster_id`, if any.
    ///
    /// Items in `Error` do not count; the caller may resubmit the booster.
    pub fn active_for_booster(&self, booster_id: &str) -> Option<&OperationItem> {
        self.by_booster(booster_id)
            .into_iter()
            .find(|item| matches!(item.status, OperationStatus::Queued | OperationStatus::Processing))
    }

    /// Most recent batch member for `booster_id` still waiting for its backend id.
    pub fn awaiting_id_for_booster(&self, booster_id: &str) -> Option<&OperationItem> {
        self.by_booster(booster_id)
            .into_iter()
            .rev()
            .find(|item| item.submission == crate::operation::SubmissionState::AwaitingId)
    }

    /// Items currently held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no items are held.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Count of accepted mutations.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Takes the changes recorded since the last drain.
    pub fn drain_changes(&mut self) -> Vec<StoreChange> {
        std::mem::take(&mut self.pending_changes)
    }

    fn upsert_inner(&mut self, item: OperationItem, allow_terminal: bool) -> Result<bool, StoreError> {
        let Some(existing) = self.records.get(&item.id) else {
            return self.insert_standalone(item);
        };

        if *existing == item {
            return Ok(false);
        }
        if existing.is_terminal() && !allow_terminal && !same_lifecycle(existing, &item) {
            return Err(StoreError::TerminalLocked(item.id));
        }
        if existing.batch_id != item.batch_id || existing.booster_id != item.booster_id {
            return Err(StoreError::RetroactiveBatch {
                id: item.id,
                batch_id: item.batch_id,
            });
        }

        let change = StoreChange::Updated {
            id: item.id.clone(),
            batch_id: item.batch_id.clone(),
            status: item.status,
        };
        self.records.insert(item.id.clone(), item);
        self.record(change);
        Ok(true)
    }

    fn insert_standalone(&mut self, item: OperationItem) -> Result<bool, StoreError> {
        if self.id_in_use(&item.id) {
            return Err(StoreError::AlreadyExists(item.id));
        }
        if item.batch_id.is_some() {
            return Err(StoreError::RetroactiveBatch {
                id: item.id,
                batch_id: item.batch_id,
            });
        }

        let id = item.id.clone();
        self.insert_indices(&item);
        self.order.push(id.clone());
        self.records.insert(id.clone(), item);
        self.record(StoreChange::Inserted { id, batch_id: None });
        Ok(true)
    }

    /// True when `id` names a live item, a local alias or a removed item.
    pub fn id_in_use(&self, id: &str) -> bool {
        self.records.contains_key(id) || self.aliases.contains_key(id) || self.retired.contains(id)
    }

    fn insert_indices(&mut self, item: &OperationItem) {
        push_unique(&mut self.by_booster, &item.booster_id, &item.id);
        if let Some(batch_id) = &item.batch_id {
            push_unique(&mut self.by_batch, batch_id, &item.id);
        }
    }

    fn record(&mut self, change: StoreChange) {
        self.revision += 1;
        self.pending_changes.push(change);
    }
}

/// Compares the fields the state machine owns; submission and cancel markers are bookkeeping.
fn same_lifecycle(a: &OperationItem, b: &OperationItem) -> bool {
    a.status == b.status
        && a.progress == b.progress
        && a.error == b.error
        && a.started_at == b.started_at
        && a.completed_at == b.completed_at
        && a.last_event_timestamp == b.last_event_timestamp
}
