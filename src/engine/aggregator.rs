use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::{
    core::store::{QueueStateStore, StoreChange},
    types::{BatchId, OperationStatus},
};

/// Settled members of a batch, by terminal status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    /// `Applied` members.
    pub applied: u32,
    /// `Failed` members.
    pub failed: u32,
    /// `Cancelled` members.
    pub cancelled: u32,
    /// Members evicted from the store before settling on their own.
    pub evicted: u32,
}

impl OutcomeCounts {
    /// Members counted towards completion.
    pub fn settled(&self) -> u32 {
        self.applied + self.failed + self.cancelled + self.evicted
    }

    fn add(&mut self, status: OperationStatus) -> bool {
        match status {
            OperationStatus::Applied => self.applied += 1,
            OperationStatus::Failed => self.failed += 1,
            OperationStatus::Cancelled => self.cancelled += 1,
            _ => return false,
        }
        true
    }
}

/// Derived progress of one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    /// Batch id.
    pub batch_id: BatchId,
    /// Requested size.
    pub total_count: u32,
    /// Accepted members.
    pub queued_count: u32,
    /// Members that reached any terminal status.
    pub settled_count: u32,
    /// `settled_count * 100 / queued_count`, floored. 100 for an empty batch.
    pub percent: u8,
    /// Terminal outcome breakdown.
    pub outcome: OutcomeCounts,
}

impl BatchProgress {
    /// True once every accepted member has settled.
    pub fn is_done(&self) -> bool {
        self.settled_count >= self.queued_count
    }
}

/// Item counts per status across the whole store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryCounts {
    /// `Queued` items.
    pub queued: u32,
    /// `Processing` items.
    pub processing: u32,
    /// `Applied` items.
    pub applied: u32,
    /// `Error` items.
    pub error: u32,
    /// `Failed` items.
    pub failed: u32,
    /// `Cancelled` items.
    pub cancelled: u32,
}

impl SummaryCounts {
    /// Items across all statuses.
    pub fn total(&self) -> u32 {
        self.queued + self.processing + self.applied + self.error + self.failed + self.cancelled
    }

    /// Count for one status.
    pub fn count(&self, status: OperationStatus) -> u32 {
        match status {
            OperationStatus::Queued => self.queued,
            OperationStatus::Processing => self.processing,
            OperationStatus::Applied => self.applied,
            OperationStatus::Error => self.error,
            OperationStatus::Failed => self.failed,
            OperationStatus::Cancelled => self.cancelled,
        }
    }

    fn bump(&mut self, status: OperationStatus) {
        let slot = match status {
            OperationStatus::Queued => &mut self.queued,
            OperationStatus::Processing => &mut self.processing,
            OperationStatus::Applied => &mut self.applied,
            OperationStatus::Error => &mut self.error,
            OperationStatus::Failed => &mut self.failed,
            OperationStatus::Cancelled => &mut self.cancelled,
        };
        *slot += 1;
    }
}

/// Keeps batch progress and summary counts in step with the store.
#[derive(Debug, Default)]
pub struct ProgressAggregator {
    batches: HashMap<BatchId, BatchProgress>,
    summary: SummaryCounts,
}

impl ProgressAggregator {
    /// Empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregator fully computed from `store`.
    pub fn from_store(store: &QueueStateStore) -> Self {
        let mut agg = Self::new();
        for batch in store.batches() {
            agg.recompute_batch(store, &batch.batch_id);
        }
        agg.recompute_summary(store);
        agg
    }

    /// Recomputes everything `changes` touched. Returns the batches whose progress changed.
    pub fn apply_changes(&mut self, store: &QueueStateStore, changes: &[StoreChange]) -> Vec<BatchProgress> {
        let mut touched: Vec<BatchId> = Vec::new();
        let mut status_changed = false;
        for change in changes {
            let batch_id = match change {
                StoreChange::Inserted { batch_id, .. }
                | StoreChange::Updated { batch_id, .. }
                | StoreChange::Removed { batch_id, .. } => {
                    status_changed = true;
                    batch_id.clone()
                }
                StoreChange::BatchCreated { batch_id } | StoreChange::BatchUpdated { batch_id } => {
                    Some(batch_id.clone())
                }
                StoreChange::BatchRekeyed { from, to } => {
                    self.batches.remove(from);
                    Some(to.clone())
                }
                StoreChange::Rekeyed { .. } => None,
            };
            if let Some(batch_id) = batch_id.and_then(|b| store.resolve_batch(&b).cloned()) {
                if !touched.contains(&batch_id) {
                    touched.push(batch_id);
                }
            }
        }

        if status_changed {
            self.recompute_summary(store);
        }
        touched
            .into_iter()
            .filter_map(|batch_id| {
                let before = self.batches.get(&batch_id).cloned();
                let after = self.recompute_batch(store, &batch_id)?;
                (before.as_ref() != Some(&after)).then_some(after)
            })
            .collect()
    }

    /// Progress of `batch_id`, following local-id aliases.
    pub fn batch_progress(&self, store: &QueueStateStore, batch_id: &str) -> Option<BatchProgress> {
        let current = store.resolve_batch(batch_id)?;
        self.batches.get(current).cloned()
    }

    /// Current per-status counts.
    pub fn summary(&self) -> SummaryCounts {
        self.summary
    }

    fn recompute_batch(&mut self, store: &QueueStateStore, batch_id: &str) -> Option<BatchProgress> {
        let Some(batch) = store.get_batch(batch_id) else {
            self.batches.remove(batch_id);
            return None;
        };

        let mut outcome = OutcomeCounts::default();
        for member in store.batch_members(batch_id) {
            outcome.add(member.status);
        }
        for status in &batch.evicted {
            if !outcome.add(*status) {
                outcome.evicted += 1;
            }
        }

        let settled_count = outcome.settled();
        let percent = if batch.queued_count == 0 {
            100
        } else {
            (u64::from(settled_count.min(batch.queued_count)) * 100 / u64::from(batch.queued_count)) as u8
        };
        let progress = BatchProgress {
            batch_id: batch.batch_id.clone(),
            total_count: batch.total_count,
            queued_count: batch.queued_count,
            settled_count,
            percent,
            outcome,
        };
        self.batches.insert(batch.batch_id.clone(), progress.clone());
        Some(progress)
    }

    fn recompute_summary(&mut self, store: &QueueStateStore) {
        let mut summary = SummaryCounts::default();
        for item in store.list() {
            summary.bump(item.status);
        }
        self.summary = summary;
    }
}
