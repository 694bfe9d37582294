//! Operation and batch records held by the queue store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{BatchId, BoosterId, OperationId, OperationStatus, Timestamp};

/// Where an error recorded on an item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Backend rejected or could not be reached at submit time.
    Submission,
    /// Recoverable error reported by `booster.error`.
    Recoverable,
    /// Non-recoverable failure reported by `booster.failed`.
    Fatal,
}

/// Error message attached to an item in `Error` or `Failed` status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    /// Error origin.
    pub class: ErrorClass,
    /// Human readable message.
    pub message: String,
}

/// Progress of the two-phase create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmissionState {
    /// Backend acknowledgment not received yet.
    Pending,
    /// Acknowledged as part of a batch; the backend id arrives with the first event.
    AwaitingId,
    /// Backend id attached.
    Confirmed,
}

/// Cancellation bookkeeping for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CancelState {
    /// No cancellation requested.
    #[default]
    None,
    /// Cancellation sent, waiting for `booster.cancelled` or the timeout.
    Requested,
    /// Timed out; `Cancelled` was applied locally and may be overridden.
    Assumed,
}

/// One submitted booster action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationItem {
    /// Current identifier (backend id once correlated).
    pub id: OperationId,
    /// Identifier allocated at optimistic insert.
    pub local_id: OperationId,
    /// Booster being applied.
    pub booster_id: BoosterId,
    /// Owning batch, fixed at creation.
    pub batch_id: Option<BatchId>,
    /// Lifecycle status.
    pub status: OperationStatus,
    /// Percent complete, 0..=100.
    pub progress: u8,
    /// Present only in `Error` or `Failed`.
    pub error: Option<ItemError>,
    /// Set when the item was queued.
    pub created_at: Timestamp,
    /// Set on first `Processing`.
    pub started_at: Option<Timestamp>,
    /// Set on reaching a terminal status.
    pub completed_at: Option<Timestamp>,
    /// Timestamp of the most recently accepted backend event.
    pub last_event_timestamp: Option<Timestamp>,
    /// Two-phase create progress.
    pub submission: SubmissionState,
    /// Cancellation bookkeeping.
    pub cancel: CancelState,
}

impl OperationItem {
    /// Builds a fresh optimistic `Queued` item.
    pub fn queued(
        local_id: OperationId,
        booster_id: BoosterId,
        batch_id: Option<BatchId>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: local_id.clone(),
            local_id,
            booster_id,
            batch_id,
            status: OperationStatus::Queued,
            progress: 0,
            error: None,
            created_at,
            started_at: None,
            completed_at: None,
            last_event_timestamp: None,
            submission: SubmissionState::Pending,
            cancel: CancelState::None,
        }
    }

    /// True once the item can no longer transition (override aside).
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True when the terminal `Cancelled` was assumed locally after a timeout.
    pub fn is_locally_assumed(&self) -> bool {
        self.status == OperationStatus::Cancelled && self.cancel == CancelState::Assumed
    }

    /// True while the item still carries its local id.
    pub fn is_provisional(&self) -> bool {
        self.submission != SubmissionState::Confirmed
    }
}

/// A set of operations submitted together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Current identifier (backend id once acknowledged).
    pub batch_id: BatchId,
    /// Identifier allocated at submit.
    pub local_id: BatchId,
    /// Operation type label reported by the backend.
    pub operation_type: String,
    /// Requested size.
    pub total_count: u32,
    /// Members accepted after local validation.
    pub queued_count: u32,
    /// Queued count last reported by `booster.batch_queued`.
    pub reported_queued_count: Option<u32>,
    /// Rejected booster id to reason.
    pub validation_errors: BTreeMap<BoosterId, String>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Timestamp of the most recently accepted batch event.
    pub last_event_timestamp: Option<Timestamp>,
    /// Members removed from the store, tallied by their last status.
    pub evicted: Vec<OperationStatus>,
}

impl Batch {
    /// Builds a batch record from local validation results.
    pub fn new(
        local_id: BatchId,
        operation_type: impl Into<String>,
        total_count: u32,
        queued_count: u32,
        validation_errors: BTreeMap<BoosterId, String>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            batch_id: local_id.clone(),
            local_id,
            operation_type: operation_type.into(),
            total_count,
            queued_count,
            reported_queued_count: None,
            validation_errors,
            created_at,
            last_event_timestamp: None,
            evicted: Vec::new(),
        }
    }
}
