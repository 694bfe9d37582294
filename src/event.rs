//! Normalized reconciler input and raw backend payloads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{BatchId, BoosterId, EventKind, OperationId, OperationStatus, Timestamp};

/// Per-operation status event after normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationEvent {
    /// Backend operation id.
    pub operation_id: OperationId,
    /// Event type.
    pub kind: EventKind,
    /// Backend timestamp, the ordering oracle.
    pub timestamp: Timestamp,
    /// Booster the event refers to, used to correlate batch members.
    pub booster_id: Option<BoosterId>,
    /// Status the backend claims, if sent.
    pub status: Option<OperationStatus>,
    /// Progress percent, if sent.
    pub progress: Option<u8>,
    /// Error message, if sent.
    pub error: Option<String>,
    /// Completion time reported by the backend.
    pub end_at: Option<Timestamp>,
    /// Backend queue depth at emission.
    pub queue_size: Option<u32>,
    /// May replace a locally assumed terminal state.
    pub authoritative: bool,
}

impl OperationEvent {
    /// Minimal event; outcome events are authoritative.
    pub fn new(operation_id: impl Into<OperationId>, kind: EventKind, timestamp: Timestamp) -> Self {
        Self {
            operation_id: operation_id.into(),
            kind,
            timestamp,
            booster_id: None,
            status: None,
            progress: None,
            error: None,
            end_at: None,
            queue_size: None,
            authoritative: kind.is_outcome() || kind == EventKind::Cancelled,
        }
    }

    /// Sets the booster id.
    pub fn with_booster(mut self, booster_id: impl Into<BoosterId>) -> Self {
        self.booster_id = Some(booster_id.into());
        self
    }

    /// Sets the progress percent.
    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Sets the error message.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Batch progress event after normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchQueuedEvent {
    /// Backend batch id.
    pub batch_id: BatchId,
    /// Operation type label.
    pub operation_type: String,
    /// Backend timestamp.
    pub timestamp: Timestamp,
    /// Requested size as seen by the backend.
    pub total_count: u32,
    /// Accepted size as seen by the backend.
    pub queued_count: u32,
    /// Backend-side rejections.
    pub validation_errors: BTreeMap<BoosterId, String>,
    /// Backend queue depth at emission.
    pub queue_size: Option<u32>,
}

/// Closed set of events the reconciler accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormalizedEvent {
    /// Targets one operation.
    Operation(OperationEvent),
    /// Targets one batch.
    BatchQueued(BatchQueuedEvent),
}

impl NormalizedEvent {
    /// Backend timestamp of the event.
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Self::Operation(ev) => ev.timestamp,
            Self::BatchQueued(ev) => ev.timestamp,
        }
    }
}

impl From<OperationEvent> for NormalizedEvent {
    fn from(value: OperationEvent) -> Self {
        Self::Operation(value)
    }
}

impl From<BatchQueuedEvent> for NormalizedEvent {
    fn from(value: BatchQueuedEvent) -> Self {
        Self::BatchQueued(value)
    }
}

/// Timestamp as sent on the wire: epoch milliseconds or RFC 3339 text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    /// Milliseconds since the Unix epoch.
    Millis(u64),
    /// RFC 3339 date-time.
    Text(String),
}

/// Raw event payload, union of the per-operation and batch field sets.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawEventPayload {
    /// Event type name, e.g. `booster.processing`.
    pub event_type: String,
    /// Emission time.
    pub timestamp: Option<RawTimestamp>,
    /// Operation type label.
    #[serde(default)]
    pub operation_type: Option<String>,
    /// Operation id (per-operation events).
    #[serde(default, rename = "OperationID")]
    pub operation_id: Option<String>,
    /// Booster id (per-operation events).
    #[serde(default, rename = "BoosterID")]
    pub booster_id: Option<String>,
    /// Status text.
    #[serde(default)]
    pub status: Option<String>,
    /// Completion time.
    #[serde(default)]
    pub end_at: Option<RawTimestamp>,
    /// Error message.
    #[serde(default)]
    pub error: Option<String>,
    /// Progress percent.
    #[serde(default)]
    pub progress: Option<u32>,
    /// Backend queue depth.
    #[serde(default)]
    pub queue_size: Option<u32>,
    /// Batch id (batch events).
    #[serde(default, rename = "BatchID")]
    pub batch_id: Option<String>,
    /// Requested batch size.
    #[serde(default)]
    pub total_count: Option<u32>,
    /// Accepted batch size.
    #[serde(default)]
    pub queued_count: Option<u32>,
    /// Backend-side rejections.
    #[serde(default)]
    pub validation_errors: Option<BTreeMap<String, String>>,
}
