//! Shared primitive IDs, timestamps, and status enums.

use serde::{Deserialize, Serialize};

/// Operation identifier: local (`local-op-<n>`) until the backend assigns one.
pub type OperationId = String;
/// Batch identifier: local (`local-batch-<n>`) until the backend assigns one.
pub type BatchId = String;
/// Identifier of a booster (one optimization action).
pub type BoosterId = String;
/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;
/// Monotonic store revision, bumped on every accepted mutation.
pub type Revision = u64;

/// Lifecycle status of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Accepted locally, waiting for the backend to start it.
    Queued,
    /// Backend is running it.
    Processing,
    /// Completed successfully.
    Applied,
    /// Recoverable error; the caller may resubmit.
    Error,
    /// Non-recoverable failure.
    Failed,
    /// Cancelled by request or assumed cancelled after a timeout.
    Cancelled,
}

impl OperationStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Queued,
        Self::Processing,
        Self::Applied,
        Self::Error,
        Self::Failed,
        Self::Cancelled,
    ];

    /// True for `Applied`, `Failed` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Applied | Self::Failed | Self::Cancelled)
    }

    /// Lowercase wire spelling, as used in the event `Status` field.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Applied => "applied",
            Self::Error => "error",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses the wire spelling. Accepts `success` as an alias of `applied`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "processing" | "applying" => Some(Self::Processing),
            "applied" | "success" => Some(Self::Applied),
            "error" => Some(Self::Error),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Closed set of per-operation event types delivered by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// `booster.queued`
    Queued,
    /// `booster.processing`
    Processing,
    /// `booster.success`
    Success,
    /// `booster.error`
    Error,
    /// `booster.failed`
    Failed,
    /// `booster.cancelled`
    Cancelled,
}

impl EventKind {
    /// Wire name of this event type.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Queued => "booster.queued",
            Self::Processing => "booster.processing",
            Self::Success => "booster.success",
            Self::Error => "booster.error",
            Self::Failed => "booster.failed",
            Self::Cancelled => "booster.cancelled",
        }
    }

    /// Terminal outcomes the backend reports with authority.
    pub fn is_outcome(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

/// Wire name of the batch progress event.
pub const BATCH_QUEUED_EVENT: &str = "booster.batch_queued";

/// Wall-clock now in epoch milliseconds.
pub fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
