//! Boundary to the backend operation API.
//!
//! The transport (HTTP, IPC, ...) lives outside this crate; implementors of
//! [`BoosterBackend`] adapt it. Event payloads arrive separately through
//! [`crate::runtime::handle::ControllerHandle::ingest_bytes`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{BatchId, BoosterId, OperationId};

/// Transport-level failure talking to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Backend could not be reached.
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    /// Any other transport failure.
    #[error("backend error: {0}")]
    Message(String),
}

/// Reply to a single submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitAck {
    /// Backend-assigned id; absent when rejected.
    pub operation_id: Option<OperationId>,
    /// Whether the backend accepted the submission.
    pub success: bool,
    /// Rejection reason or informational text.
    pub message: Option<String>,
}

/// Reply to a batch submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchAck {
    /// Backend-assigned batch id; absent when rejected.
    pub batch_id: Option<BatchId>,
    /// Whether the backend accepted the batch.
    pub success: bool,
    /// Backend-side rejections, booster id to reason.
    pub validation_errors: BTreeMap<BoosterId, String>,
}

/// Reply to a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelAck {
    /// Whether the backend accepted the cancellation request.
    pub success: bool,
}

/// Backend operation API consumed by the controller.
#[async_trait]
pub trait BoosterBackend: Send + Sync + 'static {
    async fn submit(&self, booster_id: &str) -> Result<SubmitAck, BackendError>;
    async fn submit_batch(&self, booster_ids: &[BoosterId]) -> Result<BatchAck, BackendError>;
    async fn cancel(&self, operation_id: &str) -> Result<CancelAck, BackendError>;
}
