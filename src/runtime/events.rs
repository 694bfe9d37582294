//! Notifications broadcast to subscribers after accepted mutations.

use crate::{
    engine::aggregator::BatchProgress,
    types::{BatchId, OperationId, OperationStatus, Revision},
};

/// Events emitted from the single-writer controller loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// A new operation was queued.
    OperationAdded {
        /// Operation id.
        id: OperationId,
    },
    /// An operation changed.
    OperationUpdated {
        /// Operation id.
        id: OperationId,
        /// Status after the change.
        status: OperationStatus,
    },
    /// An operation received its backend id.
    OperationRekeyed {
        /// Previous id, still resolvable.
        from: OperationId,
        /// Backend id.
        to: OperationId,
    },
    /// An operation was evicted.
    OperationRemoved {
        /// Operation id.
        id: OperationId,
    },
    /// A batch was created.
    BatchCreated {
        /// Batch id.
        batch_id: BatchId,
    },
    /// A batch received its backend id.
    BatchRekeyed {
        /// Previous id, still resolvable.
        from: BatchId,
        /// Backend id.
        to: BatchId,
    },
    /// Batch progress was recomputed and changed.
    BatchProgress(BatchProgress),
    /// A snapshot covering this revision was persisted.
    SnapshotWritten {
        /// Store revision in the snapshot.
        revision: Revision,
    },
}
