//! Snapshot persistence.

pub mod sqlite;

use thiserror::Error;

use crate::{core::store::StoreSnapshotV1, types::Revision};

/// Snapshot write or load failure.
#[derive(Debug, Error)]
pub enum PersistError {
    /// SQLite error.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Snapshot (de)serialization error.
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// Any other failure.
    #[error("{0}")]
    Message(String),
}

impl From<crate::core::store::StoreError> for PersistError {
    fn from(value: crate::core::store::StoreError) -> Self {
        Self::Message(format!("store error: {value}"))
    }
}

/// Result alias for persistence calls.
pub type PersistResult<T> = Result<T, PersistError>;

/// Destination for periodic store snapshots.
pub trait SnapshotSink: Send {
    /// Stores `snapshot` and returns its revision.
    fn write_snapshot(&mut self, snapshot: &StoreSnapshotV1) -> PersistResult<Revision>;
    /// Makes written snapshots durable.
    fn flush(&mut self) -> PersistResult<()> {
        Ok(())
    }
    /// Deletes snapshots older than `revision`; returns how many were removed.
    fn prune_before(&mut self, _revision: Revision) -> PersistResult<usize> {
        Ok(0)
    }
}
