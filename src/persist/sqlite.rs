//! SQLite-backed snapshot sink.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::{
    core::store::{QueueStateStore, StoreSnapshotV1},
    types::{now_ms, Revision},
};

use super::{PersistError, PersistResult, SnapshotSink};

const SNAPSHOT_FORMAT_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotEnvelope {
    format_version: u16,
    snapshot: StoreSnapshotV1,
}

/// SQLite implementation of [`crate::persist::SnapshotSink`].
pub struct SqliteSnapshotSink {
    conn: Connection,
}

impl SqliteSnapshotSink {
    /// Opens or creates a SQLite-backed sink at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory SQLite sink.
    pub fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> PersistResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }

    /// Restores the store from the latest snapshot, or an empty store.
    pub fn load_store(&self) -> PersistResult<QueueStateStore> {
        match self.load_latest_snapshot()? {
            Some(snapshot) => Ok(QueueStateStore::from_snapshot(snapshot)?),
            None => Ok(QueueStateStore::new()),
        }
    }

    /// Highest revision written so far.
    pub fn latest_revision(&self) -> PersistResult<Revision> {
        let revision: Option<i64> = self
            .conn
            .query_row("SELECT MAX(revision) FROM snapshots", [], |row| row.get::<_, Option<i64>>(0))
            .optional()?
            .flatten();
        Ok(revision.unwrap_or(0) as Revision)
    }

    /// Number of snapshots kept.
    pub fn snapshot_count(&self) -> PersistResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn load_latest_snapshot(&self) -> PersistResult<Option<StoreSnapshotV1>> {
        let payload: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT payload FROM snapshots ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        let env: SnapshotEnvelope = serde_json::from_slice(&payload)?;
        if env.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(PersistError::Message(format!(
                "unsupported snapshot format: {}",
                env.format_version
            )));
        }
        Ok(Some(env.snapshot))
    }
}

impl SnapshotSink for SqliteSnapshotSink {
    fn write_snapshot(&mut self, snapshot: &StoreSnapshotV1) -> PersistResult<Revision> {
        let env = SnapshotEnvelope {
            format_version: SNAPSHOT_FORMAT_VERSION,
            snapshot: snapshot.clone(),
        };
        let payload = serde_json::to_vec(&env)?;
        self.conn.execute(
            "INSERT INTO snapshots(revision, ts_ms, item_count, payload) VALUES (?1, ?2, ?3, ?4)",
            params![
                snapshot.revision as i64,
                now_ms() as i64,
                snapshot.items.len() as i64,
                payload
            ],
        )?;
        Ok(snapshot.revision)
    }

    fn flush(&mut self) -> PersistResult<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }

    fn prune_before(&mut self, revision: Revision) -> PersistResult<usize> {
        let count = self
            .conn
            .execute("DELETE FROM snapshots WHERE revision < ?1", params![revision as i64])?;
        Ok(count)
    }
}
