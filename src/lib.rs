//! Booster operation queue with event reconciliation.
//!
//! Operations are inserted optimistically, correlated with backend ids when
//! acknowledgments arrive, and driven through their lifecycle by backend
//! events that may be late, duplicated or out of order.
//!
//! # Examples
//!
//! Reconciling events directly against a [`core::store::QueueStateStore`]:
//! ```
//! use std::time::Instant;
//!
//! use boostq::{
//!     core::store::QueueStateStore,
//!     engine::reconciler::{Reconciler, ReconcilerConfig},
//!     event::OperationEvent,
//!     operation::OperationItem,
//!     types::{EventKind, OperationStatus},
//! };
//!
//! let mut store = QueueStateStore::new();
//! let local = store.next_operation_id();
//! store
//!     .upsert(OperationItem::queued(local.clone(), "fps-boost".into(), None, 0))
//!     .expect("queue");
//! store.rekey(&local, "op-1").expect("ack");
//!
//! let mut reconciler = Reconciler::new(ReconcilerConfig::default());
//! let now = Instant::now();
//! reconciler
//!     .apply(&mut store, OperationEvent::new("op-1", EventKind::Processing, 10).into(), now)
//!     .expect("processing");
//! reconciler
//!     .apply(&mut store, OperationEvent::new("op-1", EventKind::Success, 20).into(), now)
//!     .expect("success");
//! assert_eq!(store.get(&local).map(|i| i.status), Some(OperationStatus::Applied));
//! ```
//!
//! Runtime usage with a backend and a SQLite snapshot sink:
//! ```no_run
//! use std::sync::Arc;
//!
//! use boostq::{
//!     backend::BoosterBackend,
//!     persist::sqlite::SqliteSnapshotSink,
//!     runtime::handle::{spawn_controller, RuntimeConfig},
//! };
//!
//! # async fn run(backend: Arc<dyn BoosterBackend>) {
//! let sink = SqliteSnapshotSink::open("boostq.db").expect("open sqlite");
//! let store = sink.load_store().expect("restore");
//! let handle = spawn_controller(store, backend, Some(Box::new(sink)), RuntimeConfig::default());
//! let id = handle.submit("fps-boost").await.expect("submit");
//! handle
//!     .ingest_bytes(br#"{"EventType":"booster.processing","Timestamp":1,"OperationID":"op-1"}"#.to_vec())
//!     .await
//!     .expect("ingest");
//! let _item = handle.get_by_id(id).await.expect("query");
//! handle.shutdown().await.expect("shutdown");
//! # }
//! ```
#![warn(missing_docs)]

/// Backend operation API boundary.
pub mod backend;
/// Authoritative in-memory store and index helpers.
pub mod core;
/// Ingestion, reconciliation and progress aggregation.
pub mod engine;
/// Normalized events and raw wire payloads.
pub mod event;
/// Operation and batch records.
pub mod operation;
/// Snapshot persistence abstraction and SQLite implementation.
pub mod persist;
/// Single-writer controller handle and events.
pub mod runtime;
/// Shared primitive types and enums.
pub mod types;
