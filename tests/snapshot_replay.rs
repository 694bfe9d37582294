use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tempfile::TempDir;

use boostq::{
    backend::{BackendError, BatchAck, BoosterBackend, CancelAck, SubmitAck},
    core::store::QueueStateStore,
    operation::{Batch, OperationItem},
    persist::{sqlite::SqliteSnapshotSink, SnapshotSink},
    runtime::{
        events::QueueEvent,
        handle::{spawn_controller, RuntimeConfig},
    },
    types::OperationStatus,
};

struct EchoBackend;

#[async_trait]
impl BoosterBackend for EchoBackend {
    async fn submit(&self, booster_id: &str) -> Result<SubmitAck, BackendError> {
        Ok(SubmitAck {
            operation_id: Some(format!("op-{booster_id}")),
            success: true,
            message: None,
        })
    }

    async fn submit_batch(&self, _booster_ids: &[String]) -> Result<BatchAck, BackendError> {
        Err(BackendError::Unreachable("batch endpoint offline".into()))
    }

    async fn cancel(&self, _operation_id: &str) -> Result<CancelAck, BackendError> {
        Ok(CancelAck { success: false })
    }
}

#[test]
fn sqlite_snapshot_round_trips_items_batches_and_aliases() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("queue.db");

    let mut store = QueueStateStore::new();
    let single = store.next_operation_id();
    store
        .upsert(OperationItem::queued(single.clone(), "fps-boost".into(), None, 1))
        .expect("insert");
    store.rekey(&single, "op-1").expect("rekey");

    let batch_id = store.next_batch_id();
    let members: Vec<OperationItem> = ["b1", "b2"]
        .iter()
        .map(|b| OperationItem::queued(store.next_operation_id(), b.to_string(), Some(batch_id.clone()), 2))
        .collect();
    let mut rejected = BTreeMap::new();
    rejected.insert("b3".to_string(), "AlreadyQueued".to_string());
    store
        .insert_batch(Batch::new(batch_id.clone(), "apply", 3, 2, rejected, 2), members)
        .expect("batch");
    store.rekey_batch(&batch_id, "batch-1").expect("rekey batch");

    let mut sink = SqliteSnapshotSink::open(&db_path).expect("open sqlite");
    let first = sink.write_snapshot(&store.export_snapshot()).expect("write");
    let mut item = store.get_cloned("op-1").expect("item");
    item.status = OperationStatus::Processing;
    store.upsert(item).expect("update");
    let second = sink.write_snapshot(&store.export_snapshot()).expect("write");
    sink.flush().expect("flush");
    assert!(second > first);
    assert_eq!(sink.latest_revision().expect("revision"), second);
    drop(sink);

    let mut reopened = SqliteSnapshotSink::open(&db_path).expect("reopen");
    let mut restored = reopened.load_store().expect("load");
    assert_eq!(restored.list_cloned(), store.list_cloned());
    assert_eq!(restored.get(&single).map(|i| i.status), Some(OperationStatus::Processing));
    let batch = restored.get_batch(&batch_id).expect("batch by local id");
    assert_eq!(batch.batch_id, "batch-1");
    assert_eq!(restored.batch_members("batch-1").len(), 2);

    let next = restored.next_operation_id();
    assert!(restored.get(&next).is_none());
    assert_ne!(next, single);

    assert_eq!(reopened.prune_before(second).expect("prune"), 1);
    assert_eq!(reopened.snapshot_count().expect("count"), 1);
}

#[test]
fn empty_database_loads_an_empty_store() {
    let sink = SqliteSnapshotSink::open_in_memory().expect("open");
    assert_eq!(sink.latest_revision().expect("revision"), 0);
    assert!(sink.load_store().expect("load").is_empty());
}

#[tokio::test]
async fn controller_checkpoints_and_auto_snapshots() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("runtime.db");
    let sink = SqliteSnapshotSink::open(&db_path).expect("open sqlite");
    let config = RuntimeConfig {
        snapshot_every_mutations: 2,
        ..RuntimeConfig::default()
    };
    let backend: Arc<dyn BoosterBackend> = Arc::new(EchoBackend);
    let handle = spawn_controller(QueueStateStore::new(), backend, Some(Box::new(sink)), config);
    let mut events = handle.subscribe();

    let local = handle.submit("fps-boost").await.expect("submit");
    let result = handle.submit_batch(["b1", "b2"]).await.expect("batch");

    let mut durable = false;
    for _ in 0..20 {
        let evt = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event")
            .expect("recv");
        if matches!(evt, QueueEvent::SnapshotWritten { .. }) {
            durable = true;
            break;
        }
    }
    assert!(durable, "expected an automatic snapshot");

    for id in &result.operation_ids {
        for _ in 0..100 {
            let item = handle.get_by_id(id.as_str()).await.expect("get").expect("item");
            if item.status == OperationStatus::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
    let revision = handle.checkpoint().await.expect("checkpoint");
    handle.shutdown().await.expect("shutdown");

    let reopened = SqliteSnapshotSink::open(&db_path).expect("reopen");
    assert_eq!(reopened.latest_revision().expect("revision"), revision);
    let restored = reopened.load_store().expect("load");
    assert!(restored.get(&local).is_some());
    for id in &result.operation_ids {
        let item = restored.get(id).expect("member");
        assert_eq!(item.status, OperationStatus::Failed);
        assert!(item.error.as_ref().is_some_and(|e| e.message.contains("offline")));
    }
}
