use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::json;

use boostq::{
    backend::{BackendError, BatchAck, BoosterBackend, CancelAck, SubmitAck},
    core::store::QueueStateStore,
    engine::reconciler::{ApplyOutcome, DiagnosticKind},
    operation::{CancelState, ErrorClass, OperationItem, SubmissionState},
    runtime::{
        events::QueueEvent,
        handle::{spawn_controller, ControllerHandle, RuntimeConfig, RuntimeError, ValidationError},
    },
    types::OperationStatus,
};

#[derive(Default)]
struct Script {
    next_op: u32,
    next_batch: u32,
    submit_delay: Duration,
    rejected: HashSet<String>,
    batch_rejections: BTreeMap<String, String>,
    cancel_calls: Vec<String>,
    refuse_cancels: bool,
}

#[derive(Default)]
struct ScriptedBackend {
    script: Mutex<Script>,
}

impl ScriptedBackend {
    fn with_delay(delay: Duration) -> Self {
        let backend = Self::default();
        backend.script.lock().expect("lock").submit_delay = delay;
        backend
    }

    fn cancel_calls(&self) -> Vec<String> {
        self.script.lock().expect("lock").cancel_calls.clone()
    }
}

#[async_trait]
impl BoosterBackend for ScriptedBackend {
    async fn submit(&self, booster_id: &str) -> Result<SubmitAck, BackendError> {
        let delay = self.script.lock().expect("lock").submit_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.script.lock().expect("lock");
        if script.rejected.contains(booster_id) {
            return Ok(SubmitAck {
                operation_id: None,
                success: false,
                message: Some(format!("{booster_id} is not supported on this system")),
            });
        }
        script.next_op += 1;
        Ok(SubmitAck {
            operation_id: Some(format!("op-{}", script.next_op)),
            success: true,
            message: None,
        })
    }

    async fn submit_batch(&self, _booster_ids: &[String]) -> Result<BatchAck, BackendError> {
        let mut script = self.script.lock().expect("lock");
        script.next_batch += 1;
        Ok(BatchAck {
            batch_id: Some(format!("batch-{}", script.next_batch)),
            success: true,
            validation_errors: script.batch_rejections.clone(),
        })
    }

    async fn cancel(&self, operation_id: &str) -> Result<CancelAck, BackendError> {
        let mut script = self.script.lock().expect("lock");
        script.cancel_calls.push(operation_id.to_string());
        Ok(CancelAck {
            success: !script.refuse_cancels,
        })
    }
}

fn spawn(backend: &Arc<ScriptedBackend>, config: RuntimeConfig) -> ControllerHandle {
    let backend: Arc<dyn BoosterBackend> = backend.clone();
    spawn_controller(QueueStateStore::new(), backend, None, config)
}

fn event(kind: &str, ts: u64, operation_id: &str, booster_id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "EventType": kind,
        "Timestamp": ts,
        "OperationType": "apply",
        "OperationID": operation_id,
        "BoosterID": booster_id,
        "QueueSize": 1,
    }))
    .expect("encode")
}

async fn wait_for<F>(handle: &ControllerHandle, id: &str, pred: F) -> OperationItem
where
    F: Fn(&OperationItem) -> bool,
{
    for _ in 0..200 {
        if let Some(item) = handle.get_by_id(id).await.expect("get") {
            if pred(&item) {
                return item;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("operation {id} never reached the expected state");
}

#[tokio::test(start_paused = true)]
async fn single_submit_runs_to_applied_and_ignores_duplicates() {
    let backend = Arc::new(ScriptedBackend::default());
    let handle = spawn(&backend, RuntimeConfig::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sub = handle.subscribe_with({
        let seen = Arc::clone(&seen);
        move |evt| seen.lock().expect("lock").push(evt)
    });

    let local = handle.submit("fps-boost").await.expect("submit");
    let item = handle.get_by_id(local.as_str()).await.expect("get").expect("item");
    assert_eq!((item.status, item.progress), (OperationStatus::Queued, 0));

    wait_for(&handle, &local, |i| i.id == "op-1").await;

    let mut processing: serde_json::Value =
        serde_json::from_slice(&event("booster.processing", 10, "op-1", "fps-boost")).expect("json");
    processing["Status"] = json!("processing");
    let out = handle
        .ingest_bytes(serde_json::to_vec(&processing).expect("encode"))
        .await
        .expect("processing");
    assert_eq!(
        out,
        ApplyOutcome::Applied {
            id: "op-1".into(),
            from: OperationStatus::Queued,
            to: OperationStatus::Processing,
        }
    );

    handle
        .ingest_bytes(event("booster.success", 20, "op-1", "fps-boost"))
        .await
        .expect("success");
    let item = handle.get_by_id(local.as_str()).await.expect("get").expect("item");
    assert_eq!((item.status, item.progress), (OperationStatus::Applied, 100));

    let dup = handle
        .ingest_bytes(event("booster.success", 20, "op-1", "fps-boost"))
        .await
        .expect("duplicate");
    assert_eq!(dup, ApplyOutcome::Discarded(DiagnosticKind::Stale { last_accepted: 20 }));

    tokio::time::sleep(Duration::from_millis(10)).await;
    {
        let seen = seen.lock().expect("lock");
        assert_eq!(seen.first(), Some(&QueueEvent::OperationAdded { id: local.clone() }));
        assert!(seen.contains(&QueueEvent::OperationRekeyed {
            from: local.clone(),
            to: "op-1".into(),
        }));
        assert!(seen.contains(&QueueEvent::OperationUpdated {
            id: "op-1".into(),
            status: OperationStatus::Applied,
        }));
    }

    sub.unsubscribe();
    let before = seen.lock().expect("lock").len();
    handle.submit("ram-trim").await.expect("submit");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(seen.lock().expect("lock").len(), before);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn batch_rejects_in_flight_booster_and_tracks_members() {
    let backend = Arc::new(ScriptedBackend::default());
    let handle = spawn(&backend, RuntimeConfig::default());

    let b3 = handle.submit("b3").await.expect("submit");
    wait_for(&handle, &b3, |i| i.id == "op-1").await;

    let result = handle
        .submit_batch(["b1", "b2", "b3", "b1"])
        .await
        .expect("batch");
    assert_eq!((result.total_count, result.queued_count), (3, 2));
    assert_eq!(result.operation_ids.len(), 2);
    assert_eq!(
        result.validation_errors.get("b3").map(String::as_str),
        Some("AlreadyQueued")
    );

    for id in &result.operation_ids {
        wait_for(&handle, id, |i| i.submission == SubmissionState::AwaitingId).await;
    }
    let batch = handle
        .get_batch(result.batch_id.as_str())
        .await
        .expect("get")
        .expect("batch");
    assert_eq!(batch.batch_id, "batch-1");
    assert_eq!(batch.local_id, result.batch_id);

    handle
        .ingest_bytes(event("booster.processing", 10, "op-b1", "b1"))
        .await
        .expect("processing");
    let first = handle
        .get_by_id(result.operation_ids[0].as_str())
        .await
        .expect("get")
        .expect("item");
    assert_eq!(first.id, "op-b1");
    assert_eq!(first.status, OperationStatus::Processing);

    handle
        .ingest_bytes(event("booster.success", 20, "op-b1", "b1"))
        .await
        .expect("success");
    let progress = handle
        .get_batch_progress("batch-1")
        .await
        .expect("progress")
        .expect("batch");
    assert_eq!(progress.percent, 50);
    assert!(!progress.is_done());

    handle
        .ingest_bytes(event("booster.failed", 15, "op-b2", "b2"))
        .await
        .expect("failed");
    let progress = handle
        .get_batch_progress(result.batch_id.as_str())
        .await
        .expect("progress")
        .expect("batch");
    assert_eq!(progress.percent, 100);
    assert_eq!((progress.outcome.applied, progress.outcome.failed), (1, 1));

    let batch_event = serde_json::to_vec(&json!({
        "EventType": "booster.batch_queued",
        "Timestamp": 5,
        "BatchID": "batch-1",
        "OperationType": "apply",
        "TotalCount": 3,
        "QueuedCount": 2,
        "ValidationErrors": { "b3": "AlreadyQueued" },
        "QueueSize": 2,
    }))
    .expect("encode");
    let out = handle.ingest_bytes(batch_event).await.expect("batch event");
    assert_eq!(out, ApplyOutcome::BatchUpdated { batch_id: "batch-1".into() });
    let batch = handle.get_batch("batch-1").await.expect("get").expect("batch");
    assert_eq!(batch.reported_queued_count, Some(2));
    assert_eq!((batch.total_count, batch.queued_count), (3, 2));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn assumed_cancellation_is_overridden_by_late_success() {
    let backend = Arc::new(ScriptedBackend::default());
    let handle = spawn(&backend, RuntimeConfig::default());

    let local = handle.submit("fps-boost").await.expect("submit");
    wait_for(&handle, &local, |i| i.id == "op-1").await;
    handle
        .ingest_bytes(event("booster.processing", 10, "op-1", "fps-boost"))
        .await
        .expect("processing");

    handle.cancel(local.as_str()).await.expect("cancel");
    handle.cancel("op-1").await.expect("second cancel is a no-op");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(backend.cancel_calls(), vec!["op-1".to_string()]);

    tokio::time::sleep(Duration::from_millis(3_100)).await;
    let item = wait_for(&handle, "op-1", |i| i.status == OperationStatus::Cancelled).await;
    assert_eq!(item.cancel, CancelState::Assumed);
    assert!(matches!(
        handle.cancel("op-1").await,
        Err(RuntimeError::InvalidState {
            status: OperationStatus::Cancelled,
            ..
        })
    ));

    let out = handle
        .ingest_bytes(event("booster.success", 30, "op-1", "fps-boost"))
        .await
        .expect("late success");
    assert_eq!(
        out,
        ApplyOutcome::Overridden {
            id: "op-1".into(),
            from: OperationStatus::Cancelled,
            to: OperationStatus::Applied,
        }
    );
    let item = handle.get_by_id(local.as_str()).await.expect("get").expect("item");
    assert_eq!((item.status, item.progress), (OperationStatus::Applied, 100));
    assert_eq!(item.cancel, CancelState::None);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn event_before_ack_is_replayed_and_orphans_expire() {
    let backend = Arc::new(ScriptedBackend::with_delay(Duration::from_millis(200)));
    let handle = spawn(&backend, RuntimeConfig::default());

    let local = handle.submit("ram-trim").await.expect("submit");
    let early = handle
        .ingest_bytes(event("booster.processing", 10, "op-1", "ram-trim"))
        .await
        .expect("early event");
    assert_eq!(early, ApplyOutcome::Buffered);

    let item = wait_for(&handle, &local, |i| i.status == OperationStatus::Processing).await;
    assert_eq!(item.id, "op-1");
    assert_eq!(item.last_event_timestamp, Some(10));

    let orphan = handle
        .ingest_bytes(event("booster.processing", 5, "op-ghost", "nobody"))
        .await
        .expect("orphan");
    assert_eq!(orphan, ApplyOutcome::Buffered);
    tokio::time::sleep(Duration::from_millis(5_100)).await;

    let diagnostics = handle.diagnostics().await.expect("diagnostics");
    assert!(diagnostics.iter().any(|d| {
        d.kind == DiagnosticKind::Expired && d.operation_id.as_deref() == Some("op-ghost")
    }));
    assert!(handle.get_by_id("op-ghost").await.expect("get").is_none());

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn duplicate_failure_after_failed_is_a_diagnostic_only() {
    let backend = Arc::new(ScriptedBackend::default());
    let handle = spawn(&backend, RuntimeConfig::default());

    let local = handle.submit("disk-clean").await.expect("submit");
    wait_for(&handle, &local, |i| i.id == "op-1").await;
    handle
        .ingest_bytes(event("booster.processing", 10, "op-1", "disk-clean"))
        .await
        .expect("processing");

    let mut failed: serde_json::Value =
        serde_json::from_slice(&event("booster.failed", 20, "op-1", "disk-clean")).expect("json");
    failed["Error"] = json!("disk busy");
    let failed = serde_json::to_vec(&failed).expect("encode");
    handle.ingest_bytes(failed.clone()).await.expect("failed");
    let out = handle.ingest_bytes(failed).await.expect("duplicate");
    assert_eq!(out, ApplyOutcome::Discarded(DiagnosticKind::Stale { last_accepted: 20 }));

    let item = handle.get_by_id("op-1").await.expect("get").expect("item");
    assert_eq!(item.status, OperationStatus::Failed);
    let error = item.error.expect("error");
    assert_eq!((error.class, error.message.as_str()), (ErrorClass::Fatal, "disk busy"));

    let diagnostics = handle.diagnostics().await.expect("diagnostics");
    assert!(diagnostics
        .iter()
        .any(|d| matches!(d.kind, DiagnosticKind::Stale { .. }) && d.operation_id.as_deref() == Some("op-1")));
    assert_eq!(handle.summary().await.expect("summary").failed, 1);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn local_validation_never_touches_the_store() {
    let backend = Arc::new(ScriptedBackend::default());
    let config = RuntimeConfig {
        known_boosters: Some(vec!["fps-boost".into(), "ram-trim".into()]),
        ..RuntimeConfig::default()
    };
    let handle = spawn(&backend, config);

    handle.submit("fps-boost").await.expect("submit");
    assert!(matches!(
        handle.submit("fps-boost").await,
        Err(RuntimeError::Validation(ValidationError::AlreadyQueued { booster_id, .. })) if booster_id == "fps-boost"
    ));
    assert!(matches!(
        handle.submit("warp-drive").await,
        Err(RuntimeError::Validation(ValidationError::UnknownBooster(_)))
    ));
    assert!(matches!(
        handle.submit_batch(Vec::<String>::new()).await,
        Err(RuntimeError::Validation(ValidationError::EmptyBatch))
    ));

    let result = handle
        .submit_batch(["warp-drive", "fps-boost"])
        .await
        .expect("batch");
    assert_eq!((result.total_count, result.queued_count), (2, 0));
    assert_eq!(
        result.validation_errors.get("warp-drive").map(String::as_str),
        Some("UnknownBooster")
    );
    let progress = handle
        .get_batch_progress(result.batch_id.as_str())
        .await
        .expect("progress")
        .expect("batch");
    assert_eq!(progress.percent, 100);

    assert_eq!(handle.list().await.expect("list").len(), 1);
    assert!(matches!(
        handle.cancel("op-404").await,
        Err(RuntimeError::NotFound(_))
    ));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn rejected_submission_is_recorded_as_failed() {
    let backend = Arc::new(ScriptedBackend::default());
    backend
        .script
        .lock()
        .expect("lock")
        .rejected
        .insert("gpu-oc".to_string());
    let handle = spawn(&backend, RuntimeConfig::default());

    let local = handle.submit("gpu-oc").await.expect("submit");
    let item = wait_for(&handle, &local, |i| i.status == OperationStatus::Failed).await;
    let error = item.error.expect("error");
    assert_eq!(error.class, ErrorClass::Submission);
    assert!(error.message.contains("not supported"));
    assert_eq!(item.last_event_timestamp, None);

    let retry = handle.submit("gpu-oc").await.expect("resubmit after failure");
    assert_ne!(retry, local);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn backend_batch_rejections_fail_matching_members() {
    let backend = Arc::new(ScriptedBackend::default());
    backend
        .script
        .lock()
        .expect("lock")
        .batch_rejections
        .insert("b2".to_string(), "NotInstalled".to_string());
    let handle = spawn(&backend, RuntimeConfig::default());

    let result = handle.submit_batch(["b1", "b2"]).await.expect("batch");
    let rejected = wait_for(&handle, &result.operation_ids[1], |i| i.status == OperationStatus::Failed).await;
    assert_eq!(rejected.error.map(|e| e.class), Some(ErrorClass::Submission));

    let batch = handle.get_batch("batch-1").await.expect("get").expect("batch");
    assert_eq!(
        batch.validation_errors.get("b2").map(String::as_str),
        Some("NotInstalled")
    );
    let progress = handle
        .get_batch_progress("batch-1")
        .await
        .expect("progress")
        .expect("batch");
    assert_eq!(progress.percent, 50);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn cancel_before_ack_is_forwarded_once_id_arrives() {
    let backend = Arc::new(ScriptedBackend::with_delay(Duration::from_millis(100)));
    let handle = spawn(&backend, RuntimeConfig::default());

    let local = handle.submit("net-tune").await.expect("submit");
    handle.cancel(local.as_str()).await.expect("cancel");
    assert!(backend.cancel_calls().is_empty());

    wait_for(&handle, &local, |i| i.id == "op-1").await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(backend.cancel_calls(), vec!["op-1".to_string()]);

    let out = handle
        .ingest_bytes(event("booster.cancelled", 10, "op-1", "net-tune"))
        .await
        .expect("cancelled");
    assert!(matches!(out, ApplyOutcome::Applied { to: OperationStatus::Cancelled, .. }));

    tokio::time::sleep(Duration::from_millis(3_100)).await;
    let item = handle.get_by_id(local.as_str()).await.expect("get").expect("item");
    assert_eq!(item.status, OperationStatus::Cancelled);
    assert_ne!(item.cancel, CancelState::Assumed);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn removal_keeps_batch_history() {
    let backend = Arc::new(ScriptedBackend::default());
    let handle = spawn(&backend, RuntimeConfig::default());

    let result = handle.submit_batch(["b1", "b2"]).await.expect("batch");
    let removed = handle
        .remove(result.operation_ids[0].as_str())
        .await
        .expect("remove");
    assert_eq!(removed.booster_id, "b1");

    let batch = handle
        .get_batch(result.batch_id.as_str())
        .await
        .expect("get")
        .expect("batch");
    assert_eq!((batch.total_count, batch.queued_count), (2, 2));
    let progress = handle
        .get_batch_progress(result.batch_id.as_str())
        .await
        .expect("progress")
        .expect("batch");
    assert_eq!((progress.percent, progress.outcome.evicted), (50, 1));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn booster_in_error_can_be_resubmitted() {
    let backend = Arc::new(ScriptedBackend::default());
    let handle = spawn(&backend, RuntimeConfig::default());

    let first = handle.submit("fps-boost").await.expect("submit");
    wait_for(&handle, &first, |i| i.id == "op-1").await;
    handle
        .ingest_bytes(event("booster.processing", 10, "op-1", "fps-boost"))
        .await
        .expect("processing");
    handle
        .ingest_bytes(event("booster.error", 20, "op-1", "fps-boost"))
        .await
        .expect("error");
    let errored = handle.get_by_id("op-1").await.expect("get").expect("item");
    assert_eq!(errored.status, OperationStatus::Error);

    let second = handle.submit("fps-boost").await.expect("resubmit after error");
    assert_ne!(second, first);
    let item = wait_for(&handle, &second, |i| i.id == "op-2").await;
    assert_eq!(item.status, OperationStatus::Queued);
    assert!(matches!(
        handle.submit("fps-boost").await,
        Err(RuntimeError::Validation(ValidationError::AlreadyQueued { operation_id, .. })) if operation_id == "op-2"
    ));
    let old = handle.get_by_id(first.as_str()).await.expect("get").expect("item");
    assert_eq!(old.status, OperationStatus::Error);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn cancel_of_batch_member_is_sent_on_first_event() {
    let backend = Arc::new(ScriptedBackend::default());
    let handle = spawn(&backend, RuntimeConfig::default());

    let result = handle.submit_batch(["b1"]).await.expect("batch");
    let local = result.operation_ids[0].clone();
    wait_for(&handle, &local, |i| i.submission == SubmissionState::AwaitingId).await;
    handle.cancel(local.as_str()).await.expect("cancel");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(backend.cancel_calls().is_empty());

    handle
        .ingest_bytes(event("booster.processing", 10, "srv-9", "b1"))
        .await
        .expect("first event");
    let item = handle.get_by_id(local.as_str()).await.expect("get").expect("item");
    assert_eq!((item.id.as_str(), item.cancel), ("srv-9", CancelState::Requested));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(backend.cancel_calls(), vec!["srv-9".to_string()]);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn refused_cancel_timer_does_not_cut_short_a_new_request() {
    let backend = Arc::new(ScriptedBackend::default());
    let handle = spawn(&backend, RuntimeConfig::default());

    let local = handle.submit("net-tune").await.expect("submit");
    wait_for(&handle, &local, |i| i.id == "op-1").await;
    handle
        .ingest_bytes(event("booster.processing", 10, "op-1", "net-tune"))
        .await
        .expect("processing");

    backend.script.lock().expect("lock").refuse_cancels = true;
    handle.cancel("op-1").await.expect("cancel");
    wait_for(&handle, "op-1", |i| i.cancel == CancelState::None).await;
    backend.script.lock().expect("lock").refuse_cancels = false;

    tokio::time::sleep(Duration::from_millis(2_800)).await;
    handle.cancel("op-1").await.expect("cancel again");
    tokio::time::sleep(Duration::from_millis(400)).await;
    let item = handle.get_by_id("op-1").await.expect("get").expect("item");
    assert_eq!((item.status, item.cancel), (OperationStatus::Processing, CancelState::Requested));

    tokio::time::sleep(Duration::from_millis(2_700)).await;
    let item = wait_for(&handle, "op-1", |i| i.status == OperationStatus::Cancelled).await;
    assert_eq!(item.cancel, CancelState::Assumed);
    assert_eq!(backend.cancel_calls(), vec!["op-1".to_string(), "op-1".to_string()]);

    handle.shutdown().await.expect("shutdown");
}
