use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    backend::{BackendError, BatchAck, BoosterBackend, CancelAck, SubmitAck},
    core::store::{QueueStateStore, StoreChange, StoreError, StoreSnapshotV1},
    engine::{
        aggregator::{BatchProgress, ProgressAggregator, SummaryCounts},
        ingest::{EventIngestor, IngestError},
        reconciler::{ApplyOutcome, LocalTransition, Reconciler, ReconcilerConfig, ReconciliationDiagnostic},
    },
    event::NormalizedEvent,
    operation::{Batch, CancelState, OperationItem, SubmissionState},
    persist::{PersistError, SnapshotSink},
    types::{now_ms, BatchId, BoosterId, OperationId, OperationStatus, Revision},
};

use super::events::QueueEvent;

/// Why a booster id was refused before contacting the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationReason {
    /// A `Queued` or `Processing` operation already targets the booster.
    AlreadyQueued,
    /// The booster has already been applied.
    AlreadyApplied,
    /// The booster is not in the configured catalog.
    UnknownBooster,
}

impl ValidationReason {
    /// Reason code as reported in `validation_errors`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyQueued => "AlreadyQueued",
            Self::AlreadyApplied => "AlreadyApplied",
            Self::UnknownBooster => "UnknownBooster",
        }
    }
}

/// Local, pre-submission rejection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A `Queued` or `Processing` operation already targets the booster.
    #[error("booster {booster_id} already has operation {operation_id} in flight")]
    AlreadyQueued {
        /// Booster id.
        booster_id: BoosterId,
        /// Operation in flight.
        operation_id: OperationId,
    },
    /// The booster is not in the configured catalog.
    #[error("unknown booster: {0}")]
    UnknownBooster(BoosterId),
    /// `submit_batch` called with no booster ids.
    #[error("batch request is empty")]
    EmptyBatch,
}

/// Errors returned by [`ControllerHandle`] calls.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Rejected before anything was stored.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The target operation is already terminal.
    #[error("operation {id} is already {status:?}")]
    InvalidState {
        /// Operation id.
        id: OperationId,
        /// Its terminal status.
        status: OperationStatus,
    },
    /// No operation with this id (local or backend).
    #[error("operation not found: {0}")]
    NotFound(OperationId),
    /// Store rejected a mutation.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Event payload could not be normalized.
    #[error(transparent)]
    Ingest(#[from] IngestError),
    /// Snapshot persistence failed.
    #[error(transparent)]
    Persist(#[from] PersistError),
    /// Controller task has stopped.
    #[error("controller channel closed")]
    ChannelClosed,
}

/// Controller tuning. Every field has a default, so partial JSON is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Wait for `booster.cancelled` before assuming the cancellation.
    pub cancel_timeout_ms: u64,
    /// How long an event for an unknown target is buffered.
    pub grace_period_ms: u64,
    /// Upper bound on buffered events.
    pub max_buffered_events: usize,
    /// Diagnostics kept in the ring.
    pub diagnostic_capacity: usize,
    /// Command channel capacity.
    pub command_queue_bound: usize,
    /// Broadcast capacity for [`QueueEvent`]s.
    pub event_channel_capacity: usize,
    /// Allow-list for the unknown-booster check; `None` accepts any id.
    pub known_boosters: Option<Vec<BoosterId>>,
    /// Operation type label recorded on new batches.
    pub batch_operation_type: String,
    /// Auto-snapshot cadence in accepted mutations; 0 disables.
    pub snapshot_every_mutations: usize,
    /// Snapshot queue capacity.
    pub persist_queue_bound: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cancel_timeout_ms: 3_000,
            grace_period_ms: 5_000,
            max_buffered_events: 1024,
            diagnostic_capacity: 256,
            command_queue_bound: 256,
            event_channel_capacity: 1024,
            known_boosters: None,
            batch_operation_type: "apply".to_string(),
            snapshot_every_mutations: 0,
            persist_queue_bound: 8,
        }
    }
}

impl RuntimeConfig {
    /// Parses a JSON config; absent fields keep their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            grace_period: Duration::from_millis(self.grace_period_ms),
            max_buffered: self.max_buffered_events,
            diagnostic_capacity: self.diagnostic_capacity,
        }
    }
}

/// Result of [`ControllerHandle::submit_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitBatchResult {
    /// Batch id (local until the backend acknowledges; stays resolvable).
    pub batch_id: BatchId,
    /// Distinct booster ids requested.
    pub total_count: u32,
    /// Ids accepted after local validation.
    pub queued_count: u32,
    /// Operation ids created for accepted boosters, in request order.
    pub operation_ids: Vec<OperationId>,
    /// Rejected booster id to reason code.
    pub validation_errors: BTreeMap<BoosterId, String>,
}

/// Cloneable handle to the controller task.
#[derive(Clone)]
pub struct ControllerHandle {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<QueueEvent>,
}

/// Callback subscription; delivery stops on [`Subscription::unsubscribe`] or drop.
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    /// Stops delivery.
    pub fn unsubscribe(self) {
        self.task.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Command {
    Submit {
        booster_id: BoosterId,
        resp: oneshot::Sender<Result<OperationId, RuntimeError>>,
    },
    SubmitBatch {
        booster_ids: Vec<BoosterId>,
        resp: oneshot::Sender<Result<SubmitBatchResult, RuntimeError>>,
    },
    Cancel {
        id: OperationId,
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
    IngestBytes {
        payload: Vec<u8>,
        resp: oneshot::Sender<Result<ApplyOutcome, RuntimeError>>,
    },
    Apply {
        event: NormalizedEvent,
        resp: oneshot::Sender<Result<ApplyOutcome, RuntimeError>>,
    },
    Remove {
        id: OperationId,
        resp: oneshot::Sender<Result<OperationItem, RuntimeError>>,
    },
    Get {
        id: OperationId,
        resp: oneshot::Sender<Option<OperationItem>>,
    },
    List {
        resp: oneshot::Sender<Vec<OperationItem>>,
    },
    GetBatch {
        batch_id: BatchId,
        resp: oneshot::Sender<Option<Batch>>,
    },
    BatchProgress {
        batch_id: BatchId,
        resp: oneshot::Sender<Option<BatchProgress>>,
    },
    Summary {
        resp: oneshot::Sender<SummaryCounts>,
    },
    Diagnostics {
        resp: oneshot::Sender<Vec<ReconciliationDiagnostic>>,
    },
    Checkpoint {
        resp: oneshot::Sender<Result<Revision, RuntimeError>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
}

/// Completions of work the controller started on other tasks.
enum Internal {
    SubmitAcked {
        local_id: OperationId,
        result: Result<SubmitAck, BackendError>,
    },
    BatchAcked {
        local_batch_id: BatchId,
        result: Result<BatchAck, BackendError>,
    },
    CancelAcked {
        id: OperationId,
        result: Result<CancelAck, BackendError>,
    },
    CancelTimedOut {
        id: OperationId,
        generation: u64,
    },
}

enum PersistMsg {
    Snapshot {
        snapshot: StoreSnapshotV1,
        resp: Option<oneshot::Sender<Result<Revision, PersistError>>>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Starts the controller task owning `store` and returns its handle.
pub fn spawn_controller(
    store: QueueStateStore,
    backend: Arc<dyn BoosterBackend>,
    sink: Option<Box<dyn SnapshotSink>>,
    config: RuntimeConfig,
) -> ControllerHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(config.command_queue_bound.max(1));
    let (events_tx, _) = broadcast::channel::<QueueEvent>(config.event_channel_capacity.max(1));
    let (internal_tx, mut internal_rx) = mpsc::unbounded_channel::<Internal>();
    let (durable_tx, mut durable_rx) = mpsc::unbounded_channel::<Revision>();

    let persist_tx = sink.map(|sink| {
        let (persist_tx, persist_rx) = mpsc::channel::<PersistMsg>(config.persist_queue_bound.max(1));
        spawn_persistence_worker(sink, persist_rx, durable_tx);
        persist_tx
    });
    let mut durable_open = persist_tx.is_some();

    let mut ctl = Controller {
        aggregator: ProgressAggregator::from_store(&store),
        reconciler: Reconciler::new(config.reconciler_config()),
        ingestor: EventIngestor::new(),
        known_boosters: config.known_boosters.clone().map(|ids| ids.into_iter().collect()),
        store,
        backend,
        internal_tx,
        events_tx: events_tx.clone(),
        persist_tx,
        config,
        cancel_generations: HashMap::new(),
        next_cancel_generation: 1,
        mutations_since_snapshot: 0,
    };

    tokio::spawn(async move {
        loop {
            let deadline = ctl.reconciler.next_deadline().map(Instant::from_std);
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break; };
                    if ctl.handle_command(cmd).await {
                        break;
                    }
                }
                Some(msg) = internal_rx.recv() => {
                    ctl.handle_internal(msg);
                }
                durable = durable_rx.recv(), if durable_open => {
                    match durable {
                        Some(revision) => {
                            let _ = ctl.events_tx.send(QueueEvent::SnapshotWritten { revision });
                        }
                        None => durable_open = false,
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    ctl.sweep();
                }
            }
        }
        debug!("controller loop stopped");
    });

    ControllerHandle { cmd_tx, events_tx }
}

impl ControllerHandle {
    /// Raw broadcast receiver of [`QueueEvent`]s.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events_tx.subscribe()
    }

    /// Invokes `callback` for every [`QueueEvent`] until the subscription is dropped.
    pub fn subscribe_with<F>(&self, mut callback: F) -> Subscription
    where
        F: FnMut(QueueEvent) + Send + 'static,
    {
        let mut rx = self.events_tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "subscriber lagged behind queue events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { task }
    }

    /// Queues one booster optimistically and returns its local operation id.
    pub async fn submit(&self, booster_id: impl Into<BoosterId>) -> Result<OperationId, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Submit {
            booster_id: booster_id.into(),
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Validates, queues and submits a batch in one backend call.
    pub async fn submit_batch<I, S>(&self, booster_ids: I) -> Result<SubmitBatchResult, RuntimeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<BoosterId>,
    {
        let (tx, rx) = oneshot::channel();
        self.send(Command::SubmitBatch {
            booster_ids: booster_ids.into_iter().map(Into::into).collect(),
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Requests cancellation; `Cancelled` is assumed if the backend stays silent past the timeout.
    pub async fn cancel(&self, id: impl Into<OperationId>) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Cancel { id: id.into(), resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Normalizes and reconciles one raw JSON event payload.
    pub async fn ingest_bytes(&self, payload: impl Into<Vec<u8>>) -> Result<ApplyOutcome, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::IngestBytes {
            payload: payload.into(),
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Reconciles an already normalized event.
    pub async fn apply_event(&self, event: impl Into<NormalizedEvent>) -> Result<ApplyOutcome, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Apply {
            event: event.into(),
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Evicts an operation. Batch totals are not decremented.
    pub async fn remove(&self, id: impl Into<OperationId>) -> Result<OperationItem, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Remove { id: id.into(), resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Looks up an operation by local or backend id.
    pub async fn get_by_id(&self, id: impl Into<OperationId>) -> Result<Option<OperationItem>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Get { id: id.into(), resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// All operations in insertion order.
    pub async fn list(&self) -> Result<Vec<OperationItem>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::List { resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Batch record by local or backend id.
    pub async fn get_batch(&self, batch_id: impl Into<BatchId>) -> Result<Option<Batch>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::GetBatch {
            batch_id: batch_id.into(),
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Derived batch progress.
    pub async fn get_batch_progress(&self, batch_id: impl Into<BatchId>) -> Result<Option<BatchProgress>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::BatchProgress {
            batch_id: batch_id.into(),
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Per-status counts.
    pub async fn summary(&self) -> Result<SummaryCounts, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Summary { resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Recent reconciliation diagnostics, oldest first.
    pub async fn diagnostics(&self) -> Result<Vec<ReconciliationDiagnostic>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Diagnostics { resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Writes a snapshot now. Without a sink, returns the current revision.
    pub async fn checkpoint(&self) -> Result<Revision, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Checkpoint { resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Flushes the persistence worker and stops the controller.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown { resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    async fn send(&self, cmd: Command) -> Result<(), RuntimeError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| RuntimeError::ChannelClosed)
    }
}

/// State owned by the controller task.
struct Controller {
    store: QueueStateStore,
    reconciler: Reconciler,
    aggregator: ProgressAggregator,
    ingestor: EventIngestor,
    backend: Arc<dyn BoosterBackend>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    events_tx: broadcast::Sender<QueueEvent>,
    persist_tx: Option<mpsc::Sender<PersistMsg>>,
    config: RuntimeConfig,
    known_boosters: Option<HashSet<BoosterId>>,
    /// Live cancel timer per local operation id; older timers are ignored.
    cancel_generations: HashMap<OperationId, u64>,
    next_cancel_generation: u64,
    mutations_since_snapshot: usize,
}

impl Controller {
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Submit { booster_id, resp } => {
                let _ = resp.send(self.submit(booster_id));
            }
            Command::SubmitBatch { booster_ids, resp } => {
                let _ = resp.send(self.submit_batch(booster_ids));
            }
            Command::Cancel { id, resp } => {
                let _ = resp.send(self.cancel(&id));
            }
            Command::IngestBytes { payload, resp } => {
                let out = match self.ingestor.ingest_bytes(&payload) {
                    Ok(event) => self.apply_event(event),
                    Err(err) => {
                        self.reconciler.record_malformed(err.to_string());
                        Err(err.into())
                    }
                };
                let _ = resp.send(out);
            }
            Command::Apply { event, resp } => {
                let _ = resp.send(self.apply_event(event));
            }
            Command::Remove { id, resp } => {
                let out = self.store.remove(&id).map_err(RuntimeError::from);
                self.publish();
                let _ = resp.send(out);
            }
            Command::Get { id, resp } => {
                let _ = resp.send(self.store.get_cloned(&id));
            }
            Command::List { resp } => {
                let _ = resp.send(self.store.list_cloned());
            }
            Command::GetBatch { batch_id, resp } => {
                let _ = resp.send(self.store.get_batch(&batch_id).cloned());
            }
            Command::BatchProgress { batch_id, resp } => {
                let _ = resp.send(self.aggregator.batch_progress(&self.store, &batch_id));
            }
            Command::Summary { resp } => {
                let _ = resp.send(self.aggregator.summary());
            }
            Command::Diagnostics { resp } => {
                let _ = resp.send(self.reconciler.diagnostics());
            }
            Command::Checkpoint { resp } => {
                let out = self.checkpoint().await;
                let _ = resp.send(out);
            }
            Command::Shutdown { resp } => {
                let out = if let Some(tx) = self.persist_tx.as_ref() {
                    let (done_tx, done_rx) = oneshot::channel();
                    if tx.send(PersistMsg::Shutdown { resp: done_tx }).await.is_err() {
                        Err(RuntimeError::ChannelClosed)
                    } else {
                        done_rx.await.map_err(|_| RuntimeError::ChannelClosed)
                    }
                } else {
                    Ok(())
                };
                let _ = resp.send(out);
                return true;
            }
        }

        false
    }

    fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::SubmitAcked { local_id, result } => self.on_submit_acked(&local_id, result),
            Internal::BatchAcked { local_batch_id, result } => self.on_batch_acked(&local_batch_id, result),
            Internal::CancelAcked { id, result } => self.on_cancel_acked(&id, result),
            Internal::CancelTimedOut { id, generation } => self.on_cancel_timeout(&id, generation),
        }
        self.publish();
    }

    fn submit(&mut self, booster_id: BoosterId) -> Result<OperationId, RuntimeError> {
        if let Some(reason) = self.reject_reason(&booster_id, false) {
            return Err(match reason {
                ValidationReason::UnknownBooster => ValidationError::UnknownBooster(booster_id),
                _ => ValidationError::AlreadyQueued {
                    operation_id: self
                        .store
                        .active_for_booster(&booster_id)
                        .map(|item| item.id.clone())
                        .unwrap_or_default(),
                    booster_id,
                },
            }
            .into());
        }

        let id = self.store.next_operation_id();
        self.store
            .upsert(OperationItem::queued(id.clone(), booster_id.clone(), None, now_ms()))?;
        self.publish();
        info!(operation_id = %id, %booster_id, "operation queued");

        let backend = Arc::clone(&self.backend);
        let tx = self.internal_tx.clone();
        let local_id = id.clone();
        tokio::spawn(async move {
            let result = backend.submit(&booster_id).await;
            let _ = tx.send(Internal::SubmitAcked { local_id, result });
        });
        Ok(id)
    }

    fn submit_batch(&mut self, booster_ids: Vec<BoosterId>) -> Result<SubmitBatchResult, RuntimeError> {
        if booster_ids.is_empty() {
            return Err(ValidationError::EmptyBatch.into());
        }

        let mut seen = HashSet::new();
        let mut accepted = Vec::new();
        let mut validation_errors = BTreeMap::new();
        for booster_id in booster_ids {
            if !seen.insert(booster_id.clone()) {
                debug!(%booster_id, "collapsing duplicate booster id in batch request");
                continue;
            }
            match self.reject_reason(&booster_id, true) {
                Some(reason) => {
                    validation_errors.insert(booster_id, reason.as_str().to_string());
                }
                None => accepted.push(booster_id),
            }
        }

        let batch_id = self.store.next_batch_id();
        let created_at = now_ms();
        let items: Vec<OperationItem> = accepted
            .iter()
            .map(|booster_id| {
                OperationItem::queued(
                    self.store.next_operation_id(),
                    booster_id.clone(),
                    Some(batch_id.clone()),
                    created_at,
                )
            })
            .collect();
        let operation_ids: Vec<OperationId> = items.iter().map(|item| item.id.clone()).collect();
        let total_count = seen.len() as u32;
        let queued_count = items.len() as u32;

        let batch = Batch::new(
            batch_id.clone(),
            self.config.batch_operation_type.clone(),
            total_count,
            queued_count,
            validation_errors.clone(),
            created_at,
        );
        self.store.insert_batch(batch, items)?;
        self.publish();
        info!(%batch_id, total_count, queued_count, rejected = validation_errors.len(), "batch queued");

        if !accepted.is_empty() {
            let backend = Arc::clone(&self.backend);
            let tx = self.internal_tx.clone();
            let local_batch_id = batch_id.clone();
            tokio::spawn(async move {
                let result = backend.submit_batch(&accepted).await;
                let _ = tx.send(Internal::BatchAcked { local_batch_id, result });
            });
        }

        Ok(SubmitBatchResult {
            batch_id,
            total_count,
            queued_count,
            operation_ids,
            validation_errors,
        })
    }

    fn cancel(&mut self, id: &str) -> Result<(), RuntimeError> {
        let mut item = self
            .store
            .get_cloned(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if item.is_terminal() {
            return Err(RuntimeError::InvalidState {
                id: item.id,
                status: item.status,
            });
        }
        if item.cancel == CancelState::Requested {
            debug!(operation_id = %item.id, "cancellation already pending");
            return Ok(());
        }

        item.cancel = CancelState::Requested;
        let current_id = item.id.clone();
        let local_id = item.local_id.clone();
        let confirmed = item.submission == SubmissionState::Confirmed;
        self.store.upsert(item)?;
        self.publish();

        if confirmed {
            self.send_cancel(current_id.clone());
        } else {
            debug!(operation_id = %current_id, "deferring cancel request until backend id is known");
        }

        let generation = self.next_cancel_generation;
        self.next_cancel_generation += 1;
        self.cancel_generations.insert(local_id.clone(), generation);

        let tx = self.internal_tx.clone();
        let timeout = Duration::from_millis(self.config.cancel_timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Internal::CancelTimedOut { id: local_id, generation });
        });
        info!(operation_id = %current_id, timeout_ms = self.config.cancel_timeout_ms, "cancellation requested");
        Ok(())
    }

    fn apply_event(&mut self, event: NormalizedEvent) -> Result<ApplyOutcome, RuntimeError> {
        let outcome = self.reconciler.apply(&mut self.store, event, Instant::now().into_std())?;
        if !matches!(outcome, ApplyOutcome::Buffered | ApplyOutcome::Discarded(_)) {
            self.replay_buffered();
        }
        self.publish();
        Ok(outcome)
    }

    fn on_submit_acked(&mut self, local_id: &str, result: Result<SubmitAck, BackendError>) {
        let failure = match result {
            Ok(SubmitAck {
                success: true,
                operation_id: Some(backend_id),
                ..
            }) => {
                self.attach_backend_id(local_id, &backend_id);
                return;
            }
            Ok(SubmitAck {
                success: true,
                operation_id: None,
                ..
            }) => {
                self.mark_awaiting_id(local_id);
                return;
            }
            Ok(ack) => ack
                .message
                .unwrap_or_else(|| "backend rejected submission".to_string()),
            Err(err) => err.to_string(),
        };
        self.fail_submission(local_id, failure);
    }

    fn on_batch_acked(&mut self, local_batch_id: &str, result: Result<BatchAck, BackendError>) {
        let ack = match result {
            Ok(ack) if ack.success => ack,
            Ok(ack) => {
                let message = ack
                    .validation_errors
                    .values()
                    .next()
                    .cloned()
                    .unwrap_or_else(|| "backend rejected batch".to_string());
                self.fail_batch_members(local_batch_id, &message);
                return;
            }
            Err(err) => {
                self.fail_batch_members(local_batch_id, &err.to_string());
                return;
            }
        };

        if let Some(backend_batch_id) = &ack.batch_id {
            if let Err(err) = self.store.rekey_batch(local_batch_id, backend_batch_id) {
                warn!(%local_batch_id, %backend_batch_id, %err, "could not attach backend batch id");
            }
        }

        let members: Vec<OperationItem> = self
            .store
            .batch_members(local_batch_id)
            .into_iter()
            .cloned()
            .collect();
        for member in members {
            if let Some(reason) = ack.validation_errors.get(&member.booster_id) {
                self.fail_submission(&member.id, reason.clone());
                continue;
            }
            self.mark_awaiting_id(&member.id);
        }

        if !ack.validation_errors.is_empty() {
            if let Some(mut batch) = self.store.get_batch(local_batch_id).cloned() {
                for (booster_id, reason) in &ack.validation_errors {
                    batch
                        .validation_errors
                        .entry(booster_id.clone())
                        .or_insert_with(|| reason.clone());
                }
                if let Err(err) = self.store.update_batch(batch) {
                    warn!(%local_batch_id, %err, "could not record backend validation errors");
                }
            }
        }
        self.replay_buffered();
    }

    fn on_cancel_acked(&mut self, id: &str, result: Result<CancelAck, BackendError>) {
        let refused = match result {
            Ok(CancelAck { success: true }) => {
                debug!(operation_id = %id, "backend accepted cancellation");
                return;
            }
            Ok(CancelAck { success: false }) => "backend refused cancellation".to_string(),
            Err(err) => err.to_string(),
        };
        warn!(operation_id = %id, reason = %refused, "cancellation not accepted");

        let Some(mut item) = self.store.get_cloned(id) else {
            return;
        };
        if item.is_terminal() || item.cancel != CancelState::Requested {
            return;
        }
        self.cancel_generations.remove(&item.local_id);
        item.cancel = CancelState::None;
        if let Err(err) = self.store.upsert(item) {
            warn!(operation_id = %id, %err, "could not clear cancellation request");
        }
    }

    fn on_cancel_timeout(&mut self, id: &str, generation: u64) {
        if self.cancel_generations.get(id) != Some(&generation) {
            debug!(operation_id = %id, generation, "ignoring superseded cancel timer");
            return;
        }
        self.cancel_generations.remove(id);
        let Some(item) = self.store.get(id) else {
            return;
        };
        if item.is_terminal() || item.cancel != CancelState::Requested {
            return;
        }
        warn!(operation_id = %item.id, "no cancellation confirmation before timeout, assuming cancelled");
        if let Err(err) = self
            .reconciler
            .apply_local(&mut self.store, id, LocalTransition::CancelTimedOut)
        {
            warn!(operation_id = %id, %err, "could not apply assumed cancellation");
        }
    }

    fn attach_backend_id(&mut self, local_id: &str, backend_id: &str) {
        if let Err(err) = self.store.rekey(local_id, backend_id) {
            warn!(%local_id, %backend_id, %err, "could not attach backend operation id");
            return;
        }
        debug!(%local_id, %backend_id, "attached backend operation id");
        self.replay_buffered();
    }

    fn mark_awaiting_id(&mut self, id: &str) {
        let Some(mut item) = self.store.get_cloned(id) else {
            return;
        };
        if item.submission != SubmissionState::Pending {
            return;
        }
        item.submission = SubmissionState::AwaitingId;
        if let Err(err) = self.store.upsert(item) {
            warn!(operation_id = %id, %err, "could not mark operation as awaiting backend id");
        }
    }

    fn fail_submission(&mut self, id: &str, message: String) {
        warn!(operation_id = %id, %message, "submission failed");
        match self.reconciler.apply_local(
            &mut self.store,
            id,
            LocalTransition::SubmissionFailed { message },
        ) {
            Ok(_) => {}
            Err(StoreError::MissingOperation(_)) => {
                debug!(operation_id = %id, "submission failure for evicted operation");
            }
            Err(err) => warn!(operation_id = %id, %err, "could not record submission failure"),
        }
    }

    fn fail_batch_members(&mut self, batch_id: &str, message: &str) {
        let ids: Vec<OperationId> = self
            .store
            .batch_members(batch_id)
            .into_iter()
            .map(|item| item.id.clone())
            .collect();
        for id in ids {
            self.fail_submission(&id, message.to_string());
        }
    }

    fn send_cancel(&self, id: OperationId) {
        let backend = Arc::clone(&self.backend);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = backend.cancel(&id).await;
            let _ = tx.send(Internal::CancelAcked { id, result });
        });
    }

    fn replay_buffered(&mut self) {
        if self.reconciler.buffered_len() == 0 {
            return;
        }
        let outcomes = self
            .reconciler
            .retry_buffered(&mut self.store, Instant::now().into_std());
        if !outcomes.is_empty() {
            debug!(replayed = outcomes.len(), "replayed buffered events");
        }
    }

    /// Sends cancel requests held until the item's backend id arrived.
    fn forward_deferred_cancels(&self, changes: &[StoreChange]) {
        for change in changes {
            let StoreChange::Rekeyed { to, .. } = change else {
                continue;
            };
            let pending = self
                .store
                .get(to)
                .is_some_and(|item| !item.is_terminal() && item.cancel == CancelState::Requested);
            if pending {
                debug!(operation_id = %to, "forwarding deferred cancel request");
                self.send_cancel(to.clone());
            }
        }
    }

    fn sweep(&mut self) {
        let expired = self.reconciler.expire(Instant::now().into_std());
        if expired > 0 {
            debug!(expired, "expired buffered events");
        }
    }

    /// `Some(reason)` when `booster_id` must not be submitted.
    fn reject_reason(&self, booster_id: &str, reject_applied: bool) -> Option<ValidationReason> {
        if let Some(known) = &self.known_boosters {
            if !known.contains(booster_id) {
                return Some(ValidationReason::UnknownBooster);
            }
        }
        if self.store.active_for_booster(booster_id).is_some() {
            return Some(ValidationReason::AlreadyQueued);
        }
        if reject_applied
            && self
                .store
                .by_booster(booster_id)
                .iter()
                .any(|item| item.status == OperationStatus::Applied)
        {
            return Some(ValidationReason::AlreadyApplied);
        }
        None
    }

    /// Recomputes aggregates for drained store changes and notifies subscribers.
    fn publish(&mut self) {
        let changes = self.store.drain_changes();
        if changes.is_empty() {
            return;
        }
        let progress = self.aggregator.apply_changes(&self.store, &changes);
        self.forward_deferred_cancels(&changes);

        for change in &changes {
            let event = match change {
                StoreChange::Inserted { id, .. } => QueueEvent::OperationAdded { id: id.clone() },
                StoreChange::Updated { id, status, .. } => QueueEvent::OperationUpdated {
                    id: id.clone(),
                    status: *status,
                },
                StoreChange::Rekeyed { from, to } => QueueEvent::OperationRekeyed {
                    from: from.clone(),
                    to: to.clone(),
                },
                StoreChange::Removed { id, .. } => QueueEvent::OperationRemoved { id: id.clone() },
                StoreChange::BatchCreated { batch_id } => QueueEvent::BatchCreated {
                    batch_id: batch_id.clone(),
                },
                StoreChange::BatchRekeyed { from, to } => QueueEvent::BatchRekeyed {
                    from: from.clone(),
                    to: to.clone(),
                },
                StoreChange::BatchUpdated { .. } => continue,
            };
            let _ = self.events_tx.send(event);
        }
        for p in progress {
            let _ = self.events_tx.send(QueueEvent::BatchProgress(p));
        }

        self.mutations_since_snapshot += changes.len();
        self.maybe_auto_snapshot();
    }

    fn maybe_auto_snapshot(&mut self) {
        let every = self.config.snapshot_every_mutations;
        if every == 0 || self.mutations_since_snapshot < every {
            return;
        }
        let Some(tx) = self.persist_tx.as_ref() else {
            return;
        };

        let msg = PersistMsg::Snapshot {
            snapshot: self.store.export_snapshot(),
            resp: None,
        };
        match tx.try_send(msg) {
            Ok(()) => self.mutations_since_snapshot = 0,
            Err(err) => warn!(%err, "snapshot queue busy, deferring auto snapshot"),
        }
    }

    async fn checkpoint(&mut self) -> Result<Revision, RuntimeError> {
        let Some(tx) = self.persist_tx.as_ref() else {
            return Ok(self.store.revision());
        };
        let (cp_tx, cp_rx) = oneshot::channel();
        tx.send(PersistMsg::Snapshot {
            snapshot: self.store.export_snapshot(),
            resp: Some(cp_tx),
        })
        .await
        .map_err(|_| RuntimeError::ChannelClosed)?;
        let revision = cp_rx
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?
            .map_err(RuntimeError::from)?;
        self.mutations_since_snapshot = 0;
        Ok(revision)
    }
}

fn spawn_persistence_worker(
    sink: Box<dyn SnapshotSink>,
    mut rx: mpsc::Receiver<PersistMsg>,
    durable_tx: mpsc::UnboundedSender<Revision>,
) {
    let sink = Arc::new(Mutex::new(sink));
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                PersistMsg::Snapshot { snapshot, resp } => {
                    let result = write_snapshot(&sink, snapshot).await;
                    match &result {
                        Ok(revision) => {
                            let _ = durable_tx.send(*revision);
                        }
                        Err(err) => warn!(%err, "snapshot write failed"),
                    }
                    if let Some(resp) = resp {
                        let _ = resp.send(result);
                    }
                }
                PersistMsg::Shutdown { resp } => {
                    let sink_ref = Arc::clone(&sink);
                    let flushed = tokio::task::spawn_blocking(move || sink_ref.blocking_lock().flush()).await;
                    if let Ok(Err(err)) = flushed {
                        warn!(%err, "snapshot sink flush failed");
                    }
                    let _ = resp.send(());
                    break;
                }
            }
        }
    });
}

async fn write_snapshot(
    sink: &Arc<Mutex<Box<dyn SnapshotSink>>>,
    snapshot: StoreSnapshotV1,
) -> Result<Revision, PersistError> {
    let sink_ref = Arc::clone(sink);
    tokio::task::spawn_blocking(move || -> Result<Revision, PersistError> {
        let mut sink = sink_ref.blocking_lock();
        let revision = sink.write_snapshot(&snapshot)?;
        sink.flush()?;
        Ok(revision)
    })
    .await
    .map_err(|e| PersistError::Message(format!("join error: {e}")))?
}
