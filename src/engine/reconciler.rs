use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    core::store::{QueueStateStore, StoreError},
    event::{BatchQueuedEvent, NormalizedEvent, OperationEvent},
    operation::{CancelState, ErrorClass, ItemError, OperationItem},
    types::{now_ms, BatchId, EventKind, OperationId, OperationStatus, Timestamp},
};

/// Why an event (or a local transition) did not apply cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// Timestamp not newer than the last accepted event.
    Stale {
        /// Last accepted timestamp.
        last_accepted: Timestamp,
    },
    /// Target already terminal.
    TerminalDiscard {
        /// Current status.
        status: OperationStatus,
    },
    /// Accepted, but the backend skipped a state (e.g. `Queued -> Applied`).
    SkippedIntermediate {
        /// Status before.
        from: OperationStatus,
        /// Status after.
        to: OperationStatus,
    },
    /// Lower progress than already recorded; ignored.
    ProgressRegression {
        /// Recorded progress.
        current: u8,
        /// Reported progress.
        reported: u8,
    },
    /// Target never appeared within the grace window.
    Expired,
    /// Buffer full; the oldest buffered event was dropped.
    BufferOverflow,
    /// Payload could not be normalized.
    Malformed {
        /// Decoder message.
        reason: String,
    },
    /// Store refused the mutation; the event was dropped.
    Rejected {
        /// Store error text.
        reason: String,
    },
}

/// Non-fatal reconciliation record, kept for observability only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationDiagnostic {
    /// Target operation, when known.
    pub operation_id: Option<OperationId>,
    /// Target batch, when known.
    pub batch_id: Option<BatchId>,
    /// Event type wire name, when the diagnostic concerns an event.
    pub event: Option<&'static str>,
    /// Event timestamp, when the diagnostic concerns an event.
    pub event_timestamp: Option<Timestamp>,
    /// What happened.
    pub kind: DiagnosticKind,
    /// Wall-clock time it was recorded.
    pub recorded_at: Timestamp,
}

/// Result of reconciling one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Item state changed through the normal transition rule.
    Applied {
        /// Item id.
        id: OperationId,
        /// Status before.
        from: OperationStatus,
        /// Status after.
        to: OperationStatus,
    },
    /// A locally assumed terminal state was replaced by an authoritative outcome.
    Overridden {
        /// Item id.
        id: OperationId,
        /// Status before.
        from: OperationStatus,
        /// Status after.
        to: OperationStatus,
    },
    /// Batch counters changed.
    BatchUpdated {
        /// Batch id.
        batch_id: BatchId,
    },
    /// Target unknown; held for the grace window.
    Buffered,
    /// Dropped without changing state.
    Discarded(DiagnosticKind),
}

/// Locally initiated transitions that bypass the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalTransition {
    /// Backend rejected or never acknowledged the submission.
    SubmissionFailed {
        /// Error text.
        message: String,
    },
    /// No `booster.cancelled` arrived before the cancel timeout.
    CancelTimedOut,
}

/// Edge of the operation state machine selected for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// Listed transition.
    Advance(OperationStatus),
    /// Accepted transition that skips an intermediate state.
    Skip(OperationStatus),
    /// No status change.
    Stay,
}

/// Total transition function over every status and event kind.
pub fn transition(from: OperationStatus, kind: EventKind) -> Edge {
    use OperationStatus as S;

    if from.is_terminal() {
        return Edge::Stay;
    }
    match kind {
        EventKind::Queued => Edge::Stay,
        EventKind::Cancelled => Edge::Advance(S::Cancelled),
        EventKind::Processing => match from {
            S::Queued => Edge::Advance(S::Processing),
            S::Error => Edge::Skip(S::Processing),
            _ => Edge::Stay,
        },
        EventKind::Success => match from {
            S::Processing => Edge::Advance(S::Applied),
            _ => Edge::Skip(S::Applied),
        },
        EventKind::Error => match from {
            S::Processing => Edge::Advance(S::Error),
            S::Error => Edge::Stay,
            _ => Edge::Skip(S::Error),
        },
        EventKind::Failed => match from {
            S::Processing => Edge::Advance(S::Failed),
            _ => Edge::Skip(S::Failed),
        },
    }
}

#[derive(Debug, Clone)]
/// Grace buffer and diagnostic ring limits.
pub struct ReconcilerConfig {
    /// How long an event for an unknown target is held.
    pub grace_period: Duration,
    /// Buffer bound; the oldest event is dropped on overflow.
    pub max_buffered: usize,
    /// Diagnostics kept before the oldest is discarded.
    pub diagnostic_capacity: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            max_buffered: 1024,
            diagnostic_capacity: 256,
        }
    }
}

struct Buffered {
    event: NormalizedEvent,
    deadline: Instant,
}

/// Sole authority over whether and how an event changes an operation.
pub struct Reconciler {
    config: ReconcilerConfig,
    buffer: VecDeque<Buffered>,
    diagnostics: VecDeque<ReconciliationDiagnostic>,
}

impl Reconciler {
    /// Reconciler with an empty buffer and diagnostic ring.
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            config,
            buffer: VecDeque::new(),
            diagnostics: VecDeque::new(),
        }
    }

    /// Reconciles one backend event against the store.
    pub fn apply(
        &mut self,
        store: &mut QueueStateStore,
        event: NormalizedEvent,
        now: Instant,
    ) -> Result<ApplyOutcome, StoreError> {
        match self.try_apply(store, &event)? {
            Some(outcome) => Ok(outcome),
            None => Ok(self.buffer_event(event, now)),
        }
    }

    /// Applies a local transition through the normal transition rule.
    ///
    /// Local transitions skip the staleness check and leave
    /// `last_event_timestamp` untouched, so a later backend outcome stays fresh.
    pub fn apply_local(
        &mut self,
        store: &mut QueueStateStore,
        id: &str,
        local: LocalTransition,
    ) -> Result<ApplyOutcome, StoreError> {
        let mut item = store
            .get_cloned(id)
            .ok_or_else(|| StoreError::MissingOperation(id.to_string()))?;
        if item.is_terminal() {
            let kind = DiagnosticKind::TerminalDiscard { status: item.status };
            self.record(Some(item.id), None, None, None, kind.clone());
            return Ok(ApplyOutcome::Discarded(kind));
        }

        let (kind, error) = match &local {
            LocalTransition::SubmissionFailed { message } => (
                EventKind::Failed,
                Some(ItemError {
                    class: ErrorClass::Submission,
                    message: message.clone(),
                }),
            ),
            LocalTransition::CancelTimedOut => (EventKind::Cancelled, None),
        };

        let from = item.status;
        let to = self.step(&mut item, kind, None, now_ms(), None);
        if let Some(err) = error {
            item.error = Some(err);
        }
        if local == LocalTransition::CancelTimedOut {
            item.cancel = CancelState::Assumed;
        }
        warn!(operation_id = %item.id, ?from, ?to, transition = ?local, "applied local transition");

        let id = item.id.clone();
        store.upsert(item)?;
        Ok(ApplyOutcome::Applied { id, from, to })
    }

    /// Retries buffered events whose target may now exist; expires the rest past their deadline.
    ///
    /// An event the store refuses is dropped with a [`DiagnosticKind::Rejected`]
    /// record; the remaining events are still retried.
    pub fn retry_buffered(&mut self, store: &mut QueueStateStore, now: Instant) -> Vec<ApplyOutcome> {
        self.expire(now);
        if self.buffer.is_empty() {
            return Vec::new();
        }

        let mut pending: Vec<Buffered> = self.buffer.drain(..).collect();
        pending.sort_by_key(|b| b.event.timestamp());

        let mut outcomes = Vec::new();
        let mut still_waiting = Vec::new();
        for buffered in pending {
            match self.try_apply(store, &buffered.event) {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => still_waiting.push(buffered),
                Err(err) => {
                    let (op, batch, name) = event_target(&buffered.event);
                    warn!(operation_id = ?op, batch_id = ?batch, event = name, %err, "dropping buffered event the store refused");
                    let kind = DiagnosticKind::Rejected { reason: err.to_string() };
                    self.record(op, batch, Some(name), Some(buffered.event.timestamp()), kind.clone());
                    outcomes.push(ApplyOutcome::Discarded(kind));
                }
            }
        }
        still_waiting.sort_by_key(|b| b.deadline);
        self.buffer = still_waiting.into();
        outcomes
    }

    /// Drops buffered events whose grace window has passed. Returns how many expired.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        while self.buffer.front().is_some_and(|b| b.deadline <= now) {
            let Some(buffered) = self.buffer.pop_front() else {
                break;
            };
            let (op, batch, name) = event_target(&buffered.event);
            warn!(operation_id = ?op, batch_id = ?batch, event = name, "buffered event expired");
            self.record(op, batch, Some(name), Some(buffered.event.timestamp()), DiagnosticKind::Expired);
            expired += 1;
        }
        expired
    }

    /// Earliest buffered deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.buffer.front().map(|b| b.deadline)
    }

    /// Events waiting for their target.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Recent diagnostics, oldest first.
    pub fn diagnostics(&self) -> Vec<ReconciliationDiagnostic> {
        self.diagnostics.iter().cloned().collect()
    }

    /// Records a diagnostic for a payload that failed normalization.
    pub fn record_malformed(&mut self, reason: String) {
        warn!(%reason, "discarding malformed event payload");
        self.record(None, None, None, None, DiagnosticKind::Malformed { reason });
    }

    fn try_apply(
        &mut self,
        store: &mut QueueStateStore,
        event: &NormalizedEvent,
    ) -> Result<Option<ApplyOutcome>, StoreError> {
        match event {
            NormalizedEvent::Operation(ev) => {
                let Some(id) = Self::locate(store, ev)? else {
                    return Ok(None);
                };
                self.apply_operation(store, &id, ev).map(Some)
            }
            NormalizedEvent::BatchQueued(ev) => {
                let Some(batch_id) = store.resolve_batch(&ev.batch_id).cloned() else {
                    return Ok(None);
                };
                self.apply_batch(store, &batch_id, ev).map(Some)
            }
        }
    }

    fn locate(store: &mut QueueStateStore, ev: &OperationEvent) -> Result<Option<OperationId>, StoreError> {
        if let Some(id) = store.resolve(&ev.operation_id) {
            return Ok(Some(id.clone()));
        }
        let Some(booster_id) = &ev.booster_id else {
            return Ok(None);
        };
        // A late event for an evicted item must not claim a newer member.
        if store.id_in_use(&ev.operation_id) {
            return Ok(None);
        }
        let Some(local_id) = store.awaiting_id_for_booster(booster_id).map(|i| i.id.clone()) else {
            return Ok(None);
        };
        store.rekey(&local_id, &ev.operation_id)?;
        debug!(%local_id, operation_id = %ev.operation_id, %booster_id, "correlated batch member");
        Ok(Some(ev.operation_id.clone()))
    }

    fn apply_operation(
        &mut self,
        store: &mut QueueStateStore,
        id: &str,
        ev: &OperationEvent,
    ) -> Result<ApplyOutcome, StoreError> {
        let mut item = store
            .get_cloned(id)
            .ok_or_else(|| StoreError::MissingOperation(id.to_string()))?;

        if let Some(last_accepted) = item.last_event_timestamp {
            if ev.timestamp <= last_accepted {
                debug!(operation_id = %item.id, event = ev.kind.wire_name(), ts = ev.timestamp, last_accepted, "discarding stale event");
                return Ok(self.discard(&item, ev, DiagnosticKind::Stale { last_accepted }));
            }
        }

        if item.is_terminal() {
            if item.is_locally_assumed() && ev.authoritative {
                return self.override_assumed(store, item, ev);
            }
            debug!(operation_id = %item.id, event = ev.kind.wire_name(), status = ?item.status, "discarding event for terminal operation");
            let kind = DiagnosticKind::TerminalDiscard { status: item.status };
            return Ok(self.discard(&item, ev, kind));
        }

        if let Some(claimed) = ev.status {
            debug!(operation_id = %item.id, ?claimed, event = ev.kind.wire_name(), "event status field");
        }

        let from = item.status;
        let to = self.step(&mut item, ev.kind, ev.progress, ev.end_at.unwrap_or(ev.timestamp), ev.error.as_deref());
        item.last_event_timestamp = Some(ev.timestamp);
        debug!(operation_id = %item.id, event = ev.kind.wire_name(), ?from, ?to, progress = item.progress, "applied event");

        let id = item.id.clone();
        store.upsert(item)?;
        Ok(ApplyOutcome::Applied { id, from, to })
    }

    /// Advances `item` by one event through [`transition`] and returns the new status.
    fn step(
        &mut self,
        item: &mut OperationItem,
        kind: EventKind,
        progress: Option<u8>,
        at: Timestamp,
        error: Option<&str>,
    ) -> OperationStatus {
        let from = item.status;
        let to = match transition(from, kind) {
            Edge::Advance(to) => to,
            Edge::Skip(to) => {
                warn!(operation_id = %item.id, ?from, ?to, "transition skipped an intermediate state");
                self.record(
                    Some(item.id.clone()),
                    item.batch_id.clone(),
                    Some(kind.wire_name()),
                    None,
                    DiagnosticKind::SkippedIntermediate { from, to },
                );
                to
            }
            Edge::Stay => from,
        };

        item.status = to;
        if to == OperationStatus::Processing && item.started_at.is_none() {
            item.started_at = Some(at);
        }
        if to.is_terminal() {
            item.completed_at = Some(at);
        }

        match to {
            OperationStatus::Applied => item.progress = 100,
            status if !status.is_terminal() => {
                if let Some(reported) = progress.map(|p| p.min(100)) {
                    if reported >= item.progress {
                        item.progress = reported;
                    } else {
                        self.record(
                            Some(item.id.clone()),
                            item.batch_id.clone(),
                            Some(kind.wire_name()),
                            None,
                            DiagnosticKind::ProgressRegression {
                                current: item.progress,
                                reported,
                            },
                        );
                    }
                }
            }
            _ => {}
        }

        item.error = match to {
            OperationStatus::Error | OperationStatus::Failed => {
                let class = if to == OperationStatus::Failed {
                    ErrorClass::Fatal
                } else {
                    ErrorClass::Recoverable
                };
                let message = error
                    .map(str::to_string)
                    .or_else(|| item.error.as_ref().map(|e| e.message.clone()))
                    .unwrap_or_else(|| format!("{} reported without message", kind.wire_name()));
                Some(ItemError { class, message })
            }
            _ => None,
        };

        to
    }

    fn override_assumed(
        &mut self,
        store: &mut QueueStateStore,
        mut item: OperationItem,
        ev: &OperationEvent,
    ) -> Result<ApplyOutcome, StoreError> {
        let from = item.status;
        match ev.kind {
            EventKind::Success => {
                item.status = OperationStatus::Applied;
                item.progress = 100;
                item.error = None;
                item.cancel = CancelState::None;
            }
            EventKind::Failed => {
                item.status = OperationStatus::Failed;
                item.error = Some(ItemError {
                    class: ErrorClass::Fatal,
                    message: ev
                        .error
                        .clone()
                        .unwrap_or_else(|| "operation failed".to_string()),
                });
                item.cancel = CancelState::None;
            }
            EventKind::Cancelled => {
                item.cancel = CancelState::None;
            }
            _ => {
                let kind = DiagnosticKind::TerminalDiscard { status: item.status };
                return Ok(self.discard(&item, ev, kind));
            }
        }
        item.completed_at = Some(ev.end_at.unwrap_or(ev.timestamp));
        item.last_event_timestamp = Some(ev.timestamp);
        let to = item.status;
        info!(operation_id = %item.id, ?from, ?to, event = ev.kind.wire_name(), "authoritative outcome replaced assumed cancellation");

        let id = item.id.clone();
        store.upsert_override(item)?;
        Ok(ApplyOutcome::Overridden { id, from, to })
    }

    fn apply_batch(
        &mut self,
        store: &mut QueueStateStore,
        batch_id: &str,
        ev: &BatchQueuedEvent,
    ) -> Result<ApplyOutcome, StoreError> {
        let mut batch = store
            .get_batch(batch_id)
            .cloned()
            .ok_or_else(|| StoreError::MissingBatch(batch_id.to_string()))?;

        if let Some(last_accepted) = batch.last_event_timestamp {
            if ev.timestamp <= last_accepted {
                let kind = DiagnosticKind::Stale { last_accepted };
                self.record(None, Some(batch.batch_id), Some(crate::types::BATCH_QUEUED_EVENT), Some(ev.timestamp), kind.clone());
                return Ok(ApplyOutcome::Discarded(kind));
            }
        }

        batch.total_count = batch.total_count.max(ev.total_count);
        batch.reported_queued_count = Some(ev.queued_count);
        if !ev.operation_type.is_empty() {
            batch.operation_type = ev.operation_type.clone();
        }
        for (booster_id, reason) in &ev.validation_errors {
            batch
                .validation_errors
                .entry(booster_id.clone())
                .or_insert_with(|| reason.clone());
        }
        batch.last_event_timestamp = Some(ev.timestamp);
        debug!(batch_id = %batch.batch_id, total = batch.total_count, reported_queued = ev.queued_count, "applied batch event");

        let batch_id = batch.batch_id.clone();
        store.update_batch(batch)?;
        Ok(ApplyOutcome::BatchUpdated { batch_id })
    }

    fn buffer_event(&mut self, event: NormalizedEvent, now: Instant) -> ApplyOutcome {
        if self.config.max_buffered == 0 {
            let (op, batch, name) = event_target(&event);
            self.record(op, batch, Some(name), Some(event.timestamp()), DiagnosticKind::Expired);
            return ApplyOutcome::Discarded(DiagnosticKind::Expired);
        }
        if self.buffer.len() >= self.config.max_buffered {
            if let Some(dropped) = self.buffer.pop_front() {
                let (op, batch, name) = event_target(&dropped.event);
                warn!(operation_id = ?op, batch_id = ?batch, event = name, "event buffer full, dropping oldest");
                self.record(op, batch, Some(name), Some(dropped.event.timestamp()), DiagnosticKind::BufferOverflow);
            }
        }
        let (op, batch, name) = event_target(&event);
        debug!(operation_id = ?op, batch_id = ?batch, event = name, "buffering event for unknown target");
        self.buffer.push_back(Buffered {
            event,
            deadline: now + self.config.grace_period,
        });
        ApplyOutcome::Buffered
    }

    fn discard(&mut self, item: &OperationItem, ev: &OperationEvent, kind: DiagnosticKind) -> ApplyOutcome {
        self.record(
            Some(item.id.clone()),
            item.batch_id.clone(),
            Some(ev.kind.wire_name()),
            Some(ev.timestamp),
            kind.clone(),
        );
        ApplyOutcome::Discarded(kind)
    }

    fn record(
        &mut self,
        operation_id: Option<OperationId>,
        batch_id: Option<BatchId>,
        event: Option<&'static str>,
        event_timestamp: Option<Timestamp>,
        kind: DiagnosticKind,
    ) {
        if self.config.diagnostic_capacity == 0 {
            return;
        }
        while self.diagnostics.len() >= self.config.diagnostic_capacity {
            self.diagnostics.pop_front();
        }
        self.diagnostics.push_back(ReconciliationDiagnostic {
            operation_id,
            batch_id,
            event,
            event_timestamp,
            kind,
            recorded_at: now_ms(),
        });
    }
}

fn event_target(event: &NormalizedEvent) -> (Option<OperationId>, Option<BatchId>, &'static str) {
    match event {
        NormalizedEvent::Operation(ev) => (Some(ev.operation_id.clone()), None, ev.kind.wire_name()),
        NormalizedEvent::BatchQueued(ev) => (None, Some(ev.batch_id.clone()), crate::types::BATCH_QUEUED_EVENT),
    }
}
