use chrono::DateTime;
use thiserror::Error;
use tracing::debug;

use crate::{
    event::{BatchQueuedEvent, NormalizedEvent, OperationEvent, RawEventPayload, RawTimestamp},
    types::{EventKind, OperationStatus, Timestamp, BATCH_QUEUED_EVENT},
};

/// Payload that could not be normalized.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Not valid JSON for the payload shape.
    #[error("event payload decode failed: {0}")]
    Decode(#[from] serde_json::Error),
    /// `EventType` outside the closed set.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
    /// Required field absent.
    #[error("{event} is missing {field}")]
    MissingField {
        /// Event type.
        event: String,
        /// Wire field name.
        field: &'static str,
    },
    /// Timestamp not epoch millis or RFC 3339.
    #[error("invalid timestamp: {0}")]
    BadTimestamp(String),
}

/// Counters kept by [`EventIngestor`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Payloads normalized.
    pub accepted: u64,
    /// Payloads rejected.
    pub rejected: u64,
}

/// Turns raw backend payloads into [`NormalizedEvent`]s.
#[derive(Debug, Default)]
pub struct EventIngestor {
    stats: IngestStats,
}

impl EventIngestor {
    /// Ingestor with zeroed stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters since creation.
    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Decodes and normalizes one JSON payload.
    pub fn ingest_bytes(&mut self, payload: &[u8]) -> Result<NormalizedEvent, IngestError> {
        let out = serde_json::from_slice::<RawEventPayload>(payload)
            .map_err(IngestError::from)
            .and_then(normalize);
        self.count(out)
    }

    /// Normalizes an already decoded payload.
    pub fn ingest(&mut self, raw: RawEventPayload) -> Result<NormalizedEvent, IngestError> {
        self.count(normalize(raw))
    }

    fn count(&mut self, out: Result<NormalizedEvent, IngestError>) -> Result<NormalizedEvent, IngestError> {
        match &out {
            Ok(_) => self.stats.accepted += 1,
            Err(_) => self.stats.rejected += 1,
        }
        out
    }
}

/// Maps a wire event type to the closed per-operation set.
pub fn parse_event_kind(event_type: &str) -> Option<EventKind> {
    match event_type {
        "booster.queued" => Some(EventKind::Queued),
        "booster.processing" => Some(EventKind::Processing),
        "booster.success" => Some(EventKind::Success),
        "booster.error" => Some(EventKind::Error),
        "booster.failed" => Some(EventKind::Failed),
        "booster.cancelled" => Some(EventKind::Cancelled),
        _ => None,
    }
}

/// Normalizes one raw payload.
pub fn normalize(raw: RawEventPayload) -> Result<NormalizedEvent, IngestError> {
    let event_type = raw.event_type.trim().to_string();
    let timestamp = match &raw.timestamp {
        Some(ts) => parse_timestamp(ts)?,
        None => {
            return Err(IngestError::MissingField {
                event: event_type,
                field: "Timestamp",
            });
        }
    };

    if event_type == BATCH_QUEUED_EVENT {
        let batch_id = non_empty(raw.batch_id).ok_or_else(|| IngestError::MissingField {
            event: event_type.clone(),
            field: "BatchID",
        })?;
        return Ok(NormalizedEvent::BatchQueued(BatchQueuedEvent {
            batch_id,
            operation_type: raw.operation_type.unwrap_or_default(),
            timestamp,
            total_count: raw.total_count.unwrap_or(0),
            queued_count: raw.queued_count.unwrap_or(0),
            validation_errors: raw.validation_errors.unwrap_or_default(),
            queue_size: raw.queue_size,
        }));
    }

    let kind = parse_event_kind(&event_type).ok_or_else(|| IngestError::UnknownEventType(event_type.clone()))?;
    let operation_id = non_empty(raw.operation_id).ok_or_else(|| IngestError::MissingField {
        event: event_type.clone(),
        field: "OperationID",
    })?;

    let status = raw.status.as_deref().and_then(OperationStatus::parse);
    if raw.status.is_some() && status.is_none() {
        debug!(%operation_id, status = ?raw.status, "ignoring unrecognized status text");
    }
    let end_at = raw.end_at.as_ref().map(parse_timestamp).transpose()?;

    let mut ev = OperationEvent::new(operation_id, kind, timestamp);
    ev.booster_id = non_empty(raw.booster_id);
    ev.status = status;
    ev.progress = raw.progress.map(|p| p.min(100) as u8);
    ev.error = non_empty(raw.error);
    ev.end_at = end_at;
    ev.queue_size = raw.queue_size;
    Ok(NormalizedEvent::Operation(ev))
}

/// Accepts epoch milliseconds, a numeric string, or RFC 3339 text.
pub fn parse_timestamp(raw: &RawTimestamp) -> Result<Timestamp, IngestError> {
    match raw {
        RawTimestamp::Millis(ms) => Ok(*ms),
        RawTimestamp::Text(text) => {
            let text = text.trim();
            if let Ok(ms) = text.parse::<u64>() {
                return Ok(ms);
            }
            let parsed = DateTime::parse_from_rfc3339(text).map_err(|e| IngestError::BadTimestamp(format!("{text}: {e}")))?;
            u64::try_from(parsed.timestamp_millis()).map_err(|_| IngestError::BadTimestamp(text.to_string()))
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
