//! Event normalization, reconciliation, and progress aggregation.

/// Per-batch progress and summary counts derived from the store.
pub mod aggregator;
/// Raw payload to normalized event conversion.
pub mod ingest;
/// Event-to-state reconciliation rules.
pub mod reconciler;
