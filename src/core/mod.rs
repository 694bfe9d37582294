//! In-memory authoritative queue store and index helpers.

/// Helper index aliases.
pub mod indices;
/// Authoritative operation and batch store.
pub mod store;
