//! Single-writer operation controller and its event stream.

/// Event stream types emitted by the controller.
pub mod events;
/// Controller handle and command loop implementation.
pub mod handle;
