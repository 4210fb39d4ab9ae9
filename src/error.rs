//! Core error types.
//!
//! Every public API in this crate returns [`CoreResult`]. Each variant
//! carries enough context for callers to decide how to handle the failure
//! without inspecting opaque strings. Conditions that are not really
//! errors -- lookup misses, duplicate registration -- are surfaced as
//! plain `bool`/`Option` returns instead of a `CoreError` variant.

use crate::task::TaskHandle;

/// Unified error type for the scheduler and event dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The referenced task handle does not exist, or has already been
    /// retired and forgotten by the scheduler.
    #[error("task not found: {0:?}")]
    TaskNotFound(TaskHandle),

    /// `schedule_*` was called after the scheduler's main loop has already
    /// been asked to stop.
    #[error("scheduler is shut down")]
    SchedulerShutdown,
}

/// Convenience alias used throughout the crate.
pub type CoreResult<T> = std::result::Result<T, CoreError>;
