//! Error types for the journaling pipeline.

use crate::op::Stage;

/// Errors that can occur in the journaling pipeline.
///
/// Backpressure (a full stage queue) and slot exhaustion are not errors: both
/// are handled by blocking the caller.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// Failed to spawn a stage worker thread.
    #[error("Failed to spawn {stage} worker: {message}")]
    SpawnFailed {
        /// The stage whose worker could not be spawned
        stage: Stage,
        /// Error message
        message: String,
    },

    /// The write id is outside the slot table.
    #[error("Invalid write id {write_id}: max is {max_write_id}")]
    InvalidWriteId {
        /// The rejected write id
        write_id: usize,
        /// The largest valid write id
        max_write_id: usize,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The process-wide journal was already initialized.
    #[error("Journal is already initialized")]
    AlreadyInitialized,

    /// The process-wide journal has not been initialized yet.
    #[error("Journal is not initialized")]
    NotInitialized,

    /// The journal is shutting down and no longer accepts work.
    #[error("Journal is shut down")]
    ShutDown,
}
