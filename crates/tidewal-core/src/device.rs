//! Block layer and client contracts.
//!
//! The journal never performs I/O itself. Stage workers hand one
//! [`Completion`] per operation to a [`BlockDevice`]; the device finishes the
//! operation whenever it likes, on whatever thread it likes, and calls
//! [`Completion::complete`]. The token is consumed by `complete`, so an issue
//! can be completed at most once.

use std::fmt;

use crate::dispatch::CompletionDispatcher;
use crate::op::{Operation, WriteId};
use crate::table::CompletionOutcome;

/// The block layer the journal issues operations to.
pub trait BlockDevice: Send + Sync {
    /// Schedules `completion.operation()` for `completion.write_id()`.
    ///
    /// The device must eventually call [`Completion::complete`], either
    /// inline before returning or later from any thread.
    fn issue(&self, completion: Completion);
}

impl<F> BlockDevice for F
where
    F: Fn(Completion) + Send + Sync,
{
    fn issue(&self, completion: Completion) {
        self(completion);
    }
}

/// The filesystem client notified when a write is committed and checkpointed.
pub trait WriteClient: Send + Sync {
    /// Called exactly once per request, after its checkpoint stage.
    ///
    /// Runs on the checkpoint worker thread before the slot is released, so
    /// it must not wait on a new request for the same `write_id`.
    fn write_complete(&self, write_id: WriteId);
}

impl<F> WriteClient for F
where
    F: Fn(WriteId) + Send + Sync,
{
    fn write_complete(&self, write_id: WriteId) {
        self(write_id);
    }
}

/// One-shot completion token for an issued operation.
#[must_use = "an issued operation that is never completed stalls its stage"]
pub struct Completion {
    write_id: WriteId,
    op: Operation,
    generation: u64,
    dispatcher: CompletionDispatcher,
    completed: bool,
}

impl Completion {
    pub(crate) fn new(
        write_id: WriteId,
        op: Operation,
        generation: u64,
        dispatcher: CompletionDispatcher,
    ) -> Self {
        Self {
            write_id,
            op,
            generation,
            dispatcher,
            completed: false,
        }
    }

    /// The write this operation belongs to.
    #[must_use]
    pub fn write_id(&self) -> WriteId {
        self.write_id
    }

    /// The operation to perform.
    #[must_use]
    pub fn operation(&self) -> Operation {
        self.op
    }

    /// The slot generation the operation was issued for.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Reports the operation as durable.
    pub fn complete(mut self) -> CompletionOutcome {
        self.completed = true;
        self.dispatcher
            .dispatch(self.write_id, self.op, Some(self.generation))
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("write_id", &self.write_id)
            .field("op", &self.op)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.completed {
            tracing::warn!(
                "write {}: {} dropped without completing; its stage will stall",
                self.write_id,
                self.op
            );
        }
    }
}
