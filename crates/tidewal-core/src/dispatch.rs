//! Completion callbacks invoked by the block layer.
//!
//! Each callback records one operation in the [`RequestTable`], re-evaluates
//! the join condition of the stage that owns the operation and wakes that
//! stage's worker when the join holds. Callbacks may run on any thread,
//! including inline inside [`BlockDevice::issue`](crate::BlockDevice::issue).

use std::sync::Arc;

use crate::op::{Operation, WriteId};
use crate::table::{CompletionOutcome, RequestTable};

/// Cloneable handle to the completion entry points of a journal.
#[derive(Debug, Clone)]
pub struct CompletionDispatcher {
    table: Arc<RequestTable>,
}

impl CompletionDispatcher {
    pub(crate) fn new(table: Arc<RequestTable>) -> Self {
        Self { table }
    }

    /// Records completion of `op` for the current occupant of `write_id`.
    pub fn complete(&self, write_id: WriteId, op: Operation) -> CompletionOutcome {
        self.dispatch(write_id, op, None)
    }

    pub(crate) fn dispatch(
        &self,
        write_id: WriteId,
        op: Operation,
        generation: Option<u64>,
    ) -> CompletionOutcome {
        tracing::trace!("{op} complete {write_id}");
        let outcome = self.table.record_completion(write_id, op, generation);
        if let CompletionOutcome::Joined(stage) = outcome {
            tracing::trace!("write {write_id}: {stage} join satisfied");
        }
        outcome
    }

    /// The data block of `write_id` reached the device.
    pub fn write_data_complete(&self, write_id: WriteId) -> CompletionOutcome {
        self.complete(write_id, Operation::WriteData)
    }

    /// The journal transaction-begin block of `write_id` reached the device.
    pub fn journal_txb_complete(&self, write_id: WriteId) -> CompletionOutcome {
        self.complete(write_id, Operation::JournalTxb)
    }

    /// The journaled bitmap of `write_id` reached the device.
    pub fn journal_bitmap_complete(&self, write_id: WriteId) -> CompletionOutcome {
        self.complete(write_id, Operation::JournalBitmap)
    }

    /// The journaled inode of `write_id` reached the device.
    pub fn journal_inode_complete(&self, write_id: WriteId) -> CompletionOutcome {
        self.complete(write_id, Operation::JournalInode)
    }

    /// The transaction-end block of `write_id` reached the device.
    pub fn journal_txe_complete(&self, write_id: WriteId) -> CompletionOutcome {
        self.complete(write_id, Operation::JournalTxe)
    }

    /// The checkpointed bitmap of `write_id` reached the device.
    pub fn write_bitmap_complete(&self, write_id: WriteId) -> CompletionOutcome {
        self.complete(write_id, Operation::WriteBitmap)
    }

    /// The checkpointed inode of `write_id` reached the device.
    pub fn write_inode_complete(&self, write_id: WriteId) -> CompletionOutcome {
        self.complete(write_id, Operation::WriteInode)
    }
}
