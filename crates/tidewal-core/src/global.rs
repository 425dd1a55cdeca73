//! Process-wide journal.
//!
//! Free-function entry points for callers that expect a single journal per
//! process: initialize it once with [`init_journal`], then submit writes with
//! [`request_write`] and report device completions with the named callbacks.

use std::sync::{Arc, OnceLock};

use crate::config::JournalConfig;
use crate::device::{BlockDevice, WriteClient};
use crate::error::JournalError;
use crate::journal::Journal;
use crate::op::WriteId;
use crate::table::CompletionOutcome;

static GLOBAL_JOURNAL: OnceLock<Journal> = OnceLock::new();

/// Starts the process-wide journal.
///
/// Failing to spawn a stage worker is fatal: the error is logged and the
/// process aborts.
///
/// # Errors
///
/// Returns [`JournalError::AlreadyInitialized`] on every call after the
/// first, and [`JournalError::InvalidConfig`] for an unusable configuration.
pub fn init_journal(
    config: JournalConfig,
    device: Arc<dyn BlockDevice>,
    client: Arc<dyn WriteClient>,
) -> Result<(), JournalError> {
    if GLOBAL_JOURNAL.get().is_some() {
        return Err(JournalError::AlreadyInitialized);
    }

    let journal = match Journal::start(config, device, client) {
        Ok(journal) => journal,
        Err(e @ JournalError::SpawnFailed { .. }) => {
            tracing::error!("Failed to initialize journal: {e}");
            std::process::abort();
        }
        Err(e) => return Err(e),
    };

    // A racing initializer may have won; the losing journal is dropped and
    // its workers stopped.
    GLOBAL_JOURNAL
        .set(journal)
        .map_err(|_| JournalError::AlreadyInitialized)
}

/// Returns the process-wide journal, if initialized.
#[must_use]
pub fn journal() -> Option<&'static Journal> {
    GLOBAL_JOURNAL.get()
}

fn global() -> Result<&'static Journal, JournalError> {
    GLOBAL_JOURNAL.get().ok_or(JournalError::NotInitialized)
}

/// Submits `write_id` to the process-wide journal.
///
/// # Errors
///
/// Returns [`JournalError::NotInitialized`] before [`init_journal`], plus
/// every error of [`Journal::request_write`].
pub fn request_write(write_id: WriteId) -> Result<(), JournalError> {
    global()?.request_write(write_id)
}

/// Blocks until every write submitted to the process-wide journal has drained.
///
/// # Errors
///
/// Returns [`JournalError::NotInitialized`] before [`init_journal`].
pub fn journal_wait_for_all() -> Result<(), JournalError> {
    global()?.wait_for_all();
    Ok(())
}

fn complete(
    write_id: WriteId,
    f: impl FnOnce(&crate::CompletionDispatcher, WriteId) -> CompletionOutcome,
) -> Result<CompletionOutcome, JournalError> {
    Ok(f(&global()?.dispatcher(), write_id))
}

macro_rules! global_callbacks {
    ($($(#[$doc:meta])* $name:ident;)*) => {
        $(
            $(#[$doc])*
            ///
            /// # Errors
            ///
            /// Returns [`JournalError::NotInitialized`] before [`init_journal`].
            pub fn $name(write_id: WriteId) -> Result<CompletionOutcome, JournalError> {
                complete(write_id, crate::CompletionDispatcher::$name)
            }
        )*
    };
}

global_callbacks! {
    /// Reports the data write of `write_id` complete.
    write_data_complete;
    /// Reports the journal txb of `write_id` complete.
    journal_txb_complete;
    /// Reports the journal bitmap of `write_id` complete.
    journal_bitmap_complete;
    /// Reports the journal inode of `write_id` complete.
    journal_inode_complete;
    /// Reports the journal txe of `write_id` complete.
    journal_txe_complete;
    /// Reports the checkpoint bitmap write of `write_id` complete.
    write_bitmap_complete;
    /// Reports the checkpoint inode write of `write_id` complete.
    write_inode_complete;
}
