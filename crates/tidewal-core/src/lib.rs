//! # tidewal Core
//!
//! A write-ahead journaling pipeline. Write requests from a filesystem client
//! are driven through three asynchronous persistence stages, and the client is
//! told once each write is committed and checkpointed.
//!
//! This crate provides:
//! - **Stage queues**: bounded blocking FIFOs between stages ([`queue`])
//! - **Request table**: per-write completion flags and outstanding I/O ([`table`])
//! - **Stage workers**: one thread per stage, issue then join
//! - **Completion dispatch**: callbacks the block layer reports to ([`dispatch`])
//! - **Journal**: the client-facing facade ([`Journal`], [`global`])
//! - **Simulated device**: an in-memory block layer for tests ([`sim`])
//!
//! ## Pipeline
//!
//! | Stage | Issues | Join |
//! |-------|--------|------|
//! | Metadata | data, journal txb, journal bitmap, journal inode | all 4 |
//! | Commit | journal txe | 1 |
//! | Checkpoint | bitmap, inode | both |
//!
//! Writes with different ids overlap freely across stages; a slow completion
//! only stalls the stage waiting on it, up to each queue's capacity.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tidewal_core::{Journal, JournalConfig, sim::SimulatedBlockDevice};
//!
//! let device = Arc::new(SimulatedBlockDevice::inline());
//! let journal = Journal::start(
//!     JournalConfig::default(),
//!     device,
//!     Arc::new(|id: usize| println!("write complete {id}")),
//! )?;
//!
//! for id in 0..16 {
//!     journal.request_write(id)?;
//! }
//! journal.wait_for_all();
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod global;
pub mod journal;
pub mod op;
pub mod queue;
pub mod sim;
mod stage;
pub mod table;

// Re-export key types
pub use config::{JournalConfig, JournalConfigBuilder, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_REQUESTS};
pub use device::{BlockDevice, Completion, WriteClient};
pub use dispatch::CompletionDispatcher;
pub use error::JournalError;
pub use journal::{Journal, JournalStats, StageStats};
pub use op::{OpSet, Operation, Stage, WriteId};
pub use queue::{BoundedQueue, QueueStats};
pub use table::{CompletionOutcome, RequestTable, SlotSnapshot, TableStats};

/// Result type for tidewal-core operations
pub type Result<T> = std::result::Result<T, JournalError>;
