//! # Journal
//!
//! The boundary the filesystem client talks to. Owns the request table, the
//! three stage queues and the three stage workers.
//!
//! ```text
//! request_write ──> [metadata queue] ──> metadata worker  (data, txb, bitmap, inode)
//!                                              │
//!                   [commit queue]     <───────┘
//!                          │
//!                          └──────────> commit worker     (txe)
//!                                              │
//!                   [checkpoint queue] <───────┘
//!                          │
//!                          └──────────> checkpoint worker (bitmap, inode)
//!                                              │
//!                                              └──> WriteClient::write_complete
//! ```

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use crate::config::JournalConfig;
use crate::device::{BlockDevice, WriteClient};
use crate::dispatch::CompletionDispatcher;
use crate::error::JournalError;
use crate::op::{Stage, WriteId};
use crate::queue::{BoundedQueue, QueueStats};
use crate::stage::{Downstream, StageContext, StageWorker};
use crate::table::{RequestTable, SlotSnapshot, TableStats};

/// Counters for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageStats {
    /// The stage.
    pub stage: Stage,
    /// Writes that passed this stage's join.
    pub processed: u64,
    /// The stage's input queue.
    pub queue: QueueStats,
}

/// Snapshot of journal counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalStats {
    /// Per-stage counters, in pipeline order.
    pub stages: Vec<StageStats>,
    /// Slots currently in use.
    pub in_flight: usize,
    /// Completions the request table refused.
    pub table: TableStats,
}

/// A running write-ahead journaling pipeline.
pub struct Journal {
    config: JournalConfig,
    table: Arc<RequestTable>,
    queues: [Arc<BoundedQueue<WriteId>>; 3],
    workers: Vec<StageWorker>,
    dispatcher: CompletionDispatcher,
}

impl Journal {
    /// Builds the pipeline and spawns its three stage workers.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::InvalidConfig`] for an unusable configuration
    /// and [`JournalError::SpawnFailed`] if a worker thread cannot be created.
    pub fn start(
        config: JournalConfig,
        device: Arc<dyn BlockDevice>,
        client: Arc<dyn WriteClient>,
    ) -> Result<Self, JournalError> {
        config.validate()?;

        let table = Arc::new(RequestTable::new(config.max_requests));
        let dispatcher = CompletionDispatcher::new(Arc::clone(&table));
        let queues = Stage::ALL.map(|stage| {
            Arc::new(BoundedQueue::new(stage.name(), config.buffer_size))
        });

        let mut journal = Self {
            config,
            table,
            queues,
            workers: Vec::with_capacity(Stage::ALL.len()),
            dispatcher,
        };

        for stage in Stage::ALL {
            let downstream = match stage.next() {
                Some(next) => Downstream::Queue(Arc::clone(&journal.queues[next.index()])),
                None => Downstream::Client(Arc::clone(&client)),
            };
            let ctx = StageContext {
                stage,
                input: Arc::clone(&journal.queues[stage.index()]),
                downstream,
                table: Arc::clone(&journal.table),
                device: Arc::clone(&device),
                dispatcher: journal.dispatcher.clone(),
                processed: Arc::new(AtomicU64::new(0)),
            };
            let name = format!("{}-{}", journal.config.thread_name_prefix, stage.name());
            // On failure, dropping `journal` stops the workers already running.
            let worker = StageWorker::spawn(ctx, name)?;
            journal.workers.push(worker);
        }

        tracing::info!(
            "journal started: {} slots, stage queue capacity {}",
            journal.config.max_requests,
            journal.config.buffer_size
        );
        Ok(journal)
    }

    /// Submits `write_id` to the pipeline.
    ///
    /// Blocks only while the slot is still held by a previous write with the
    /// same id, or while the metadata queue is full; never waits for I/O.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::InvalidWriteId`] if `write_id` is not below
    /// `max_requests` and [`JournalError::ShutDown`] after shutdown.
    pub fn request_write(&self, write_id: WriteId) -> Result<(), JournalError> {
        self.table.acquire(write_id)?;
        tracing::debug!("requesting write {write_id}");
        self.queues[Stage::Metadata.index()]
            .push(write_id)
            .map_err(|_| JournalError::ShutDown)
    }

    /// Blocks until every submitted write has been checkpointed and drained.
    pub fn wait_for_all(&self) {
        self.table.wait_for_all();
    }

    /// Like [`wait_for_all`](Self::wait_for_all), giving up after `timeout`.
    ///
    /// Returns true if the journal drained.
    #[must_use]
    pub fn wait_for_all_timeout(&self, timeout: Duration) -> bool {
        self.table.wait_for_all_timeout(timeout)
    }

    /// Handle to the completion callbacks, for block layers that report by id.
    #[must_use]
    pub fn dispatcher(&self) -> CompletionDispatcher {
        self.dispatcher.clone()
    }

    /// Returns the configuration the journal was started with.
    #[must_use]
    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    /// Returns the state of the slot for `write_id`.
    #[must_use]
    pub fn slot(&self, write_id: WriteId) -> Option<SlotSnapshot> {
        self.table.snapshot(write_id)
    }

    /// Number of writes submitted and not yet drained.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.table.in_flight()
    }

    /// Returns a snapshot of the journal counters.
    #[must_use]
    pub fn stats(&self) -> JournalStats {
        let stages = Stage::ALL
            .iter()
            .map(|&stage| StageStats {
                stage,
                processed: self
                    .workers
                    .get(stage.index())
                    .map_or(0, StageWorker::processed),
                queue: self.queues[stage.index()].stats(),
            })
            .collect();

        JournalStats {
            stages,
            in_flight: self.table.in_flight(),
            table: self.table.stats(),
        }
    }

    /// Stops the stage workers and waits for them to exit.
    ///
    /// Writes still in the pipeline are abandoned. Idempotent.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        for queue in &self.queues {
            queue.close();
        }
        self.table.shutdown();
        for worker in &mut self.workers {
            worker.join();
        }
        self.workers.clear();
        tracing::info!("journal shut down");
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight())
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}
