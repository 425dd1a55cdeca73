//! # Stage Workers
//!
//! Each pipeline stage runs one dedicated thread looping through:
//!
//! ```text
//!   WAIT_INPUT ──> ISSUE ──> WAIT_JOIN ──> ADVANCE ──┐
//!       ▲                                            │
//!       └────────────────────────────────────────────┘
//! ```
//!
//! 1. Pop the next write id from the stage's input queue
//! 2. For every operation the stage owns: record the issue, then hand a
//!    [`Completion`] to the block device
//! 3. Block until the stage's join condition holds for that id
//! 4. Push the id to the next stage, or for the checkpoint stage notify the
//!    client and mark the checkpoint done
//!
//! A join that never completes stalls the worker; that is a liveness bug in
//! the block layer, not an error the worker handles. The loop ends only when
//! shutdown closes the input queue or aborts the join wait.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::device::{BlockDevice, Completion, WriteClient};
use crate::dispatch::CompletionDispatcher;
use crate::error::JournalError;
use crate::op::{Stage, WriteId};
use crate::queue::BoundedQueue;
use crate::table::RequestTable;

/// Where a stage sends a write once its join holds.
pub(crate) enum Downstream {
    /// Hand the id to the next stage.
    Queue(Arc<BoundedQueue<WriteId>>),
    /// Final stage: notify the client and finish the request.
    Client(Arc<dyn WriteClient>),
}

/// Everything a stage worker thread needs.
pub(crate) struct StageContext {
    pub(crate) stage: Stage,
    pub(crate) input: Arc<BoundedQueue<WriteId>>,
    pub(crate) downstream: Downstream,
    pub(crate) table: Arc<RequestTable>,
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) dispatcher: CompletionDispatcher,
    pub(crate) processed: Arc<AtomicU64>,
}

/// Handle to a running stage worker.
#[derive(Debug)]
pub(crate) struct StageWorker {
    stage: Stage,
    thread: Option<JoinHandle<()>>,
    processed: Arc<AtomicU64>,
}

impl StageWorker {
    /// Spawns the worker thread for `ctx.stage`.
    pub(crate) fn spawn(ctx: StageContext, thread_name: String) -> Result<Self, JournalError> {
        let stage = ctx.stage;
        let processed = Arc::clone(&ctx.processed);
        let thread = thread::Builder::new()
            .name(thread_name)
            .spawn(move || stage_thread_main(&ctx))
            .map_err(|e| JournalError::SpawnFailed {
                stage,
                message: e.to_string(),
            })?;

        Ok(Self {
            stage,
            thread: Some(thread),
            processed,
        })
    }

    /// Number of writes this stage has advanced.
    pub(crate) fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Waits for the worker thread to exit.
    pub(crate) fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("{} worker panicked", self.stage);
            }
        }
    }
}

fn stage_thread_main(ctx: &StageContext) {
    tracing::info!("{} worker started", ctx.stage);

    while let Some(write_id) = ctx.input.pop() {
        if let Err(e) = run_stage(ctx, write_id) {
            tracing::info!("{} worker stopping on write {write_id}: {e}", ctx.stage);
            break;
        }
    }

    tracing::info!("{} worker stopped", ctx.stage);
}

/// Drives one write through this stage.
fn run_stage(ctx: &StageContext, write_id: WriteId) -> Result<(), JournalError> {
    for &op in ctx.stage.operations() {
        let generation = ctx.table.record_issue(write_id);
        tracing::debug!("issue {op} {write_id}");
        ctx.device.issue(Completion::new(
            write_id,
            op,
            generation,
            ctx.dispatcher.clone(),
        ));
    }

    ctx.table.wait_join(write_id, ctx.stage)?;
    ctx.processed.fetch_add(1, Ordering::Relaxed);

    match &ctx.downstream {
        Downstream::Queue(next) => {
            tracing::debug!("write {write_id}: {} done, queued for {}", ctx.stage, next.name());
            next.push(write_id).map_err(|_| JournalError::ShutDown)
        }
        Downstream::Client(client) => {
            client.write_complete(write_id);
            ctx.table.mark_checkpoint_done(write_id);
            tracing::debug!("write {write_id}: checkpointed");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn context(
        stage: Stage,
        downstream: Downstream,
        table: &Arc<RequestTable>,
        device: Arc<dyn BlockDevice>,
    ) -> StageContext {
        StageContext {
            stage,
            input: Arc::new(BoundedQueue::new(stage.name(), 4)),
            downstream,
            table: Arc::clone(table),
            device,
            dispatcher: CompletionDispatcher::new(Arc::clone(table)),
            processed: Arc::new(AtomicU64::new(0)),
        }
    }

    fn inline_device() -> Arc<dyn BlockDevice> {
        Arc::new(|completion: Completion| {
            completion.complete();
        })
    }

    #[test]
    fn test_metadata_stage_issues_four_and_advances() {
        let table = Arc::new(RequestTable::new(4));
        let issued = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&issued);
        let device: Arc<dyn BlockDevice> = Arc::new(move |completion: Completion| {
            sink.lock().push(completion.operation());
            completion.complete();
        });
        let next = Arc::new(BoundedQueue::new("commit", 4));
        let ctx = context(
            Stage::Metadata,
            Downstream::Queue(Arc::clone(&next)),
            &table,
            device,
        );

        table.acquire(2).unwrap();
        run_stage(&ctx, 2).unwrap();

        assert_eq!(*issued.lock(), Stage::Metadata.operations().to_vec());
        assert_eq!(next.try_pop(), Some(2));
        assert_eq!(ctx.processed.load(Ordering::Relaxed), 1);
        assert_eq!(table.in_flight(), 1);
    }

    #[test]
    fn test_checkpoint_stage_notifies_client_and_releases() {
        let table = Arc::new(RequestTable::new(4));
        let done = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&done);
        let client: Arc<dyn WriteClient> = Arc::new(move |id: WriteId| sink.lock().push(id));
        let ctx = context(
            Stage::Checkpoint,
            Downstream::Client(client),
            &table,
            inline_device(),
        );

        table.acquire(1).unwrap();
        run_stage(&ctx, 1).unwrap();

        assert_eq!(*done.lock(), vec![1]);
        assert_eq!(table.in_flight(), 0);
        assert!(!table.snapshot(1).unwrap().in_use);
    }

    #[test]
    fn test_worker_exits_when_input_closes() {
        let table = Arc::new(RequestTable::new(4));
        let next = Arc::new(BoundedQueue::new("checkpoint", 4));
        let ctx = context(
            Stage::Commit,
            Downstream::Queue(Arc::clone(&next)),
            &table,
            inline_device(),
        );
        let input = Arc::clone(&ctx.input);

        let mut worker = StageWorker::spawn(ctx, "test-commit".to_string()).unwrap();
        table.acquire(0).unwrap();
        input.push(0).unwrap();
        input.close();
        worker.join();

        assert_eq!(worker.processed(), 1);
        assert_eq!(next.try_pop(), Some(0));
    }
}
