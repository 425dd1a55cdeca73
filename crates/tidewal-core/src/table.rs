//! # Request State Table
//!
//! One slot per in-flight write, indexed by [`WriteId`]. A slot records which
//! of the seven operations have completed, how many issued operations are
//! still outstanding, and whether the checkpoint stage has finished.
//!
//! ## Slot lifecycle
//!
//! ```text
//!            acquire()                    checkpoint_done && pending_io == 0
//!   FREE ───────────────> IN USE ─────────────────────────────────────────> FREE
//!    ▲   (flags reset,       │  record_issue / record_completion
//!    │    generation + 1)    │  wait_join / mark_checkpoint_done
//!    └───────────────────────┘
//! ```
//!
//! Release needs both conditions, in either order: the checkpoint worker
//! reporting completion and every outstanding I/O draining.
//!
//! ## Synchronization
//!
//! A single mutex guards every slot. Each slot has its own condition variable
//! for the join wait and another for slot availability; both are predicate
//! based, so a wakeup is only ever acted on after re-checking the flags under
//! the lock. Every acquisition bumps the slot generation, and completions
//! carrying an older generation are discarded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::JournalError;
use crate::op::{OpSet, Operation, Stage, WriteId};

#[derive(Debug, Default, Clone)]
struct Slot {
    in_use: bool,
    generation: u64,
    completed: OpSet,
    pending_io: u32,
    checkpoint_done: bool,
}

impl Slot {
    fn is_drained(&self) -> bool {
        self.checkpoint_done && self.pending_io == 0
    }
}

#[derive(Debug)]
struct TableState {
    slots: Vec<Slot>,
    in_flight: usize,
    shut_down: bool,
}

/// Point-in-time copy of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSnapshot {
    /// Whether a request currently occupies the slot.
    pub in_use: bool,
    /// Number of times the slot has been acquired.
    pub generation: u64,
    /// Operations completed for the current occupant.
    pub completed: OpSet,
    /// Issued operations that have not completed yet.
    pub pending_io: u32,
    /// Whether the checkpoint stage has reported completion.
    pub checkpoint_done: bool,
}

/// Result of recording a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The flag was recorded; the stage's join is still missing operations.
    Pending,
    /// The flag completed the join for this stage; its worker was woken.
    Joined(Stage),
    /// The completion belongs to a previous occupant (or a free slot) and was ignored.
    Stale,
    /// The operation had already completed for this occupant and was ignored.
    Duplicate,
}

/// Counters for completions the table refused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    /// Completions discarded because they did not match the current occupant.
    pub stale_completions: u64,
    /// Completions discarded because the flag was already set.
    pub duplicate_completions: u64,
}

/// Per-slot state for every in-flight write request.
#[derive(Debug)]
pub struct RequestTable {
    state: Mutex<TableState>,
    /// Per slot: the join condition of the stage holding it may now hold.
    joined: Box<[Condvar]>,
    /// Per slot: the slot was released.
    freed: Box<[Condvar]>,
    /// The table became empty.
    drained: Condvar,
    stale_completions: AtomicU64,
    duplicate_completions: AtomicU64,
}

impl RequestTable {
    /// Creates a table with `capacity` slots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(TableState {
                slots: vec![Slot::default(); capacity],
                in_flight: 0,
                shut_down: false,
            }),
            joined: (0..capacity).map(|_| Condvar::new()).collect(),
            freed: (0..capacity).map(|_| Condvar::new()).collect(),
            drained: Condvar::new(),
            stale_completions: AtomicU64::new(0),
            duplicate_completions: AtomicU64::new(0),
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.joined.len()
    }

    fn check_id(&self, write_id: WriteId) -> Result<(), JournalError> {
        if write_id < self.capacity() {
            Ok(())
        } else {
            Err(JournalError::InvalidWriteId {
                write_id,
                max_write_id: self.capacity().saturating_sub(1),
            })
        }
    }

    /// Claims the slot for `write_id`, blocking until any previous occupant
    /// has fully drained.
    ///
    /// Resets every flag and counter and returns the new slot generation.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::InvalidWriteId`] for an id outside the table
    /// and [`JournalError::ShutDown`] if the table shuts down while waiting.
    pub fn acquire(&self, write_id: WriteId) -> Result<u64, JournalError> {
        self.check_id(write_id)?;

        let mut state = self.state.lock();
        loop {
            if state.shut_down {
                return Err(JournalError::ShutDown);
            }
            if !state.slots[write_id].in_use {
                break;
            }
            tracing::debug!("write {write_id}: slot busy, waiting for previous occupant");
            self.freed[write_id].wait(&mut state);
        }

        let slot = &mut state.slots[write_id];
        let generation = slot.generation.wrapping_add(1);
        *slot = Slot {
            in_use: true,
            generation,
            ..Slot::default()
        };
        state.in_flight += 1;
        Ok(generation)
    }

    /// Records that an operation is about to be issued for `write_id`.
    ///
    /// Must be called before the operation is handed to the block layer so a
    /// fast completion cannot drain the slot early. Returns the generation the
    /// completion must carry.
    pub fn record_issue(&self, write_id: WriteId) -> u64 {
        let mut state = self.state.lock();
        let slot = &mut state.slots[write_id];
        debug_assert!(slot.in_use, "issue for free slot {write_id}");
        slot.pending_io += 1;
        slot.generation
    }

    /// Records the completion of `op` for `write_id`.
    ///
    /// With `Some(generation)` the completion is only accepted for that
    /// occupant of the slot; with `None` it is attributed to the current one.
    /// Wakes the stage worker when the completion satisfies its join, then
    /// releases the slot if it has fully drained.
    pub fn record_completion(
        &self,
        write_id: WriteId,
        op: Operation,
        generation: Option<u64>,
    ) -> CompletionOutcome {
        if write_id >= self.capacity() {
            self.stale_completions.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("{op} completion for unknown write {write_id}, ignoring");
            return CompletionOutcome::Stale;
        }

        let mut state = self.state.lock();
        let slot = &mut state.slots[write_id];

        if !slot.in_use || generation.is_some_and(|g| g != slot.generation) {
            self.stale_completions.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "write {write_id}: stale {op} completion (generation {generation:?}, slot at {}), ignoring",
                slot.generation
            );
            return CompletionOutcome::Stale;
        }

        if !slot.completed.insert(op) {
            self.duplicate_completions.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("write {write_id}: duplicate {op} completion, ignoring");
            return CompletionOutcome::Duplicate;
        }

        if let Some(pending) = slot.pending_io.checked_sub(1) {
            slot.pending_io = pending;
        } else {
            tracing::warn!("write {write_id}: {op} completed without a recorded issue");
        }

        let stage = op.stage();
        let outcome = if slot.completed.contains_all(stage.join()) {
            self.joined[write_id].notify_one();
            CompletionOutcome::Joined(stage)
        } else {
            CompletionOutcome::Pending
        };

        self.try_release(&mut state, write_id);
        outcome
    }

    /// Blocks until every operation of `stage` has completed for `write_id`.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::ShutDown`] if the table shuts down first.
    pub fn wait_join(&self, write_id: WriteId, stage: Stage) -> Result<(), JournalError> {
        let join = stage.join();
        let mut state = self.state.lock();
        loop {
            if state.slots[write_id].completed.contains_all(join) {
                return Ok(());
            }
            if state.shut_down {
                return Err(JournalError::ShutDown);
            }
            self.joined[write_id].wait(&mut state);
        }
    }

    /// Marks the checkpoint stage as finished for `write_id` and releases the
    /// slot if no I/O is outstanding.
    ///
    /// Returns true if the slot was released by this call.
    pub fn mark_checkpoint_done(&self, write_id: WriteId) -> bool {
        let mut state = self.state.lock();
        state.slots[write_id].checkpoint_done = true;
        self.try_release(&mut state, write_id)
    }

    fn try_release(&self, state: &mut TableState, write_id: WriteId) -> bool {
        let slot = &mut state.slots[write_id];
        if !slot.in_use || !slot.is_drained() {
            return false;
        }

        *slot = Slot {
            generation: slot.generation,
            ..Slot::default()
        };
        state.in_flight -= 1;
        tracing::trace!("write {write_id}: slot released");

        self.freed[write_id].notify_all();
        if state.in_flight == 0 {
            self.drained.notify_all();
        }
        true
    }

    /// Blocks until no slot is in use.
    pub fn wait_for_all(&self) {
        let mut state = self.state.lock();
        while state.in_flight > 0 {
            self.drained.wait(&mut state);
        }
    }

    /// Blocks until no slot is in use or `timeout` elapses.
    ///
    /// Returns true if the table drained.
    pub fn wait_for_all_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.in_flight > 0 {
            if self.drained.wait_until(&mut state, deadline).timed_out() {
                return state.in_flight == 0;
            }
        }
        true
    }

    /// Number of slots currently in use.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Returns a copy of the slot for `write_id`, or `None` if out of range.
    #[must_use]
    pub fn snapshot(&self, write_id: WriteId) -> Option<SlotSnapshot> {
        let state = self.state.lock();
        state.slots.get(write_id).map(|slot| SlotSnapshot {
            in_use: slot.in_use,
            generation: slot.generation,
            completed: slot.completed,
            pending_io: slot.pending_io,
            checkpoint_done: slot.checkpoint_done,
        })
    }

    /// Returns counters for refused completions.
    #[must_use]
    pub fn stats(&self) -> TableStats {
        TableStats {
            stale_completions: self.stale_completions.load(Ordering::Relaxed),
            duplicate_completions: self.duplicate_completions.load(Ordering::Relaxed),
        }
    }

    /// Fails every current and future wait with [`JournalError::ShutDown`].
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shut_down = true;
        for cv in self.joined.iter().chain(self.freed.iter()) {
            cv.notify_all();
        }
        self.drained.notify_all();
    }
}
