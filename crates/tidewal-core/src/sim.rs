//! # Simulated Block Device
//!
//! An in-memory [`BlockDevice`] for tests, benchmarks and the driver binary.
//! No data is written anywhere; the device only decides *when* each issued
//! operation completes:
//!
//! - **Inline** (default): completes on the issuing thread before `issue`
//!   returns.
//! - **Latency**: every completion is deferred by a fixed duration.
//! - **Delay first**: the first issue of an operation is deferred, every
//!   later one follows the base mode (a slow device on the first txe).
//! - **Hold**: completions for a given (operation, write id) are parked until
//!   [`release_held`](SimulatedBlockDevice::release_held) is called.
//!
//! Deferred completions are fired by a single timer thread draining a
//! deadline-ordered heap, not by a thread per completion.
//!
//! Every issue and completion is appended to an event log, in the order it
//! happened, so tests can assert stage ordering.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::device::{BlockDevice, Completion};
use crate::op::{Operation, WriteId};

/// Kind of entry in the device event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEventKind {
    /// The journal issued the operation.
    Issued,
    /// The device reported the operation complete.
    Completed,
}

/// One entry in the device event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoEvent {
    /// Issue or completion.
    pub kind: IoEventKind,
    /// The write the operation belongs to.
    pub write_id: WriteId,
    /// The operation.
    pub op: Operation,
}

#[derive(Debug, Default)]
struct EventLog {
    events: Mutex<Vec<IoEvent>>,
}

impl EventLog {
    fn record(&self, kind: IoEventKind, write_id: WriteId, op: Operation) {
        self.events.lock().push(IoEvent { kind, write_id, op });
    }

    /// Logs the completion, then reports it to the journal.
    fn complete(&self, completion: Completion) {
        self.record(
            IoEventKind::Completed,
            completion.write_id(),
            completion.operation(),
        );
        completion.complete();
    }
}

struct Scheduled {
    deadline: Instant,
    seq: u64,
    completion: Completion,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed so the max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
    shutdown: bool,
}

#[derive(Default)]
struct TimerShared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

struct Timer {
    shared: Arc<TimerShared>,
    thread: Option<JoinHandle<()>>,
}

impl Timer {
    fn spawn(log: Arc<EventLog>) -> io::Result<Self> {
        let shared = Arc::new(TimerShared::default());
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("tidewal-sim-timer".to_string())
            .spawn(move || timer_thread_main(&thread_shared, &log))?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    fn schedule(&self, deadline: Instant, completion: Completion) {
        let mut state = self.shared.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Scheduled {
            deadline,
            seq,
            completion,
        });
        drop(state);
        self.shared.wakeup.notify_one();
    }

    fn pending(&self) -> usize {
        self.shared.state.lock().heap.len()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wakeup.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn timer_thread_main(shared: &TimerShared, log: &EventLog) {
    let mut state = shared.state.lock();
    loop {
        let now = Instant::now();
        let mut due = Vec::new();
        while state.heap.peek().is_some_and(|s| s.deadline <= now || state.shutdown) {
            if let Some(scheduled) = state.heap.pop() {
                due.push(scheduled.completion);
            }
        }

        if !due.is_empty() {
            // Never call into the journal with the timer lock held.
            drop(state);
            for completion in due {
                log.complete(completion);
            }
            state = shared.state.lock();
            continue;
        }

        if state.shutdown {
            return;
        }

        match state.heap.peek().map(|s| s.deadline) {
            Some(deadline) => {
                shared.wakeup.wait_until(&mut state, deadline);
            }
            None => shared.wakeup.wait(&mut state),
        }
    }
}

/// Builder for `SimulatedBlockDevice`.
#[derive(Debug, Default)]
pub struct SimulatedBlockDeviceBuilder {
    latency: Option<Duration>,
    delay_first: Vec<(Operation, Duration)>,
    holds: Vec<(Operation, WriteId)>,
}

impl SimulatedBlockDeviceBuilder {
    /// Defers every completion by `latency`.
    #[must_use]
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Defers the first issue of `op` by `delay`.
    #[must_use]
    pub fn delay_first(mut self, op: Operation, delay: Duration) -> Self {
        self.delay_first.push((op, delay));
        self
    }

    /// Parks completions of `op` for `write_id` until released.
    #[must_use]
    pub fn hold(mut self, op: Operation, write_id: WriteId) -> Self {
        self.holds.push((op, write_id));
        self
    }

    /// Builds the device, starting the timer thread if anything is deferred.
    ///
    /// # Errors
    ///
    /// Returns an error if the timer thread cannot be spawned.
    pub fn build(self) -> io::Result<SimulatedBlockDevice> {
        let log = Arc::new(EventLog::default());
        let needs_timer = self.latency.is_some_and(|d| !d.is_zero())
            || self.delay_first.iter().any(|(_, d)| !d.is_zero());
        let timer = if needs_timer {
            Some(Timer::spawn(Arc::clone(&log))?)
        } else {
            None
        };

        Ok(SimulatedBlockDevice {
            latency: self.latency.filter(|d| !d.is_zero()),
            delay_first: Mutex::new(self.delay_first),
            holds: Mutex::new(self.holds.into_iter().collect()),
            held: Mutex::new(Vec::new()),
            log,
            timer,
        })
    }
}

/// In-memory block device with configurable completion timing.
pub struct SimulatedBlockDevice {
    latency: Option<Duration>,
    delay_first: Mutex<Vec<(Operation, Duration)>>,
    holds: Mutex<HashSet<(Operation, WriteId)>>,
    held: Mutex<Vec<Completion>>,
    log: Arc<EventLog>,
    timer: Option<Timer>,
}

impl SimulatedBlockDevice {
    /// Creates a device that completes every operation inline.
    #[must_use]
    pub fn inline() -> Self {
        Self {
            latency: None,
            delay_first: Mutex::new(Vec::new()),
            holds: Mutex::new(HashSet::new()),
            held: Mutex::new(Vec::new()),
            log: Arc::new(EventLog::default()),
            timer: None,
        }
    }

    /// Creates a builder for a device with deferred completions.
    #[must_use]
    pub fn builder() -> SimulatedBlockDeviceBuilder {
        SimulatedBlockDeviceBuilder::default()
    }

    /// Parks future completions of `op` for `write_id`.
    pub fn hold(&self, op: Operation, write_id: WriteId) {
        self.holds.lock().insert((op, write_id));
    }

    /// Stops parking, and completes every parked operation on this thread.
    ///
    /// Returns the number of completions released.
    pub fn release_held(&self) -> usize {
        self.holds.lock().clear();
        let held = std::mem::take(&mut *self.held.lock());
        let count = held.len();
        for completion in held {
            tracing::info!(
                "SIMULATION: releasing {} {}",
                completion.operation(),
                completion.write_id()
            );
            self.log.complete(completion);
        }
        count
    }

    /// Number of completions currently parked.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Number of completions waiting on the timer.
    #[must_use]
    pub fn scheduled_count(&self) -> usize {
        self.timer.as_ref().map_or(0, Timer::pending)
    }

    /// Returns a copy of the event log.
    #[must_use]
    pub fn events(&self) -> Vec<IoEvent> {
        self.log.events.lock().clone()
    }

    /// Returns how many times `op` was issued for `write_id`.
    #[must_use]
    pub fn issued(&self, write_id: WriteId, op: Operation) -> usize {
        self.log
            .events
            .lock()
            .iter()
            .filter(|e| e.kind == IoEventKind::Issued && e.write_id == write_id && e.op == op)
            .count()
    }

    fn take_first_delay(&self, op: Operation) -> Option<Duration> {
        let mut delays = self.delay_first.lock();
        let index = delays.iter().position(|(o, _)| *o == op)?;
        Some(delays.swap_remove(index).1)
    }
}

impl BlockDevice for SimulatedBlockDevice {
    fn issue(&self, completion: Completion) {
        let write_id = completion.write_id();
        let op = completion.operation();
        self.log.record(IoEventKind::Issued, write_id, op);

        if self.holds.lock().contains(&(op, write_id)) {
            tracing::info!("SIMULATION: holding {op} {write_id}");
            self.held.lock().push(completion);
            return;
        }

        let delay = match self.take_first_delay(op) {
            Some(delay) => {
                tracing::info!("SIMULATION: device is slow writing {op} {write_id} ({delay:?})");
                Some(delay)
            }
            None => self.latency,
        };

        match (delay, &self.timer) {
            (Some(delay), Some(timer)) if !delay.is_zero() => {
                timer.schedule(Instant::now() + delay, completion);
            }
            _ => self.log.complete(completion),
        }
    }
}

impl std::fmt::Debug for SimulatedBlockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedBlockDevice")
            .field("latency", &self.latency)
            .field("held", &self.held_count())
            .field("scheduled", &self.scheduled_count())
            .finish_non_exhaustive()
    }
}
