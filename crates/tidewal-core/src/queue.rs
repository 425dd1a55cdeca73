//! # Bounded Stage Queue
//!
//! Fixed-capacity blocking FIFO connecting the pipeline stages.
//!
//! - `push` blocks while the queue is full (backpressure, never an error)
//! - `pop` blocks while the queue is empty
//! - Safe for any number of producers and consumers
//!
//! A producer that has to wait is a pipeline stall: it is counted in
//! [`QueueStats::push_blocked`] and logged at `debug`.
//!
//! `close` exists only for shutdown. Once closed, `push` hands the item back
//! and `pop` drains what is left before returning `None`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

/// Error returned when pushing into a closed queue.
#[derive(Debug, PartialEq, Eq)]
pub struct PushError<T> {
    /// The value that could not be pushed.
    pub value: T,
}

impl<T> PushError<T> {
    /// Consumes the error and returns the value that could not be pushed.
    #[must_use]
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue is closed")
    }
}

impl<T: fmt::Debug> std::error::Error for PushError<T> {}

/// Error returned from `try_push`.
#[derive(Debug, PartialEq, Eq)]
pub enum TryPushError<T> {
    /// The queue is at capacity.
    Full(T),
    /// The queue is closed.
    Closed(T),
}

impl<T> TryPushError<T> {
    /// Consumes the error and returns the value that could not be pushed.
    #[must_use]
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(value) | Self::Closed(value) => value,
        }
    }

    /// Returns true if the error is due to a full queue.
    #[must_use]
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Items pushed.
    pub pushed: u64,
    /// Items popped.
    pub popped: u64,
    /// Times a producer had to wait for space.
    pub push_blocked: u64,
    /// Times a consumer had to wait for an item.
    pub pop_waited: u64,
}

/// Blocking bounded FIFO queue.
pub struct BoundedQueue<T> {
    name: &'static str,
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    closed: AtomicBool,
    pushed: AtomicU64,
    popped: AtomicU64,
    push_blocked: AtomicU64,
    pop_waited: AtomicU64,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(name: &'static str, capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            name,
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            closed: AtomicBool::new(false),
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
            push_blocked: AtomicU64::new(0),
            pop_waited: AtomicU64::new(0),
        }
    }

    /// Pushes an item, blocking while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns the item in a [`PushError`] if the queue is closed. A full
    /// queue is never an error.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        let mut items = self.items.lock();
        let mut stalled = false;
        while items.len() >= self.capacity {
            if self.is_closed() {
                return Err(PushError { value: item });
            }
            if !stalled {
                stalled = true;
                self.push_blocked.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "{} queue full ({} items), producer waiting",
                    self.name,
                    self.capacity
                );
            }
            self.not_full.wait(&mut items);
        }
        if self.is_closed() {
            return Err(PushError { value: item });
        }
        items.push_back(item);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        drop(items);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Pushes an item without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`TryPushError::Full`] if the queue is at capacity and
    /// [`TryPushError::Closed`] if it has been closed.
    pub fn try_push(&self, item: T) -> Result<(), TryPushError<T>> {
        let mut items = self.items.lock();
        if self.is_closed() {
            return Err(TryPushError::Closed(item));
        }
        if items.len() >= self.capacity {
            return Err(TryPushError::Full(item));
        }
        items.push_back(item);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        drop(items);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Pops the oldest item, blocking while the queue is empty.
    ///
    /// Returns `None` only once the queue is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut items = self.items.lock();
        let mut waited = false;
        loop {
            if let Some(item) = items.pop_front() {
                self.popped.fetch_add(1, Ordering::Relaxed);
                drop(items);
                self.not_full.notify_one();
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }
            if !waited {
                waited = true;
                self.pop_waited.fetch_add(1, Ordering::Relaxed);
            }
            self.not_empty.wait(&mut items);
        }
    }

    /// Pops the oldest item without blocking.
    pub fn try_pop(&self) -> Option<T> {
        let item = self.items.lock().pop_front();
        if item.is_some() {
            self.popped.fetch_add(1, Ordering::Relaxed);
            self.not_full.notify_one();
        }
        item
    }

    /// Closes the queue and wakes every blocked producer and consumer.
    pub fn close(&self) {
        let items = self.items.lock();
        self.closed.store(true, Ordering::Release);
        drop(items);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Returns true if the queue has been closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Returns true if no items are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Returns the queue capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the queue name used in logs.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns a snapshot of the queue counters.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.pushed.load(Ordering::Relaxed),
            popped: self.popped.load(Ordering::Relaxed),
            push_blocked: self.push_blocked.load(Ordering::Relaxed),
            pop_waited: self.pop_waited.load(Ordering::Relaxed),
        }
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
