//! Fixed-capacity blocking FIFO between the interpolation worker and the
//! encoder worker.
//!
//! `put` parks while the queue is full and `pop` parks while it is empty.
//! Termination is tracked with an explicit closed flag: once closed, buffered
//! items still drain in order and every later `pop` returns `None` without
//! blocking. `abort` additionally drops buffered items and releases producers
//! parked in `put`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};

use thiserror::Error;

pub const DEFAULT_QUEUE_CAPACITY: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("frame queue is closed")]
pub struct QueueClosed;

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    aborted: bool,
}

pub struct BoundedFrameQueue<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedFrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                aborted: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    /// Appends `item`, blocking while the queue is full. Fails once the queue
    /// has been closed; the item is dropped in that case.
    pub fn put(&self, item: T) -> Result<(), QueueClosed> {
        let mut state = self.lock();
        while !state.closed && state.items.len() >= self.capacity {
            state = self
                .not_full
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if state.closed {
            return Err(QueueClosed);
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes the oldest item, blocking while the queue is empty and still
    /// open. Returns `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Marks the end of the stream. Buffered items remain poppable.
    pub fn signal_termination(&self) {
        let mut state = self.lock();
        state.closed = true;
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Closes the queue, discards buffered items and wakes every waiter.
    /// Returns how many items were dropped.
    pub fn abort(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        state.aborted = true;
        let dropped = state.items.len();
        state.items.clear();
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
        dropped
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> fmt::Debug for BoundedFrameQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("BoundedFrameQueue")
            .field("capacity", &self.capacity)
            .field("len", &state.items.len())
            .field("closed", &state.closed)
            .field("aborted", &state.aborted)
            .finish()
    }
}
