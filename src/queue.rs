//! Bounded, closable, multi-producer/multi-consumer queue.
//!
//! Every pipeline stage communicates through one of these: producers hold
//! RAII [`Producer`] tokens and the queue closes automatically when the last
//! token is dropped. Consumers keep draining after closure and only observe
//! [`QueueError::Closed`] once the queue is both closed and empty, so no
//! item in flight is ever lost during shutdown.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Error type for queue operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue is closed (and, for `get`, empty).
    #[error("queue is closed")]
    Closed,
}

/// What `put` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Block until room is available; fail `Closed` if the queue closes
    /// during the wait.
    #[default]
    Block,
    /// Count the new item as dropped and return successfully.
    DropNew,
    /// Evict the oldest item to make room, counting the eviction as a drop.
    KeepNewest,
}

/// Monotonic put/get/drop counters, readable with optional reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounters {
    pub total_put: u64,
    pub total_get: u64,
    pub total_drop: u64,
}

struct State<T> {
    buffer: VecDeque<T>,
    producer_count: usize,
    closed: bool,
    counters: QueueCounters,
}

struct Inner<T> {
    capacity: usize,
    policy: OverflowPolicy,
    state: Mutex<State<T>>,
    // One condvar, broadcast on every mutation: size changes in either
    // direction and closure all have waiters with different predicates.
    cond: Condvar,
}

/// Fixed-capacity blocking MPMC queue.
///
/// Cloning the handle shares the same underlying queue. All puts go through
/// a [`Producer`] token obtained from [`Queue::create_producer`].
pub struct Queue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Queue<T> {
    /// Creates a queue with the [`OverflowPolicy::Block`] policy.
    pub fn new(capacity: usize) -> Self {
        Self::with_policy(capacity, OverflowPolicy::Block)
    }

    /// Creates a queue with an explicit overflow policy.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_policy(capacity: usize, policy: OverflowPolicy) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            inner: Arc::new(Inner {
                capacity,
                policy,
                state: Mutex::new(State {
                    buffer: VecDeque::with_capacity(capacity),
                    producer_count: 0,
                    closed: false,
                    counters: QueueCounters::default(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Registers a new producer token. Fails if the queue is already closed.
    pub fn create_producer(&self) -> Result<Producer<T>, QueueError> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        state.producer_count += 1;
        Ok(Producer {
            queue: self.clone(),
        })
    }

    /// Blocks until an item is available. Items remaining after closure are
    /// still returned; `Closed` is surfaced only once the queue is empty.
    pub fn get(&self) -> Result<T, QueueError> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(item) = state.buffer.pop_front() {
                state.counters.total_get += 1;
                self.inner.cond.notify_all();
                return Ok(item);
            }
            if state.closed {
                return Err(QueueError::Closed);
            }
            self.inner.cond.wait(&mut state);
        }
    }

    /// Blocks until `count` items have been collected.
    ///
    /// If the queue closes mid-collection, the items gathered so far are
    /// returned as a short batch; `Closed` is returned only when nothing at
    /// all could be collected.
    pub fn get_batch(&self, count: usize) -> Result<Vec<T>, QueueError> {
        let mut out = Vec::with_capacity(count);
        let mut state = self.inner.state.lock();
        loop {
            while out.len() < count {
                match state.buffer.pop_front() {
                    Some(item) => {
                        state.counters.total_get += 1;
                        out.push(item);
                    }
                    None => break,
                }
            }
            if out.len() == count {
                self.inner.cond.notify_all();
                return Ok(out);
            }
            if state.closed {
                self.inner.cond.notify_all();
                if out.is_empty() {
                    return Err(QueueError::Closed);
                }
                return Ok(out);
            }
            self.inner.cond.wait(&mut state);
        }
    }

    /// Returns the current number of queued items.
    pub fn size(&self) -> usize {
        self.inner.state.lock().buffer.len()
    }

    /// Returns the fixed capacity.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Returns true once the queue has been closed. Closure is terminal.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Closes the queue. Idempotent; wakes all blocked producers and
    /// consumers.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if !state.closed {
            state.closed = true;
            debug!(
                producers = state.producer_count,
                remaining = state.buffer.len(),
                "queue closed explicitly"
            );
            self.inner.cond.notify_all();
        }
    }

    /// Reads the put/get/drop counters without resetting them.
    pub fn counters(&self) -> QueueCounters {
        self.inner.state.lock().counters
    }

    /// Reads the put/get/drop counters and resets them to zero.
    pub fn flush_counters(&self) -> QueueCounters {
        let mut state = self.inner.state.lock();
        std::mem::take(&mut state.counters)
    }

    /// Blocks until the queue holds at least `size` items.
    pub fn wait_size_at_least(&self, size: usize) {
        let mut state = self.inner.state.lock();
        while state.buffer.len() < size {
            self.inner.cond.wait(&mut state);
        }
    }

    /// Blocks until the queue holds at most `size` items.
    pub fn wait_size_at_most(&self, size: usize) {
        let mut state = self.inner.state.lock();
        while state.buffer.len() > size {
            self.inner.cond.wait(&mut state);
        }
    }

    /// Blocks until the queue has at least `room` free slots.
    pub fn wait_room_at_least(&self, room: usize) {
        let mut state = self.inner.state.lock();
        while self.inner.capacity - state.buffer.len() < room {
            self.inner.cond.wait(&mut state);
        }
    }

    /// Blocks until the queue has at most `room` free slots.
    pub fn wait_room_at_most(&self, room: usize) {
        let mut state = self.inner.state.lock();
        while self.inner.capacity - state.buffer.len() > room {
            self.inner.cond.wait(&mut state);
        }
    }

    fn remove_producer(&self) {
        let mut state = self.inner.state.lock();
        state.producer_count -= 1;
        if state.producer_count == 0 && !state.closed {
            state.closed = true;
            debug!("queue closed after last producer detached");
            self.inner.cond.notify_all();
        }
    }
}

/// RAII producer token. The queue closes automatically when the last token
/// is dropped; [`Producer::close`] releases a token explicitly.
pub struct Producer<T> {
    queue: Queue<T>,
}

impl<T> Producer<T> {
    /// Puts a single item. Behavior when full is governed by the queue's
    /// [`OverflowPolicy`].
    pub fn put(&self, item: T) -> Result<(), QueueError> {
        let inner = &self.queue.inner;
        let mut state = inner.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        state.counters.total_put += 1;

        match inner.policy {
            OverflowPolicy::Block => {
                while state.buffer.len() >= inner.capacity && !state.closed {
                    inner.cond.wait(&mut state);
                }
                // Second check needed: queue might have closed while waiting.
                if state.closed {
                    return Err(QueueError::Closed);
                }
            }
            OverflowPolicy::DropNew => {
                if state.buffer.len() >= inner.capacity {
                    state.counters.total_drop += 1;
                    return Ok(());
                }
            }
            OverflowPolicy::KeepNewest => {
                if state.buffer.len() >= inner.capacity {
                    state.buffer.pop_front();
                    state.counters.total_drop += 1;
                }
            }
        }

        state.buffer.push_back(item);
        inner.cond.notify_all();
        Ok(())
    }

    /// Puts a batch of items, releasing the lock between chunks so that
    /// consumers can interleave.
    ///
    /// Under [`OverflowPolicy::Block`] the batch may partially complete and
    /// then fail `Closed`; items already enqueued remain consumable. Under
    /// [`OverflowPolicy::DropNew`] every item that does not fit accounts for
    /// one drop.
    pub fn put_batch(&self, items: Vec<T>) -> Result<(), QueueError> {
        let inner = &self.queue.inner;
        let mut items = items.into_iter();
        let mut remaining = items.len();

        while remaining > 0 {
            let mut state = inner.state.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }

            let batch = match inner.policy {
                OverflowPolicy::Block => {
                    while state.buffer.len() >= inner.capacity && !state.closed {
                        inner.cond.wait(&mut state);
                    }
                    // Second check needed: queue might have closed while waiting.
                    if state.closed {
                        return Err(QueueError::Closed);
                    }
                    remaining.min(inner.capacity - state.buffer.len())
                }
                OverflowPolicy::DropNew => {
                    let room = inner.capacity - state.buffer.len();
                    if room == 0 {
                        state.counters.total_put += remaining as u64;
                        state.counters.total_drop += remaining as u64;
                        return Ok(());
                    }
                    remaining.min(room)
                }
                OverflowPolicy::KeepNewest => {
                    let batch = remaining.min(inner.capacity);
                    while state.buffer.len() + batch > inner.capacity {
                        state.buffer.pop_front();
                        state.counters.total_drop += 1;
                    }
                    batch
                }
            };

            for item in items.by_ref().take(batch) {
                state.buffer.push_back(item);
            }
            state.counters.total_put += batch as u64;
            remaining -= batch;
            inner.cond.notify_all();
        }
        Ok(())
    }

    /// Releases this producer token explicitly. Equivalent to dropping it.
    pub fn close(self) {}

    /// Returns true once the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        self.queue.remove_producer();
    }
}
