//! Per-stage metric building blocks.
//!
//! Queue counters are flushed into [`QueueMetrics`] snapshots; worker
//! threads account busy vs paused wall time through a [`LoadTracker`],
//! marking the spans spent inside blocking queue calls with a scoped
//! [`LoadPauser`].

use crate::queue::Queue;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Snapshot of one queue's counters plus its current fill level. Reading
/// the snapshot resets the put/get/drop counters.
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    pub name: &'static str,
    pub put_total: u64,
    pub get_total: u64,
    pub drop_total: u64,
    pub size: usize,
    pub capacity: usize,
}

impl QueueMetrics {
    pub fn from_queue<T>(name: &'static str, queue: &Queue<T>) -> Self {
        let counters = queue.flush_counters();
        Self {
            name,
            put_total: counters.total_put,
            get_total: counters.total_get,
            drop_total: counters.total_drop,
            size: queue.size(),
            capacity: queue.capacity(),
        }
    }
}

/// Busy vs paused wall time accumulated by one worker since the last flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadMetrics {
    pub busy: Duration,
    pub paused: Duration,
}

impl LoadMetrics {
    pub fn merge(&mut self, other: LoadMetrics) {
        self.busy += other.busy;
        self.paused += other.paused;
    }
}

struct TrackerState {
    busy: Duration,
    paused: Duration,
    span_start: Instant,
    paused_now: bool,
}

/// Accumulates one worker's busy/paused time. Workers start busy.
pub struct LoadTracker {
    state: Mutex<TrackerState>,
}

impl LoadTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                busy: Duration::ZERO,
                paused: Duration::ZERO,
                span_start: Instant::now(),
                paused_now: false,
            }),
        }
    }

    fn roll(state: &mut TrackerState) {
        let now = Instant::now();
        let span = now - state.span_start;
        if state.paused_now {
            state.paused += span;
        } else {
            state.busy += span;
        }
        state.span_start = now;
    }

    fn set_paused(&self, paused: bool) {
        let mut state = self.state.lock();
        Self::roll(&mut state);
        state.paused_now = paused;
    }

    /// Flushes the accumulated counters, resetting them to zero. The span
    /// in progress is attributed up to the flush instant.
    pub fn flush(&self) -> LoadMetrics {
        let mut state = self.state.lock();
        Self::roll(&mut state);
        let metrics = LoadMetrics {
            busy: state.busy,
            paused: state.paused,
        };
        state.busy = Duration::ZERO;
        state.paused = Duration::ZERO;
        metrics
    }
}

impl Default for LoadTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard marking a paused span (a blocking queue call) on a
/// [`LoadTracker`].
pub struct LoadPauser<'a> {
    tracker: &'a LoadTracker,
}

impl<'a> LoadPauser<'a> {
    pub fn new(tracker: &'a LoadTracker) -> Self {
        tracker.set_paused(true);
        Self { tracker }
    }
}

impl Drop for LoadPauser<'_> {
    fn drop(&mut self) {
        self.tracker.set_paused(false);
    }
}
