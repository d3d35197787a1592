//! The shuffling chunk pool: a concurrent sliding window over the most
//! recent chunk sources, emitting a uniform random stream of loaded chunks.
//!
//! Sources arrive tagged on the input queue; the pool keeps the newest
//! `chunk_pool_size` chunks' worth of sources, evicting from the oldest
//! end, and draws chunk indices from a [`StreamShuffler`] whose bounds
//! track the window. Optional Hanse acceptance sampling biases emissions
//! away from under-filled chunks.

use crate::chunk::{frames_from_bytes, TrainingChunk, FRAME_SIZE};
use crate::config::ChunkPoolConfig;
use crate::metrics::{LoadMetrics, LoadPauser, LoadTracker, QueueMetrics};
use crate::queue::{Queue, QueueError};
use crate::shuffler::StreamShuffler;
use crate::source::{ChunkSource, SourceMessage};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{error, info, warn};

thread_local! {
    // Per-worker RNG for acceptance sampling; a shared generator would
    // serialise the loading workers.
    static HANSE_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_entropy());
}

/// Anchor control requests (see [`ShufflingChunkPool::control`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Move the anchor to the newest source and zero the counter.
    ResetAnchor,
    /// Overwrite the anchor without touching the counter.
    SetAnchor(String),
    /// Read the current state.
    GetAnchor,
}

/// Current anchor watermark and the chunks ingested since it was set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnchorStatus {
    pub chunk_anchor: String,
    pub chunks_since_anchor: u64,
}

/// Metrics snapshot produced by [`ShufflingChunkPool::flush_metrics`].
#[derive(Debug, Clone, Default)]
pub struct PoolMetrics {
    pub source_ingestion_load: LoadMetrics,
    pub chunk_loading_load: LoadMetrics,
    pub chunk_sources: u64,
    pub chunks_current: u64,
    pub chunks_capacity: u64,
    pub chunks_total: u64,
    pub dropped_chunks: u64,
    pub hanse_cache_hits: u64,
    pub hanse_cache_misses: u64,
    pub hanse_rejected: u64,
    pub reshuffles: u64,
    pub anchor: String,
    pub chunks_since_anchor: u64,
    pub output_queue: QueueMetrics,
}

#[derive(Debug, Error)]
enum InitError {
    #[error("input queue closed during initial scan")]
    InputClosed,
    #[error("no chunks indexed during startup")]
    NoChunks,
}

struct SourceEntry {
    start_chunk_index: u64,
    source: Box<dyn ChunkSource>,
    dropped_chunks: HashSet<usize>,
    use_counts: Vec<u16>,
    num_records: Vec<u16>,
}

impl SourceEntry {
    fn new(start_chunk_index: u64, source: Box<dyn ChunkSource>) -> Self {
        let count = source.chunk_count();
        Self {
            start_chunk_index,
            source,
            dropped_chunks: HashSet::new(),
            use_counts: vec![0; count],
            num_records: vec![0; count],
        }
    }

    fn end_chunk_index(&self) -> u64 {
        self.start_chunk_index + self.source.chunk_count() as u64
    }
}

/// Entries in ascending `start_chunk_index` (equivalently sort-key) order
/// plus the shuffler whose bounds mirror the window.
struct WindowState {
    entries: VecDeque<SourceEntry>,
    shuffler: StreamShuffler,
}

struct PoolShared {
    config: ChunkPoolConfig,
    input: Queue<SourceMessage>,
    output: Queue<TrainingChunk>,
    window: Mutex<WindowState>,
    anchor: Mutex<String>,
    chunks_since_anchor: AtomicU64,
    dropped_chunks: AtomicU64,
    hanse_cache_hits: AtomicU64,
    hanse_cache_misses: AtomicU64,
    hanse_rejected: AtomicU64,
    reshuffles: AtomicU64,
    ingestion_trackers: Vec<Arc<LoadTracker>>,
    loading_trackers: Vec<Arc<LoadTracker>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// A chunk selected for emission, still in raw byte form.
struct LoadedChunk {
    data: Vec<u8>,
    sort_key: String,
    local_index: usize,
    global_index: u64,
    use_count: u32,
}

/// The pool stage. Owns its output queue; the input queue is shared with
/// whatever stage produces source messages.
pub struct ShufflingChunkPool {
    shared: Arc<PoolShared>,
    init_thread: Mutex<Option<JoinHandle<()>>>,
    stop_requested: AtomicBool,
}

impl ShufflingChunkPool {
    pub fn new(config: ChunkPoolConfig, input: Queue<SourceMessage>) -> Self {
        info!(
            pool_size = config.chunk_pool_size,
            "initializing shuffling chunk pool"
        );
        let output = Queue::new(config.output_queue_capacity);
        let ingestion_trackers = (0..config.source_ingestion_threads)
            .map(|_| Arc::new(LoadTracker::new()))
            .collect();
        let loading_trackers = (0..config.chunk_loading_threads)
            .map(|_| Arc::new(LoadTracker::new()))
            .collect();
        Self {
            shared: Arc::new(PoolShared {
                config,
                input,
                output,
                window: Mutex::new(WindowState {
                    entries: VecDeque::new(),
                    shuffler: StreamShuffler::new(),
                }),
                anchor: Mutex::new(String::new()),
                chunks_since_anchor: AtomicU64::new(0),
                dropped_chunks: AtomicU64::new(0),
                hanse_cache_hits: AtomicU64::new(0),
                hanse_cache_misses: AtomicU64::new(0),
                hanse_rejected: AtomicU64::new(0),
                reshuffles: AtomicU64::new(0),
                ingestion_trackers,
                loading_trackers,
                workers: Mutex::new(Vec::new()),
            }),
            init_thread: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
        }
    }

    /// The output queue carrying loaded [`TrainingChunk`]s.
    pub fn output(&self) -> &Queue<TrainingChunk> {
        &self.shared.output
    }

    /// Starts the initialization thread, which runs the startup sequence
    /// and then launches the worker pools.
    pub fn start(&self) {
        let mut slot = self.init_thread.lock();
        if slot.is_some() {
            return;
        }
        info!("starting shuffling chunk pool initialization thread");
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("chunk-pool-init".into())
            .spawn(move || match initialize(&shared) {
                Ok(()) => {}
                Err(InitError::InputClosed) => {
                    info!("chunk pool initialization interrupted, input queue closed");
                    shared.output.close();
                }
                Err(err) => {
                    error!(%err, "chunk pool initialization failed");
                    shared.output.close();
                }
            });
        match handle {
            Ok(handle) => *slot = Some(handle),
            Err(err) => {
                error!(%err, "failed to spawn chunk pool initialization thread");
                self.shared.output.close();
            }
        }
    }

    /// Stops the pool: closes both queues, joins the initialization thread
    /// and both worker pools. Idempotent.
    pub fn stop(&self) {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping shuffling chunk pool");
        self.shared.input.close();
        self.shared.output.close();

        if let Some(handle) = self.init_thread.lock().take() {
            let _ = handle.join();
        }
        let workers: Vec<JoinHandle<()>> = self.shared.workers.lock().drain(..).collect();
        for handle in workers {
            let _ = handle.join();
        }
        info!("shuffling chunk pool stopped");
    }

    /// Anchors to the newest source's sort key, zeroes the counter and
    /// returns the new anchor together with the previous count.
    pub fn reset_anchor(&self) -> AnchorStatus {
        let mut anchor = self.shared.anchor.lock();
        let latest = {
            let window = self.shared.window.lock();
            match window.entries.back() {
                Some(entry) => entry.source.sort_key(),
                None => return AnchorStatus::default(),
            }
        };
        *anchor = latest.clone();
        let previous = self.shared.chunks_since_anchor.swap(0, Ordering::SeqCst);
        AnchorStatus {
            chunk_anchor: latest,
            chunks_since_anchor: previous,
        }
    }

    /// Overwrites the anchor watermark without touching the counter.
    pub fn set_anchor(&self, anchor: impl Into<String>) {
        *self.shared.anchor.lock() = anchor.into();
    }

    /// Current anchor and counter.
    pub fn anchor_status(&self) -> AnchorStatus {
        let anchor = self.shared.anchor.lock().clone();
        AnchorStatus {
            chunk_anchor: anchor,
            chunks_since_anchor: self.shared.chunks_since_anchor.load(Ordering::SeqCst),
        }
    }

    /// Dispatches an anchor control request.
    pub fn control(&self, request: ControlRequest) -> AnchorStatus {
        match request {
            ControlRequest::ResetAnchor => self.reset_anchor(),
            ControlRequest::SetAnchor(anchor) => {
                self.set_anchor(anchor.clone());
                AnchorStatus {
                    chunk_anchor: anchor,
                    chunks_since_anchor: self
                        .shared
                        .chunks_since_anchor
                        .load(Ordering::SeqCst),
                }
            }
            ControlRequest::GetAnchor => self.anchor_status(),
        }
    }

    /// Flushes all stage metrics. Event counters reset on read; gauge-like
    /// counts (window sizes, anchor state) do not.
    pub fn flush_metrics(&self) -> PoolMetrics {
        let shared = &self.shared;
        let mut metrics = PoolMetrics::default();
        for tracker in &shared.ingestion_trackers {
            metrics.source_ingestion_load.merge(tracker.flush());
        }
        for tracker in &shared.loading_trackers {
            metrics.chunk_loading_load.merge(tracker.flush());
        }

        {
            let window = shared.window.lock();
            metrics.chunk_sources = window.entries.len() as u64;
            if let (Some(first), Some(last)) = (window.entries.front(), window.entries.back()) {
                metrics.chunks_total = last.end_chunk_index();
                metrics.chunks_current = last.end_chunk_index() - first.start_chunk_index;
            }
            metrics.chunks_capacity = shared.config.chunk_pool_size as u64;
        }
        {
            let anchor = shared.anchor.lock();
            metrics.anchor = anchor.clone();
            metrics.chunks_since_anchor = shared.chunks_since_anchor.load(Ordering::SeqCst);
        }

        metrics.dropped_chunks = shared.dropped_chunks.swap(0, Ordering::AcqRel);
        metrics.hanse_cache_hits = shared.hanse_cache_hits.swap(0, Ordering::AcqRel);
        metrics.hanse_cache_misses = shared.hanse_cache_misses.swap(0, Ordering::AcqRel);
        metrics.hanse_rejected = shared.hanse_rejected.swap(0, Ordering::AcqRel);
        metrics.reshuffles = shared.reshuffles.swap(0, Ordering::AcqRel);
        metrics.output_queue = QueueMetrics::from_queue("output", &shared.output);
        metrics
    }
}

impl Drop for ShufflingChunkPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn initialize(shared: &Arc<PoolShared>) -> Result<(), InitError> {
    let sources = collect_initial_sources(shared)?;
    seed_window(shared, sources)?;
    spawn_workers(shared);
    info!("chunk pool initialization done, workers started");
    Ok(())
}

/// Reads the input queue until the initial-scan marker, then keeps the
/// newest sources whose cumulative chunk count reaches the pool size.
fn collect_initial_sources(
    shared: &PoolShared,
) -> Result<Vec<Box<dyn ChunkSource>>, InitError> {
    let mut sources: Vec<Box<dyn ChunkSource>> = Vec::new();
    loop {
        match shared.input.get() {
            Ok(SourceMessage::File(source)) => sources.push(source),
            Ok(SourceMessage::InitialScanComplete) => break,
            Err(QueueError::Closed) => return Err(InitError::InputClosed),
        }
    }
    info!(
        candidates = sources.len(),
        "initial scan complete, indexing newest sources"
    );

    // Newest first.
    sources.sort_by_cached_key(|source| std::cmp::Reverse(source.sort_key()));

    let pool_size = shared.config.chunk_pool_size as u64;
    let anchor = shared.anchor.lock().clone();
    let mut total_chunks = 0u64;
    let mut sources_to_keep = 0;
    for source in &sources {
        if shared.output.is_closed() {
            info!("output queue closed, stopping initial indexing");
            break;
        }
        if total_chunks >= pool_size {
            break;
        }
        let count = source.chunk_count() as u64;
        total_chunks += count;
        // During the initial scan only sources newer than the anchor count
        // as new; live ingestion counts every source.
        if source.sort_key() > anchor {
            shared
                .chunks_since_anchor
                .fetch_add(count, Ordering::Relaxed);
        }
        sources_to_keep += 1;
    }

    info!(
        chunks = total_chunks,
        sources = sources_to_keep,
        "indexed startup window"
    );
    if total_chunks < pool_size && !shared.output.is_closed() {
        warn!(
            chunks = total_chunks,
            pool_size, "startup window under-filled, continuing anyway"
        );
    }
    sources.truncate(sources_to_keep);
    Ok(sources)
}

/// Installs the kept sources oldest-first with dense global numbering and
/// points the shuffler at the resulting window.
fn seed_window(
    shared: &PoolShared,
    sources: Vec<Box<dyn ChunkSource>>,
) -> Result<(), InitError> {
    let mut window = shared.window.lock();
    let mut start_chunk_index = 0u64;
    for source in sources.into_iter().rev() {
        let entry = SourceEntry::new(start_chunk_index, source);
        start_chunk_index = entry.end_chunk_index();
        window.entries.push_back(entry);
    }

    let total_chunks = start_chunk_index;
    if total_chunks == 0 {
        return Err(InitError::NoChunks);
    }
    let pool_size = shared.config.chunk_pool_size as u64;
    let lower = total_chunks.saturating_sub(pool_size);
    window.shuffler.reset(lower, total_chunks);
    info!(
        sources = window.entries.len(),
        chunks = total_chunks,
        "initial window ready"
    );
    Ok(())
}

fn spawn_workers(shared: &Arc<PoolShared>) {
    let mut workers = shared.workers.lock();
    for (index, tracker) in shared.ingestion_trackers.iter().enumerate() {
        let shared = Arc::clone(shared);
        let tracker = Arc::clone(tracker);
        let handle = thread::Builder::new()
            .name(format!("source-ingest-{index}"))
            .spawn(move || ingestion_worker(&shared, &tracker));
        match handle {
            Ok(handle) => workers.push(handle),
            Err(err) => error!(%err, "failed to spawn source ingestion worker"),
        }
    }
    for (index, tracker) in shared.loading_trackers.iter().enumerate() {
        let shared = Arc::clone(shared);
        let tracker = Arc::clone(tracker);
        let handle = thread::Builder::new()
            .name(format!("chunk-load-{index}"))
            .spawn(move || output_worker(&shared, &tracker));
        match handle {
            Ok(handle) => workers.push(handle),
            Err(err) => error!(%err, "failed to spawn chunk loading worker"),
        }
    }
}

/// Blocks on the input queue and folds arriving sources into the window.
fn ingestion_worker(shared: &PoolShared, tracker: &LoadTracker) {
    loop {
        let message = {
            let _pauser = LoadPauser::new(tracker);
            shared.input.get()
        };
        match message {
            Ok(SourceMessage::File(source)) => {
                let count = source.chunk_count() as u64;
                shared
                    .chunks_since_anchor
                    .fetch_add(count, Ordering::Relaxed);
                let mut window = shared.window.lock();
                add_new_chunk_source(&mut window, &shared.config, source);
            }
            // Late scan markers can arrive when the producing stage restarts
            // its walk; the window is already live, so they carry nothing.
            Ok(SourceMessage::InitialScanComplete) => {}
            Err(QueueError::Closed) => {
                info!("input queue closed, stopping source ingestion worker");
                return;
            }
        }
    }
}

/// Appends a source at the top of the global numbering, evicts stale
/// sources from the front and updates the shuffler bounds.
fn add_new_chunk_source(
    window: &mut WindowState,
    config: &ChunkPoolConfig,
    source: Box<dyn ChunkSource>,
) {
    let pool_size = config.chunk_pool_size as u64;
    let start = window
        .entries
        .back()
        .map_or(0, SourceEntry::end_chunk_index);
    let entry = SourceEntry::new(start, source);
    let new_upper = entry.end_chunk_index();
    window.entries.push_back(entry);

    // Evict while dropping the oldest source still leaves a full window.
    while window.entries.len() > 1 {
        let front_end = window.entries[0].end_chunk_index();
        if new_upper - front_end < pool_size {
            break;
        }
        window.entries.pop_front();
    }

    let window_start = window
        .entries
        .front()
        .map_or(new_upper, |entry| entry.start_chunk_index);
    let new_lower = new_upper.saturating_sub(pool_size).max(window_start);
    window.shuffler.set_upper_bound(new_upper);
    window.shuffler.set_lower_bound(new_lower);
}

/// Loads chunks and pushes them to the output queue until it closes.
fn output_worker(shared: &PoolShared, tracker: &LoadTracker) {
    let producer = match shared.output.create_producer() {
        Ok(producer) => producer,
        Err(QueueError::Closed) => return,
    };

    loop {
        let Some(loaded) = get_next_chunk_data(shared) else {
            if shared.output.is_closed() {
                return;
            }
            continue;
        };
        let Some(frames) = frames_from_bytes(&loaded.data) else {
            // Length was validated during selection; a mismatch here means
            // the source mutated under us. Treat it like a transient defect.
            warn!(
                sort_key = %loaded.sort_key,
                index = loaded.local_index,
                "chunk bytes changed size between load and unpack"
            );
            continue;
        };
        let chunk = TrainingChunk {
            sort_key: loaded.sort_key,
            index_within_sort_key: loaded.local_index as u64,
            global_index: loaded.global_index,
            use_count: loaded.use_count,
            frames,
        };

        let put_result = {
            let _pauser = LoadPauser::new(tracker);
            producer.put(chunk)
        };
        if put_result.is_err() {
            info!("output queue closed, stopping chunk loading worker");
            return;
        }
    }
}

/// One round of the selection loop: draw an index, resolve its entry,
/// apply drop/acceptance filtering and load the bytes.
///
/// Returns `None` only when the window is empty (or the stage is shutting
/// down); transient misses retry internally.
fn get_next_chunk_data(shared: &PoolShared) -> Option<LoadedChunk> {
    let pool_size = shared.config.chunk_pool_size as u64;
    loop {
        if shared.output.is_closed() {
            return None;
        }
        let mut window = shared.window.lock();
        let state = &mut *window;

        let mut next_index = state.shuffler.next();
        if next_index.is_none() {
            if let (Some(first), Some(last)) = (state.entries.front(), state.entries.back()) {
                let upper = last.end_chunk_index();
                let lower = upper
                    .saturating_sub(pool_size)
                    .max(first.start_chunk_index);
                state.shuffler.reset(lower, upper);
                shared.reshuffles.fetch_add(1, Ordering::AcqRel);
                next_index = state.shuffler.next();
            }
        }
        let global_index = next_index?;

        // Find the entry owning this global index.
        let position = state
            .entries
            .partition_point(|entry| entry.end_chunk_index() <= global_index);
        if position >= state.entries.len()
            || global_index < state.entries[position].start_chunk_index
        {
            warn!(global_index, "chunk index raced with eviction, retrying");
            continue;
        }
        let entry = &mut state.entries[position];
        let local_index = (global_index - entry.start_chunk_index) as usize;
        if entry.dropped_chunks.contains(&local_index) {
            continue;
        }

        let data = if shared.config.hanse_enabled() {
            hanse_accept_and_maybe_load(shared, entry, local_index)
        } else {
            load_chunk_data(shared, entry, local_index)
        };
        let Some(data) = data else { continue };

        let Some(slot) = entry.use_counts.get_mut(local_index) else {
            warn!(
                local_index,
                sort_key = %entry.source.sort_key(),
                "use_counts shorter than chunk_count, retrying"
            );
            continue;
        };
        let use_count = u32::from(*slot);
        *slot = slot.saturating_add(1);

        return Some(LoadedChunk {
            sort_key: entry.source.sort_key(),
            local_index,
            global_index,
            use_count,
            data,
        });
    }
}

/// Loads a chunk's bytes, marking the chunk dropped on any defect (missing,
/// empty, or not a whole number of frames).
fn load_chunk_data(
    shared: &PoolShared,
    entry: &mut SourceEntry,
    local_index: usize,
) -> Option<Vec<u8>> {
    let data = entry.source.chunk_data(local_index);
    let valid = matches!(&data, Some(bytes) if !bytes.is_empty() && bytes.len() % FRAME_SIZE == 0);
    if !valid {
        if let Some(bytes) = &data {
            warn!(
                size = bytes.len(),
                frame_size = FRAME_SIZE,
                sort_key = %entry.source.sort_key(),
                local_index,
                "chunk is not a whole number of frames, dropping"
            );
        }
        entry.dropped_chunks.insert(local_index);
        shared.dropped_chunks.fetch_add(1, Ordering::AcqRel);
        return None;
    }
    data
}

/// Hanse acceptance sampling: accept a candidate chunk with probability
/// `min(1, frames / threshold) ^ gamma`, caching the frame count so later
/// rejections cost no I/O.
fn hanse_accept_and_maybe_load(
    shared: &PoolShared,
    entry: &mut SourceEntry,
    local_index: usize,
) -> Option<Vec<u8>> {
    let mut data = None;
    let cached = entry.num_records.get(local_index).copied().unwrap_or(0);
    let frames = if cached == 0 {
        // 0 is the "unknown" sentinel: a loadable chunk always has at least
        // one frame.
        shared.hanse_cache_misses.fetch_add(1, Ordering::AcqRel);
        let bytes = load_chunk_data(shared, entry, local_index)?;
        let count = (bytes.len() / FRAME_SIZE).min(usize::from(u16::MAX)) as u16;
        if let Some(slot) = entry.num_records.get_mut(local_index) {
            *slot = count;
        }
        data = Some(bytes);
        count
    } else {
        shared.hanse_cache_hits.fetch_add(1, Ordering::AcqRel);
        cached
    };

    let threshold = f64::from(shared.config.hanse_sampling_threshold);
    let gamma = shared.config.hanse_sampling_gamma;
    let accept_probability = (f64::from(frames) / threshold).min(1.0).powf(gamma);
    let draw = HANSE_RNG.with(|rng| rng.borrow_mut().gen::<f64>());
    if draw >= accept_probability {
        shared.hanse_rejected.fetch_add(1, Ordering::AcqRel);
        return None;
    }

    match data {
        Some(bytes) => Some(bytes),
        None => load_chunk_data(shared, entry, local_index),
    }
}
