//! Sequential pass-through extractor: every chunk of every arriving source
//! is emitted exactly once, in per-source shuffled order.
//!
//! A non-windowed sibling of the pool for sequential replay and loader
//! bring-up: no reuse, no eviction, no acceptance sampling.

use crate::chunk::{frames_from_bytes, TrainingChunk};
use crate::config::SimpleExtractorConfig;
use crate::metrics::QueueMetrics;
use crate::queue::{Producer, Queue, QueueError};
use crate::source::{ChunkSource, SourceMessage};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

/// Metrics snapshot produced by [`SimpleChunkExtractor::flush_metrics`].
#[derive(Debug, Clone, Default)]
pub struct ExtractorMetrics {
    pub chunks_processed: u64,
    pub chunks_dropped: u64,
    pub sources_processed: u64,
    pub output_queue: QueueMetrics,
}

struct ExtractorShared {
    input: Queue<SourceMessage>,
    output: Queue<TrainingChunk>,
    chunks_processed: AtomicU64,
    chunks_dropped: AtomicU64,
    sources_processed: AtomicU64,
}

/// Single-threaded extractor stage.
pub struct SimpleChunkExtractor {
    shared: Arc<ExtractorShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stop_requested: AtomicBool,
}

impl SimpleChunkExtractor {
    pub fn new(config: &SimpleExtractorConfig, input: Queue<SourceMessage>) -> Self {
        Self {
            shared: Arc::new(ExtractorShared {
                input,
                output: Queue::new(config.output_queue_capacity),
                chunks_processed: AtomicU64::new(0),
                chunks_dropped: AtomicU64::new(0),
                sources_processed: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn output(&self) -> &Queue<TrainingChunk> {
        &self.shared.output
    }

    pub fn start(&self) {
        let mut slot = self.worker.lock();
        if slot.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("chunk-extract".into())
            .spawn(move || worker(&shared));
        if let Ok(handle) = handle {
            *slot = Some(handle);
        }
    }

    /// Stops the stage: closes both queues and joins the worker. Idempotent.
    pub fn stop(&self) {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.input.close();
        self.shared.output.close();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn flush_metrics(&self) -> ExtractorMetrics {
        let shared = &self.shared;
        ExtractorMetrics {
            chunks_processed: shared.chunks_processed.swap(0, Ordering::AcqRel),
            chunks_dropped: shared.chunks_dropped.swap(0, Ordering::AcqRel),
            sources_processed: shared.sources_processed.swap(0, Ordering::AcqRel),
            output_queue: QueueMetrics::from_queue("output", &shared.output),
        }
    }
}

impl Drop for SimpleChunkExtractor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker(shared: &ExtractorShared) {
    let producer = match shared.output.create_producer() {
        Ok(producer) => producer,
        Err(QueueError::Closed) => return,
    };
    let mut rng = SmallRng::from_entropy();

    loop {
        match shared.input.get() {
            Ok(SourceMessage::File(source)) => {
                if process_source(shared, &producer, source, &mut rng).is_err() {
                    return;
                }
            }
            Ok(SourceMessage::InitialScanComplete) => {}
            Err(QueueError::Closed) => {
                info!("input queue closed, stopping chunk extractor");
                return;
            }
        }
    }
}

fn process_source(
    shared: &ExtractorShared,
    producer: &Producer<TrainingChunk>,
    mut source: Box<dyn ChunkSource>,
    rng: &mut SmallRng,
) -> Result<(), QueueError> {
    let chunk_count = source.chunk_count();
    if chunk_count == 0 {
        shared.sources_processed.fetch_add(1, Ordering::AcqRel);
        return Ok(());
    }

    let mut indices: Vec<usize> = (0..chunk_count).collect();
    indices.shuffle(rng);

    let sort_key = source.sort_key();
    for index in indices {
        let Some(frames) = load_chunk(shared, source.as_mut(), &sort_key, index) else {
            continue;
        };
        let chunk = TrainingChunk {
            sort_key: sort_key.clone(),
            index_within_sort_key: index as u64,
            global_index: shared.chunks_processed.load(Ordering::Acquire),
            use_count: 0,
            frames,
        };
        producer.put(chunk)?;
        shared.chunks_processed.fetch_add(1, Ordering::AcqRel);
    }
    shared.sources_processed.fetch_add(1, Ordering::AcqRel);
    Ok(())
}

fn load_chunk(
    shared: &ExtractorShared,
    source: &mut dyn ChunkSource,
    sort_key: &str,
    index: usize,
) -> Option<Vec<crate::chunk::Frame>> {
    let data = source.chunk_data(index);
    let frames = data.as_deref().and_then(frames_from_bytes);
    if frames.is_none() {
        if let Some(bytes) = &data {
            if !bytes.is_empty() {
                warn!(
                    size = bytes.len(),
                    sort_key, index, "invalid chunk size, dropping"
                );
            }
        }
        shared.chunks_dropped.fetch_add(1, Ordering::AcqRel);
    }
    frames
}
