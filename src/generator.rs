//! Debug chunk-source generator stage.
//!
//! Emits deterministic [`DebugChunkSource`]s for loader bring-up and
//! testing without filesystem input: first `initial_chunk_sources` ids in
//! shuffled order, then the initial-scan marker, then (optionally) a steady
//! live stream of fresh ids.

use crate::config::DebugGeneratorConfig;
use crate::metrics::QueueMetrics;
use crate::queue::Queue;
use crate::source::SourceMessage;
use crate::sources::DebugChunkSource;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const DEFAULT_QUEUE_CAPACITY: u64 = 16;
const INITIAL_SHUFFLE_SEED: u64 = 0xC0_FFEE;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Metrics snapshot produced by
/// [`DebugChunkSourceGenerator::flush_metrics`].
#[derive(Debug, Clone, Default)]
pub struct GeneratorMetrics {
    pub chunk_sources_generated: u64,
    pub output_queue: QueueMetrics,
}

/// Generator stage; owns the source message queue it feeds.
pub struct DebugChunkSourceGenerator {
    config: DebugGeneratorConfig,
    mean_chunk_count: f64,
    output: Queue<SourceMessage>,
    generated_sources: Arc<AtomicU64>,
    stop_flag: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DebugChunkSourceGenerator {
    pub fn new(config: DebugGeneratorConfig) -> Self {
        if config.mean_chunks_per_chunk_source <= 0.0 {
            warn!("debug generator mean chunk count not positive, using 1");
        }
        let mean_chunk_count = config.mean_chunks_per_chunk_source.max(1.0);
        let capacity = config.initial_chunk_sources.max(DEFAULT_QUEUE_CAPACITY) as usize;
        Self {
            config,
            mean_chunk_count,
            output: Queue::new(capacity),
            generated_sources: Arc::new(AtomicU64::new(0)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// The queue of generated source messages.
    pub fn output(&self) -> &Queue<SourceMessage> {
        &self.output
    }

    pub fn start(&self) {
        let mut slot = self.worker.lock();
        if slot.is_some() {
            return;
        }
        let config = self.config.clone();
        let mean_chunk_count = self.mean_chunk_count;
        let output = self.output.clone();
        let generated = Arc::clone(&self.generated_sources);
        let stop_flag = Arc::clone(&self.stop_flag);
        let handle = thread::Builder::new()
            .name("debug-source-gen".into())
            .spawn(move || run(&config, mean_chunk_count, &output, &generated, &stop_flag));
        if let Ok(handle) = handle {
            *slot = Some(handle);
        }
    }

    /// Requests the worker to stop and joins it. Closing the output queue
    /// also wakes a worker blocked on a full queue; consumers can still
    /// drain whatever was emitted. Idempotent.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        self.output.close();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn flush_metrics(&self) -> GeneratorMetrics {
        GeneratorMetrics {
            chunk_sources_generated: self.generated_sources.load(Ordering::Relaxed),
            output_queue: QueueMetrics::from_queue("output", &self.output),
        }
    }
}

impl Drop for DebugChunkSourceGenerator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    config: &DebugGeneratorConfig,
    mean_chunk_count: f64,
    output: &Queue<SourceMessage>,
    generated: &AtomicU64,
    stop_flag: &AtomicBool,
) {
    let producer = match output.create_producer() {
        Ok(producer) => producer,
        Err(_) => return,
    };
    let stopped = || stop_flag.load(Ordering::Acquire);

    let mut initial_ids: Vec<u64> = (0..config.initial_chunk_sources).collect();
    initial_ids.shuffle(&mut SmallRng::seed_from_u64(INITIAL_SHUFFLE_SEED));

    let emit = |id: u64| {
        let source = DebugChunkSource::new(id, mean_chunk_count);
        let result = producer.put(SourceMessage::File(Box::new(source)));
        if result.is_ok() {
            generated.fetch_add(1, Ordering::Relaxed);
        }
        result
    };

    for id in initial_ids {
        if stopped() {
            return;
        }
        if emit(id).is_err() {
            info!("debug generator stopping, output queue closed");
            return;
        }
    }
    if stopped() || producer.put(SourceMessage::InitialScanComplete).is_err() {
        return;
    }

    let per_minute = config.chunk_sources_per_minute;
    if per_minute <= 0.0 {
        return; // producer drop closes the queue
    }

    let cadence = Duration::from_secs_f64(60.0 / per_minute);
    let mut next_id = config.initial_chunk_sources;
    let mut next_deadline = Instant::now();

    while !stopped() {
        if emit(next_id).is_err() {
            info!("debug generator stopping, output queue closed");
            return;
        }
        next_id += 1;
        next_deadline += cadence;
        // Wakeable sleep: poll the stop flag at most every 10 ms.
        while !stopped() {
            let wait = next_deadline.saturating_duration_since(Instant::now());
            if wait.is_zero() {
                break;
            }
            thread::sleep(wait.min(STOP_POLL_INTERVAL));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueError;

    #[test]
    fn test_emits_initial_sources_then_marker_then_closes() {
        let config = DebugGeneratorConfig::default()
            .with_initial_sources(5)
            .with_mean_chunks(8.0)
            .with_sources_per_minute(0.0);
        let generator = DebugChunkSourceGenerator::new(config);
        generator.start();

        let mut keys = Vec::new();
        loop {
            match generator.output().get() {
                Ok(SourceMessage::File(source)) => keys.push(source.sort_key()),
                Ok(SourceMessage::InitialScanComplete) => break,
                Err(err) => panic!("queue closed before scan marker: {err}"),
            }
        }
        keys.sort();
        assert_eq!(
            keys,
            vec!["00000000", "00000001", "00000002", "00000003", "00000004"]
        );
        // No live stream configured: the queue closes after the marker.
        assert_eq!(
            generator.output().get().err(),
            Some(QueueError::Closed)
        );
        assert_eq!(generator.flush_metrics().chunk_sources_generated, 5);
        generator.stop();
    }

    #[test]
    fn test_live_stream_continues_after_marker() {
        let config = DebugGeneratorConfig::default()
            .with_initial_sources(2)
            .with_mean_chunks(4.0)
            .with_sources_per_minute(60_000.0); // 1 per ms
        let generator = DebugChunkSourceGenerator::new(config);
        generator.start();

        let mut seen_marker = false;
        let mut live_keys = Vec::new();
        while live_keys.len() < 3 {
            match generator.output().get().unwrap() {
                SourceMessage::File(source) => {
                    if seen_marker {
                        live_keys.push(source.sort_key());
                    }
                }
                SourceMessage::InitialScanComplete => seen_marker = true,
            }
        }
        assert!(seen_marker);
        assert_eq!(live_keys[0], "00000002");
        generator.stop();
    }

    #[test]
    fn test_stop_is_prompt_and_idempotent() {
        let config = DebugGeneratorConfig::default()
            .with_initial_sources(1)
            .with_sources_per_minute(1.0); // ~60 s cadence; stop must not wait for it
        let generator = DebugChunkSourceGenerator::new(config);
        generator.start();
        std::thread::sleep(Duration::from_millis(30));

        let begin = Instant::now();
        generator.stop();
        generator.stop();
        assert!(begin.elapsed() < Duration::from_secs(2));
    }
}
