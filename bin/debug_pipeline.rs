//! Demo: debug generator → shuffling chunk pool → stdout consumer.
//!
//! Run with `RUST_LOG=info cargo run --bin debug_pipeline`.

use chunkfeed::{
    ChunkPoolConfig, DebugChunkSourceGenerator, DebugGeneratorConfig, ShufflingChunkPool,
};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

const CHUNKS_TO_CONSUME: usize = 2_000;
const REPORT_EVERY: usize = 500;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let generator = DebugChunkSourceGenerator::new(
        DebugGeneratorConfig::default()
            .with_initial_sources(8)
            .with_mean_chunks(16.0)
            .with_sources_per_minute(600.0),
    );
    let pool = ShufflingChunkPool::new(
        ChunkPoolConfig::new(100)
            .with_threads(1, 2)
            .with_output_capacity(64),
        generator.output().clone(),
    );

    generator.start();
    pool.start();

    let begin = Instant::now();
    let mut frames_seen = 0usize;
    let mut consumed_total = 0usize;
    for consumed in 1..=CHUNKS_TO_CONSUME {
        let chunk = match pool.output().get() {
            Ok(chunk) => chunk,
            Err(err) => {
                eprintln!("pipeline ended early: {err}");
                break;
            }
        };
        consumed_total = consumed;
        frames_seen += chunk.frames.len();
        if consumed % REPORT_EVERY == 0 {
            let metrics = pool.flush_metrics();
            println!(
                "{consumed:>6} chunks ({frames_seen} frames) | window: {} sources / {} chunks | \
                 reshuffles: {} | since anchor: {}",
                metrics.chunk_sources,
                metrics.chunks_current,
                metrics.reshuffles,
                metrics.chunks_since_anchor,
            );
        }
    }

    let elapsed = begin.elapsed();
    println!(
        "consumed {consumed_total} chunks / {frames_seen} frames in {:.2?} ({:.0} chunks/s)",
        elapsed,
        consumed_total as f64 / elapsed.as_secs_f64(),
    );

    pool.stop();
    generator.stop();
}
