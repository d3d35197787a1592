//! chunkfeed - Sliding-Window Shuffling Training-Data Loader
//!
//! A multi-stage pipeline that streams fixed-size training frames from
//! on-disk archives into shuffled in-memory chunks. Stages are connected by
//! bounded, closable queues; the central stage is a [`ShufflingChunkPool`]
//! that keeps a sliding window over the most recent chunk sources and
//! serves a uniform random stream over it.
//!
//! ```text
//! source producer ──Q1──▶ ShufflingChunkPool ──Q2──▶ downstream consumer
//! ```
//!
//! # Key Pieces
//!
//! - [`Queue`]: bounded MPMC queue with RAII producer tokens, overflow
//!   policies and drain-after-close semantics
//! - [`StreamShuffler`]: every integer of `[lower, upper)` exactly once in
//!   uniform random order, with bounds movable mid-pass
//! - [`ShufflingChunkPool`]: the sliding window, with optional Hanse
//!   acceptance sampling against short chunks
//! - [`ChunkSource`] adapters for tar archives, raw files and synthetic
//!   debug data
//!
//! # Example
//!
//! ```
//! use chunkfeed::{
//!     ChunkPoolConfig, DebugChunkSourceGenerator, DebugGeneratorConfig,
//!     ShufflingChunkPool,
//! };
//!
//! let generator = DebugChunkSourceGenerator::new(
//!     DebugGeneratorConfig::default()
//!         .with_initial_sources(4)
//!         .with_mean_chunks(8.0),
//! );
//! let pool = ShufflingChunkPool::new(
//!     ChunkPoolConfig::new(1000).with_threads(1, 2),
//!     generator.output().clone(),
//! );
//! generator.start();
//! pool.start();
//!
//! let chunk = pool.output().get().unwrap();
//! assert!(!chunk.frames.is_empty());
//!
//! pool.stop();
//! generator.stop();
//! ```

pub mod chunk;
pub mod config;
pub mod extractor;
pub mod generator;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod shuffler;
pub mod source;
pub mod sources;

pub use chunk::{
    bytes_from_frames, frames_from_bytes, Frame, FrameFormat, TrainingChunk, FRAME_SIZE,
    V6_FRAME_SIZE,
};
pub use config::{ChunkPoolConfig, DebugGeneratorConfig, SimpleExtractorConfig};
pub use extractor::{ExtractorMetrics, SimpleChunkExtractor};
pub use generator::{DebugChunkSourceGenerator, GeneratorMetrics};
pub use metrics::{LoadMetrics, LoadPauser, LoadTracker, QueueMetrics};
pub use pool::{AnchorStatus, ControlRequest, PoolMetrics, ShufflingChunkPool};
pub use queue::{OverflowPolicy, Producer, Queue, QueueCounters, QueueError};
pub use shuffler::StreamShuffler;
pub use source::{ChunkSource, SourceMessage};
pub use sources::{DebugChunkSource, RawFileChunkSource, TarChunkSource};
