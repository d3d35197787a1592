//! Configuration for the pipeline stages.

/// Configuration for [`ShufflingChunkPool`](crate::pool::ShufflingChunkPool).
#[derive(Debug, Clone)]
pub struct ChunkPoolConfig {
    /// Maximum number of chunks kept in the sliding window.
    pub chunk_pool_size: usize,
    /// Workers consuming the source message queue.
    pub source_ingestion_threads: usize,
    /// Workers loading chunks and feeding the output queue.
    pub chunk_loading_threads: usize,
    /// Target frame count for acceptance sampling; 0 disables it.
    pub hanse_sampling_threshold: u32,
    /// Curvature of the acceptance curve (1.0 = linear).
    pub hanse_sampling_gamma: f64,
    /// Capacity of the output chunk queue.
    pub output_queue_capacity: usize,
}

impl ChunkPoolConfig {
    /// Creates a configuration with the given window size and defaults for
    /// everything else.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_pool_size` is zero.
    pub fn new(chunk_pool_size: usize) -> Self {
        assert!(chunk_pool_size > 0, "chunk_pool_size must be non-zero");
        Self {
            chunk_pool_size,
            ..Self::default()
        }
    }

    /// Sets the worker pool sizes.
    pub fn with_threads(mut self, source_ingestion: usize, chunk_loading: usize) -> Self {
        self.source_ingestion_threads = source_ingestion;
        self.chunk_loading_threads = chunk_loading;
        self
    }

    /// Enables Hanse acceptance sampling with the given target frame count
    /// and curvature.
    pub fn with_hanse_sampling(mut self, threshold: u32, gamma: f64) -> Self {
        self.hanse_sampling_threshold = threshold;
        self.hanse_sampling_gamma = gamma;
        self
    }

    /// Sets the output queue capacity.
    pub fn with_output_capacity(mut self, capacity: usize) -> Self {
        self.output_queue_capacity = capacity;
        self
    }

    /// True when acceptance sampling is enabled.
    pub fn hanse_enabled(&self) -> bool {
        self.hanse_sampling_threshold > 0
    }
}

impl Default for ChunkPoolConfig {
    fn default() -> Self {
        Self {
            chunk_pool_size: 100_000,
            source_ingestion_threads: 1,
            chunk_loading_threads: 4,
            hanse_sampling_threshold: 0,
            hanse_sampling_gamma: 1.0,
            output_queue_capacity: 256,
        }
    }
}

/// Configuration for
/// [`DebugChunkSourceGenerator`](crate::generator::DebugChunkSourceGenerator).
#[derive(Debug, Clone)]
pub struct DebugGeneratorConfig {
    /// Sources emitted (in shuffled order) before the initial-scan marker.
    pub initial_chunk_sources: u64,
    /// Mean of the per-source chunk count distribution.
    pub mean_chunks_per_chunk_source: f64,
    /// Live emission rate after the initial scan; non-positive disables the
    /// live stream.
    pub chunk_sources_per_minute: f64,
}

impl DebugGeneratorConfig {
    pub fn with_initial_sources(mut self, count: u64) -> Self {
        self.initial_chunk_sources = count;
        self
    }

    pub fn with_mean_chunks(mut self, mean: f64) -> Self {
        self.mean_chunks_per_chunk_source = mean;
        self
    }

    pub fn with_sources_per_minute(mut self, per_minute: f64) -> Self {
        self.chunk_sources_per_minute = per_minute;
        self
    }
}

impl Default for DebugGeneratorConfig {
    fn default() -> Self {
        Self {
            initial_chunk_sources: 16,
            mean_chunks_per_chunk_source: 20.0,
            chunk_sources_per_minute: 0.0,
        }
    }
}

/// Configuration for
/// [`SimpleChunkExtractor`](crate::extractor::SimpleChunkExtractor).
#[derive(Debug, Clone)]
pub struct SimpleExtractorConfig {
    /// Capacity of the output chunk queue.
    pub output_queue_capacity: usize,
}

impl Default for SimpleExtractorConfig {
    fn default() -> Self {
        Self {
            output_queue_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_builders() {
        let config = ChunkPoolConfig::new(1000)
            .with_threads(2, 8)
            .with_hanse_sampling(32, 2.0)
            .with_output_capacity(64);
        assert_eq!(config.chunk_pool_size, 1000);
        assert_eq!(config.source_ingestion_threads, 2);
        assert_eq!(config.chunk_loading_threads, 8);
        assert!(config.hanse_enabled());
        assert_eq!(config.output_queue_capacity, 64);
    }

    #[test]
    fn test_hanse_disabled_by_default() {
        assert!(!ChunkPoolConfig::default().hanse_enabled());
    }
}
