//! The chunk-source abstraction consumed by the pool.

/// A handle to one archive of chunks (a tar file, a single raw file, or a
/// synthetic source).
///
/// Implementations are exclusively owned by the consuming stage; ownership
/// transfers through the queue on put.
pub trait ChunkSource: Send {
    /// Stable identifier whose lexicographic order is the recency order:
    /// newer sources have larger sort keys.
    fn sort_key(&self) -> String;

    /// Number of chunks in this source. Invariant over the source's
    /// lifetime.
    fn chunk_count(&self) -> usize;

    /// Raw frame bytes of chunk `index`, or `None` if the chunk is
    /// permanently unavailable (the caller must mark it dropped and never
    /// retry).
    fn chunk_data(&mut self, index: usize) -> Option<Vec<u8>>;

    /// At most `max_bytes` of the chunk's decoded bytes, for record-count
    /// probes that do not need the full chunk. The default implementation
    /// loads the whole chunk and truncates.
    fn chunk_prefix(&mut self, index: usize, max_bytes: usize) -> Option<Vec<u8>> {
        self.chunk_data(index).map(|mut data| {
            data.truncate(max_bytes);
            data
        })
    }
}

/// Message stream feeding a chunk-consuming stage.
pub enum SourceMessage {
    /// A newly discovered chunk source; ownership transfers with the
    /// message.
    File(Box<dyn ChunkSource>),
    /// One-shot marker: the initial batch of sources has fully arrived and
    /// the consumer may start emitting.
    InitialScanComplete,
}

impl std::fmt::Debug for SourceMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceMessage::File(source) => f
                .debug_struct("File")
                .field("sort_key", &source.sort_key())
                .field("chunk_count", &source.chunk_count())
                .finish(),
            SourceMessage::InitialScanComplete => f.write_str("InitialScanComplete"),
        }
    }
}
