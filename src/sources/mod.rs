//! Reference [`ChunkSource`](crate::source::ChunkSource) implementations.

mod debug;
mod raw_file;
mod tar;

pub use debug::DebugChunkSource;
pub use raw_file::RawFileChunkSource;
pub use tar::TarChunkSource;
