//! Chunk source wrapping a single raw training-data file.

use crate::chunk::{FrameFormat, FRAME_SIZE};
use crate::source::ChunkSource;
use std::fs;
use std::path::PathBuf;
use tracing::warn;

/// Reads one file as a single chunk.
///
/// The file must be a whole number of records in the configured
/// [`FrameFormat`]; V6 records are copied into zero-extended V7-sized slots
/// so that downstream always sees [`Frame`](crate::chunk::Frame)-width data.
pub struct RawFileChunkSource {
    path: PathBuf,
    format: FrameFormat,
}

impl RawFileChunkSource {
    pub fn new(path: impl Into<PathBuf>, format: FrameFormat) -> Self {
        Self {
            path: path.into(),
            format,
        }
    }
}

impl ChunkSource for RawFileChunkSource {
    fn sort_key(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn chunk_count(&self) -> usize {
        1
    }

    fn chunk_data(&mut self, index: usize) -> Option<Vec<u8>> {
        if index != 0 {
            return None;
        }
        let data = fs::read(&self.path).ok()?;
        if data.is_empty() {
            return None;
        }
        let record_size = self.format.frame_size();
        if data.len() % record_size != 0 {
            warn!(
                path = %self.path.display(),
                size = data.len(),
                record_size,
                "file is not a whole number of records"
            );
            return None;
        }

        match self.format {
            FrameFormat::V7 => Some(data),
            FrameFormat::V6 => {
                let records = data.len() / record_size;
                let mut out = vec![0u8; records * FRAME_SIZE];
                for (record, slot) in data
                    .chunks_exact(record_size)
                    .zip(out.chunks_exact_mut(FRAME_SIZE))
                {
                    slot[..record_size].copy_from_slice(record);
                }
                Some(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{bytes_from_frames, frames_from_bytes, Frame, V6_FRAME_SIZE};
    use bytemuck::Zeroable;
    use std::io::Write;

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_v7_roundtrip_is_byte_identical() {
        let mut frames = vec![Frame::zeroed(); 4];
        for (i, frame) in frames.iter_mut().enumerate() {
            frame.planes[0] = i as u64 + 1;
        }
        let bytes = bytes_from_frames(&frames);
        let file = write_temp(&bytes);

        let mut source = RawFileChunkSource::new(file.path(), FrameFormat::V7);
        assert_eq!(source.chunk_count(), 1);
        let loaded = source.chunk_data(0).unwrap();
        assert_eq!(loaded, bytes);
        assert_eq!(frames_from_bytes(&loaded).unwrap(), frames);
    }

    #[test]
    fn test_v6_records_are_packed_into_v7_slots() {
        // Two V6 records of recognisable bytes.
        let mut bytes = vec![0xABu8; 2 * V6_FRAME_SIZE];
        bytes[V6_FRAME_SIZE..].fill(0xCD);
        let file = write_temp(&bytes);

        let mut source = RawFileChunkSource::new(file.path(), FrameFormat::V6);
        let loaded = source.chunk_data(0).unwrap();
        assert_eq!(loaded.len(), 2 * FRAME_SIZE);
        assert!(loaded[..V6_FRAME_SIZE].iter().all(|&b| b == 0xAB));
        assert!(loaded[V6_FRAME_SIZE..FRAME_SIZE].iter().all(|&b| b == 0));
        assert!(loaded[FRAME_SIZE..FRAME_SIZE + V6_FRAME_SIZE]
            .iter()
            .all(|&b| b == 0xCD));
        assert!(loaded[FRAME_SIZE + V6_FRAME_SIZE..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_wrong_multiple_is_unavailable() {
        let file = write_temp(&vec![0u8; FRAME_SIZE + 3]);
        let mut source = RawFileChunkSource::new(file.path(), FrameFormat::V7);
        assert!(source.chunk_data(0).is_none());
    }

    #[test]
    fn test_empty_and_out_of_range_are_unavailable() {
        let file = write_temp(&[]);
        let mut source = RawFileChunkSource::new(file.path(), FrameFormat::V7);
        assert!(source.chunk_data(0).is_none());
        assert!(source.chunk_data(1).is_none());
    }

    #[test]
    fn test_sort_key_is_file_name() {
        let source = RawFileChunkSource::new("/some/dir/training.20240101.bin", FrameFormat::V7);
        assert_eq!(source.sort_key(), "training.20240101.bin");
    }
}
