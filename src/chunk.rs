//! Frame and chunk records flowing through the pipeline.
//!
//! A [`Frame`] is the fixed-size wire record of the training-data format;
//! the loader never inspects its fields and only ever reinterprets byte
//! buffers whose length is a whole number of frames.

use bytemuck::{Pod, Zeroable};

/// One fixed-size training record.
///
/// The struct is `repr(C)` with no padding so a chunk's byte buffer can be
/// reinterpreted as a frame slice without per-field decoding.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Frame {
    pub version: u32,
    pub input_format: u32,
    pub planes: [u64; 32],
    pub result_q: f32,
    pub result_d: f32,
    pub visits: u32,
    pub played_idx: u32,
}

/// Size in bytes of one [`Frame`] on disk (the V7 layout).
pub const FRAME_SIZE: usize = std::mem::size_of::<Frame>();

/// Size in bytes of the legacy V6 record: a [`Frame`] without the trailing
/// `visits`/`played_idx` fields.
pub const V6_FRAME_SIZE: usize = FRAME_SIZE - 8;

/// On-disk record layout of a raw chunk file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameFormat {
    /// Legacy records, copied into zero-extended [`Frame`]-sized slots on
    /// read. Field-level translation happens downstream.
    V6,
    /// Current records, bit-identical to [`Frame`].
    #[default]
    V7,
}

impl FrameFormat {
    /// Record width in bytes for this format.
    pub fn frame_size(self) -> usize {
        match self {
            FrameFormat::V6 => V6_FRAME_SIZE,
            FrameFormat::V7 => FRAME_SIZE,
        }
    }
}

/// A fully loaded chunk with its provenance, as emitted on the pool's
/// output queue.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingChunk {
    /// Sort key of the owning chunk source.
    pub sort_key: String,
    /// Local chunk index inside that source.
    pub index_within_sort_key: u64,
    /// Global chunk index in the window numbering.
    pub global_index: u64,
    /// How many times this chunk had been emitted before this emission.
    pub use_count: u32,
    pub frames: Vec<Frame>,
}

/// Reinterprets a chunk's byte buffer as frames.
///
/// Returns `None` if the buffer is empty or its length is not a whole
/// number of frames. The bytes are copied into an aligned allocation, so
/// the input buffer's alignment does not matter.
pub fn frames_from_bytes(bytes: &[u8]) -> Option<Vec<Frame>> {
    if bytes.is_empty() || bytes.len() % FRAME_SIZE != 0 {
        return None;
    }
    let mut frames = vec![Frame::zeroed(); bytes.len() / FRAME_SIZE];
    bytemuck::cast_slice_mut::<Frame, u8>(&mut frames).copy_from_slice(bytes);
    Some(frames)
}

/// Serialises frames back into their on-disk byte form.
pub fn bytes_from_frames(frames: &[Frame]) -> Vec<u8> {
    bytemuck::cast_slice::<Frame, u8>(frames).to_vec()
}
