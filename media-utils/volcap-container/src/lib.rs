//! On-disk container for recorded capture sessions.
//!
//! The file is a flat stream of typed chunks, each `{length: u32, type:
//! u32, body[length]}`, little-endian. One file may interleave multiple
//! capture servers; every chunk except `BatchInfo` starts with the
//! `CameraIdentity` it applies to.
//!
//! The format is not seekable to arbitrary frames: playback must start from
//! a frame whose `back_reference == 0` (a keyframe), so readers begin at
//! offset zero and play forward.

use volcap_types::{CameraCalibration, CameraExtrinsics, CameraIdentity, VideoInfo};

mod chunk;
mod reader;
mod writer;

pub use chunk::{ChunkType, BATCH_INFO_BODY_BYTES, FRAME_HEADER_BODY_BYTES};
pub use reader::{ContainerEvent, ContainerReader};
pub use writer::{ContainerWriter, RecordedBatch, RecordedFrame};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("chunk body truncated: type {chunk_type} wants {want} bytes, {have} remain")]
    TruncatedChunk {
        chunk_type: u32,
        want: usize,
        have: usize,
    },
    #[error("{0}")]
    InvalidCode(#[from] volcap_types::InvalidCode),
    #[error("writer already closed")]
    AlreadyClosed,
}

/// Metadata frame payload pair read from or written to the container.
#[derive(Debug, Clone, PartialEq)]
pub struct FileFrame {
    pub identity: CameraIdentity,
    pub is_final_frame: bool,
    pub frame_number: u32,
    pub back_reference: i32,
    pub accelerometer: [f32; 3],
    pub exposure_usec: u32,
    pub awb_usec: u32,
    pub iso_speed: u32,
    pub brightness: f32,
    pub saturation: f32,
    pub image: Vec<u8>,
    pub depth: Vec<u8>,
}

/// Batch metadata chunk contents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileBatchInfo {
    /// Maximum number of frames that may follow for this batch.
    pub max_camera_count: u32,
    /// Monotonic per-file presentation timestamp.
    pub video_usec: u64,
    /// Best estimate of mid-exposure wall-clock time.
    pub video_epoch_usec: u64,
}

/// Per-camera metadata tables maintained by both reader and writer.
#[derive(Debug, Clone, Default)]
pub struct CameraTables {
    pub calibration: Option<CameraCalibration>,
    pub extrinsics: Option<CameraExtrinsics>,
    pub video_info: Option<VideoInfo>,
}
