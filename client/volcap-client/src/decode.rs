//! Per-camera decode pipeline.
//!
//! Mirrors the capture-side pipeline in reverse: depth decompression and
//! mesh regeneration first, then video decoding. Stages run on bounded
//! worker queues (depth 60); an overflowing or failing stage drops that
//! frame with a warning and the stream recovers at the next keyframe.

use std::sync::Arc;

use parking_lot::Mutex;

use volcap_capture::codec::{CodecFactory, Nv12Image, VideoDecoderSession};
use volcap_capture::depth::{
    is_lossless_payload, is_lossy_payload, DepthDecompressor, LosslessDepth, LossyDepth,
};
use volcap_capture::mesh::{edge_filter, DepthMesher, TemporalDepthFilter};
use volcap_proto::wire::FrameHeader;
use volcap_types::{
    CameraCalibration, CameraExtrinsics, CaptureMode, VideoInfo,
};
use volcap_util::WorkerQueue;

/// Queue depth for each decode stage.
pub const MAX_QUEUED_DECODES: usize = 60;

/// Batch-level metadata shared by the frames of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchMeta {
    pub camera_count: u32,
    /// Presentation timestamp, already on the local timeline.
    pub video_boot_usec: u64,
    pub video_epoch_usec: u64,
}

/// One compressed frame with everything needed to decode it.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub guid: u64,
    pub batch: Arc<BatchMeta>,
    pub video_info: Arc<VideoInfo>,
    pub calibration: Arc<CameraCalibration>,
    pub extrinsics: Option<Arc<CameraExtrinsics>>,
    pub capture_mode: CaptureMode,
    pub header: FrameHeader,
    pub image: Vec<u8>,
    pub depth: Vec<u8>,
}

/// Decoded output: NV12 planes plus regenerated mesh.
#[derive(Debug)]
pub struct DecodedFrame {
    pub info: Arc<FrameInfo>,
    pub color: Option<Nv12Image>,
    pub depth_width: usize,
    pub depth_height: usize,
    pub depth: Vec<u16>,
    pub vertices: Vec<f32>,
    pub indices: Vec<u32>,
}

impl DecodedFrame {
    pub fn floats_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn indices_count(&self) -> usize {
        self.indices.len()
    }
}

pub type DecodeCallback = Arc<dyn Fn(Arc<DecodedFrame>) + Send + Sync>;

pub struct DecodeJob {
    pub input: Arc<FrameInfo>,
    pub output: Option<DecodedFrame>,
    pub callback: DecodeCallback,
}

/// Tracks the last few accepted frame numbers so unsatisfied
/// back-references are detected.
pub struct BackreferenceChecker {
    accepted: [u32; Self::MAX_ACCEPTED],
    next_index: usize,
    count: usize,
}

impl Default for BackreferenceChecker {
    fn default() -> Self {
        Self {
            accepted: [0; Self::MAX_ACCEPTED],
            next_index: 0,
            count: 0,
        }
    }
}

impl BackreferenceChecker {
    const MAX_ACCEPTED: usize = 4;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.next_index = 0;
        self.count = 0;
    }

    /// Record `frame_code` and report whether its back-reference is
    /// satisfied by a recently accepted frame.
    pub fn check(&mut self, frame_code: u32, back_reference: i32) -> bool {
        let satisfied = if back_reference == 0 {
            true
        } else {
            let expected = frame_code.wrapping_add(back_reference as u32);
            self.accepted[..self.count].contains(&expected)
        };

        self.accepted[self.next_index] = frame_code;
        if self.next_index >= self.count {
            self.count = self.next_index + 1;
        }
        self.next_index = (self.next_index + 1) % Self::MAX_ACCEPTED;

        satisfied
    }
}

enum DecodeStageKind {
    MeshDecompressor(MeshDecompressorState),
    VideoDecoder(VideoDecoderState),
}

impl DecodeStageKind {
    fn run(&mut self, job: &mut DecodeJob) -> bool {
        match self {
            DecodeStageKind::MeshDecompressor(state) => state.run(job),
            DecodeStageKind::VideoDecoder(state) => state.run(job),
        }
    }
}

struct MeshDecompressorState {
    lossless: Option<LosslessDepth>,
    lossy: Option<LossyDepth>,
    mesher: Option<DepthMesher>,
    temporal: TemporalDepthFilter,
    depth_width: i32,
    color_width: i32,
}

impl MeshDecompressorState {
    fn new() -> Self {
        Self {
            lossless: None,
            lossy: None,
            mesher: None,
            temporal: TemporalDepthFilter::new(),
            depth_width: 0,
            color_width: 0,
        }
    }

    fn run(&mut self, job: &mut DecodeJob) -> bool {
        let input = &job.input;
        let payload = &input.depth;

        let decoded = if is_lossless_payload(payload) {
            self.lossy = None;
            self.lossless
                .get_or_insert_with(LosslessDepth::default)
                .decompress(payload)
        } else if is_lossy_payload(payload) {
            self.lossless = None;
            self.lossy
                .get_or_insert_with(LossyDepth::default)
                .decompress(payload)
        } else {
            tracing::error!("depth data is corrupted");
            return false;
        };
        let mut decoded = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!("depth decompression failed: {e}");
                return false;
            }
        };

        let calibration = &input.calibration;
        if decoded.width != calibration.depth.width as usize
            || decoded.height != calibration.depth.height as usize
        {
            tracing::error!("calibration resolution does not match depth resolution");
            return false;
        }

        // Resolution or calibration change rebuilds the mesher.
        if self.depth_width != calibration.depth.width
            || self.color_width != calibration.color.width
        {
            tracing::debug!(
                "resetting mesher on resolution change: depth={}x{} color={}x{}",
                calibration.depth.width,
                calibration.depth.height,
                calibration.color.width,
                calibration.color.height
            );
            self.mesher = None;
        }
        self.depth_width = calibration.depth.width;
        self.color_width = calibration.color.width;
        let mesher = self
            .mesher
            .get_or_insert_with(|| DepthMesher::new(*calibration.as_ref()));

        // Symmetric to the server-side filters.
        self.temporal
            .filter(&mut decoded.depth, decoded.width, decoded.height);
        edge_filter(&mut decoded.depth, decoded.width, decoded.height);

        // Registration needs the full depth field in calibration mode.
        let cull = input.capture_mode != CaptureMode::Calibration;

        let mut vertices = Vec::new();
        mesher.generate_coordinates(&mut decoded.depth, None, false, cull, &mut vertices);
        let mut indices = Vec::new();
        mesher.generate_triangle_indices(&decoded.depth, &mut indices);

        job.output = Some(DecodedFrame {
            info: input.clone(),
            color: None,
            depth_width: decoded.width,
            depth_height: decoded.height,
            depth: decoded.depth,
            vertices,
            indices,
        });
        true
    }
}

struct VideoDecoderState {
    factory: Arc<dyn CodecFactory>,
    decoder: Option<Box<dyn VideoDecoderSession>>,
    width: u32,
    checker: BackreferenceChecker,
}

impl VideoDecoderState {
    fn new(factory: Arc<dyn CodecFactory>) -> Self {
        Self {
            factory,
            decoder: None,
            width: 0,
            checker: BackreferenceChecker::new(),
        }
    }

    fn run(&mut self, job: &mut DecodeJob) -> bool {
        let input = &job.input;
        let video_info = &input.video_info;

        if self.width != video_info.width {
            if self.decoder.is_some() {
                tracing::info!(
                    "video decoder reset on resolution change {}x{}",
                    video_info.width,
                    video_info.height
                );
            }
            self.decoder = None;
        }

        if self.decoder.is_none() {
            if input.header.back_reference != 0 {
                tracing::warn!(
                    "video decoder cannot initialize on a P-frame: waiting for next keyframe"
                );
                return false;
            }
            // Keyframes carry their parameter sets up front, so the stream
            // is self-contained from any keyframe.
            match self
                .factory
                .create_video_decoder(video_info.video_type, &input.image)
            {
                Ok(decoder) => {
                    self.decoder = Some(decoder);
                    self.width = video_info.width;
                    self.checker.reset();
                }
                Err(e) => {
                    tracing::error!("failed to initialize video decoder: {e}");
                    return false;
                }
            }
        }

        if !self
            .checker
            .check(input.header.frame_number, input.header.back_reference)
        {
            // Best effort: the decoder may conceal or recover on its own.
            tracing::warn!(
                "corrupted video: unsatisfied back-reference: frame={} ref={}",
                input.header.frame_number,
                input.header.back_reference
            );
        }

        let decoder = self.decoder.as_mut().expect("decoder present");
        match decoder.decode(&input.image) {
            Ok(decoded) => {
                if let Some(output) = job.output.as_mut() {
                    // Copy out and release the backend frame reference
                    // immediately; some backends allow only one surface.
                    output.color = Some(decoded.image.clone());
                }
                true
            }
            Err(e) => {
                tracing::error!("video decode failed: {e}; resetting decoder");
                self.decoder = None;
                false
            }
        }
    }
}

struct DecoderStage {
    name: &'static str,
    kind: Mutex<DecodeStageKind>,
    worker: WorkerQueue,
    next: Option<Arc<DecoderStage>>,
}

impl DecoderStage {
    fn process(self: &Arc<Self>, mut job: DecodeJob) {
        let stage = self.clone();
        let queued = self.worker.try_submit(move || {
            let success = stage.kind.lock().run(&mut job);
            if !success {
                tracing::warn!(
                    "operation failed for stage {}: dropped frame {}",
                    stage.name,
                    job.input.header.frame_number
                );
                return;
            }
            match &stage.next {
                Some(next) => next.process(job),
                None => {
                    if let Some(output) = job.output.take() {
                        (job.callback)(Arc::new(output));
                    }
                }
            }
        });
        if !queued {
            tracing::warn!("computer too slow for stage {}: dropped a frame", self.name);
        }
    }
}

/// The decode pipeline for one camera of one server.
pub struct DecoderPipeline {
    head: Arc<DecoderStage>,
}

impl DecoderPipeline {
    pub fn new(factory: Arc<dyn CodecFactory>) -> Self {
        let video = Arc::new(DecoderStage {
            name: "video-decoder",
            kind: Mutex::new(DecodeStageKind::VideoDecoder(VideoDecoderState::new(
                factory,
            ))),
            worker: WorkerQueue::new("video-decoder", MAX_QUEUED_DECODES),
            next: None,
        });
        let mesh = Arc::new(DecoderStage {
            name: "mesh-decompressor",
            kind: Mutex::new(DecodeStageKind::MeshDecompressor(
                MeshDecompressorState::new(),
            )),
            worker: WorkerQueue::new("mesh-decompressor", MAX_QUEUED_DECODES),
            next: Some(video),
        });
        Self { head: mesh }
    }

    pub fn process(&self, input: Arc<FrameInfo>, callback: DecodeCallback) {
        self.head.process(DecodeJob {
            input,
            output: None,
            callback,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backref_checker_accepts_keyframes_unconditionally() {
        let mut checker = BackreferenceChecker::new();
        assert!(checker.check(10, 0));
        assert!(checker.check(11, -1));
        assert!(checker.check(12, -1));
    }

    #[test]
    fn backref_checker_flags_missing_reference() {
        let mut checker = BackreferenceChecker::new();
        assert!(checker.check(10, 0));
        // Frame 12 references 11, which was never accepted.
        assert!(!checker.check(12, -1));
        // But 12 itself is recorded, so 13 is satisfied.
        assert!(checker.check(13, -1));
    }

    #[test]
    fn backref_checker_forgets_old_frames() {
        let mut checker = BackreferenceChecker::new();
        for n in 0..6u32 {
            checker.check(n, 0);
        }
        // Frame 0 has been evicted from the 4-entry ring.
        assert!(!checker.check(1, -1));
    }
}
