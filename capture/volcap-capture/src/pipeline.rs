//! Per-camera compression pipeline and batch processor.
//!
//! A matched batch fans out into one two-stage pipeline per camera
//! (mesh compression, then video encoding). Stages run on their own worker
//! threads with bounded queues; overflow or stage failure aborts the whole
//! batch and every sibling pipeline short-circuits. A per-batch countdown
//! fires the completion callback exactly once when the last pipeline
//! retires.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use volcap_types::{CaptureMode, CompressionSettings, VideoInfo, VideoType, MAX_CAMERAS};
use volcap_util::WorkerQueue;

use crate::camera::ColorFormat;
use crate::clock::{BootEpochConverter, VideoTimestampCleaner};
use crate::codec::{
    CodecFactory, EncoderParams, JpegDecoderSession, Nv12Image, ProcAmp, VideoEncoderSession,
};
use crate::config::RuntimeConfig;
use crate::depth::{DepthCompressor, LosslessDepth, LossyDepth};
use crate::device::RawFrame;
use crate::mesh::{edge_filter, CropRegion, DepthMesher, TemporalDepthFilter};
use crate::nal;

/// Interval between scheduled keyframes.
pub const KEYFRAME_INTERVAL_MSEC: u64 = 1000;

/// Bounded queue depth for every pipeline stage.
pub const PIPELINE_QUEUE_DEPTH: usize = 8;

/// How long slow/error states stick before reporting Encoding again.
const WARNING_HOLD_MSEC: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorState {
    Idle = 0,
    Encoding = 1,
    SlowWarning = 2,
    Error = 3,
}

/// Output slot for one camera of one batch. Only that camera's stages
/// write it.
#[derive(Default)]
pub struct FrameOutput {
    pub compressed_image: Vec<u8>,
    pub compressed_depth: Vec<u8>,
    pub mesh_vertices: Vec<f32>,
    pub mesh_triangles: Vec<u32>,
    /// Decoded color for local rendering, present when images are needed.
    pub decoded_color: Option<Nv12Image>,
    pub crop: Option<CropRegion>,
    pub brightness: f32,
    pub saturation: f32,
}

pub struct Batch {
    pub batch_number: u64,
    pub images: Vec<Arc<RawFrame>>,
    pub outputs: Vec<Mutex<FrameOutput>>,
    /// Earliest member shutter time: frames behind more USB hops arrive
    /// later, and the earliest one skews least against peer hosts.
    pub sync_system_usec: u64,
    pub sync_epoch_usec: u64,
    pub video_epoch_usec: u64,
    pub discontinuity: bool,
    pub keyframe: bool,
    pub video_info_epoch: u32,
    pub video_info: VideoInfo,
    pub start_msec: u64,
    end_msec: AtomicU64,
    aborted: AtomicBool,
    pipeline_error: AtomicBool,
    slow_drop: AtomicBool,
}

impl Batch {
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn is_pipeline_error(&self) -> bool {
        self.pipeline_error.load(Ordering::SeqCst)
    }

    pub fn is_slow_drop(&self) -> bool {
        self.slow_drop.load(Ordering::SeqCst)
    }

    pub fn end_msec(&self) -> u64 {
        self.end_msec.load(Ordering::SeqCst)
    }

    fn abort_slow(&self) {
        self.slow_drop.store(true, Ordering::SeqCst);
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn abort_error(&self) {
        self.pipeline_error.store(true, Ordering::SeqCst);
        self.aborted.store(true, Ordering::SeqCst);
    }
}

/// Work item shared by all pipelines of one batch.
pub struct PipelineData {
    pub batch: Arc<Batch>,
    pub compression: CompressionSettings,
    pub images_needed: bool,
    pub video_needed: bool,
    pub config: Arc<RuntimeConfig>,
    callback: Box<dyn Fn(Arc<Batch>) + Send + Sync>,
    remaining: AtomicU32,
}

impl PipelineData {
    fn on_pipeline_complete(&self) {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            (self.callback)(self.batch.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Stages

enum StageKind {
    MeshCompressor(MeshCompressorState),
    VideoEncoder(VideoEncoderState),
}

impl StageKind {
    fn run(&mut self, data: &PipelineData, camera_index: usize) -> bool {
        match self {
            StageKind::MeshCompressor(state) => state.run(data, camera_index),
            StageKind::VideoEncoder(state) => state.run(data, camera_index),
        }
    }
}

struct MeshCompressorState {
    temporal: TemporalDepthFilter,
    mesher: Option<DepthMesher>,
    lossless: LosslessDepth,
    lossy: LossyDepth,
    extrinsics_epoch: u32,
    clip_epoch: u32,
    crop: Option<CropRegion>,
}

impl MeshCompressorState {
    fn new() -> Self {
        Self {
            temporal: TemporalDepthFilter::new(),
            mesher: None,
            lossless: LosslessDepth,
            lossy: LossyDepth,
            extrinsics_epoch: 0,
            clip_epoch: 0,
            crop: None,
        }
    }

    fn run(&mut self, data: &PipelineData, camera_index: usize) -> bool {
        let batch = &data.batch;
        let image = &batch.images[camera_index];
        let width = image.depth_width as usize;
        let height = image.depth_height as usize;

        // The ring still shares the frame, so filtering works on a copy.
        let mut depth = image.depth.clone();

        let rebuild = match &self.mesher {
            Some(mesher) => {
                let cal = mesher.calibration();
                cal.depth.width != image.calibration.depth.width
                    || cal.color.width != image.calibration.color.width
            }
            None => true,
        };
        if rebuild {
            self.mesher = Some(DepthMesher::new(*image.calibration.as_ref()));
            self.crop = None;
        }
        let mesher = self.mesher.as_ref().expect("mesher built above");

        let clip = data.config.should_clip(camera_index);
        if let Some(region) = &clip {
            let extrinsics_epoch = data.config.extrinsics_epoch.load(Ordering::SeqCst);
            let clip_epoch = data.config.clip_epoch.load(Ordering::SeqCst);
            if self.crop.is_none()
                || self.extrinsics_epoch != extrinsics_epoch
                || self.clip_epoch != clip_epoch
            {
                self.extrinsics_epoch = extrinsics_epoch;
                self.clip_epoch = clip_epoch;
                let crop = mesher.calculate_crop(&depth, region);
                tracing::info!(
                    "updated camera {camera_index} crop: x={} y={} w={} h={}",
                    crop.x,
                    crop.y,
                    crop.width,
                    crop.height
                );
                self.crop = Some(crop);
            }
        }

        let is_calibration = data.config.mode() == CaptureMode::Calibration;

        // Calibration always stabilizes, for registration accuracy.
        if is_calibration || data.compression.stabilization_filter {
            self.temporal.filter(&mut depth, width, height);
        }
        if data.compression.edge_filter {
            edge_filter(&mut depth, width, height);
        }

        let mut output = batch.outputs[camera_index].lock();
        output.crop = if clip.is_some() { self.crop } else { None };

        mesher.generate_coordinates(
            &mut depth,
            clip.as_ref(),
            data.compression.face_painting_fix,
            !is_calibration,
            &mut output.mesh_vertices,
        );

        if !data.images_needed && !data.video_needed {
            return true;
        }

        let mut triangles = std::mem::take(&mut output.mesh_triangles);
        mesher.generate_triangle_indices(&depth, &mut triangles);
        output.mesh_triangles = triangles;

        if !data.video_needed {
            return true;
        }

        // Calibration requires bit-exact depth.
        let lossy = data.compression.depth_video != VideoType::Lossless && !is_calibration;
        output.compressed_depth = if lossy {
            self.lossy.compress(width, height, &depth, batch.keyframe)
        } else {
            self.lossless.compress(width, height, &depth, batch.keyframe)
        };

        if output.compressed_depth.is_empty() {
            tracing::error!("depth compression produced no output");
            return false;
        }
        true
    }
}

struct VideoEncoderState {
    factory: Arc<dyn CodecFactory>,
    encoder: Option<Box<dyn VideoEncoderSession>>,
    jpeg_decoder: Option<Box<dyn JpegDecoderSession>>,
    params: Option<EncoderParams>,
    video_parameters: Vec<u8>,
    jpeg_width: u32,
    jpeg_height: u32,
}

impl VideoEncoderState {
    fn new(factory: Arc<dyn CodecFactory>) -> Self {
        Self {
            factory,
            encoder: None,
            jpeg_decoder: None,
            params: None,
            video_parameters: Vec::new(),
            jpeg_width: 0,
            jpeg_height: 0,
        }
    }

    fn reset_sessions(&mut self) {
        self.encoder = None;
        self.jpeg_decoder = None;
    }

    fn run(&mut self, data: &PipelineData, camera_index: usize) -> bool {
        if !data.images_needed && !data.video_needed {
            return true;
        }

        let batch = &data.batch;
        let image = &batch.images[camera_index];

        if self.jpeg_width != image.color_width || self.jpeg_height != image.color_height {
            if self.jpeg_decoder.is_some() {
                tracing::info!("video format change: resetting video pipeline");
            }
            self.jpeg_width = image.color_width;
            self.jpeg_height = image.color_height;
            self.reset_sessions();
        }

        let lighting = data.config.lighting(camera_index);
        let procamp = ProcAmp {
            enabled: true,
            denoise_pct: data.compression.denoise_pct,
            brightness: lighting.brightness,
            saturation: lighting.saturation,
        };
        let params = EncoderParams {
            codec: data.compression.color_video,
            bitrate: data.compression.color_bitrate,
            quality: data.compression.color_quality,
            framerate: image.framerate,
            width: image.color_width,
            height: image.color_height,
            intra_refresh_cycle: image.framerate * KEYFRAME_INTERVAL_MSEC as u32 / 2000,
            intra_refresh_qp_delta: -5,
            procamp,
        };

        if let Some(current) = &self.params {
            if current.requires_reinit(&params) {
                tracing::warn!("resetting video encoder for new camera={camera_index} settings");
                self.reset_sessions();
            }
        }
        self.params = Some(params);

        // Obtain the NV12 surface for this frame.
        let nv12 = match image.color_format {
            ColorFormat::Mjpeg => {
                if self.jpeg_decoder.is_none() {
                    match self.factory.create_jpeg_decoder() {
                        Ok(decoder) => self.jpeg_decoder = Some(decoder),
                        Err(e) => {
                            tracing::error!("JPEG decoder failed to initialize: {e}");
                            return false;
                        }
                    }
                }
                let decoder = self.jpeg_decoder.as_mut().expect("decoder created above");
                match decoder.decode(&image.color) {
                    Ok(decoded) => decoded.image.clone(),
                    Err(e) => {
                        tracing::error!("JPEG decode failed: {e}; resetting video pipeline");
                        self.reset_sessions();
                        return false;
                    }
                }
            }
            ColorFormat::Nv12 => {
                match Nv12Image::from_packed(image.color_width, image.color_height, &image.color)
                {
                    Ok(nv12) => nv12,
                    Err(e) => {
                        tracing::error!("bad NV12 buffer: {e}");
                        return false;
                    }
                }
            }
        };

        {
            let mut output = batch.outputs[camera_index].lock();
            output.brightness = procamp.brightness;
            output.saturation = procamp.saturation;
            if data.images_needed {
                output.decoded_color = Some(nv12.clone());
            }
        }

        if !data.video_needed {
            return true;
        }

        // ProcAmp can change on a live session; anything else re-creates it.
        let procamp_rejected = match &mut self.encoder {
            Some(encoder) => !encoder.change_procamp(&procamp),
            None => false,
        };
        if procamp_rejected {
            tracing::warn!("resetting video pipeline on ProcAmp change for camera={camera_index}");
            self.reset_sessions();
        }
        if self.encoder.is_none() {
            match self.factory.create_encoder(&params) {
                Ok(encoder) => self.encoder = Some(encoder),
                Err(e) => {
                    tracing::error!("video encoder initialization failed: {e}");
                    return false;
                }
            }
        }
        let encoder = self.encoder.as_mut().expect("encoder created above");

        let keyframe = batch.keyframe;
        let mut access_unit = Vec::new();
        for retries in 0..3 {
            match encoder.encode(&nv12, keyframe) {
                Ok(data) if !data.is_empty() => {
                    access_unit = data;
                    break;
                }
                Ok(_) | Err(_) => {
                    tracing::warn!("encoder failed {}x: retrying...", retries + 1);
                }
            }
        }
        if access_unit.is_empty() {
            tracing::error!("encoder failed repeatedly: resetting video pipeline");
            self.reset_sessions();
            return false;
        }

        let is_hevc = data.compression.color_video == VideoType::H265;
        let parsed = nal::parse_video(is_hevc, &access_unit);
        if parsed.pictures.len() != 1 {
            tracing::error!("found {} pictures in encoder output", parsed.pictures.len());
            return false;
        }
        if !parsed.parameters.is_empty() {
            self.video_parameters = parsed.parameters;
        }

        let picture = &parsed.pictures[0];
        let mut output = batch.outputs[camera_index].lock();
        output.compressed_image.clear();
        if keyframe {
            if self.video_parameters.is_empty() {
                tracing::error!("video parameters not available for keyframe");
                return false;
            }
            // The receiver must be able to initialize a decoder from any
            // keyframe without out-of-band configuration.
            output
                .compressed_image
                .extend_from_slice(&self.video_parameters);
        }
        output.compressed_image.extend_from_slice(picture);
        true
    }
}

struct PipelineStage {
    name: &'static str,
    camera_index: usize,
    kind: Mutex<StageKind>,
    worker: WorkerQueue,
    next: Option<Arc<PipelineStage>>,
}

impl PipelineStage {
    fn new(
        name: &'static str,
        camera_index: usize,
        kind: StageKind,
        next: Option<Arc<PipelineStage>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            camera_index,
            kind: Mutex::new(kind),
            worker: WorkerQueue::new(
                &format!("{name}-{camera_index}"),
                PIPELINE_QUEUE_DEPTH,
            ),
            next,
        })
    }

    fn process(self: &Arc<Self>, data: Arc<PipelineData>) {
        let stage = self.clone();
        let data_for_worker = data.clone();
        let queued = self.worker.try_submit(move || {
            let data = data_for_worker;
            let batch = &data.batch;

            // A parallel pipeline aborted this batch: retire in sympathy.
            if batch.is_aborted() {
                data.on_pipeline_complete();
                return;
            }

            let success = stage.kind.lock().run(&data, stage.camera_index);
            if !success {
                tracing::warn!(
                    "operation failed for stage {}: dropped batch {} for camera {}",
                    stage.name,
                    batch.batch_number,
                    stage.camera_index
                );
                batch.abort_error();
                data.on_pipeline_complete();
                return;
            }

            match &stage.next {
                Some(next) => next.process(data),
                None => data.on_pipeline_complete(),
            }
        });

        if !queued {
            let batch = &data.batch;
            tracing::warn!(
                "computer too slow for stage {}: dropped batch {} for camera {}",
                self.name,
                batch.batch_number,
                self.camera_index
            );
            batch.abort_slow();
            data.on_pipeline_complete();
        }
    }
}

/// The two stages for one camera, wired head to tail.
struct PipelineCamera {
    head: Arc<PipelineStage>,
}

impl PipelineCamera {
    fn new(camera_index: usize, factory: Arc<dyn CodecFactory>) -> Self {
        let video = PipelineStage::new(
            "video-encoder",
            camera_index,
            StageKind::VideoEncoder(VideoEncoderState::new(factory)),
            None,
        );
        let mesh = PipelineStage::new(
            "mesh-compressor",
            camera_index,
            StageKind::MeshCompressor(MeshCompressorState::new()),
            Some(video),
        );
        Self { head: mesh }
    }
}

// ---------------------------------------------------------------------------
// Statistics

#[derive(Default)]
struct PipelineStatistics {
    last_report_msec: u64,
    min_delay_msec: u64,
    max_delay_msec: u64,
    delay_sum_msec: u64,
    delay_count: u64,
    error_count: u64,
    slow_drop_count: u64,
}

const REPORT_INTERVAL_MSEC: u64 = 2000;

impl PipelineStatistics {
    fn add_sample(&mut self, batch: &Batch) {
        if batch.is_aborted() {
            if batch.is_pipeline_error() {
                self.error_count += 1;
            }
            if batch.is_slow_drop() {
                self.slow_drop_count += 1;
            }
            return;
        }

        let delay = batch.end_msec().saturating_sub(batch.start_msec);
        if self.delay_count == 0 {
            self.min_delay_msec = delay;
            self.max_delay_msec = delay;
            self.delay_sum_msec = delay;
            self.delay_count = 1;
            return;
        }
        self.min_delay_msec = self.min_delay_msec.min(delay);
        self.max_delay_msec = self.max_delay_msec.max(delay);
        self.delay_sum_msec += delay;
        self.delay_count += 1;

        if self.delay_count >= 10
            && batch.end_msec().saturating_sub(self.last_report_msec) > REPORT_INTERVAL_MSEC
        {
            self.last_report_msec = batch.end_msec();
            tracing::info!(
                "video pipeline delay statistics: min={} avg={} max={} (msec) errors={} slow_drops={}",
                self.min_delay_msec,
                self.delay_sum_msec / self.delay_count,
                self.max_delay_msec,
                self.error_count,
                self.slow_drop_count
            );
            *self = PipelineStatistics {
                last_report_msec: self.last_report_msec,
                ..Default::default()
            };
        }
    }
}

// ---------------------------------------------------------------------------
// BatchProcessor

struct ProcessorInner {
    last_keyframe_msec: Option<u64>,
    epoch: BootEpochConverter,
    cleaner: VideoTimestampCleaner,
    video_info: VideoInfo,
    /// Starts from 1 so a zero-initialized connection cache always differs.
    video_info_epoch: u32,
}

/// Invoked with every successfully compressed batch, in batch order.
pub type BatchCallback = Arc<dyn Fn(Arc<Batch>) + Send + Sync>;

pub struct BatchProcessor {
    config: Arc<RuntimeConfig>,
    callback: BatchCallback,
    worker: WorkerQueue,
    cameras: Vec<PipelineCamera>,
    next_batch_number: AtomicU64,
    state: AtomicU8,
    force_keyframe: AtomicBool,
    inner: Mutex<ProcessorInner>,
    /// Held while handling pipeline output: aborts may arrive out of
    /// order, successful batches arrive in order.
    handler: Mutex<PipelineStatistics>,
    last_warning_msec: AtomicU64,
}

impl BatchProcessor {
    pub fn new(
        config: Arc<RuntimeConfig>,
        factory: Arc<dyn CodecFactory>,
        callback: BatchCallback,
    ) -> Arc<Self> {
        let cameras = (0..MAX_CAMERAS)
            .map(|i| PipelineCamera::new(i, factory.clone()))
            .collect();
        Arc::new(Self {
            config,
            callback,
            worker: WorkerQueue::new("batch-processor", PIPELINE_QUEUE_DEPTH),
            cameras,
            next_batch_number: AtomicU64::new(0),
            state: AtomicU8::new(ProcessorState::Idle as u8),
            force_keyframe: AtomicBool::new(false),
            inner: Mutex::new(ProcessorInner {
                last_keyframe_msec: None,
                epoch: BootEpochConverter::new(),
                cleaner: VideoTimestampCleaner::new(),
                video_info: VideoInfo::default(),
                video_info_epoch: 1,
            }),
            handler: Mutex::new(PipelineStatistics::default()),
            last_warning_msec: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> ProcessorState {
        match self.state.load(Ordering::SeqCst) {
            1 => ProcessorState::Encoding,
            2 => ProcessorState::SlowWarning,
            3 => ProcessorState::Error,
            _ => ProcessorState::Idle,
        }
    }

    /// Entry point from the frame matcher.
    pub fn on_batch(self: &Arc<Self>, images: Vec<Arc<RawFrame>>) {
        if images.is_empty() {
            tracing::error!("empty image set");
            return;
        }
        let batch_number = self.next_batch_number.fetch_add(1, Ordering::SeqCst);
        let start_msec = volcap_util::boot_usec() / 1000;

        let this = self.clone();
        let queued = self.worker.try_submit(move || {
            this.process_batch(batch_number, start_msec, images);
        });
        if !queued {
            tracing::warn!("computer too slow to queue up new batch {batch_number}");
            self.force_keyframe.store(true, Ordering::SeqCst);
            let mut stats = self.handler.lock();
            stats.slow_drop_count += 1;
        }
    }

    fn process_batch(
        self: &Arc<Self>,
        batch_number: u64,
        start_msec: u64,
        images: Vec<Arc<RawFrame>>,
    ) {
        let camera_count = images.len();

        // Earliest member defines the batch shutter time.
        let first = images
            .iter()
            .min_by_key(|image| image.sync_system_usec)
            .expect("images not empty")
            .clone();

        let mut keyframe = false;
        let (sync_epoch_usec, video_epoch_usec, discontinuity, video_info, video_info_epoch) = {
            let mut inner = self.inner.lock();

            let interval_elapsed = match inner.last_keyframe_msec {
                None => true,
                Some(last) => start_msec.saturating_sub(last) >= KEYFRAME_INTERVAL_MSEC,
            };
            if interval_elapsed
                || self.config.take_keyframe_request()
                || self.force_keyframe.swap(false, Ordering::SeqCst)
            {
                inner.last_keyframe_msec = Some(start_msec);
                keyframe = true;
            }

            let sync_epoch_usec = inner.epoch.convert(first.sync_system_usec);
            let (video_epoch_usec, discontinuity) =
                inner.cleaner.clean(first.depth_device_usec, sync_epoch_usec);
            if discontinuity {
                keyframe = true;
                inner.last_keyframe_msec = Some(start_msec);
            }

            let compression = self.config.compression();
            let video_info = VideoInfo {
                video_type: compression.color_video,
                width: first.color_width,
                height: first.color_height,
                framerate: first.framerate,
                bitrate: compression.color_bitrate,
            };
            if video_info != inner.video_info {
                inner.video_info = video_info;
                inner.video_info_epoch += 1;
            }
            (
                sync_epoch_usec,
                video_epoch_usec,
                discontinuity,
                video_info,
                inner.video_info_epoch,
            )
        };

        let outputs = (0..camera_count)
            .map(|_| Mutex::new(FrameOutput::default()))
            .collect();
        let batch = Arc::new(Batch {
            batch_number,
            sync_system_usec: first.sync_system_usec,
            sync_epoch_usec,
            video_epoch_usec,
            discontinuity,
            keyframe,
            video_info,
            video_info_epoch,
            images,
            outputs,
            start_msec,
            end_msec: AtomicU64::new(0),
            aborted: AtomicBool::new(false),
            pipeline_error: AtomicBool::new(false),
            slow_drop: AtomicBool::new(false),
        });

        let processor = self.clone();
        let data = Arc::new(PipelineData {
            batch: batch.clone(),
            compression: self.config.compression(),
            images_needed: self.config.images_needed(),
            video_needed: self.config.video_needed(),
            config: self.config.clone(),
            callback: Box::new(move |batch| processor.on_pipeline_output(batch)),
            remaining: AtomicU32::new(camera_count as u32),
        });

        for camera_index in 0..camera_count {
            self.cameras[camera_index].head.process(data.clone());
        }
    }

    fn on_pipeline_output(&self, batch: Arc<Batch>) {
        // One lock for all pipeline completions: aborted batches arrive out
        // of order, successes in order, and the downstream callback must
        // observe successes in order.
        let mut stats = self.handler.lock();

        let now_msec = volcap_util::boot_usec() / 1000;
        batch.end_msec.store(now_msec, Ordering::SeqCst);
        stats.add_sample(&batch);

        if batch.is_aborted() {
            let state = if batch.is_pipeline_error() {
                ProcessorState::Error
            } else {
                ProcessorState::SlowWarning
            };
            self.state.store(state as u8, Ordering::SeqCst);
            self.last_warning_msec.store(now_msec, Ordering::SeqCst);
            // Decoders need a resync point after a dropped batch.
            self.force_keyframe.store(true, Ordering::SeqCst);
            return;
        }

        let last_warning = self.last_warning_msec.load(Ordering::SeqCst);
        if last_warning == 0 || now_msec.saturating_sub(last_warning) > WARNING_HOLD_MSEC {
            self.last_warning_msec.store(0, Ordering::SeqCst);
            self.state
                .store(ProcessorState::Encoding as u8, Ordering::SeqCst);
        }

        (self.callback)(batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraSettings, ColorFormat};
    use crate::codec::SoftwareCodecFactory;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn synthetic_raw_frame(camera_index: u32, frame_number: u32, shutter_usec: u64) -> Arc<RawFrame> {
        let settings = CameraSettings::for_mode(CaptureMode::CaptureLowQ);
        let mut cam = crate::camera::SyntheticCamera::new(camera_index);
        let calibration = Arc::new(cam.calibration());
        use crate::camera::{RgbdCamera, SyncMode};
        cam.start(&settings, SyncMode::Standalone, 0).unwrap();
        let frame = cam.next_frame(Duration::from_millis(100)).unwrap();

        Arc::new(RawFrame {
            device_index: camera_index,
            frame_number,
            framerate: 30,
            calibration,
            color: frame.color,
            color_width: frame.color_width,
            color_height: frame.color_height,
            color_stride: frame.color_stride,
            color_format: ColorFormat::Nv12,
            depth: frame.depth,
            depth_width: frame.depth_width,
            depth_height: frame.depth_height,
            depth_device_usec: shutter_usec,
            depth_system_usec: shutter_usec + 3000,
            color_device_usec: shutter_usec,
            color_system_usec: shutter_usec + 3000,
            color_exposure_usec: 10_000,
            color_awb_usec: 4500,
            color_iso_speed: 400,
            accelerometer: [0.0, -9.8, 0.0],
            sync_device_usec: shutter_usec,
            sync_system_usec: shutter_usec + 3000,
            matched: AtomicBool::new(true),
        })
    }

    fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
        let t0 = std::time::Instant::now();
        while !check() {
            assert!(t0.elapsed() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn single_camera_batch_produces_output() {
        let config = Arc::new(RuntimeConfig::new());
        config.store_mode(CaptureMode::CaptureLowQ);
        let received: Arc<Mutex<Vec<Arc<Batch>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let processor = BatchProcessor::new(
            config,
            Arc::new(SoftwareCodecFactory),
            Arc::new(move |batch| sink.lock().push(batch)),
        );

        processor.on_batch(vec![synthetic_raw_frame(0, 0, 1_000_000)]);
        wait_for("batch completion", Duration::from_secs(10), || {
            !received.lock().is_empty()
        });

        let batches = received.lock();
        let batch = &batches[0];
        assert_eq!(batch.batch_number, 0);
        assert!(batch.keyframe, "first batch must be a keyframe");
        assert!(!batch.is_aborted());
        let output = batch.outputs[0].lock();
        assert!(!output.compressed_image.is_empty());
        assert!(!output.compressed_depth.is_empty());
        assert!(output.mesh_vertices.iter().any(|&v| v != 0.0));
        assert!(!output.mesh_triangles.is_empty());
        assert_eq!(batch.video_info.width, 1280);
        assert_eq!(batch.video_info.height, 720);
    }

    #[test]
    fn keyframes_follow_the_interval() {
        let config = Arc::new(RuntimeConfig::new());
        config.store_mode(CaptureMode::CaptureLowQ);
        let keyframes = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));
        let kf = keyframes.clone();
        let tot = total.clone();
        let processor = BatchProcessor::new(
            config,
            Arc::new(SoftwareCodecFactory),
            Arc::new(move |batch: Arc<Batch>| {
                if batch.keyframe {
                    kf.fetch_add(1, Ordering::SeqCst);
                }
                tot.fetch_add(1, Ordering::SeqCst);
            }),
        );

        // Feed batches at a simulated 30 fps without real-time sleeps; the
        // keyframe clock runs on wall time, so only the first batch and
        // those after a full interval may be keyframes.
        for n in 0..10u64 {
            processor.on_batch(vec![synthetic_raw_frame(0, n as u32, 1_000_000 + n * 33_333)]);
            wait_for("batch", Duration::from_secs(10), || {
                total.load(Ordering::SeqCst) > n as usize
            });
        }
        assert_eq!(total.load(Ordering::SeqCst), 10);
        // The first batch is always a keyframe; at most one more can be
        // scheduled if the test machine takes over a second.
        let count = keyframes.load(Ordering::SeqCst);
        assert!((1..=2).contains(&count), "unexpected keyframe count {count}");
    }

    #[test]
    fn keyframe_request_forces_next_batch() {
        let config = Arc::new(RuntimeConfig::new());
        config.store_mode(CaptureMode::CaptureLowQ);
        let keyframes = Arc::new(Mutex::new(Vec::new()));
        let sink = keyframes.clone();
        let processor = BatchProcessor::new(
            config.clone(),
            Arc::new(SoftwareCodecFactory),
            Arc::new(move |batch: Arc<Batch>| sink.lock().push(batch.keyframe)),
        );

        processor.on_batch(vec![synthetic_raw_frame(0, 0, 1_000_000)]);
        wait_for("first", Duration::from_secs(10), || keyframes.lock().len() == 1);
        processor.on_batch(vec![synthetic_raw_frame(0, 1, 1_033_333)]);
        wait_for("second", Duration::from_secs(10), || keyframes.lock().len() == 2);
        config.request_keyframe();
        processor.on_batch(vec![synthetic_raw_frame(0, 2, 1_066_666)]);
        wait_for("third", Duration::from_secs(10), || keyframes.lock().len() == 3);

        let flags = keyframes.lock();
        assert_eq!(&flags[..], &[true, false, true]);
    }

    #[test]
    fn batch_numbers_strictly_increase() {
        let config = Arc::new(RuntimeConfig::new());
        config.store_mode(CaptureMode::CaptureLowQ);
        let numbers = Arc::new(Mutex::new(Vec::new()));
        let sink = numbers.clone();
        let processor = BatchProcessor::new(
            config,
            Arc::new(SoftwareCodecFactory),
            Arc::new(move |batch: Arc<Batch>| sink.lock().push(batch.batch_number)),
        );

        for n in 0..5u64 {
            processor.on_batch(vec![synthetic_raw_frame(0, n as u32, 1_000_000 + n * 33_333)]);
        }
        wait_for("all batches", Duration::from_secs(10), || {
            numbers.lock().len() == 5
        });
        let numbers = numbers.lock();
        for pair in numbers.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }
}
