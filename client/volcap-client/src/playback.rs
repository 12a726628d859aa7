//! Playback driver: feeds a recorded container through the decode
//! pipeline into the dejitter queue, bypassing the transport.
//!
//! The reader paces itself against the dejitter queue (never more than 30
//! batches ahead) and rebases timestamps so the first delivered batch
//! plays at zero. The container is not random-access: playback always
//! starts at offset zero and runs forward from a keyframe.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use volcap_capture::codec::CodecFactory;
use volcap_container::{ContainerEvent, ContainerReader};
use volcap_proto::wire::FrameHeader;
use volcap_types::{CameraCalibration, CameraExtrinsics, CameraIdentity, CaptureMode, VideoInfo};

use crate::decode::{BatchMeta, DecoderPipeline, FrameInfo};
use crate::dejitter::DejitterQueue;
use crate::Result;

/// Read ahead at most this many queued batches.
const MAX_READAHEAD_BATCHES: usize = 30;

/// Substitute interval when the recorded timestamps are unusable, e.g.
/// across a loop wrap.
const DEFAULT_INTERVAL_USEC: u64 = 33_333;

#[derive(Debug, Clone, Copy, Default)]
pub struct PlaybackProgress {
    pub video_time_usec: u64,
    pub video_frame: u64,
    pub finished: bool,
}

pub struct PlaybackReader {
    paused: Arc<AtomicBool>,
    loop_repeat: Arc<AtomicBool>,
    progress_frame: Arc<AtomicU64>,
    progress_usec: Arc<AtomicU64>,
    finished: Arc<AtomicBool>,
    terminated: volcap_util::TerminateFlag,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackReader {
    pub fn open<P: AsRef<Path>>(
        path: P,
        queue: Arc<DejitterQueue>,
        factory: Arc<dyn CodecFactory>,
    ) -> Result<Self> {
        let reader = ContainerReader::open(path)?;

        let paused = Arc::new(AtomicBool::new(false));
        let loop_repeat = Arc::new(AtomicBool::new(false));
        let progress_frame = Arc::new(AtomicU64::new(0));
        let progress_usec = Arc::new(AtomicU64::new(0));
        let finished = Arc::new(AtomicBool::new(false));
        let terminated = volcap_util::TerminateFlag::new();

        let worker = Worker {
            reader,
            queue,
            factory,
            paused: paused.clone(),
            loop_repeat: loop_repeat.clone(),
            progress_frame: progress_frame.clone(),
            progress_usec: progress_usec.clone(),
            finished: finished.clone(),
            terminated: terminated.clone(),
            decoders: HashMap::new(),
            current_batch: None,
            last_input_video_usec: 0,
            last_output_video_usec: 0,
        };
        let handle = std::thread::Builder::new()
            .name("playback-reader".to_string())
            .spawn(move || worker.run())
            .map_err(std::io::Error::from)?;

        Ok(Self {
            paused,
            loop_repeat,
            progress_frame,
            progress_usec,
            finished,
            terminated,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_loop_repeat(&self, loop_repeat: bool) {
        self.loop_repeat.store(loop_repeat, Ordering::SeqCst);
    }

    pub fn progress(&self) -> PlaybackProgress {
        PlaybackProgress {
            video_time_usec: self.progress_usec.load(Ordering::SeqCst),
            video_frame: self.progress_frame.load(Ordering::SeqCst),
            finished: self.finished.load(Ordering::SeqCst),
        }
    }

    pub fn close(&self) {
        self.terminated.set();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("playback reader thread panicked");
            }
        }
        tracing::debug!("closed playback file");
    }
}

impl Drop for PlaybackReader {
    fn drop(&mut self) {
        self.close();
    }
}

struct Worker {
    reader: ContainerReader,
    queue: Arc<DejitterQueue>,
    factory: Arc<dyn CodecFactory>,
    paused: Arc<AtomicBool>,
    loop_repeat: Arc<AtomicBool>,
    progress_frame: Arc<AtomicU64>,
    progress_usec: Arc<AtomicU64>,
    finished: Arc<AtomicBool>,
    terminated: volcap_util::TerminateFlag,
    decoders: HashMap<CameraIdentity, DecoderPipeline>,
    current_batch: Option<Arc<BatchMeta>>,
    last_input_video_usec: u64,
    last_output_video_usec: u64,
}

impl Worker {
    fn run(mut self) {
        while !self.terminated.is_set() {
            if self.paused.load(Ordering::SeqCst) || self.finished.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
            // Queue up roughly a second of video, no more.
            if self.queue.queued_batch_count() > MAX_READAHEAD_BATCHES {
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }

            match self.reader.next_event() {
                Ok(ContainerEvent::EndOfFile) => {
                    if self.loop_repeat.load(Ordering::SeqCst) {
                        self.reader.rewind();
                    } else {
                        self.finished.store(true, Ordering::SeqCst);
                    }
                }
                Ok(ContainerEvent::BatchInfo(info)) => {
                    // Rebase to a file-local monotonic timeline starting at
                    // zero; loop wraps fall back to the default interval.
                    let output_usec = if self.last_input_video_usec == 0 {
                        0
                    } else {
                        let diff = info.video_usec as i64 - self.last_input_video_usec as i64;
                        let diff = if diff <= 0 || diff > 1_000_000 {
                            DEFAULT_INTERVAL_USEC as i64
                        } else {
                            diff
                        };
                        self.last_output_video_usec + diff as u64
                    };
                    self.last_input_video_usec = info.video_usec.max(1);
                    self.last_output_video_usec = output_usec;

                    self.current_batch = Some(Arc::new(BatchMeta {
                        camera_count: info.max_camera_count,
                        video_boot_usec: output_usec,
                        video_epoch_usec: info.video_epoch_usec,
                    }));
                    self.progress_frame.fetch_add(1, Ordering::SeqCst);
                    self.progress_usec.store(output_usec, Ordering::SeqCst);
                }
                Ok(ContainerEvent::Frame(frame)) => self.on_frame(frame),
                // Metadata chunks update the reader's tables internally.
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("playback read failed: {e}");
                    self.finished.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    fn on_frame(&mut self, frame: volcap_container::FileFrame) {
        let Some(batch) = self.current_batch.clone() else {
            tracing::warn!("dropping playback frame before any batch info");
            return;
        };
        let identity = frame.identity;
        let tables = self.reader.camera_tables(&identity);
        let (video_info, calibration, extrinsics): (
            Option<VideoInfo>,
            Option<CameraCalibration>,
            Option<CameraExtrinsics>,
        ) = match tables {
            Some(tables) => (tables.video_info, tables.calibration, tables.extrinsics),
            None => (None, None, None),
        };
        let (Some(video_info), Some(calibration)) = (video_info, calibration) else {
            tracing::warn!("dropping playback frame due to missing reference info");
            return;
        };

        let header = FrameHeader {
            frame_number: frame.frame_number,
            back_reference: frame.back_reference,
            is_final_frame: frame.is_final_frame,
            camera_index: identity.camera_index,
            accelerometer: frame.accelerometer,
            image_bytes: frame.image.len() as u32,
            depth_bytes: frame.depth.len() as u32,
            exposure_usec: frame.exposure_usec,
            awb_usec: frame.awb_usec,
            iso_speed: frame.iso_speed,
            brightness: frame.brightness,
            saturation: frame.saturation,
        };
        let info = Arc::new(FrameInfo {
            guid: identity.server_guid,
            batch,
            video_info: Arc::new(video_info),
            calibration: Arc::new(calibration),
            extrinsics: extrinsics.map(Arc::new),
            capture_mode: CaptureMode::CaptureHighQ,
            header,
            image: frame.image,
            depth: frame.depth,
        });

        let factory = self.factory.clone();
        let pipeline = self
            .decoders
            .entry(identity)
            .or_insert_with(|| DecoderPipeline::new(factory));

        let queue = self.queue.clone();
        pipeline.process(
            info,
            Arc::new(move |decoded| {
                queue.insert(decoded);
            }),
        );
    }
}
