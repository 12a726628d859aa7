//! Container writer.
//!
//! Camera metadata (calibration, extrinsics, video info) is re-emitted
//! every [`PARAMS_INTERVAL`] batches and whenever a deep compare detects a
//! change, so a reader that starts mid-file only has to wait a second for
//! the tables it needs. Frames are copied, never referenced: recording may
//! outlive the in-memory batch.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use volcap_types::{CameraCalibration, CameraExtrinsics, CameraIdentity, VideoInfo};

use crate::chunk;
use crate::{Error, FileBatchInfo, FileFrame, Result};

/// Batches between periodic metadata re-emission.
pub const PARAMS_INTERVAL: u32 = 30;

/// Substitute inter-batch interval when the source timestamp is invalid.
const DEFAULT_INTERVAL_USEC: u64 = 33_333;

/// One camera's contribution to a recorded batch.
#[derive(Debug, Clone)]
pub struct RecordedFrame {
    pub frame: FileFrame,
    pub video_info: Option<VideoInfo>,
    pub calibration: Option<CameraCalibration>,
    pub extrinsics: Option<CameraExtrinsics>,
}

/// A decoded batch flattened for recording.
#[derive(Debug, Clone)]
pub struct RecordedBatch {
    /// Source presentation timestamp; the writer rebases to a file-local
    /// monotonic timeline.
    pub video_boot_usec: u64,
    pub video_epoch_usec: u64,
    pub frames: Vec<RecordedFrame>,
}

pub struct ContainerWriter {
    file: Option<BufWriter<File>>,
    bytes_written: u64,
    frame_count: u64,
    duration_usec: u64,
    last_video_boot_usec: u64,
    params_counter: u32,
    video_info: HashMap<CameraIdentity, VideoInfo>,
    calibration: HashMap<CameraIdentity, CameraCalibration>,
    extrinsics: HashMap<CameraIdentity, CameraExtrinsics>,
}

impl ContainerWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        Ok(Self {
            file: Some(file),
            bytes_written: 0,
            frame_count: 0,
            duration_usec: 0,
            last_video_boot_usec: 0,
            params_counter: 0,
            video_info: HashMap::new(),
            calibration: HashMap::new(),
            extrinsics: HashMap::new(),
        })
    }

    pub fn file_bytes(&self) -> u64 {
        self.bytes_written
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn duration_usec(&self) -> u64 {
        self.duration_usec
    }

    pub fn write_batch(&mut self, batch: &RecordedBatch) -> Result<()> {
        if self.file.is_none() {
            return Err(Error::AlreadyClosed);
        }

        let mut interval_usec =
            batch.video_boot_usec.wrapping_sub(self.last_video_boot_usec) as i64;
        if self.last_video_boot_usec == 0 || interval_usec <= 0 || interval_usec > 1_000_000 {
            interval_usec = DEFAULT_INTERVAL_USEC as i64;
        }
        self.last_video_boot_usec = batch.video_boot_usec;

        let mut buf: Vec<u8> = Vec::with_capacity(4096);

        chunk::write_batch_info(
            &mut buf,
            &FileBatchInfo {
                max_camera_count: batch.frames.len() as u32,
                video_usec: self.duration_usec,
                video_epoch_usec: batch.video_epoch_usec,
            },
        )?;
        self.frame_count += 1;
        self.duration_usec += interval_usec as u64;

        let force_write = self.params_counter == 0;
        self.params_counter += 1;
        if self.params_counter >= PARAMS_INTERVAL {
            self.params_counter = 0;
        }

        for recorded in &batch.frames {
            let identity = recorded.frame.identity;

            if let Some(info) = &recorded.video_info {
                let changed = self.video_info.get(&identity) != Some(info);
                if changed || force_write {
                    self.video_info.insert(identity, *info);
                    chunk::write_video_info(&mut buf, &identity, info)?;
                }
            }
            if let Some(calibration) = &recorded.calibration {
                let changed = self.calibration.get(&identity) != Some(calibration);
                if changed || force_write {
                    self.calibration.insert(identity, *calibration);
                    chunk::write_calibration(&mut buf, &identity, calibration)?;
                }
            }
            if let Some(extrinsics) = &recorded.extrinsics {
                // An identity transform carries no information worth storing.
                if !extrinsics.is_identity {
                    let changed = self.extrinsics.get(&identity) != Some(extrinsics);
                    if changed || force_write {
                        self.extrinsics.insert(identity, *extrinsics);
                        chunk::write_extrinsics(&mut buf, &identity, extrinsics)?;
                    }
                }
            }
        }

        for (i, recorded) in batch.frames.iter().enumerate() {
            let mut frame = recorded.frame.clone();
            frame.is_final_frame = i + 1 == batch.frames.len();
            chunk::write_frame(&mut buf, &frame)?;
        }

        let file = self.file.as_mut().ok_or(Error::AlreadyClosed)?;
        file.write_all(&buf)?;
        self.bytes_written += buf.len() as u64;
        Ok(())
    }

    /// Flush and close. Errors surface here instead of being swallowed by
    /// drop.
    pub fn close(mut self) -> Result<()> {
        self.flush_and_close()
    }

    fn flush_and_close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}

impl Drop for ContainerWriter {
    fn drop(&mut self) {
        if let Err(e) = self.flush_and_close() {
            tracing::error!("container writer close failed: {e}");
        }
    }
}
