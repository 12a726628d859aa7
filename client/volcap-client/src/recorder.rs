//! Recording driver: feeds released batches into the container writer.
//!
//! Frames are copied into the file, never referenced, because recording
//! may continue after the in-memory frames are reused. A freshly opened
//! recorder is paused; unpausing requests a keyframe upstream so the
//! recording starts at a decodable point.

use std::path::Path;

use volcap_container::{ContainerWriter, FileFrame, RecordedBatch, RecordedFrame};
use volcap_types::CameraIdentity;

use crate::dejitter::DecodedBatch;
use crate::Result;

#[derive(Debug, Clone, Copy, Default)]
pub struct RecorderState {
    pub paused: bool,
    pub file_size_bytes: u64,
    pub video_frame_count: u64,
    pub video_duration_usec: u64,
}

pub struct Recorder {
    writer: ContainerWriter,
    paused: bool,
}

impl Recorder {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            writer: ContainerWriter::create(path)?,
            paused: true,
        })
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn state(&self) -> RecorderState {
        RecorderState {
            paused: self.paused,
            file_size_bytes: self.writer.file_bytes(),
            video_frame_count: self.writer.frame_count(),
            video_duration_usec: self.writer.duration_usec(),
        }
    }

    pub fn write_batch(&mut self, batch: &DecodedBatch) -> Result<()> {
        if self.paused {
            return Ok(());
        }

        let frames = batch
            .frames
            .iter()
            .map(|frame| {
                let info = &frame.info;
                let header = &info.header;
                RecordedFrame {
                    frame: FileFrame {
                        identity: CameraIdentity::new(info.guid, header.camera_index),
                        is_final_frame: header.is_final_frame,
                        frame_number: header.frame_number,
                        back_reference: header.back_reference,
                        accelerometer: header.accelerometer,
                        exposure_usec: header.exposure_usec,
                        awb_usec: header.awb_usec,
                        iso_speed: header.iso_speed,
                        brightness: header.brightness,
                        saturation: header.saturation,
                        image: info.image.clone(),
                        depth: info.depth.clone(),
                    },
                    video_info: Some(*info.video_info.as_ref()),
                    calibration: Some(*info.calibration.as_ref()),
                    extrinsics: info.extrinsics.as_deref().copied(),
                }
            })
            .collect();

        self.writer.write_batch(&RecordedBatch {
            video_boot_usec: batch.video_boot_usec,
            video_epoch_usec: batch.epoch_usec,
            frames,
        })?;
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        self.writer.close()?;
        Ok(())
    }
}
