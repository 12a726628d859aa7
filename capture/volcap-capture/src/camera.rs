//! Camera driver interface.
//!
//! The vendor SDK sits behind [`RgbdCamera`]; the capture core only needs
//! raw color + depth + IMU frames with device and host timestamps.
//! [`SyntheticCamera`] is the in-tree driver used by tests, benchmarks and
//! single-host demos.

use std::time::Duration;

use volcap_types::{CameraCalibration, CameraIntrinsics, CaptureMode, ExposureSettings, LensModel};

use crate::{Error, Result};

/// How a camera is wired into the shutter sync chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Standalone,
    Master,
    Subordinate,
}

/// Color surface layout delivered by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorFormat {
    Nv12,
    Mjpeg,
}

/// Static facts about an opened camera.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub serial: String,
    pub firmware_version: String,
    pub sync_in_connected: bool,
    pub sync_out_connected: bool,
}

/// Per-mode capture configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraSettings {
    pub framerate: u32,
    pub color_width: u32,
    pub color_height: u32,
    pub color_format: ColorFormat,
    pub depth_width: u32,
    pub depth_height: u32,
    /// Wide field of view trades range for coverage; used for calibration.
    pub wide_fov: bool,
}

impl CameraSettings {
    /// Settings for each capture mode. Low quality favors a cheap NV12
    /// path; high quality and calibration use MJPEG at full resolution.
    pub fn for_mode(mode: CaptureMode) -> Self {
        match mode {
            CaptureMode::CaptureHighQ => Self {
                framerate: 30,
                color_width: 2048,
                color_height: 1536,
                color_format: ColorFormat::Mjpeg,
                depth_width: 320,
                depth_height: 288,
                wide_fov: false,
            },
            CaptureMode::Calibration => Self {
                framerate: 5,
                color_width: 2048,
                color_height: 1536,
                color_format: ColorFormat::Mjpeg,
                depth_width: 512,
                depth_height: 512,
                wide_fov: true,
            },
            // Disabled uses the low-quality settings if it is ever started.
            CaptureMode::CaptureLowQ | CaptureMode::Disabled => Self {
                framerate: 30,
                color_width: 1280,
                color_height: 720,
                color_format: ColorFormat::Nv12,
                depth_width: 320,
                depth_height: 288,
                wide_fov: false,
            },
        }
    }
}

/// One raw frame as delivered by the driver.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    pub color: Vec<u8>,
    pub color_width: u32,
    pub color_height: u32,
    pub color_stride: u32,
    pub color_format: ColorFormat,
    pub depth: Vec<u16>,
    pub depth_width: u32,
    pub depth_height: u32,
    pub depth_stride: u32,
    pub depth_device_usec: u64,
    pub depth_system_usec: u64,
    pub color_device_usec: u64,
    pub color_system_usec: u64,
    pub color_exposure_usec: u32,
    pub color_awb_usec: u32,
    pub color_iso_speed: u32,
    pub accelerometer: [f32; 3],
}

/// Driver for one physical camera. Strictly single-thread-owner: the
/// capture device worker is the only caller after open.
pub trait RgbdCamera: Send {
    fn info(&self) -> DeviceInfo;
    fn calibration(&self) -> CameraCalibration;
    fn start(
        &mut self,
        settings: &CameraSettings,
        sync_mode: SyncMode,
        depth_delay_off_color_usec: i32,
    ) -> Result<()>;
    fn stop(&mut self);
    fn start_imu(&mut self) -> Result<()>;
    /// Blocking frame acquisition; `Err(Error::Timeout)` when no frame
    /// arrived within the deadline.
    fn next_frame(&mut self, timeout: Duration) -> Result<CameraFrame>;
    fn set_exposure(&mut self, exposure: &ExposureSettings) -> Result<()>;
}

/// Opens cameras attached to this host.
pub trait CameraProvider: Send + Sync {
    fn device_count(&self) -> usize;
    fn open(&self, index: u32) -> Result<Box<dyn RgbdCamera>>;
}

// ---------------------------------------------------------------------------
// Synthetic driver

fn synthetic_intrinsics(width: u32, height: u32) -> CameraIntrinsics {
    CameraIntrinsics {
        width: width as i32,
        height: height as i32,
        lens_model: LensModel::BrownConrady,
        cx: width as f32 / 2.0,
        cy: height as f32 / 2.0,
        fx: width as f32 * 0.6,
        fy: width as f32 * 0.6,
        k: [0.0; 6],
        codx: 0.0,
        cody: 0.0,
        p1: 0.0,
        p2: 0.0,
    }
}

/// Deterministic software camera.
///
/// Produces an NV12 gradient (or a pseudo-MJPEG wrapping of it) over a flat
/// depth plane. Device timestamps advance at the configured framerate from
/// a per-camera epoch; host timestamps apply a constant receive delay so
/// the clock-sync path is exercised realistically.
pub struct SyntheticCamera {
    index: u32,
    settings: CameraSettings,
    running: bool,
    frame_count: u64,
    /// Per-camera device clock epoch offset.
    device_epoch_usec: u64,
    /// Simulated USB receive delay.
    receive_delay_usec: u64,
    depth_mm: u16,
    depth_delay_off_color_usec: i32,
}

impl SyntheticCamera {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            settings: CameraSettings::for_mode(CaptureMode::CaptureLowQ),
            running: false,
            frame_count: 0,
            device_epoch_usec: 1_000_000 + u64::from(index) * 500,
            receive_delay_usec: 3_000 + u64::from(index) * 250,
            depth_mm: 1500,
            depth_delay_off_color_usec: 0,
        }
    }

    pub fn with_device_epoch(mut self, epoch_usec: u64) -> Self {
        self.device_epoch_usec = epoch_usec;
        self
    }

    pub fn with_receive_delay(mut self, delay_usec: u64) -> Self {
        self.receive_delay_usec = delay_usec;
        self
    }

    pub fn with_depth_mm(mut self, depth_mm: u16) -> Self {
        self.depth_mm = depth_mm;
        self
    }

    fn nv12_frame(&self, frame_number: u64) -> Vec<u8> {
        let w = self.settings.color_width as usize;
        let h = self.settings.color_height as usize;
        let mut data = vec![0u8; w * h * 3 / 2];
        let phase = (frame_number % 255) as u8;
        for y in 0..h {
            let row = &mut data[y * w..(y + 1) * w];
            for (x, px) in row.iter_mut().enumerate() {
                *px = (x as u8).wrapping_add(y as u8).wrapping_add(phase);
            }
        }
        // Neutral chroma.
        for px in &mut data[w * h..] {
            *px = 128;
        }
        data
    }
}

/// Pseudo-MJPEG framing used by the synthetic camera and understood by the
/// software JPEG decoder session.
pub const PSEUDO_MJPEG_MAGIC: &[u8; 4] = b"VMJP";

pub fn wrap_pseudo_mjpeg(width: u32, height: u32, nv12: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + nv12.len());
    out.extend_from_slice(PSEUDO_MJPEG_MAGIC);
    out.extend_from_slice(&width.to_le_bytes());
    out.extend_from_slice(&height.to_le_bytes());
    out.extend_from_slice(nv12);
    out
}

pub fn unwrap_pseudo_mjpeg(data: &[u8]) -> Option<(u32, u32, &[u8])> {
    if data.len() < 12 || &data[..4] != PSEUDO_MJPEG_MAGIC {
        return None;
    }
    let width = u32::from_le_bytes(data[4..8].try_into().expect("slice length"));
    let height = u32::from_le_bytes(data[8..12].try_into().expect("slice length"));
    Some((width, height, &data[12..]))
}

impl RgbdCamera for SyntheticCamera {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            serial: format!("SYN{:06}", self.index),
            firmware_version: "1.6.110".to_string(),
            // Camera 0 plays sync master, the rest subordinates.
            sync_in_connected: self.index != 0,
            sync_out_connected: self.index == 0,
        }
    }

    fn calibration(&self) -> CameraCalibration {
        let mut rotation = [0f32; 9];
        rotation[0] = 1.0;
        rotation[4] = 1.0;
        rotation[8] = 1.0;
        CameraCalibration {
            color: synthetic_intrinsics(self.settings.color_width, self.settings.color_height),
            depth: synthetic_intrinsics(self.settings.depth_width, self.settings.depth_height),
            rotation_from_depth: rotation,
            translation_from_depth: [0.032, 0.0, 0.0],
        }
    }

    fn start(
        &mut self,
        settings: &CameraSettings,
        _sync_mode: SyncMode,
        depth_delay_off_color_usec: i32,
    ) -> Result<()> {
        self.settings = *settings;
        self.depth_delay_off_color_usec = depth_delay_off_color_usec;
        self.running = true;
        self.frame_count = 0;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn start_imu(&mut self) -> Result<()> {
        Ok(())
    }

    fn next_frame(&mut self, _timeout: Duration) -> Result<CameraFrame> {
        if !self.running {
            return Err(Error::Camera("camera not started".into()));
        }
        let interval = 1_000_000 / u64::from(self.settings.framerate);
        let n = self.frame_count;
        self.frame_count += 1;

        // Pace frame production at the configured rate.
        std::thread::sleep(Duration::from_micros(interval.min(33_333)));

        let shutter_device = (self.device_epoch_usec as i64
            + (n * interval) as i64
            + i64::from(self.depth_delay_off_color_usec)) as u64;
        let shutter_system = volcap_util::boot_usec();

        let w = self.settings.color_width;
        let h = self.settings.color_height;
        let nv12 = self.nv12_frame(n);
        let (color, color_stride) = match self.settings.color_format {
            ColorFormat::Nv12 => (nv12, w),
            ColorFormat::Mjpeg => (wrap_pseudo_mjpeg(w, h, &nv12), 0),
        };

        let dw = self.settings.depth_width;
        let dh = self.settings.depth_height;
        let depth = vec![self.depth_mm; (dw * dh) as usize];

        Ok(CameraFrame {
            color,
            color_width: w,
            color_height: h,
            color_stride,
            color_format: self.settings.color_format,
            depth,
            depth_width: dw,
            depth_height: dh,
            depth_stride: dw * 2,
            depth_device_usec: shutter_device,
            depth_system_usec: shutter_system + self.receive_delay_usec,
            color_device_usec: shutter_device,
            color_system_usec: shutter_system + self.receive_delay_usec,
            color_exposure_usec: 10_000,
            color_awb_usec: 4500,
            color_iso_speed: 400,
            accelerometer: [0.0, -9.81, 0.0],
        })
    }

    fn set_exposure(&mut self, _exposure: &ExposureSettings) -> Result<()> {
        Ok(())
    }
}

/// Provider yielding N synthetic cameras.
pub struct SyntheticProvider {
    count: usize,
}

impl SyntheticProvider {
    pub fn new(count: usize) -> Self {
        Self { count }
    }
}

impl CameraProvider for SyntheticProvider {
    fn device_count(&self) -> usize {
        self.count
    }

    fn open(&self, index: u32) -> Result<Box<dyn RgbdCamera>> {
        if (index as usize) < self.count {
            Ok(Box::new(SyntheticCamera::new(index)))
        } else {
            Err(Error::Camera(format!("no camera at index {index}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_camera_produces_nv12_frames() {
        let mut cam = SyntheticCamera::new(0);
        cam.start(
            &CameraSettings::for_mode(CaptureMode::CaptureLowQ),
            SyncMode::Master,
            0,
        )
        .unwrap();
        let frame = cam.next_frame(Duration::from_millis(100)).unwrap();
        assert_eq!(frame.color_width, 1280);
        assert_eq!(frame.color_height, 720);
        assert_eq!(frame.color.len(), 1280 * 720 * 3 / 2);
        assert_eq!(frame.depth.len(), 320 * 288);
        assert!(frame.depth.iter().all(|&d| d == 1500));
    }

    #[test]
    fn pseudo_mjpeg_round_trips() {
        let nv12 = vec![7u8; 24];
        let wrapped = wrap_pseudo_mjpeg(4, 4, &nv12);
        let (w, h, payload) = unwrap_pseudo_mjpeg(&wrapped).unwrap();
        assert_eq!((w, h), (4, 4));
        assert_eq!(payload, &nv12[..]);
        assert!(unwrap_pseudo_mjpeg(b"nope").is_none());
    }

    #[test]
    fn device_timestamps_advance_at_framerate() {
        let mut cam = SyntheticCamera::new(1);
        cam.start(
            &CameraSettings::for_mode(CaptureMode::CaptureLowQ),
            SyncMode::Subordinate,
            0,
        )
        .unwrap();
        let a = cam.next_frame(Duration::from_millis(100)).unwrap();
        let b = cam.next_frame(Duration::from_millis(100)).unwrap();
        assert_eq!(b.depth_device_usec - a.depth_device_usec, 33_333);
    }
}
