//! Per-camera capture worker.
//!
//! Each device owns one driver thread that pulls frames, stamps them onto
//! the shared host timeline, and parks them in a small history ring for
//! the cross-camera matcher. The ring bounds matching latency to 8 frames
//! per camera.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use volcap_types::{CameraCalibration, CameraExtrinsics, CameraStatus};

use crate::camera::{CameraFrame, CameraProvider, CameraSettings, ColorFormat, RgbdCamera, SyncMode};
use crate::clock::DeviceClockSync;
use crate::config::RuntimeConfig;
use crate::{Error, Result};

/// History ring capacity per camera.
pub const CAPTURE_HISTORY_LEN: usize = 8;

/// Frames from different cameras match when their sync timestamps are
/// within this distance. In practice matches land under a millisecond;
/// each USB hub in the path adds roughly 3 ms.
pub const MATCH_DIST_USEC: u64 = 20_000;

const OPEN_RETRIES: usize = 10;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(100);
const READ_TIMEOUT: Duration = Duration::from_millis(100);
const DEVICE_TIMEOUT_MSEC: u64 = 10_000;

/// Registration survives restarts: extrinsics are keyed by camera serial
/// on disk and restored when the same camera is opened again.
fn extrinsics_path(serial: &str) -> Option<std::path::PathBuf> {
    let dir = dirs::config_dir()?.join("volcap");
    Some(dir.join(format!("extrinsics-{serial}.json")))
}

fn load_extrinsics(serial: &str) -> Option<CameraExtrinsics> {
    let path = extrinsics_path(serial)?;
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

fn save_extrinsics(serial: &str, extrinsics: &CameraExtrinsics) {
    let Some(path) = extrinsics_path(serial) else {
        return;
    };
    if let Some(parent) = path.parent() {
        if std::fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    match serde_json::to_string_pretty(extrinsics) {
        Ok(text) => {
            if let Err(e) = std::fs::write(&path, text) {
                tracing::warn!("could not persist extrinsics to {}: {e}", path.display());
            }
        }
        Err(e) => tracing::warn!("could not serialize extrinsics: {e}"),
    }
}

/// One camera frame on the shared host timeline.
#[derive(Debug)]
pub struct RawFrame {
    pub device_index: u32,
    pub frame_number: u32,
    pub framerate: u32,
    pub calibration: Arc<CameraCalibration>,

    pub color: Vec<u8>,
    pub color_width: u32,
    pub color_height: u32,
    pub color_stride: u32,
    pub color_format: ColorFormat,

    pub depth: Vec<u16>,
    pub depth_width: u32,
    pub depth_height: u32,

    pub depth_device_usec: u64,
    pub depth_system_usec: u64,
    pub color_device_usec: u64,
    pub color_system_usec: u64,
    pub color_exposure_usec: u32,
    pub color_awb_usec: u32,
    pub color_iso_speed: u32,
    pub accelerometer: [f32; 3],

    /// Depth shutter time with the TDMA delay removed, device clock.
    pub sync_device_usec: u64,
    /// Host-comparable shutter time, centered on the color exposure.
    pub sync_system_usec: u64,

    pub(crate) matched: AtomicBool,
}

impl RawFrame {
    pub fn is_matched(&self) -> bool {
        self.matched.load(Ordering::SeqCst)
    }

    /// Transition `matched` false -> true. Returns false when the frame
    /// was already claimed; a frame must never join two batches.
    pub fn mark_matched(&self) -> bool {
        !self.matched.swap(true, Ordering::SeqCst)
    }
}

type FrameCallback = Arc<dyn Fn(Arc<RawFrame>) + Send + Sync>;

pub struct CaptureDevice {
    index: u32,
    serial: String,
    firmware_version: String,
    sync_in_connected: bool,
    sync_out_connected: bool,
    calibration: Arc<CameraCalibration>,
    status: AtomicU8,
    needs_reset: AtomicBool,
    terminated: volcap_util::TerminateFlag,
    history: Mutex<[Option<Arc<RawFrame>>; CAPTURE_HISTORY_LEN]>,
    write_index: AtomicUsize,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureDevice {
    /// Open and start one camera. Opening is retried: cameras enumerate
    /// slowly right after a previous process released them.
    ///
    /// With `multi_camera`, the sync wiring decides master or subordinate;
    /// a lone camera runs standalone.
    pub fn open(
        provider: &dyn CameraProvider,
        index: u32,
        settings: CameraSettings,
        multi_camera: bool,
        depth_delay_off_color_usec: i32,
        start_imu: bool,
        config: Arc<RuntimeConfig>,
        callback: FrameCallback,
    ) -> Result<Arc<Self>> {
        let mut camera = None;
        for attempt in 0..OPEN_RETRIES {
            match provider.open(index) {
                Ok(cam) => {
                    camera = Some(cam);
                    break;
                }
                Err(e) => {
                    tracing::error!("[{index}] camera open failed ({e}) - retrying {attempt}");
                    std::thread::sleep(OPEN_RETRY_DELAY);
                }
            }
        }
        let mut camera = camera.ok_or_else(|| {
            Error::Camera(format!("camera {index} failed to open after {OPEN_RETRIES} tries"))
        })?;

        let info = camera.info();
        tracing::info!(
            "[{index}] device open: serial=`{}` firmware={} sync_in={} sync_out={}",
            info.serial,
            info.firmware_version,
            info.sync_in_connected,
            info.sync_out_connected
        );

        let calibration = Arc::new(camera.calibration());

        let sync_mode = if multi_camera {
            if info.sync_out_connected {
                SyncMode::Master
            } else {
                SyncMode::Subordinate
            }
        } else {
            SyncMode::Standalone
        };
        camera.start(&settings, sync_mode, depth_delay_off_color_usec)?;
        if start_imu {
            camera.start_imu()?;
        }

        if let Some(extrinsics) = load_extrinsics(&info.serial) {
            config.set_extrinsics(index as usize, extrinsics);
            tracing::info!("[{index}] successfully restored extrinsics");
        }

        let device = Arc::new(Self {
            index,
            serial: info.serial,
            firmware_version: info.firmware_version,
            sync_in_connected: info.sync_in_connected,
            sync_out_connected: info.sync_out_connected,
            calibration,
            status: AtomicU8::new(CameraStatus::Initializing as u8),
            needs_reset: AtomicBool::new(false),
            terminated: volcap_util::TerminateFlag::new(),
            history: Mutex::new(Default::default()),
            write_index: AtomicUsize::new(0),
            handle: Mutex::new(None),
        });

        let worker = device.clone();
        let framerate = settings.framerate.max(1);
        let handle = std::thread::Builder::new()
            .name(format!("capture-device-{index}"))
            .spawn(move || {
                worker.run(camera, config, callback, framerate, depth_delay_off_color_usec);
            })
            .map_err(|e| Error::Camera(format!("spawn device thread: {e}")))?;
        *device.handle.lock() = Some(handle);

        Ok(device)
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn firmware_version(&self) -> &str {
        &self.firmware_version
    }

    pub fn sync_in_connected(&self) -> bool {
        self.sync_in_connected
    }

    pub fn sync_out_connected(&self) -> bool {
        self.sync_out_connected
    }

    pub fn calibration(&self) -> Arc<CameraCalibration> {
        self.calibration.clone()
    }

    pub fn status(&self) -> CameraStatus {
        CameraStatus::try_from(self.status.load(Ordering::SeqCst)).unwrap_or(CameraStatus::Idle)
    }

    /// True when the watchdog decided the device needs a restart.
    pub fn failed(&self) -> bool {
        self.needs_reset.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.terminated.set();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("[{}] device thread panicked", self.index);
            }
        }
        let mut history = self.history.lock();
        for slot in history.iter_mut() {
            *slot = None;
        }
        self.status.store(CameraStatus::Idle as u8, Ordering::SeqCst);
    }

    /// Scan the ring for the unmatched frame closest to `sync_system_usec`
    /// within the match window.
    pub fn find_capture(&self, sync_system_usec: u64) -> Option<Arc<RawFrame>> {
        let history = self.history.lock();
        let write_index = self.write_index.load(Ordering::SeqCst);

        let mut best: Option<(u64, &Arc<RawFrame>)> = None;
        for (i, slot) in history.iter().enumerate() {
            if i == write_index {
                continue;
            }
            let Some(frame) = slot else { continue };
            if frame.is_matched() {
                continue;
            }
            let delta = sync_system_usec.abs_diff(frame.sync_system_usec);
            if delta < MATCH_DIST_USEC && best.map_or(true, |(d, _)| delta < d) {
                best = Some((delta, frame));
            }
        }
        best.map(|(_, frame)| frame.clone())
    }

    fn run(
        &self,
        mut camera: Box<dyn RgbdCamera>,
        config: Arc<RuntimeConfig>,
        callback: FrameCallback,
        framerate: u32,
        depth_delay_off_color_usec: i32,
    ) {
        let expected_interval_usec = 1_000_000 / u64::from(framerate);
        let mut clock_sync = DeviceClockSync::new();
        let mut exposure_epoch = config.exposure_epoch.load(Ordering::SeqCst);
        let mut extrinsics_epoch = config.extrinsics_epoch.load(Ordering::SeqCst);
        let mut next_frame_number = 0u32;
        let mut last_depth_device_usec = 0u64;
        let mut last_frame_msec = volcap_util::boot_usec() / 1000;
        let mut status_hold_msec = 0u64;

        while !self.terminated.is_set() {
            match camera.next_frame(READ_TIMEOUT) {
                Ok(frame) => {
                    let now_msec = volcap_util::boot_usec() / 1000;
                    last_frame_msec = now_msec;

                    if now_msec >= status_hold_msec {
                        self.status
                            .store(CameraStatus::Capturing as u8, Ordering::SeqCst);
                    }

                    // Slow intervals usually mean the host is overloaded.
                    let interval = frame.depth_device_usec.wrapping_sub(last_depth_device_usec);
                    if last_depth_device_usec != 0 && interval > expected_interval_usec * 3 / 2 {
                        tracing::warn!(
                            "[{}] slow RGBD image interval: {:.1} msec",
                            self.index,
                            interval as f32 / 1000.0
                        );
                        self.status
                            .store(CameraStatus::SlowWarning as u8, Ordering::SeqCst);
                        status_hold_msec = now_msec + 1000;
                    }
                    last_depth_device_usec = frame.depth_device_usec;

                    // Reprogram exposure only when the epoch moved.
                    let epoch = config.exposure_epoch.load(Ordering::SeqCst);
                    if epoch != exposure_epoch {
                        exposure_epoch = epoch;
                        let exposure = config.exposure();
                        if let Err(e) = camera.set_exposure(&exposure) {
                            tracing::error!("[{}] exposure update failed: {e}", self.index);
                        }
                    }

                    // Persist a fresh registration for this serial.
                    let epoch = config.extrinsics_epoch.load(Ordering::SeqCst);
                    if epoch != extrinsics_epoch {
                        extrinsics_epoch = epoch;
                        let all = config.extrinsics();
                        if let Some(extrinsics) = all.get(self.index as usize) {
                            if !extrinsics.is_identity {
                                tracing::debug!(
                                    "[{}] writing extrinsics for serial={}",
                                    self.index,
                                    self.serial
                                );
                                save_extrinsics(&self.serial, extrinsics);
                            }
                        }
                    }

                    let frame_number = next_frame_number;
                    next_frame_number = next_frame_number.wrapping_add(1);
                    let raw = self.finish_frame(
                        frame,
                        frame_number,
                        framerate,
                        depth_delay_off_color_usec,
                        &mut clock_sync,
                    );
                    self.store_history(raw.clone());
                    callback(raw);
                }
                Err(Error::Timeout) => {}
                Err(e) => {
                    self.status
                        .store(CameraStatus::ReadFailed as u8, Ordering::SeqCst);
                    tracing::error!("[{}] camera read failed: {e}", self.index);
                    if self.terminated.is_set() {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
            }

            let now_msec = volcap_util::boot_usec() / 1000;
            if now_msec.saturating_sub(last_frame_msec) >= DEVICE_TIMEOUT_MSEC {
                self.needs_reset.store(true, Ordering::SeqCst);
            }
        }

        camera.stop();
    }

    fn finish_frame(
        &self,
        frame: CameraFrame,
        frame_number: u32,
        framerate: u32,
        depth_delay_off_color_usec: i32,
        clock_sync: &mut DeviceClockSync,
    ) -> Arc<RawFrame> {
        // Depth shutter beats color for sync purposes: its exposure is
        // microseconds long and pinned to the sync pulse. The TDMA delay
        // programmed into the device is subtracted back out.
        let sync_device_usec =
            frame.depth_device_usec.wrapping_sub(depth_delay_off_color_usec as i64 as u64);
        let mut sync_system_usec =
            clock_sync.sync_system_usec(frame.depth_system_usec, sync_device_usec);
        // Center on the middle of the color integration window.
        sync_system_usec += u64::from(frame.color_exposure_usec) / 2;

        Arc::new(RawFrame {
            device_index: self.index,
            frame_number,
            framerate,
            calibration: self.calibration.clone(),
            color: frame.color,
            color_width: frame.color_width,
            color_height: frame.color_height,
            color_stride: frame.color_stride,
            color_format: frame.color_format,
            depth: frame.depth,
            depth_width: frame.depth_width,
            depth_height: frame.depth_height,
            depth_device_usec: frame.depth_device_usec,
            depth_system_usec: frame.depth_system_usec,
            color_device_usec: frame.color_device_usec,
            color_system_usec: frame.color_system_usec,
            color_exposure_usec: frame.color_exposure_usec,
            color_awb_usec: frame.color_awb_usec,
            color_iso_speed: frame.color_iso_speed,
            accelerometer: frame.accelerometer,
            sync_device_usec,
            sync_system_usec,
            matched: AtomicBool::new(false),
        })
    }

    fn store_history(&self, frame: Arc<RawFrame>) {
        let mut history = self.history.lock();
        let mut write_index = self.write_index.load(Ordering::SeqCst);
        history[write_index] = Some(frame);
        write_index = (write_index + 1) % CAPTURE_HISTORY_LEN;
        // Free the slot the next frame will land in so the matcher cannot
        // pair against a frame that is about to be dropped.
        history[write_index] = None;
        self.write_index.store(write_index, Ordering::SeqCst);
    }
}
