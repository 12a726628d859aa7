//! Capture manager: device lifecycle and cross-camera frame matching.
//!
//! A background loop watches the requested mode and starts or stops the
//! camera set accordingly, with validation of firmware versions and sync
//! cabling before capture begins. Incoming frames are matched across
//! cameras by shutter time; a batch is emitted only when every active
//! camera contributes one unmatched frame within the match window.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use volcap_types::{CameraCalibration, CameraStatus, CaptureMode, CaptureStatus};

use crate::camera::{CameraProvider, CameraSettings};
use crate::config::RuntimeConfig;
use crate::device::{CaptureDevice, RawFrame};
use crate::pipeline::BatchProcessor;

const WAKE_INTERVAL: Duration = Duration::from_millis(100);
const RETRY_DELAY_TICKS: u32 = 5000 / 100;

/// Multiplying a TDMA slot by this offset spaces depth laser pulses so
/// cameras (and neighboring hosts) do not blind each other.
pub const DEPTH_OFFSET_USEC: i32 = 160;

pub use crate::pipeline::BatchCallback;

struct MatchState {
    devices: Vec<Arc<CaptureDevice>>,
}

pub struct CaptureManager {
    provider: Arc<dyn CameraProvider>,
    config: Arc<RuntimeConfig>,
    processor: Arc<BatchProcessor>,
    status: AtomicU8,
    device_count: AtomicUsize,
    devices: Mutex<MatchState>,
    /// Serializes batch formation so a frame can never join two batches.
    batch_lock: Mutex<()>,
    tdma: Mutex<Vec<i16>>,
    tdma_mode: std::sync::atomic::AtomicBool,
    terminated: volcap_util::TerminateFlag,
    wake: Condvar,
    wake_lock: Mutex<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureManager {
    pub fn new(
        provider: Arc<dyn CameraProvider>,
        config: Arc<RuntimeConfig>,
        processor: Arc<BatchProcessor>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            provider,
            config,
            processor,
            status: AtomicU8::new(CaptureStatus::Idle as u8),
            device_count: AtomicUsize::new(0),
            devices: Mutex::new(MatchState {
                devices: Vec::new(),
            }),
            batch_lock: Mutex::new(()),
            tdma: Mutex::new(Vec::new()),
            tdma_mode: std::sync::atomic::AtomicBool::new(false),
            terminated: volcap_util::TerminateFlag::new(),
            wake: Condvar::new(),
            wake_lock: Mutex::new(()),
            handle: Mutex::new(None),
        });

        let worker = manager.clone();
        let handle = std::thread::Builder::new()
            .name("capture-manager".to_string())
            .spawn(move || worker.run())
            .expect("spawn capture manager thread");
        *manager.handle.lock() = Some(handle);
        manager
    }

    pub fn config(&self) -> &Arc<RuntimeConfig> {
        &self.config
    }

    pub fn status(&self) -> CaptureStatus {
        CaptureStatus::try_from(self.status.load(Ordering::SeqCst)).unwrap_or(CaptureStatus::Idle)
    }

    pub fn set_mode(&self, mode: CaptureMode) {
        self.config.store_mode(mode);
        let _guard = self.wake_lock.lock();
        self.wake.notify_all();
    }

    pub fn enable_tdma_mode(&self, enabled: bool) {
        self.tdma_mode.store(enabled, Ordering::SeqCst);
    }

    pub fn set_tdma_slots(&self, slots: Vec<i16>) {
        *self.tdma.lock() = slots;
    }

    pub fn tdma_slot_count(&self) -> usize {
        self.tdma.lock().len()
    }

    /// Cameras detected on the host, whether or not capture is running.
    pub fn detected_camera_count(&self) -> usize {
        self.provider.device_count()
    }

    pub fn camera_status(&self) -> Vec<CameraStatus> {
        self.devices
            .lock()
            .devices
            .iter()
            .map(|d| d.status())
            .collect()
    }

    pub fn camera_calibration(&self) -> Vec<CameraCalibration> {
        self.devices
            .lock()
            .devices
            .iter()
            .map(|d| *d.calibration())
            .collect()
    }

    pub fn shutdown(&self) {
        self.terminated.set();
        {
            let _guard = self.wake_lock.lock();
            self.wake.notify_all();
        }
        tracing::info!("capture manager thread stopping...");
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("capture manager thread panicked");
            }
        }
        tracing::info!("...capture manager shutdown complete");
    }

    fn run(self: &Arc<Self>) {
        let mut prev_mode = CaptureMode::Disabled;
        let mut delay_counter = 0u32;

        while !self.terminated.is_set() {
            {
                let mut guard = self.wake_lock.lock();
                if !self.terminated.is_set() {
                    self.wake.wait_for(&mut guard, WAKE_INTERVAL);
                }
            }
            if self.terminated.is_set() {
                break;
            }

            let running = self.device_count.load(Ordering::SeqCst);
            if running > 0 {
                let detected = self.provider.device_count();
                if running != detected {
                    tracing::warn!(
                        "detected camera count changed from {running} -> {detected}: stopping capture..."
                    );
                    self.background_stop();
                    prev_mode = CaptureMode::Disabled;
                    continue;
                }

                if self.tdma_mode.load(Ordering::SeqCst) && self.tdma_slot_count() != detected {
                    tracing::warn!(
                        "registered TDMA slots no longer match detected camera count: stopping capture..."
                    );
                    self.background_stop();
                    prev_mode = CaptureMode::Disabled;
                    continue;
                }
            }

            let next_mode = self.config.mode();

            if self.check_device_failure() {
                tracing::warn!("device failure detected, restarting capture...");
                self.status
                    .store(CaptureStatus::BadUsbConnection as u8, Ordering::SeqCst);
                self.background_stop();
                let status = self.background_start(next_mode);
                self.status.store(status as u8, Ordering::SeqCst);
                if status != CaptureStatus::Capturing {
                    // Fall back to the normal retry path.
                    prev_mode = CaptureMode::Disabled;
                    delay_counter = RETRY_DELAY_TICKS;
                }
                continue;
            }

            if next_mode == prev_mode {
                continue;
            }

            if prev_mode != CaptureMode::Disabled {
                tracing::debug!("background: stopping capture");
                self.background_stop();
                self.status.store(CaptureStatus::Idle as u8, Ordering::SeqCst);
            }
            prev_mode = CaptureMode::Disabled;

            if delay_counter > 0 {
                delay_counter -= 1;
                continue;
            }

            if next_mode != CaptureMode::Disabled {
                tracing::debug!("background: starting capture");
                self.status
                    .store(CaptureStatus::Initializing as u8, Ordering::SeqCst);
                let status = self.background_start(next_mode);
                self.status.store(status as u8, Ordering::SeqCst);
                self.config.bump_capture_config_epoch();
                if status == CaptureStatus::Capturing {
                    tracing::debug!("background: capture started");
                    prev_mode = next_mode;
                } else {
                    tracing::debug!("background: capture start failed");
                    self.background_stop();
                    delay_counter = RETRY_DELAY_TICKS;
                }
            }
        }

        tracing::debug!("background: stopping capture on shutdown");
        self.background_stop();
    }

    fn check_device_failure(&self) -> bool {
        self.devices.lock().devices.iter().any(|d| d.failed())
    }

    fn background_start(self: &Arc<Self>, mode: CaptureMode) -> CaptureStatus {
        self.background_stop();

        let count = self.provider.device_count();
        if count == 0 {
            tracing::warn!("no cameras detected");
            return CaptureStatus::NoCameras;
        }
        tracing::info!("number of cameras = {count}");

        let multi_server = self.tdma_mode.load(Ordering::SeqCst);
        let tdma_slots: Vec<i16> = if multi_server {
            self.tdma.lock().clone()
        } else {
            // Spread slots around zero so laser pulses interleave.
            (0..count as i16).map(|i| count as i16 / 2 - i).collect()
        };
        if tdma_slots.len() != count {
            tracing::error!(
                "mismatch between TDMA slot count {} and detected camera count {count}",
                tdma_slots.len()
            );
            return CaptureStatus::Initializing;
        }

        let settings = CameraSettings::for_mode(mode);
        let start_imu = mode == CaptureMode::Calibration;
        let t0 = volcap_util::boot_usec();

        let manager = Arc::downgrade(self);
        let callback: Arc<dyn Fn(Arc<RawFrame>) + Send + Sync> = Arc::new(move |frame| {
            if let Some(manager) = manager.upgrade() {
                manager.on_image(frame);
            }
        });

        let stop_all = |devices: &[Arc<CaptureDevice>], status: CaptureStatus| {
            for device in devices {
                device.stop();
            }
            status
        };

        let mut devices: Vec<Arc<CaptureDevice>> = Vec::with_capacity(count);
        // Opening in parallel is not safe with every vendor SDK; serially
        // in index order also keeps camera_index deterministic.
        for camera_index in 0..count as u32 {
            let depth_delay =
                i32::from(tdma_slots[camera_index as usize]) * DEPTH_OFFSET_USEC;
            let device = match CaptureDevice::open(
                self.provider.as_ref(),
                camera_index,
                settings,
                count > 1 || multi_server,
                depth_delay,
                start_imu,
                self.config.clone(),
                callback.clone(),
            ) {
                Ok(device) => device,
                Err(e) => {
                    tracing::error!(
                        "failed to open camera {camera_index}: {e}; make sure USB bandwidth is available"
                    );
                    return stop_all(&devices, CaptureStatus::BadUsbConnection);
                }
            };
            devices.push(device);
        }

        // Multi-camera rigs need matching firmware and exactly one sync
        // master.
        if count > 1 || multi_server {
            let version0 = devices[0].firmware_version().to_string();
            let mut master_count = 0;
            for device in &devices {
                if device.firmware_version() != version0 {
                    tracing::error!(
                        "firmware version does not match on all cameras; please upgrade the firmware"
                    );
                    return stop_all(&devices, CaptureStatus::FirmwareVersionMismatch);
                }
                if !device.sync_in_connected() && !device.sync_out_connected() {
                    tracing::error!("one of the cameras has no sync cables plugged in");
                    return stop_all(&devices, CaptureStatus::SyncCableMisconfigured);
                }
                if device.sync_in_connected() && device.sync_out_connected() {
                    tracing::error!("one of the cameras has sync in and sync out both plugged in");
                    return stop_all(&devices, CaptureStatus::SyncCableMisconfigured);
                }
                if device.sync_out_connected() {
                    master_count += 1;
                }
            }
            if !multi_server && master_count == 0 {
                tracing::error!("no master detected: none of the cameras has sync out plugged in");
                return stop_all(&devices, CaptureStatus::SyncCableMisconfigured);
            }
            if master_count > 1 {
                tracing::error!("multiple cameras are master: check the sync ports");
                return stop_all(&devices, CaptureStatus::SyncCableMisconfigured);
            }
        }

        let t1 = volcap_util::boot_usec();
        tracing::info!("took {:.1} msec to open cameras", (t1 - t0) as f32 / 1000.0);

        self.device_count.store(count, Ordering::SeqCst);
        self.devices.lock().devices = devices;
        CaptureStatus::Capturing
    }

    fn background_stop(&self) {
        if self.device_count.load(Ordering::SeqCst) == 0 {
            return;
        }
        let t0 = volcap_util::boot_usec();
        tracing::info!("starting capture stop");

        let devices = std::mem::take(&mut self.devices.lock().devices);
        for device in &devices {
            device.stop();
        }
        drop(devices);
        self.device_count.store(0, Ordering::SeqCst);

        // A new camera set must not inherit a stale registration, and
        // lighting is invalidated whenever cameras are re-opened.
        self.config.clear_extrinsics();
        self.config.clear_lighting();

        let t1 = volcap_util::boot_usec();
        tracing::info!("capture stop in {:.1} msec", (t1 - t0) as f32 / 1000.0);
    }

    /// Called from every device worker on every new frame.
    fn on_image(self: &Arc<Self>, image: Arc<RawFrame>) {
        if self.config.mode() == CaptureMode::Disabled {
            return;
        }
        if image.is_matched() {
            return;
        }

        let count = self.device_count.load(Ordering::SeqCst);
        if count == 0 {
            return;
        }

        let _batch_guard = self.batch_lock.lock();

        // Re-check under the lock: another thread may have claimed it.
        if image.is_matched() {
            return;
        }

        let devices = self.devices.lock();
        if devices.devices.len() != count {
            return;
        }

        let mut members: Vec<Option<Arc<RawFrame>>> = vec![None; count];
        let device_index = image.device_index as usize;
        if device_index >= count {
            return;
        }
        members[device_index] = Some(image.clone());

        for (i, device) in devices.devices.iter().enumerate() {
            if i == device_index {
                continue;
            }
            match device.find_capture(image.sync_system_usec) {
                Some(candidate) => members[i] = Some(candidate),
                // Keep waiting; the ring holds frames for later matching.
                None => return,
            }
        }
        drop(devices);

        let images: Vec<Arc<RawFrame>> = members
            .into_iter()
            .map(|m| m.expect("all members present"))
            .collect();

        // Claim every member exactly once.
        for frame in &images {
            if !frame.mark_matched() {
                tracing::error!(
                    "frame {} of camera {} was already matched",
                    frame.frame_number,
                    frame.device_index
                );
                return;
            }
        }

        self.processor.on_batch(images);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SyntheticProvider;
    use crate::codec::SoftwareCodecFactory;
    use crate::pipeline::Batch;
    use std::time::Instant;

    fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
        let t0 = Instant::now();
        while !check() {
            assert!(t0.elapsed() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn two_camera_batches_are_matched() {
        let config = Arc::new(RuntimeConfig::new());
        let batches: Arc<Mutex<Vec<Arc<Batch>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        let processor = BatchProcessor::new(
            config.clone(),
            Arc::new(SoftwareCodecFactory),
            Arc::new(move |batch| sink.lock().push(batch)),
        );
        let manager = CaptureManager::new(
            Arc::new(SyntheticProvider::new(2)),
            config,
            processor,
        );

        manager.set_mode(CaptureMode::CaptureLowQ);
        wait_for("capturing", Duration::from_secs(10), || {
            manager.status() == CaptureStatus::Capturing
        });
        wait_for("matched batches", Duration::from_secs(20), || {
            batches.lock().len() >= 3
        });

        manager.set_mode(CaptureMode::Disabled);
        manager.shutdown();

        let batches = batches.lock();
        for batch in batches.iter() {
            assert_eq!(batch.images.len(), 2);
            // Every member pair is within the match window.
            let a = batch.images[0].sync_system_usec;
            let b = batch.images[1].sync_system_usec;
            assert!(a.abs_diff(b) < crate::device::MATCH_DIST_USEC);
            // Batch time is the earliest member's shutter.
            assert_eq!(batch.sync_system_usec, a.min(b));
        }
    }

    #[test]
    fn zero_cameras_reports_no_cameras() {
        let config = Arc::new(RuntimeConfig::new());
        let processor = BatchProcessor::new(
            config.clone(),
            Arc::new(SoftwareCodecFactory),
            Arc::new(|_| {}),
        );
        let manager = CaptureManager::new(Arc::new(SyntheticProvider::new(0)), config, processor);

        manager.set_mode(CaptureMode::CaptureLowQ);
        wait_for("no-cameras status", Duration::from_secs(5), || {
            manager.status() == CaptureStatus::NoCameras
        });
        manager.shutdown();
    }
}
