//! Process-wide runtime configuration.
//!
//! One mutex guards the structured fields; monotonically increasing atomic
//! epochs let consumers notice changes without taking the lock on the hot
//! path. Writers mutate under the lock and then bump the matching epoch,
//! so any change is observed by every consumer at most one batch later.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use parking_lot::Mutex;

use volcap_types::{
    CameraExtrinsics, CaptureMode, ClipRegion, ClipSettings, CompressionSettings,
    ExposureSettings, LightingSettings,
};

#[derive(Default)]
struct ConfigInner {
    clip: ClipSettings,
    exposure: ExposureSettings,
    lighting: Vec<LightingSettings>,
    extrinsics: Vec<CameraExtrinsics>,
    compression: CompressionSettings,
}

#[derive(Default)]
pub struct RuntimeConfig {
    mode: AtomicU8,
    images_needed: AtomicBool,
    video_needed: AtomicBool,
    needs_keyframe: AtomicBool,

    pub capture_config_epoch: AtomicU32,
    pub extrinsics_epoch: AtomicU32,
    pub clip_epoch: AtomicU32,
    pub exposure_epoch: AtomicU32,

    inner: Mutex<ConfigInner>,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        let config = Self::default();
        config.images_needed.store(true, Ordering::SeqCst);
        config.video_needed.store(true, Ordering::SeqCst);
        config
    }

    pub fn mode(&self) -> CaptureMode {
        CaptureMode::try_from(self.mode.load(Ordering::SeqCst)).unwrap_or(CaptureMode::Disabled)
    }

    /// Set via `CaptureManager::set_mode` so the manager loop wakes.
    pub(crate) fn store_mode(&self, mode: CaptureMode) {
        self.mode.store(mode as u8, Ordering::SeqCst);
    }

    pub fn images_needed(&self) -> bool {
        self.images_needed.load(Ordering::SeqCst)
    }

    pub fn set_images_needed(&self, needed: bool) {
        self.images_needed.store(needed, Ordering::SeqCst);
    }

    pub fn video_needed(&self) -> bool {
        self.video_needed.load(Ordering::SeqCst)
    }

    pub fn set_video_needed(&self, needed: bool) {
        self.video_needed.store(needed, Ordering::SeqCst);
    }

    pub fn request_keyframe(&self) {
        self.needs_keyframe.store(true, Ordering::SeqCst);
    }

    /// Consume a pending keyframe request.
    pub fn take_keyframe_request(&self) -> bool {
        self.needs_keyframe.swap(false, Ordering::SeqCst)
    }

    pub fn bump_capture_config_epoch(&self) {
        self.capture_config_epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_clip(&self, clip: ClipSettings) {
        self.inner.lock().clip = clip;
        self.clip_epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn clip(&self) -> ClipSettings {
        self.inner.lock().clip
    }

    /// Resolve the clip request against one camera's extrinsics.
    ///
    /// Returns `None` when culling must not run: calibration mode (the
    /// registration step needs the full depth field), clip disabled, no
    /// non-identity extrinsics for the camera, or a degenerate radius.
    pub fn should_clip(&self, camera_index: usize) -> Option<ClipRegion> {
        if self.mode() == CaptureMode::Calibration {
            return None;
        }
        let inner = self.inner.lock();
        if !inner.clip.enabled {
            return None;
        }
        let extrinsics = inner.extrinsics.get(camera_index)?;
        if extrinsics.is_identity {
            return None;
        }
        if inner.clip.radius_m <= 0.0 {
            return None;
        }
        Some(ClipRegion {
            extrinsics: extrinsics.transform,
            radius: inner.clip.radius_m,
            floor: inner.clip.floor_m,
            ceiling: inner.clip.ceiling_m,
        })
    }

    pub fn set_exposure(&self, exposure: ExposureSettings) {
        self.inner.lock().exposure = exposure;
        self.exposure_epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn exposure(&self) -> ExposureSettings {
        self.inner.lock().exposure
    }

    pub fn set_lighting(&self, camera_index: usize, lighting: LightingSettings) {
        let mut inner = self.inner.lock();
        if camera_index >= inner.lighting.len() {
            inner.lighting.resize(camera_index + 1, LightingSettings::default());
        }
        inner.lighting[camera_index] = lighting;
    }

    pub fn lighting(&self, camera_index: usize) -> LightingSettings {
        let inner = self.inner.lock();
        inner
            .lighting
            .get(camera_index)
            .copied()
            .unwrap_or_default()
    }

    /// Lighting is invalidated each time the cameras are re-opened.
    pub fn clear_lighting(&self) {
        self.inner.lock().lighting.clear();
    }

    pub fn set_compression(&self, compression: CompressionSettings) {
        self.inner.lock().compression = compression;
    }

    pub fn compression(&self) -> CompressionSettings {
        self.inner.lock().compression
    }

    pub fn set_extrinsics(&self, camera_index: usize, extrinsics: CameraExtrinsics) {
        tracing::info!(
            "updating extrinsics for camera {camera_index}: identity={}",
            extrinsics.is_identity
        );
        let mut inner = self.inner.lock();
        if camera_index >= inner.extrinsics.len() {
            inner
                .extrinsics
                .resize(camera_index + 1, CameraExtrinsics::default());
        }
        inner.extrinsics[camera_index] = extrinsics;
        drop(inner);
        self.extrinsics_epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn extrinsics(&self) -> Vec<CameraExtrinsics> {
        self.inner.lock().extrinsics.clone()
    }

    /// Cleared on capture stop so a changed camera set cannot inherit a
    /// stale registration.
    pub fn clear_extrinsics(&self) {
        self.inner.lock().extrinsics.clear();
        self.extrinsics_epoch.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volcap_types::IDENTITY_TRANSFORM;

    #[test]
    fn epochs_increment_on_writes() {
        let config = RuntimeConfig::new();
        let e0 = config.clip_epoch.load(Ordering::SeqCst);
        config.set_clip(ClipSettings {
            enabled: true,
            ..Default::default()
        });
        assert_eq!(config.clip_epoch.load(Ordering::SeqCst), e0 + 1);

        let e0 = config.exposure_epoch.load(Ordering::SeqCst);
        config.set_exposure(ExposureSettings {
            auto_enabled: false,
            exposure_usec: 8000,
            awb_usec: 4000,
        });
        assert_eq!(config.exposure_epoch.load(Ordering::SeqCst), e0 + 1);
    }

    #[test]
    fn keyframe_request_is_a_latch() {
        let config = RuntimeConfig::new();
        assert!(!config.take_keyframe_request());
        config.request_keyframe();
        assert!(config.take_keyframe_request());
        assert!(!config.take_keyframe_request());
    }

    #[test]
    fn clip_requires_real_extrinsics() {
        let config = RuntimeConfig::new();
        config.set_clip(ClipSettings {
            enabled: true,
            radius_m: 2.0,
            floor_m: -0.5,
            ceiling_m: 2.2,
        });
        // No extrinsics yet.
        assert!(config.should_clip(0).is_none());

        // Identity extrinsics are not enough.
        config.set_extrinsics(0, CameraExtrinsics::default());
        assert!(config.should_clip(0).is_none());

        let mut transform = IDENTITY_TRANSFORM;
        transform[3] = 0.5;
        config.set_extrinsics(
            0,
            CameraExtrinsics {
                is_identity: false,
                transform,
            },
        );
        let region = config.should_clip(0).unwrap();
        assert_eq!(region.radius, 2.0);

        // Calibration mode disables culling regardless.
        config.store_mode(CaptureMode::Calibration);
        assert!(config.should_clip(0).is_none());
    }
}
