//! Clock synchronization between camera device clocks and the host.
//!
//! Each camera reports a high-precision device timestamp with a per-camera
//! epoch, plus the host time when the frame was read off USB. Assuming the
//! minimum transfer delay is similar for all cameras, the windowed minimum
//! of `host - device` recovers the per-camera clock offset, which makes
//! shutter times directly comparable across cameras and across hosts.

/// Window length for the offset estimator. Long enough to ride out load
/// spikes, short enough to track clock drift.
const WINDOW_LENGTH_USEC: u64 = 30 * 1_000_000;

/// One retained sample of the windowed minimum.
#[derive(Debug, Clone, Copy, Default)]
struct Sample {
    value: i64,
    timestamp: u64,
}

impl Sample {
    fn expired(&self, now: u64, timeout: u64) -> bool {
        now.wrapping_sub(self.timestamp) > timeout
    }
}

/// Running windowed minimum with O(1) updates.
///
/// Three samples are retained: best, second-best, third-best, each with its
/// observation time. A new best (or total expiry) resets all three;
/// otherwise the sample is inserted by rank and stale leaders are promoted
/// out as the window advances.
#[derive(Debug, Default)]
pub struct WindowedMin {
    samples: [Sample; 3],
    valid: bool,
}

impl WindowedMin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn best(&self) -> i64 {
        self.samples[0].value
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn update(&mut self, value: i64, timestamp: u64, window: u64) {
        let sample = Sample { value, timestamp };

        // First sample, new best, or the whole window expired.
        if !self.valid
            || value <= self.samples[0].value
            || self.samples[2].expired(timestamp, window)
        {
            self.samples = [sample; 3];
            self.valid = true;
            return;
        }

        // Insert by rank.
        if value <= self.samples[1].value {
            self.samples[1] = sample;
            self.samples[2] = sample;
        } else if value <= self.samples[2].value {
            self.samples[2] = sample;
        }

        // Expire the best if it has led for a full window.
        if self.samples[0].expired(timestamp, window) {
            if self.samples[1].expired(timestamp, window) {
                self.samples[0] = self.samples[2];
                self.samples[1] = sample;
            } else {
                self.samples[0] = self.samples[1];
                self.samples[1] = self.samples[2];
            }
            self.samples[2] = sample;
            return;
        }

        // A quarter window with no better value: fall back to second-best.
        if self.samples[1].value == self.samples[0].value
            && self.samples[1].expired(timestamp, window / 4)
        {
            self.samples[1] = sample;
            self.samples[2] = sample;
            return;
        }

        // Half window: refresh the third.
        if self.samples[2].value == self.samples[1].value
            && self.samples[2].expired(timestamp, window / 2)
        {
            self.samples[2] = sample;
        }
    }
}

/// Estimates the host system time of each shutter for one camera.
///
/// Depth capture time is used rather than color because the depth exposure
/// is microseconds long and pinned to the sync pulse, while color exposure
/// is long and varies per camera.
#[derive(Debug, Default)]
pub struct DeviceClockSync {
    min_deltas: WindowedMin,
}

impl DeviceClockSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.min_deltas.reset();
    }

    /// Returns the sync pulse time on the host clock, updating the offset
    /// estimate with this observation.
    pub fn sync_system_usec(&mut self, usbread_system_usec: u64, sync_device_usec: u64) -> u64 {
        // delta = clock offset + transfer delay; the minimum over the
        // window isolates the offset.
        let delta = usbread_system_usec as i64 - sync_device_usec as i64;
        self.min_deltas
            .update(delta, sync_device_usec, WINDOW_LENGTH_USEC);
        (sync_device_usec as i64 + self.min_deltas.best()) as u64
    }
}

/// Maximum per-frame correction applied when smoothing timestamps.
const MAX_MISMATCH_USEC: i64 = 4000;

/// Smooths raw shutter timestamps into a strictly advancing presentation
/// clock. Unavoidable jumps are flagged as discontinuities so a keyframe
/// can be forced.
#[derive(Debug, Default)]
pub struct VideoTimestampCleaner {
    last_returned_system_usec: u64,
    last_device_usec: u64,
}

impl VideoTimestampCleaner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cleaned timestamp and whether the series jumped.
    pub fn clean(&mut self, shutter_device_usec: u64, shutter_system_usec: u64) -> (u64, bool) {
        let system_diff = shutter_system_usec as i64 - self.last_returned_system_usec as i64;
        let device_diff = shutter_device_usec as i64 - self.last_device_usec as i64;

        self.last_returned_system_usec = shutter_system_usec;
        self.last_device_usec = shutter_device_usec;

        if device_diff < 5000 {
            tracing::info!(
                "device time reset backwards: device={} (diff={}) usec",
                shutter_device_usec,
                device_diff
            );
            return (shutter_system_usec, true);
        }
        if device_diff > 300_000 {
            tracing::info!(
                "device time jumped forward: device={} (diff={}) usec",
                shutter_device_usec,
                device_diff
            );
            return (shutter_system_usec, true);
        }
        if system_diff < 5000 {
            tracing::info!(
                "system time reset backwards: system={} (diff={}) usec",
                shutter_system_usec,
                system_diff
            );
            return (shutter_system_usec, true);
        }
        if system_diff > device_diff * 2 {
            tracing::debug!(
                "system time jumped forward: system={} (diff={}) usec",
                shutter_system_usec,
                system_diff
            );
            return (shutter_system_usec, true);
        }

        // Expected interval minus actual, bounded so corrections smooth
        // out over several frames.
        let mismatch = (device_diff - system_diff).clamp(-MAX_MISMATCH_USEC, MAX_MISMATCH_USEC);

        let cleaned = (shutter_system_usec as i64 + mismatch) as u64;
        self.last_returned_system_usec = cleaned;
        (cleaned, false)
    }
}

/// Converts boot-relative microseconds into Unix epoch microseconds by
/// sampling both clocks once.
#[derive(Debug)]
pub struct BootEpochConverter {
    offset_usec: i64,
}

impl Default for BootEpochConverter {
    fn default() -> Self {
        let boot = volcap_util::boot_usec();
        let unix = volcap_util::unix_usec();
        Self {
            offset_usec: unix as i64 - boot as i64,
        }
    }
}

impl BootEpochConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn convert(&self, boot_usec: u64) -> u64 {
        (boot_usec as i64 + self.offset_usec) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windowed_min_tracks_minimum() {
        let mut w = WindowedMin::new();
        let window = 1_000_000;
        w.update(100, 0, window);
        w.update(50, 1000, window);
        w.update(70, 2000, window);
        assert_eq!(w.best(), 50);
        // A better value always wins immediately.
        w.update(10, 3000, window);
        assert_eq!(w.best(), 10);
    }

    #[test]
    fn windowed_min_expires_old_best() {
        let mut w = WindowedMin::new();
        let window = 1_000;
        w.update(10, 0, window);
        w.update(50, 100, window);
        w.update(60, 200, window);
        // All three retained samples are now past the window.
        w.update(40, 5_000, window);
        assert_eq!(w.best(), 40);
    }

    #[test]
    fn clock_sync_converges_on_constant_offset() {
        let mut sync = DeviceClockSync::new();
        // Host clock = device + 5 ms, with transfer jitter on top.
        let offset = 5_000i64;
        let mut result = 0;
        for n in 0..100u64 {
            let device = 1_000_000 + n * 33_333;
            let jitter = (n % 7) as i64 * 250;
            let host = (device as i64 + offset + jitter) as u64;
            result = sync.sync_system_usec(host, device);
        }
        let device_last = 1_000_000 + 99 * 33_333;
        assert_eq!(result, (device_last as i64 + offset) as u64);
    }

    #[test]
    fn two_cameras_with_same_delay_become_comparable() {
        // Devices with wildly different epochs but the same minimum
        // transfer delay map onto the same host timeline.
        let mut sync0 = DeviceClockSync::new();
        let mut sync1 = DeviceClockSync::new();
        let mut t0 = 0;
        let mut t1 = 0;
        for n in 0..50u64 {
            let shutter_host = 10_000_000 + n * 33_333;
            let dev0 = shutter_host - 7_000_000; // epoch A
            let dev1 = shutter_host - 1_234_567; // epoch B
            t0 = sync0.sync_system_usec(shutter_host + 3_000, dev0);
            t1 = sync1.sync_system_usec(shutter_host + 3_000, dev1);
        }
        assert_eq!(t0, t1);
    }

    #[test]
    fn cleaner_flags_device_jump() {
        let mut cleaner = VideoTimestampCleaner::new();
        let (_, disc) = cleaner.clean(1_000_000, 2_000_000);
        // First sample looks like a jump from zero.
        assert!(disc);
        let (t, disc) = cleaner.clean(1_033_333, 2_033_333);
        assert!(!disc);
        assert_eq!(t, 2_033_333);
        // A 400 ms device gap is a discontinuity.
        let (t, disc) = cleaner.clean(1_433_333, 2_433_000);
        assert!(disc);
        assert_eq!(t, 2_433_000);
    }

    #[test]
    fn cleaner_clamps_small_mismatch() {
        let mut cleaner = VideoTimestampCleaner::new();
        cleaner.clean(1_000_000, 2_000_000);
        // Device advanced 33 ms but system advanced 43 ms: mismatch -10 ms
        // clamps to -4 ms.
        let (t, disc) = cleaner.clean(1_033_333, 2_043_333);
        assert!(!disc);
        assert_eq!(t, 2_043_333 - 4_000);
    }

    #[test]
    fn boot_epoch_converter_is_consistent() {
        let conv = BootEpochConverter::new();
        let now_boot = volcap_util::boot_usec();
        let unix = conv.convert(now_boot);
        let direct = volcap_util::unix_usec();
        assert!(unix.abs_diff(direct) < 1_000_000);
    }
}
