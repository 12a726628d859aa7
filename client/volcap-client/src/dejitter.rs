//! Dejitter / playback engine.
//!
//! Several capture servers each contribute a stream of decoded frames; the
//! dejitter queue merges them into one monotonic presentation timeline and
//! releases combined batches at a steady pace. Playback speeds up when the
//! queue grows but never drops below 1x: queue shrinkage is almost always
//! a transient latency spike, and compensating for it would compound
//! drift.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::decode::DecodedFrame;

/// Release when within this distance of the presentation time.
const FUZZ_USEC: i64 = 1000;

/// Wake interval band for the release thread.
const WAKE_MIN_MSEC: u64 = 2;
const WAKE_MAX_MSEC: u64 = 10;

/// Interval between re-anchoring to the stream timestamps.
const SYNC_INTERVAL_USEC: u64 = 500_000;

/// Front batches within this window of the earliest merge into one
/// released batch.
const MERGE_WINDOW_USEC: i64 = 30_000;

/// Default added latency that absorbs network jitter.
pub const DEFAULT_QUEUE_DEPTH_USEC: u32 = 500_000;

/// Frames that decoded from the same shutter instant of one server.
#[derive(Default)]
pub struct DecodedBatch {
    pub frames: Vec<Arc<DecodedFrame>>,
    pub frame_number: u32,
    pub video_boot_usec: u64,
    pub epoch_usec: u64,
    /// When the first frame of this batch was enqueued.
    queue_start_usec: u64,
}

impl DecodedBatch {
    fn start(frame: Arc<DecodedFrame>) -> Self {
        let video_boot_usec = frame.info.batch.video_boot_usec;
        let frame_number = frame.info.header.frame_number;
        Self {
            frames: vec![frame],
            frame_number,
            video_boot_usec,
            epoch_usec: 0,
            queue_start_usec: volcap_util::boot_usec(),
        }
    }
}

/// Per-server ordered batch list, earliest first.
struct FrameHistory {
    guid: u64,
    batches: VecDeque<DecodedBatch>,
}

impl FrameHistory {
    fn insert(&mut self, frame: Arc<DecodedFrame>) {
        let video_usec = frame.info.batch.video_boot_usec;
        for (index, batch) in self.batches.iter_mut().enumerate() {
            if batch.video_boot_usec == video_usec {
                batch.frames.push(frame);
                return;
            }
            if (video_usec as i64 - batch.video_boot_usec as i64) < 0 {
                self.batches.insert(index, DecodedBatch::start(frame));
                return;
            }
        }
        self.batches.push_back(DecodedBatch::start(frame));
    }

    /// Drop leading batches queued longer than `erase_point_usec`.
    fn erase_before(&mut self, now_usec: u64, erase_point_usec: u64) {
        while let Some(front) = self.batches.front() {
            if now_usec.saturating_sub(front.queue_start_usec) < erase_point_usec {
                return;
            }
            self.batches.pop_front();
        }
    }
}

#[derive(Default)]
struct DejitterState {
    histories: Vec<FrameHistory>,
    last_released_local_usec: u64,
    last_released_video_usec: u64,
    sync_local_usec: u64,
    sync_video_usec: u64,
}

impl DejitterState {
    fn clear(&mut self) {
        self.histories.clear();
        self.last_released_local_usec = 0;
        self.last_released_video_usec = 0;
        self.reset_sync();
    }

    fn reset_sync(&mut self) {
        self.sync_local_usec = 0;
        self.sync_video_usec = 0;
    }
}

pub type ReleaseCallback = Arc<dyn Fn(DecodedBatch) + Send + Sync>;

pub struct DejitterQueue {
    callback: ReleaseCallback,
    state: Mutex<DejitterState>,
    target_usec: AtomicU32,
    terminated: volcap_util::TerminateFlag,
    wake: Condvar,
    wake_lock: Mutex<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DejitterQueue {
    pub fn new(callback: ReleaseCallback) -> Arc<Self> {
        let queue = Arc::new(Self {
            callback,
            state: Mutex::new(DejitterState::default()),
            target_usec: AtomicU32::new(DEFAULT_QUEUE_DEPTH_USEC),
            terminated: volcap_util::TerminateFlag::new(),
            wake: Condvar::new(),
            wake_lock: Mutex::new(()),
            handle: Mutex::new(None),
        });
        let worker = queue.clone();
        let handle = std::thread::Builder::new()
            .name("dejitter-release".to_string())
            .spawn(move || worker.release_loop())
            .expect("spawn dejitter thread");
        *queue.handle.lock() = Some(handle);
        queue
    }

    pub fn set_queue_depth_msec(&self, msec: u32) {
        tracing::info!("dejitter queue depth: {msec} msec");
        self.target_usec.store(msec * 1000, Ordering::SeqCst);
    }

    pub fn queue_depth_msec(&self) -> u32 {
        self.target_usec.load(Ordering::SeqCst) / 1000
    }

    /// Total batches queued across all histories; the file reader paces
    /// against this.
    pub fn queued_batch_count(&self) -> usize {
        self.state
            .lock()
            .histories
            .iter()
            .map(|h| h.batches.len())
            .sum()
    }

    pub fn shutdown(&self) {
        self.terminated.set();
        {
            let _guard = self.wake_lock.lock();
            self.wake.notify_all();
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("dejitter thread panicked");
            }
        }
    }

    /// Feed one decoded frame. Frames from the past are rejected; a long
    /// input gap clears all state so the stream can restart cleanly.
    pub fn insert(&self, frame: Arc<DecodedFrame>) {
        let now_usec = volcap_util::boot_usec();
        let target = u64::from(self.target_usec.load(Ordering::SeqCst));
        let mut state = self.state.lock();

        let video_usec = frame.info.batch.video_boot_usec;

        if state.last_released_local_usec != 0 {
            let idle = now_usec.saturating_sub(state.last_released_local_usec);
            if idle > target * 2 {
                state.clear();
            } else if state.last_released_video_usec != 0 {
                let delta = video_usec as i64 - state.last_released_video_usec as i64;
                if delta <= 0 {
                    return; // Too late to present.
                }
            }
        }

        let guid = frame.info.guid;
        if let Some(history) = state.histories.iter_mut().find(|h| h.guid == guid) {
            history.insert(frame);
            return;
        }
        let mut history = FrameHistory {
            guid,
            batches: VecDeque::new(),
        };
        history.insert(frame);
        state.histories.push(history);
    }

    fn release_loop(&self) {
        while !self.terminated.is_set() {
            let (batch, sleep_msec) = self.dequeue_next();
            if let Some(batch) = batch {
                (self.callback)(batch);
            }

            let sleep_msec = sleep_msec.clamp(WAKE_MIN_MSEC, WAKE_MAX_MSEC);
            let mut guard = self.wake_lock.lock();
            if !self.terminated.is_set() {
                self.wake
                    .wait_for(&mut guard, Duration::from_millis(sleep_msec));
            }
        }
    }

    fn dequeue_next(&self) -> (Option<DecodedBatch>, u64) {
        let now_usec = volcap_util::boot_usec();
        let target_usec = u64::from(self.target_usec.load(Ordering::SeqCst));
        let mut state = self.state.lock();

        // Earliest front batch across the streams, and the shallowest
        // stream for the lookahead rule. Streams that drained are skipped.
        let mut earliest_video_usec = 0u64;
        let mut earliest_queue_start = 0u64;
        let mut found = false;
        let mut smallest_count = usize::MAX;
        for history in &state.histories {
            let Some(front) = history.batches.front() else {
                continue;
            };
            if !found || (front.video_boot_usec as i64 - earliest_video_usec as i64) < 0 {
                earliest_video_usec = front.video_boot_usec;
                earliest_queue_start = front.queue_start_usec;
                found = true;
            }
            smallest_count = smallest_count.min(history.batches.len());
        }
        if !found {
            state.reset_sync();
            return (None, WAKE_MAX_MSEC);
        }

        if state.last_released_local_usec != 0
            && now_usec.saturating_sub(state.last_released_local_usec) > target_usec * 2
        {
            state.reset_sync();
        }

        let queued_time_usec = now_usec.saturating_sub(earliest_queue_start);

        // Every live stream needs lookahead before release.
        if smallest_count < 2 {
            return (None, WAKE_MAX_MSEC);
        }

        if state.sync_video_usec != 0 {
            let erase_point_usec = target_usec * 3 / 2;
            if queued_time_usec > erase_point_usec {
                state.reset_sync();
                for history in &mut state.histories {
                    history.erase_before(now_usec, erase_point_usec);
                }
                tracing::warn!("dejitter: erased extra long queue backlog");
                return (None, WAKE_MAX_MSEC);
            }

            // Speed up to drain a growing queue; never slow below 1x.
            let mut playback_speed = 1.0f32;
            if queued_time_usec > target_usec {
                playback_speed = queued_time_usec as f32 / target_usec as f32;
            }

            let release_delay_usec = now_usec.saturating_sub(state.sync_local_usec) as i64;
            let video_delay_usec = earliest_video_usec as i64 - state.sync_video_usec as i64;
            let remaining_usec =
                video_delay_usec - (release_delay_usec as f32 * playback_speed) as i64;
            if remaining_usec > FUZZ_USEC {
                return (None, (remaining_usec / 1000) as u64);
            }
        } else {
            // Not started yet: build the queue up to the target first.
            if queued_time_usec < target_usec {
                return (None, WAKE_MAX_MSEC);
            }
        }

        // Periodically re-anchor the local/video clock pair.
        if now_usec.saturating_sub(state.sync_local_usec) > SYNC_INTERVAL_USEC {
            state.sync_local_usec = now_usec;
            state.sync_video_usec = earliest_video_usec;
        }
        state.last_released_local_usec = now_usec;
        state.last_released_video_usec = earliest_video_usec;

        // Merge every stream whose front batch is within the window.
        let mut output = DecodedBatch::default();
        for history in &mut state.histories {
            let Some(front) = history.batches.front() else {
                continue;
            };
            let delta = (front.video_boot_usec as i64 - earliest_video_usec as i64).max(0);
            if delta < MERGE_WINDOW_USEC {
                let mut batch = history.batches.pop_front().expect("front exists");
                if output.video_boot_usec == 0 {
                    output.video_boot_usec = batch.video_boot_usec;
                    output.frame_number = batch.frame_number;
                }
                output.frames.append(&mut batch.frames);
            }
        }

        (Some(output), WAKE_MIN_MSEC)
    }
}

impl Drop for DejitterQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{BatchMeta, FrameInfo};
    use volcap_proto::wire::FrameHeader;
    use volcap_types::{CameraCalibration, CaptureMode, VideoInfo};

    fn test_frame(guid: u64, camera_index: u32, video_boot_usec: u64) -> Arc<DecodedFrame> {
        let header = FrameHeader {
            frame_number: (video_boot_usec / 33_333) as u32,
            back_reference: 0,
            is_final_frame: true,
            camera_index,
            accelerometer: [0.0; 3],
            image_bytes: 0,
            depth_bytes: 0,
            exposure_usec: 0,
            awb_usec: 0,
            iso_speed: 0,
            brightness: 0.0,
            saturation: 1.0,
        };
        Arc::new(DecodedFrame {
            info: Arc::new(FrameInfo {
                guid,
                batch: Arc::new(BatchMeta {
                    camera_count: 1,
                    video_boot_usec,
                    video_epoch_usec: 0,
                }),
                video_info: Arc::new(VideoInfo::default()),
                calibration: Arc::new(CameraCalibration::default()),
                extrinsics: None,
                capture_mode: CaptureMode::CaptureLowQ,
                header,
                image: Vec::new(),
                depth: Vec::new(),
            }),
            color: None,
            depth_width: 0,
            depth_height: 0,
            depth: Vec::new(),
            vertices: Vec::new(),
            indices: Vec::new(),
        })
    }

    fn collect_queue() -> (Arc<DejitterQueue>, Arc<Mutex<Vec<DecodedBatch>>>) {
        let released = Arc::new(Mutex::new(Vec::new()));
        let sink = released.clone();
        let queue = DejitterQueue::new(Arc::new(move |batch| sink.lock().push(batch)));
        (queue, released)
    }

    #[test]
    fn frames_with_same_timestamp_join_one_batch() {
        let (queue, _released) = collect_queue();
        queue.insert(test_frame(1, 0, 1000));
        queue.insert(test_frame(1, 1, 1000));
        queue.insert(test_frame(1, 0, 34_333));
        assert_eq!(queue.queued_batch_count(), 2);
        queue.shutdown();
    }

    #[test]
    fn release_merges_servers_and_is_monotonic() {
        let (queue, released) = collect_queue();
        queue.set_queue_depth_msec(50);

        // Two servers, 20 ms shutter skew, several batches each.
        for n in 0..6u64 {
            queue.insert(test_frame(1, 0, 1_000_000 + n * 33_333));
            queue.insert(test_frame(2, 0, 1_020_000 + n * 33_333));
        }

        // Wait out the target depth plus release cadence.
        let t0 = std::time::Instant::now();
        while released.lock().len() < 3 {
            assert!(
                t0.elapsed() < Duration::from_secs(10),
                "release loop did not emit batches"
            );
            std::thread::sleep(Duration::from_millis(10));
        }
        queue.shutdown();

        let released = released.lock();
        // Merged batches contain both servers' frames.
        assert!(released
            .iter()
            .any(|batch| {
                let mut guids: Vec<u64> = batch.frames.iter().map(|f| f.info.guid).collect();
                guids.sort_unstable();
                guids.dedup();
                guids.len() == 2
            }));
        // Released timestamps strictly increase.
        for pair in released.windows(2) {
            assert!(pair[0].video_boot_usec < pair[1].video_boot_usec);
        }
    }

    #[test]
    fn late_frames_are_rejected_after_release() {
        let (queue, released) = collect_queue();
        queue.set_queue_depth_msec(30);
        for n in 0..5u64 {
            queue.insert(test_frame(1, 0, 500_000 + n * 33_333));
        }
        let t0 = std::time::Instant::now();
        while released.lock().is_empty() {
            assert!(t0.elapsed() < Duration::from_secs(10));
            std::thread::sleep(Duration::from_millis(5));
        }
        // Stop the release loop so the count cannot change underneath us.
        queue.shutdown();
        let before = queue.queued_batch_count();
        // A frame from before the last release must vanish.
        queue.insert(test_frame(1, 0, 1));
        assert_eq!(queue.queued_batch_count(), before);
    }

    #[test]
    fn long_idle_clears_state_without_panic() {
        let (queue, _released) = collect_queue();
        queue.set_queue_depth_msec(1);
        queue.insert(test_frame(1, 0, 1_000));
        queue.insert(test_frame(1, 0, 34_333));
        queue.insert(test_frame(1, 0, 67_666));
        // Let the release loop drain and go idle well past 2x target.
        std::thread::sleep(Duration::from_millis(100));
        queue.insert(test_frame(1, 0, 5_000_000));
        queue.shutdown();
    }
}
