//! Programmatic client surface.
//!
//! One `CaptureClient` owns the connections to capture servers, the
//! dejitter queue, and the optional recorder and playback reader. The
//! renderer polls [`CaptureClient::get`], which pins the latest presentable
//! batch until the next call.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use volcap_capture::clock::BootEpochConverter;
use volcap_capture::codec::{CodecFactory, SoftwareCodecFactory};
use volcap_proto::{Channel, Message};
use volcap_transport::Network;
use volcap_types::{
    CameraExtrinsics, CaptureMode, CaptureStatus, CompressionSettings, StreamState,
};

use crate::connection::{spawn_capture_connection, ClientContext, ConnectionShared};
use crate::decode::DecodedFrame;
use crate::dejitter::{DecodedBatch, DejitterQueue};
use crate::playback::PlaybackReader;
use crate::recorder::Recorder;
use crate::{Error, Result};

const RECONNECT_INTERVAL_USEC: u64 = 2_000_000;

/// Aggregated connection + capture status for the UI.
#[derive(Debug, Clone, Default)]
pub struct ClientStatus {
    pub state: StreamState,
    pub mode: CaptureMode,
    pub capture_status: CaptureStatus,
    pub camera_count: u32,
    pub camera_codes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackMode {
    Idle,
    LiveStream,
    Playing,
    Paused,
}

#[derive(Debug, Clone, Copy)]
pub struct PlaybackState {
    pub mode: PlaybackMode,
    pub video_time_usec: u64,
    pub video_frame: u64,
    pub dejitter_queue_msec: u32,
}

pub use crate::recorder::RecorderState as RecordingState;

#[derive(Clone, PartialEq, Eq)]
struct ConnectParams {
    host: String,
    port: u16,
    name: String,
    password: String,
}

struct ClientCore {
    network: Arc<dyn Network>,
    factory: Arc<dyn CodecFactory>,
    params: Mutex<Option<ConnectParams>>,
    connections: Mutex<Vec<Arc<ConnectionShared>>>,
    queue: Mutex<Option<Arc<DejitterQueue>>>,
    latest: Mutex<Option<Arc<DecodedBatch>>>,
    recorder: Mutex<Option<Recorder>>,
    reader: Mutex<Option<PlaybackReader>>,
    epoch: BootEpochConverter,
    last_mode: Mutex<Option<CaptureMode>>,
    /// Final state of the most recently closed connection, reported while
    /// no connection is live (e.g. IncorrectPassword between redials).
    last_closed_state: Mutex<StreamState>,
    frame_counter: AtomicU64,
    terminated: volcap_util::TerminateFlag,
    self_weak: Weak<ClientCore>,
}

impl ClientCore {
    fn queue(&self) -> Option<Arc<DejitterQueue>> {
        self.queue.lock().clone()
    }

    fn ensure_queue(self: &Arc<Self>) -> Arc<DejitterQueue> {
        let mut queue = self.queue.lock();
        if let Some(queue) = queue.as_ref() {
            return queue.clone();
        }
        let weak = self.self_weak.clone();
        let new_queue = DejitterQueue::new(Arc::new(move |batch| {
            if let Some(core) = weak.upgrade() {
                core.play_frame(batch);
            }
        }));
        *queue = Some(new_queue.clone());
        new_queue
    }

    /// Dejitter release callback: publish for `get` and feed the recorder.
    fn play_frame(&self, mut batch: DecodedBatch) {
        if batch.frames.is_empty() {
            return;
        }
        batch.epoch_usec = self.epoch.convert(batch.video_boot_usec);
        let batch = Arc::new(batch);
        *self.latest.lock() = Some(batch.clone());

        let mut recorder = self.recorder.lock();
        if let Some(recorder) = recorder.as_mut() {
            if !recorder.is_paused() {
                if let Err(e) = recorder.write_batch(&batch) {
                    tracing::error!("recording failed: {e}");
                }
            }
        }
    }

    fn live_connections(&self) -> Vec<Arc<ConnectionShared>> {
        self.connections.lock().clone()
    }

    fn send_to_authenticated(&self, channel: Channel, message: &Message) {
        for shared in self.live_connections() {
            if shared.is_authenticated() {
                shared.send_message(channel, message);
            }
        }
    }

    fn reconnect_loop(self: Arc<Self>) {
        let mut last_attempt_usec = 0u64;
        while !self.terminated.is_set() {
            std::thread::sleep(Duration::from_millis(100));
            let now_usec = volcap_util::boot_usec();
            if now_usec.saturating_sub(last_attempt_usec) < RECONNECT_INTERVAL_USEC
                && last_attempt_usec != 0
            {
                continue;
            }
            last_attempt_usec = now_usec;

            let Some(params) = self.params.lock().clone() else {
                continue;
            };
            let has_live = !self.connections.lock().is_empty();
            if has_live {
                continue;
            }

            tracing::info!("connecting to {}:{}...", params.host, params.port);
            let context: Arc<dyn ClientContext> = self.clone();
            let factory = self.factory.clone();
            let registry = self.self_weak.clone();
            let result = self.network.connect(
                &params.host,
                params.port,
                Box::new(move |conn| {
                    let (shared, handler) =
                        spawn_capture_connection(context.clone(), factory.clone(), conn);
                    if let Some(core) = registry.upgrade() {
                        core.connections.lock().push(shared);
                    }
                    handler
                }),
            );
            if let Err(e) = result {
                tracing::error!("connect failed: {e}");
            }
        }
    }

    fn disconnect_all(&self) {
        for shared in self.connections.lock().drain(..) {
            shared.close();
        }
    }
}

impl ClientContext for ClientCore {
    fn server_name(&self) -> String {
        self.params
            .lock()
            .as_ref()
            .map(|p| p.name.clone())
            .unwrap_or_default()
    }

    fn password(&self) -> String {
        self.params
            .lock()
            .as_ref()
            .map(|p| p.password.clone())
            .unwrap_or_default()
    }

    fn known_guids(&self) -> Vec<u64> {
        self.connections
            .lock()
            .iter()
            .map(|c| c.server_guid())
            .filter(|&guid| guid != 0)
            .collect()
    }

    fn check_direct_unique(&self, shared: &Arc<ConnectionShared>) -> bool {
        let guid = shared.server_guid();
        !self
            .connections
            .lock()
            .iter()
            .any(|other| !Arc::ptr_eq(other, shared) && other.server_guid() == guid)
    }

    fn on_decoded_frame(&self, frame: Arc<DecodedFrame>) {
        if let Some(queue) = self.queue() {
            queue.insert(frame);
        }
    }

    fn on_connection_closed(&self, shared: &Arc<ConnectionShared>) {
        *self.last_closed_state.lock() = shared.state();
        self.connections
            .lock()
            .retain(|other| !Arc::ptr_eq(other, shared));
    }
}

pub struct CaptureClient {
    core: Arc<ClientCore>,
    reconnect_handle: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureClient {
    pub fn new(network: Arc<dyn Network>) -> Self {
        Self::with_codec_factory(network, Arc::new(SoftwareCodecFactory))
    }

    pub fn with_codec_factory(network: Arc<dyn Network>, factory: Arc<dyn CodecFactory>) -> Self {
        let core = Arc::new_cyclic(|weak| ClientCore {
            network,
            factory,
            params: Mutex::new(None),
            connections: Mutex::new(Vec::new()),
            queue: Mutex::new(None),
            latest: Mutex::new(None),
            recorder: Mutex::new(None),
            reader: Mutex::new(None),
            epoch: BootEpochConverter::new(),
            last_mode: Mutex::new(None),
            last_closed_state: Mutex::new(StreamState::Idle),
            frame_counter: AtomicU64::new(0),
            terminated: volcap_util::TerminateFlag::new(),
            self_weak: weak.clone(),
        });
        Self {
            core,
            reconnect_handle: Mutex::new(None),
        }
    }

    /// Connect to a capture (or rendezvous) server. Idempotent: a repeat
    /// call with identical arguments is a no-op; changed arguments re-dial.
    pub fn connect(&self, host: &str, port: u16, name: &str, password: &str) {
        let params = ConnectParams {
            host: host.to_string(),
            port,
            name: name.to_string(),
            password: password.to_string(),
        };
        {
            let mut current = self.core.params.lock();
            if current.as_ref() == Some(&params) {
                return;
            }
            if current.is_some() {
                tracing::info!("resetting connection on connect() with new parameters");
                self.core.disconnect_all();
            }
            *current = Some(params);
            *self.core.last_mode.lock() = None;
        }

        self.core.ensure_queue();

        let mut handle = self.reconnect_handle.lock();
        if handle.is_none() {
            let core = self.core.clone();
            *handle = Some(
                std::thread::Builder::new()
                    .name("client-reconnect".to_string())
                    .spawn(move || core.reconnect_loop())
                    .expect("spawn reconnect thread"),
            );
        }
    }

    /// Latest presentable batch plus aggregated status. The returned batch
    /// stays pinned until the next call.
    pub fn get(&self) -> (Option<Arc<DecodedBatch>>, ClientStatus) {
        let mut status = ClientStatus::default();

        let live = self.core.live_connections();
        if live.is_empty() {
            status.state = *self.core.last_closed_state.lock();
        }
        for shared in live {
            status.state = status.state.max(shared.state());
            let snapshot = shared.last_status();
            if let Ok(mode) = CaptureMode::try_from(snapshot.mode) {
                if mode as u8 > status.mode as u8 {
                    status.mode = mode;
                }
            }
            if let Ok(capture_status) = CaptureStatus::try_from(snapshot.capture_status) {
                if capture_status as u8 > status.capture_status as u8 {
                    status.capture_status = capture_status;
                }
            }
            for index in 0..snapshot.camera_count.min(8) as usize {
                status.camera_codes.push(snapshot.camera_status[index]);
            }
            status.camera_count += snapshot.camera_count;
        }

        let latest = self.core.latest.lock().clone();
        if latest.is_some() {
            self.core.frame_counter.fetch_add(1, Ordering::SeqCst);
        }
        (latest, status)
    }

    /// Coalesces duplicate mode requests. A request made before any server
    /// is authenticated is not latched, so the caller's next poll retries.
    pub fn set_server_capture_mode(&self, mode: CaptureMode) {
        let any_live = self
            .core
            .live_connections()
            .iter()
            .any(|c| c.is_authenticated());
        let mut last = self.core.last_mode.lock();
        if !any_live {
            *last = None;
            return;
        }
        if *last == Some(mode) {
            return;
        }
        *last = Some(mode);
        drop(last);
        self.core
            .send_to_authenticated(Channel::Control, &Message::SetMode { mode });
    }

    pub fn set_exposure(&self, auto_enabled: bool, exposure_usec: u32, awb_usec: u32) {
        self.core.send_to_authenticated(
            Channel::Control,
            &Message::SetExposure {
                auto_enabled,
                exposure_usec,
                awb_usec,
            },
        );
    }

    pub fn set_clip(&self, enabled: bool, radius_m: f32, floor_m: f32, ceiling_m: f32) {
        self.core.send_to_authenticated(
            Channel::Control,
            &Message::SetClip {
                enabled,
                radius_m,
                floor_m,
                ceiling_m,
            },
        );
    }

    pub fn set_extrinsics(&self, camera_index: u32, extrinsics: CameraExtrinsics) {
        self.core.send_to_authenticated(
            Channel::Control,
            &Message::Extrinsics {
                camera_index,
                extrinsics,
            },
        );
    }

    pub fn set_compression(&self, settings: CompressionSettings) {
        self.core
            .send_to_authenticated(Channel::Control, &Message::SetCompression { settings });
    }

    pub fn set_lighting(&self, camera_index: i32, brightness: f32, saturation: f32) {
        self.core.send_to_authenticated(
            Channel::Control,
            &Message::SetLighting {
                camera_index,
                brightness,
                saturation,
            },
        );
    }

    /// Ask every connected server for an immediate keyframe.
    pub fn request_keyframe(&self) {
        self.core
            .send_to_authenticated(Channel::Unordered, &Message::RequestKeyframe);
    }

    /// Resize the dejitter target depth.
    pub fn playback_settings(&self, dejitter_queue_msec: u32) {
        self.core
            .ensure_queue()
            .set_queue_depth_msec(dejitter_queue_msec);
    }

    /// Open a recorded container for playback. Returns false when the file
    /// cannot be opened.
    pub fn playback_read_file<P: AsRef<Path>>(&self, path: P) -> bool {
        let queue = self.core.ensure_queue();
        match PlaybackReader::open(path, queue, self.core.factory.clone()) {
            Ok(reader) => {
                *self.core.reader.lock() = Some(reader);
                true
            }
            Err(e) => {
                tracing::error!("failed to open playback file: {e}");
                false
            }
        }
    }

    pub fn playback_tricks(&self, pause: bool, loop_repeat: bool) {
        let reader = self.core.reader.lock();
        if let Some(reader) = reader.as_ref() {
            reader.set_paused(pause);
            reader.set_loop_repeat(loop_repeat);
        }
    }

    /// Unimplemented: the container format is not random-access.
    pub fn playback_seek(&self, _video_usec: u64) -> Result<()> {
        Err(Error::Unsupported(
            "the container is not seekable; playback starts at a keyframe",
        ))
    }

    /// Unimplemented companion to `playback_seek`.
    pub fn playback_append<P: AsRef<Path>>(&self, _path: P) -> Result<()> {
        Err(Error::Unsupported("playback append is not implemented"))
    }

    /// Open (or with `None`, close) a recording file. Recording starts
    /// paused.
    pub fn record(&self, path: Option<&PathBuf>) -> Result<()> {
        let mut recorder = self.core.recorder.lock();
        if let Some(old) = recorder.take() {
            old.close()?;
        }
        if let Some(path) = path {
            *recorder = Some(Recorder::create(path)?);
        }
        Ok(())
    }

    /// Pause or resume recording. Resuming requests a keyframe upstream so
    /// the recording resumes at a decodable point.
    pub fn record_pause(&self, pause: bool) {
        let mut resumed = false;
        {
            let mut recorder = self.core.recorder.lock();
            if let Some(recorder) = recorder.as_mut() {
                if recorder.is_paused() && !pause {
                    resumed = true;
                }
                recorder.set_paused(pause);
            }
        }
        if resumed {
            self.request_keyframe();
        }
    }

    pub fn get_playback_state(&self) -> PlaybackState {
        let reader = self.core.reader.lock();
        let dejitter_queue_msec = self
            .core
            .queue()
            .map(|q| q.queue_depth_msec())
            .unwrap_or(0);
        match reader.as_ref() {
            Some(reader) => {
                let progress = reader.progress();
                PlaybackState {
                    mode: if reader.is_paused() {
                        PlaybackMode::Paused
                    } else {
                        PlaybackMode::Playing
                    },
                    video_time_usec: progress.video_time_usec,
                    video_frame: progress.video_frame,
                    dejitter_queue_msec,
                }
            }
            None => PlaybackState {
                mode: if self.core.connections.lock().is_empty() {
                    PlaybackMode::Idle
                } else {
                    PlaybackMode::LiveStream
                },
                video_time_usec: 0,
                video_frame: 0,
                dejitter_queue_msec,
            },
        }
    }

    pub fn get_recording_state(&self) -> RecordingState {
        self.core
            .recorder
            .lock()
            .as_ref()
            .map(|r| r.state())
            .unwrap_or_default()
    }

    /// Release connections, playback, recording, and presentation state.
    pub fn reset(&self) {
        *self.core.params.lock() = None;
        self.core.disconnect_all();
        *self.core.reader.lock() = None;
        if let Some(recorder) = self.core.recorder.lock().take() {
            if let Err(e) = recorder.close() {
                tracing::error!("recorder close failed: {e}");
            }
        }
        *self.core.latest.lock() = None;
        *self.core.last_mode.lock() = None;
        *self.core.last_closed_state.lock() = StreamState::Idle;
    }

    /// Blocking shutdown of every background thread.
    pub fn shutdown(&self) {
        self.reset();
        self.core.terminated.set();
        let handle = self.reconnect_handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("reconnect thread panicked");
            }
        }
        if let Some(queue) = self.core.queue.lock().take() {
            queue.shutdown();
        }
    }
}

impl Drop for CaptureClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
