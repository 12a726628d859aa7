//! Capture server network front.
//!
//! Accepts viewer connections, runs the server side of the password
//! handshake, and broadcasts compressed batches to every authenticated
//! viewer with epoch-driven metadata resync. Also maintains the link to
//! the rendezvous server for name registration and TDMA slot assignment.

mod connection;
mod rendezvous_link;

use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use volcap_capture::pipeline::Batch;
use volcap_capture::CaptureManager;
use volcap_proto::pake::{stored_from_base64, PakeError, STORED_DATA_BYTES};
use volcap_proto::MAX_QUEUED_BATCHES;
use volcap_transport::Network;
use volcap_util::WorkerQueue;

use connection::ViewerPeer;
use rendezvous_link::RendezvousLink;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("transport: {0}")]
    Transport(#[from] volcap_transport::Error),
    #[error("bad stored password data: {0}")]
    BadStoredData(PakeError),
    #[error("manager not attached")]
    NoManager,
}

/// Broadcast worker queue depth; a full queue drops the batch and forces a
/// keyframe.
const MAX_QUEUED_VIDEO_SENDS: usize = MAX_QUEUED_BATCHES;

const TICK_INTERVAL: Duration = Duration::from_millis(100);
const RENDEZVOUS_RECONNECT_USEC: u64 = 2_000_000;
const TDMA_REQUEST_BACKOFF_USEC: u64 = 1_000_000;

pub struct CaptureServer {
    name: String,
    guid: u64,
    stored: [u8; STORED_DATA_BYTES],
    port: u16,
    rendezvous: Option<(String, u16)>,
    multi_server: bool,
    pub(crate) network: Arc<dyn Network>,
    manager: OnceLock<Arc<CaptureManager>>,
    connections: Mutex<Vec<Arc<ViewerPeer>>>,
    rendezvous_link: Mutex<Option<RendezvousLink>>,
    broadcaster: WorkerQueue,
    terminated: volcap_util::TerminateFlag,
    tick_handle: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureServer {
    pub fn new(
        network: Arc<dyn Network>,
        name: &str,
        stored_data_base64: &str,
        port: u16,
        rendezvous: Option<(String, u16)>,
        multi_server: bool,
    ) -> Result<Arc<Self>> {
        let stored = if stored_data_base64.is_empty() {
            tracing::warn!("no password provided: using an empty password");
            volcap_proto::pake::server_store("")
        } else {
            stored_from_base64(stored_data_base64).map_err(Error::BadStoredData)?
        };

        let guid = volcap_util::generate_guid();
        tracing::info!("capture server `{name}` guid={guid:#018x}");

        Ok(Arc::new(Self {
            name: name.to_string(),
            guid,
            stored,
            port,
            rendezvous,
            multi_server,
            network,
            manager: OnceLock::new(),
            connections: Mutex::new(Vec::new()),
            rendezvous_link: Mutex::new(None),
            broadcaster: WorkerQueue::new("batch-broadcast", MAX_QUEUED_VIDEO_SENDS),
            terminated: volcap_util::TerminateFlag::new(),
            tick_handle: Mutex::new(None),
        }))
    }

    pub fn guid(&self) -> u64 {
        self.guid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attach_manager(&self, manager: Arc<CaptureManager>) {
        manager.enable_tdma_mode(self.multi_server);
        let _ = self.manager.set(manager);
    }

    pub(crate) fn manager(&self) -> &Arc<CaptureManager> {
        self.manager.get().expect("manager attached before start")
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Start listening and run the background tick loop.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.manager.get().is_none() {
            return Err(Error::NoManager);
        }

        let server = self.clone();
        self.network.listen(
            self.port,
            Box::new(move |conn| connection::spawn_viewer(server.clone(), conn)),
        );

        let server = self.clone();
        let handle = std::thread::Builder::new()
            .name("capture-server-tick".to_string())
            .spawn(move || server.tick_loop())
            .expect("spawn server tick thread");
        *self.tick_handle.lock() = Some(handle);
        Ok(())
    }

    pub fn shutdown(&self) {
        self.terminated.set();
        let handle = self.tick_handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("server tick thread panicked");
            }
        }
        self.network.stop_listening(self.port);
        *self.rendezvous_link.lock() = None;
        for peer in self.connections.lock().drain(..) {
            peer.close();
        }
        tracing::info!("capture server destroyed");
    }

    fn tick_loop(self: &Arc<Self>) {
        let mut last_rendezvous_check = 0u64;
        let mut last_tdma_request = 0u64;

        while !self.terminated.is_set() {
            std::thread::sleep(TICK_INTERVAL);
            let now_usec = volcap_util::boot_usec();

            // Viewers connected decides whether encode effort is spent.
            let want_video = self.connection_count() > 0;
            self.manager().config().set_video_needed(want_video);

            if let Some((host, port)) = &self.rendezvous {
                if now_usec.saturating_sub(last_rendezvous_check) > RENDEZVOUS_RECONNECT_USEC {
                    last_rendezvous_check = now_usec;
                    let mut link = self.rendezvous_link.lock();
                    let alive = link.as_ref().map(|l| l.is_alive()).unwrap_or(false);
                    if !alive {
                        tracing::warn!("not connected to rendezvous server");
                        match RendezvousLink::connect(self, host, *port) {
                            Ok(new_link) => *link = Some(new_link),
                            Err(e) => {
                                tracing::warn!("failed to connect to rendezvous server: {e}")
                            }
                        }
                    }
                }

                if self.multi_server {
                    let camera_count = self.manager().detected_camera_count();
                    let tdma_count = self.manager().tdma_slot_count();
                    if tdma_count != camera_count
                        && now_usec.saturating_sub(last_tdma_request) > TDMA_REQUEST_BACKOFF_USEC
                    {
                        last_tdma_request = now_usec;
                        let link = self.rendezvous_link.lock();
                        match link.as_ref() {
                            Some(link) if link.is_alive() => {
                                tracing::info!(
                                    "camera count changed: detected={camera_count} tdma={tdma_count}; requesting new TDMA slots..."
                                );
                                link.request_tdma(camera_count as u8);
                            }
                            _ => tracing::warn!(
                                "rendezvous server not connected: delaying capture in multi-server mode"
                            ),
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn register_peer(&self, peer: Arc<ViewerPeer>) {
        self.connections.lock().push(peer);
    }

    pub(crate) fn remove_peer(&self, peer: &Arc<ViewerPeer>) {
        self.connections
            .lock()
            .retain(|other| !Arc::ptr_eq(other, peer));
    }

    pub(crate) fn stored_data(&self) -> &[u8; STORED_DATA_BYTES] {
        &self.stored
    }

    pub(crate) fn on_tdma_assignment(&self, offsets: Vec<i16>) {
        self.manager().set_tdma_slots(offsets);
    }

    pub(crate) fn on_rendezvous_closed(&self) {
        // Delay capture until new slots arrive.
        self.manager().set_tdma_slots(Vec::new());
        *self.rendezvous_link.lock() = None;
    }

    /// Processor batch callback: fan the batch out to every authenticated
    /// viewer.
    pub fn broadcast_video(self: &Arc<Self>, batch: Arc<Batch>) {
        let server = self.clone();
        let queued = self.broadcaster.try_submit(move || {
            let connections = server.connections.lock().clone();
            if connections.is_empty() || batch.images.is_empty() {
                return;
            }

            let config = server.manager().config();
            let capture_config_epoch = config.capture_config_epoch.load(Ordering::SeqCst);
            let extrinsics_epoch = config.extrinsics_epoch.load(Ordering::SeqCst);

            for peer in connections {
                if !peer.is_authenticated() {
                    continue;
                }

                if peer.exchange_capture_config_epoch(capture_config_epoch) {
                    tracing::info!("delivering updated capture configuration data to peer");
                    let calibration = server.manager().camera_calibration();
                    for (camera_index, cal) in calibration.iter().enumerate() {
                        peer.send_calibration(camera_index as u32, cal);
                    }
                }

                if peer.exchange_extrinsics_epoch(extrinsics_epoch) {
                    let extrinsics = config.extrinsics();
                    for (camera_index, ext) in extrinsics.iter().enumerate() {
                        tracing::info!(
                            "delivering updated extrinsics data to peer for camera={camera_index}"
                        );
                        peer.send_extrinsics(camera_index as u32, ext);
                    }
                }

                peer.queue_batch(batch.clone());
            }
        });

        if !queued {
            tracing::warn!(
                "video broadcast thread cannot keep up: dropped a batch, forcing a keyframe"
            );
            self.manager().config().request_keyframe();
        }
    }
}
