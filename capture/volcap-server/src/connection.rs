//! Server side of one viewer connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use volcap_capture::pipeline::Batch;
use volcap_proto::pake::PakeServer;
use volcap_proto::wire::{BatchInfo, FrameHeader};
use volcap_proto::{Channel, Message, MAX_CHUNK_BYTES, MAX_QUEUED_BATCHES};
use volcap_transport::{Connection, ConnectionHandler, ConnectionKeys, KeyBehavior};
use volcap_types::{AuthResult, CameraCalibration, CameraExtrinsics, ConnectResult, MAX_CAMERAS};

use crate::CaptureServer;

const STATUS_INTERVAL_USEC: u64 = 500_000;

/// Connection state shared between the transport handler, the broadcaster,
/// and the tick path.
pub(crate) struct ViewerPeer {
    conn: Arc<dyn Connection>,
    label: String,
    authenticated: AtomicBool,
    capture_config_epoch: AtomicU32,
    extrinsics_epoch: AtomicU32,
    video_info_epoch: AtomicU32,
    batches: Mutex<VecDeque<Arc<Batch>>>,
}

impl ViewerPeer {
    pub(crate) fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Swap in the current epoch; true means this connection had not yet
    /// delivered it.
    pub(crate) fn exchange_capture_config_epoch(&self, epoch: u32) -> bool {
        self.capture_config_epoch.swap(epoch, Ordering::SeqCst) != epoch
    }

    pub(crate) fn exchange_extrinsics_epoch(&self, epoch: u32) -> bool {
        self.extrinsics_epoch.swap(epoch, Ordering::SeqCst) != epoch
    }

    pub(crate) fn close(&self) {
        self.conn.close();
    }

    fn send(&self, channel: Channel, message: &Message) {
        if let Err(e) = self.conn.send(channel, &message.encode()) {
            tracing::error!("{} send failed: {e}", self.label);
        }
    }

    pub(crate) fn send_calibration(&self, camera_index: u32, calibration: &CameraCalibration) {
        tracing::info!("{} sending calibration for camera {camera_index}", self.label);
        self.send(
            Channel::Control,
            &Message::Calibration {
                camera_index,
                calibration: *calibration,
            },
        );
    }

    pub(crate) fn send_extrinsics(&self, camera_index: u32, extrinsics: &CameraExtrinsics) {
        tracing::info!("{} sending extrinsics for camera {camera_index}", self.label);
        self.send(
            Channel::Control,
            &Message::Extrinsics {
                camera_index,
                extrinsics: *extrinsics,
            },
        );
    }

    /// Queue one batch for the tick path; beyond the cap the connection is
    /// too slow and the batch is dropped.
    pub(crate) fn queue_batch(&self, batch: Arc<Batch>) {
        let mut batches = self.batches.lock();
        if batches.len() >= MAX_QUEUED_BATCHES {
            tracing::error!("{} client connection too slow: dropping batch", self.label);
            return;
        }
        batches.push_back(batch);
    }

    fn pop_batch(&self) -> Option<Arc<Batch>> {
        self.batches.lock().pop_front()
    }

    fn send_batch(&self, batch: &Batch) {
        if batch.images.is_empty() {
            return;
        }

        // Resend video info ahead of the first frame that follows a change.
        let epoch = batch.video_info_epoch;
        if self.video_info_epoch.swap(epoch, Ordering::SeqCst) != epoch {
            tracing::info!("{} delivering updated video info to peer", self.label);
            self.send(Channel::Control, &Message::VideoInfo(batch.video_info));
        }

        self.send(
            Channel::Control,
            &Message::BatchInfo(BatchInfo {
                camera_count: batch.images.len() as u32,
                video_boot_usec: batch.sync_system_usec,
            }),
        );

        let image_count = batch.images.len();
        for (index, image) in batch.images.iter().enumerate() {
            let output = batch.outputs[index].lock();

            let header = FrameHeader {
                frame_number: image.frame_number,
                back_reference: if batch.keyframe { 0 } else { -1 },
                is_final_frame: index + 1 == image_count,
                camera_index: image.device_index,
                accelerometer: image.accelerometer,
                image_bytes: output.compressed_image.len() as u32,
                depth_bytes: output.compressed_depth.len() as u32,
                exposure_usec: image.color_exposure_usec,
                awb_usec: image.color_awb_usec,
                iso_speed: image.color_iso_speed,
                brightness: output.brightness,
                saturation: output.saturation,
            };
            self.send(Channel::Control, &Message::FrameHeader(header));

            for chunk in output.compressed_image.chunks(MAX_CHUNK_BYTES) {
                if let Err(e) = self.conn.send(Channel::Image, chunk) {
                    tracing::error!("{} image send failed: {e}", self.label);
                    return;
                }
            }
            for chunk in output.compressed_depth.chunks(MAX_CHUNK_BYTES) {
                if let Err(e) = self.conn.send(Channel::Depth, chunk) {
                    tracing::error!("{} depth send failed: {e}", self.label);
                    return;
                }
            }
        }
    }
}

struct ViewerHandler {
    server: Arc<CaptureServer>,
    peer: Arc<ViewerPeer>,
    pake: Option<PakeServer>,
    started_auth: bool,
    auth_reply_count: u32,
    auth_proof_count: u32,
    last_status_usec: u64,
}

pub(crate) fn spawn_viewer(
    server: Arc<CaptureServer>,
    conn: Arc<dyn Connection>,
) -> Box<dyn ConnectionHandler> {
    let label = format!("[client {}]", conn.remote_label());
    let peer = Arc::new(ViewerPeer {
        conn,
        label,
        authenticated: AtomicBool::new(false),
        capture_config_epoch: AtomicU32::new(0),
        extrinsics_epoch: AtomicU32::new(0),
        video_info_epoch: AtomicU32::new(0),
        batches: Mutex::new(VecDeque::new()),
    });
    server.register_peer(peer.clone());
    Box::new(ViewerHandler {
        server,
        peer,
        pake: None,
        started_auth: false,
        auth_reply_count: 0,
        auth_proof_count: 0,
        last_status_usec: 0,
    })
}

impl ViewerHandler {
    fn on_connect_name(&mut self, name: &str) {
        let matches = name.eq_ignore_ascii_case(self.server.name());
        if !matches {
            tracing::warn!("{} client provided an incorrect server name", self.peer.label);
            self.peer.send(
                Channel::Rendezvous,
                &Message::ConnectResult {
                    result: ConnectResult::WrongName,
                    server_count: 0,
                    server_guid: 0,
                },
            );
            return;
        }

        self.peer.send(
            Channel::Rendezvous,
            &Message::ConnectResult {
                result: ConnectResult::Direct,
                server_count: 1,
                server_guid: self.server.guid(),
            },
        );

        // The name message repeats until the client sees Direct; auth
        // starts at most once.
        if self.started_auth {
            return;
        }
        self.started_auth = true;

        let mut pake = match PakeServer::new(self.server.stored_data()) {
            Ok(pake) => pake,
            Err(e) => {
                tracing::error!("{} pake setup failed: {e}", self.peer.label);
                return;
            }
        };
        match pake.step0() {
            Ok(public_data) => {
                tracing::info!(
                    "{} client provided the correct server name: sending hello",
                    self.peer.label
                );
                self.peer
                    .send(Channel::Authentication, &Message::AuthServerHello { public_data });
                self.pake = Some(pake);
            }
            Err(e) => tracing::error!("{} pake step0 failed: {e}", self.peer.label),
        }
    }

    fn on_auth_client_reply(&mut self, response1: &[u8; 32]) {
        let Some(pake) = self.pake.as_mut() else {
            tracing::error!("{} client reply before hello", self.peer.label);
            return;
        };
        match pake.step2(response1) {
            Ok((response2, keys)) => {
                tracing::info!(
                    "{} sending server proof of password knowledge",
                    self.peer.label
                );
                // The client turns encryption on the moment it verifies the
                // proof, so the keys are staged now; wait-for-peer defers
                // our own encryption until a message from the client
                // verifies, which also confirms the password agreement.
                self.peer.conn.set_keys(
                    ConnectionKeys {
                        send_key: keys.server_sk,
                        recv_key: keys.client_sk,
                    },
                    KeyBehavior::WaitForPeer,
                );
                self.peer
                    .send(Channel::Authentication, &Message::AuthServerProof { response2 });
            }
            Err(e) => {
                tracing::error!("{} pake rejected client reply: {e}", self.peer.label);
                self.send_auth_result(AuthResult::Deny);
            }
        }
    }

    fn on_auth_client_proof(&mut self, response3: &[u8; 32]) {
        let Some(pake) = self.pake.as_mut() else {
            tracing::error!("{} client proof before reply", self.peer.label);
            return;
        };
        match pake.step4(response3) {
            Ok(_keys) => {
                tracing::info!(
                    "{} client provided proof of knowing the correct password",
                    self.peer.label
                );
                self.send_auth_result(AuthResult::Accept);
                self.peer.authenticated.store(true, Ordering::SeqCst);
            }
            Err(e) => {
                tracing::error!("{} pake rejected client proof: {e}", self.peer.label);
                self.send_auth_result(AuthResult::Deny);
            }
        }
    }

    fn send_auth_result(&self, result: AuthResult) {
        self.peer
            .send(Channel::Authentication, &Message::AuthResult { result });
    }

    fn send_status(&self) {
        let manager = self.server.manager();
        let mode = manager.config().mode();
        let capture_status = manager.status();
        let cameras = manager.camera_status();
        let camera_count = cameras.len().min(MAX_CAMERAS);
        let mut camera_status = [0u8; MAX_CAMERAS];
        for (slot, status) in camera_status.iter_mut().zip(cameras.iter()) {
            *slot = *status as u8;
        }
        self.peer.send(
            Channel::Control,
            &Message::Status {
                mode,
                capture_status,
                camera_count: camera_count as u32,
                camera_status,
            },
        );
    }

    fn on_control(&mut self, message: Message) {
        let config = self.server.manager().config().clone();
        match message {
            Message::SetCompression { settings } => {
                tracing::info!(
                    "{} client updated compression: color video={:?} bitrate={} depth video={:?} denoise={}",
                    self.peer.label,
                    settings.color_video,
                    settings.color_bitrate,
                    settings.depth_video,
                    settings.denoise_pct
                );
                config.set_compression(settings);
            }
            Message::SetMode { mode } => {
                tracing::info!("{} viewer set mode: {mode}", self.peer.label);
                self.server.manager().set_mode(mode);
            }
            Message::SetExposure {
                auto_enabled,
                exposure_usec,
                awb_usec,
            } => {
                if auto_enabled {
                    tracing::info!("{} viewer enabled auto-exposure", self.peer.label);
                } else {
                    tracing::info!(
                        "{} viewer set manual exposure={exposure_usec} awb={awb_usec}",
                        self.peer.label
                    );
                }
                config.set_exposure(volcap_types::ExposureSettings {
                    auto_enabled,
                    exposure_usec,
                    awb_usec,
                });
            }
            Message::SetClip {
                enabled,
                radius_m,
                floor_m,
                ceiling_m,
            } => {
                if enabled {
                    tracing::info!(
                        "{} viewer enabled clip radius={radius_m} floor={floor_m} ceiling={ceiling_m}",
                        self.peer.label
                    );
                } else {
                    tracing::info!("{} viewer disabled clip", self.peer.label);
                }
                config.set_clip(volcap_types::ClipSettings {
                    enabled,
                    radius_m,
                    floor_m,
                    ceiling_m,
                });
            }
            Message::SetLighting {
                camera_index,
                brightness,
                saturation,
            } => {
                if camera_index >= 0 {
                    config.set_lighting(
                        camera_index as usize,
                        volcap_types::LightingSettings {
                            brightness,
                            saturation,
                        },
                    );
                }
            }
            Message::Extrinsics {
                camera_index,
                extrinsics,
            } => {
                if (camera_index as usize) < MAX_CAMERAS {
                    config.set_extrinsics(camera_index as usize, extrinsics);
                }
            }
            other => {
                tracing::error!(
                    "{} invalid post-auth message {:?} from client",
                    self.peer.label,
                    other.message_type()
                );
            }
        }
    }
}

impl ConnectionHandler for ViewerHandler {
    fn on_connect(&mut self) {
        tracing::info!("{} client connected", self.peer.label);
    }

    fn on_data(&mut self, channel: Channel, data: &[u8]) {
        let message = match Message::decode(data) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!("{} dropping bad message: {e}", self.peer.label);
                return;
            }
        };
        match (channel, message) {
            (Channel::Rendezvous, Message::ConnectName { name, .. }) => {
                self.on_connect_name(&name);
            }
            (Channel::Authentication, Message::AuthClientReply { response1 }) => {
                self.auth_reply_count += 1;
                if self.auth_reply_count > 1 {
                    tracing::error!(
                        "{} ignoring AuthClientReply #{}",
                        self.peer.label,
                        self.auth_reply_count
                    );
                    return;
                }
                self.on_auth_client_reply(&response1);
            }
            (Channel::Authentication, Message::AuthClientProof { response3 }) => {
                self.auth_proof_count += 1;
                if self.auth_proof_count > 1 {
                    tracing::error!(
                        "{} ignoring AuthClientProof #{}",
                        self.peer.label,
                        self.auth_proof_count
                    );
                    return;
                }
                self.on_auth_client_proof(&response3);
            }
            (channel, message) => {
                tracing::error!(
                    "{} unsupported pre-auth message {:?} on channel {channel:?}",
                    self.peer.label,
                    message.message_type()
                );
            }
        }
    }

    fn on_secure_data(&mut self, channel: Channel, data: &[u8]) {
        let message = match Message::decode(data) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!("{} dropping bad message: {e}", self.peer.label);
                return;
            }
        };
        match channel {
            Channel::Unordered => match message {
                Message::RequestKeyframe => {
                    tracing::debug!("{} client requested keyframe", self.peer.label);
                    self.server.manager().config().request_keyframe();
                }
                other => tracing::error!(
                    "{} unsupported unordered message {:?}",
                    self.peer.label,
                    other.message_type()
                ),
            },
            // The client proof is the first encrypted message of the
            // session, so it arrives here rather than on the plain path.
            Channel::Authentication => match message {
                Message::AuthClientProof { response3 } => {
                    self.auth_proof_count += 1;
                    if self.auth_proof_count > 1 {
                        tracing::error!(
                            "{} ignoring AuthClientProof #{}",
                            self.peer.label,
                            self.auth_proof_count
                        );
                        return;
                    }
                    self.on_auth_client_proof(&response3);
                }
                other => tracing::error!(
                    "{} unsupported auth message {:?}",
                    self.peer.label,
                    other.message_type()
                ),
            },
            Channel::Control => self.on_control(message),
            other => {
                tracing::error!("{} invalid channel {other:?}", self.peer.label);
            }
        }
    }

    fn on_tick(&mut self, now_usec: u64) {
        if self.peer.is_authenticated()
            && now_usec.saturating_sub(self.last_status_usec) > STATUS_INTERVAL_USEC
        {
            self.last_status_usec = now_usec;
            self.send_status();
        }

        // Drain one queued batch per tick.
        if let Some(batch) = self.peer.pop_batch() {
            self.peer.send_batch(&batch);
        }
    }

    fn on_close(&mut self) {
        tracing::warn!("{} viewer disconnected", self.peer.label);
        self.server.remove_peer(&self.peer);
    }
}
