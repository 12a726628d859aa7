//! Client side of one capture-server connection.
//!
//! Drives the name lookup and the password handshake, assembles chunked
//! frame payloads, and routes complete frames into the per-camera decode
//! pipelines. Duplicate handshake messages are counted and dropped; a
//! second direct connection to the same server guid is closed.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use volcap_capture::codec::CodecFactory;
use volcap_proto::pake::PakeClient;
use volcap_proto::wire::FrameHeader;
use volcap_proto::{Channel, Message};
use volcap_transport::{Connection, ConnectionHandler, ConnectionKeys, KeyBehavior};
use volcap_types::{
    AuthResult, CameraCalibration, CameraExtrinsics, CaptureMode, ConnectResult, StreamState,
    VideoInfo, MAX_CAMERAS,
};

use crate::decode::{BatchMeta, DecodedFrame, DecoderPipeline, FrameInfo};

const CONNECT_NAME_INTERVAL_USEC: u64 = 1_000_000;

/// Latest server status as reported on the control channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusSnapshot {
    pub mode: u8,
    pub capture_status: u8,
    pub camera_count: u32,
    pub camera_status: [u8; MAX_CAMERAS],
}

/// Connection state observable from the client API.
pub struct ConnectionShared {
    pub(crate) conn: Arc<dyn Connection>,
    pub(crate) label: String,
    state: AtomicU8,
    server_guid: AtomicU64,
    authenticated: AtomicBool,
    closed: AtomicBool,
    last_status: Mutex<StatusSnapshot>,
}

impl ConnectionShared {
    pub fn state(&self) -> StreamState {
        match self.state.load(Ordering::SeqCst) {
            1 => StreamState::ServerOffline,
            2 => StreamState::ServerBusy,
            3 => StreamState::Relaying,
            4 => StreamState::Authenticating,
            5 => StreamState::IncorrectPassword,
            6 => StreamState::Live,
            _ => StreamState::Idle,
        }
    }

    fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn server_guid(&self) -> u64 {
        self.server_guid.load(Ordering::SeqCst)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn last_status(&self) -> StatusSnapshot {
        *self.last_status.lock()
    }

    pub fn send_message(&self, channel: Channel, message: &Message) {
        if let Err(e) = self.conn.send(channel, &message.encode()) {
            tracing::error!("{} send failed: {e}", self.label);
        }
    }

    pub fn close(&self) {
        self.conn.close();
    }
}

/// What the handler needs from the owning client.
pub trait ClientContext: Send + Sync {
    fn server_name(&self) -> String;
    fn password(&self) -> String;
    /// Guids of all live connections, for the connect-name ignore list.
    fn known_guids(&self) -> Vec<u64>;
    /// False when another live connection already owns this guid.
    fn check_direct_unique(&self, shared: &Arc<ConnectionShared>) -> bool;
    fn on_decoded_frame(&self, frame: Arc<DecodedFrame>);
    fn on_connection_closed(&self, shared: &Arc<ConnectionShared>);
}

/// Fixed-size buffer filled by chunked messages.
#[derive(Default)]
pub(crate) struct StreamedBuffer {
    pub data: Vec<u8>,
    pub expected: usize,
    pub received: usize,
    pub complete: bool,
}

impl StreamedBuffer {
    fn reset(&mut self, bytes: usize) {
        self.expected = bytes;
        self.received = 0;
        self.data.clear();
        self.data.resize(bytes, 0);
        self.complete = bytes == 0;
    }

    /// Returns true when the buffer just became complete.
    fn accumulate(&mut self, chunk: &[u8]) -> bool {
        if chunk.is_empty() {
            tracing::error!("ignoring empty data");
            return false;
        }
        let remaining = self.expected.saturating_sub(self.received);
        if remaining == 0 {
            tracing::error!("received data after buffer complete");
            return false;
        }
        if chunk.len() > remaining {
            tracing::error!(
                "received too many bytes: remaining={remaining} < bytes={}",
                chunk.len()
            );
            return false;
        }
        self.data[self.received..self.received + chunk.len()].copy_from_slice(chunk);
        self.received += chunk.len();
        if self.received < self.expected {
            return false;
        }
        self.complete = true;
        true
    }
}

struct PendingFrame {
    header: FrameHeader,
    image: StreamedBuffer,
    depth: StreamedBuffer,
}

pub struct CaptureConnection {
    shared: Arc<ConnectionShared>,
    client: Arc<dyn ClientContext>,
    factory: Arc<dyn CodecFactory>,
    pake: Option<PakeClient>,
    hello_count: u32,
    proof_count: u32,
    result_count: u32,
    needs_connect_name: bool,
    last_connect_request_usec: u64,
    batch: Option<Arc<BatchMeta>>,
    video_info: Option<Arc<VideoInfo>>,
    calibration: Vec<Option<Arc<CameraCalibration>>>,
    extrinsics: Vec<Option<Arc<CameraExtrinsics>>>,
    pending: Option<PendingFrame>,
    decoders: Vec<DecoderPipeline>,
}

pub fn spawn_capture_connection(
    client: Arc<dyn ClientContext>,
    factory: Arc<dyn CodecFactory>,
    conn: Arc<dyn Connection>,
) -> (Arc<ConnectionShared>, Box<dyn ConnectionHandler>) {
    let label = format!("[server {}]", conn.remote_label());
    let shared = Arc::new(ConnectionShared {
        conn,
        label,
        state: AtomicU8::new(StreamState::Idle as u8),
        server_guid: AtomicU64::new(0),
        authenticated: AtomicBool::new(false),
        closed: AtomicBool::new(false),
        last_status: Mutex::new(StatusSnapshot::default()),
    });
    let handler = CaptureConnection {
        shared: shared.clone(),
        client,
        factory,
        pake: None,
        hello_count: 0,
        proof_count: 0,
        result_count: 0,
        needs_connect_name: true,
        last_connect_request_usec: 0,
        batch: None,
        video_info: None,
        calibration: vec![None; MAX_CAMERAS],
        extrinsics: vec![None; MAX_CAMERAS],
        pending: None,
        decoders: Vec::new(),
    };
    (shared, Box::new(handler))
}

impl CaptureConnection {
    fn send_connect_name(&self) {
        let msg = Message::ConnectName {
            name: self.client.server_name(),
            ignore_guids: self.client.known_guids(),
        };
        self.shared.send_message(Channel::Rendezvous, &msg);
    }

    fn on_connect_result(&mut self, result: ConnectResult, server_guid: u64) {
        match result {
            ConnectResult::NotFound => {
                // The server may be restarting; keep retrying.
                self.shared.set_state(StreamState::ServerOffline);
            }
            ConnectResult::NotReady => {
                tracing::info!("{} connect result: server not ready", self.shared.label);
                self.shared.set_state(StreamState::ServerBusy);
            }
            ConnectResult::Connecting => {
                tracing::info!(
                    "{} connect result: relaying to capture server",
                    self.shared.label
                );
                self.shared.set_state(StreamState::Relaying);
            }
            ConnectResult::Direct => {
                self.shared.server_guid.store(server_guid, Ordering::SeqCst);
                tracing::info!(
                    "{} connect result: direct connection, guid={server_guid:#018x}",
                    self.shared.label
                );
                if !self.client.check_direct_unique(&self.shared) {
                    tracing::warn!(
                        "{} closing extra connection to the same server",
                        self.shared.label
                    );
                    self.shared.close();
                    return;
                }
                self.shared.set_state(StreamState::Authenticating);
                self.needs_connect_name = false;
            }
            ConnectResult::WrongName => {
                tracing::warn!("{} server rejected our server name", self.shared.label);
                self.shared.set_state(StreamState::ServerOffline);
                self.shared.close();
            }
        }
    }

    fn on_auth_server_hello(&mut self, public_data: &[u8; 36]) {
        let mut pake = PakeClient::new(&self.client.password());
        match pake.step1(public_data) {
            Ok(response1) => {
                self.shared
                    .send_message(Channel::Authentication, &Message::AuthClientReply { response1 });
                self.pake = Some(pake);
            }
            Err(e) => {
                tracing::error!("{} server hello was invalid: {e}", self.shared.label);
                self.shared.close();
            }
        }
    }

    fn on_auth_server_proof(&mut self, response2: &[u8; 64]) {
        let Some(pake) = self.pake.as_mut() else {
            tracing::error!("{} server proof before hello", self.shared.label);
            return;
        };
        match pake.step3(response2) {
            Ok((response3, keys)) => {
                tracing::info!(
                    "{} successfully authenticated: server knows the password",
                    self.shared.label
                );
                // The client encrypts everything from here on.
                self.shared.conn.set_keys(
                    ConnectionKeys {
                        send_key: keys.client_sk,
                        recv_key: keys.server_sk,
                    },
                    KeyBehavior::Immediate,
                );
                self.shared.set_state(StreamState::Live);
                self.shared.authenticated.store(true, Ordering::SeqCst);
                self.shared
                    .send_message(Channel::Authentication, &Message::AuthClientProof { response3 });
            }
            Err(e) => {
                tracing::error!(
                    "{} server password does not match ours: {e}",
                    self.shared.label
                );
                self.shared.set_state(StreamState::IncorrectPassword);
                self.shared.close();
            }
        }
    }

    fn on_auth_result(&mut self, result: AuthResult) {
        match result {
            AuthResult::Accept => {
                tracing::info!("{} server accepted our password", self.shared.label);
            }
            AuthResult::Deny => {
                tracing::info!("{} server denied us access", self.shared.label);
                self.shared.set_state(StreamState::IncorrectPassword);
                self.shared.close();
            }
        }
    }

    fn on_frame_header(&mut self, header: FrameHeader) {
        let (Some(_), Some(_)) = (&self.batch, &self.video_info) else {
            tracing::error!(
                "{} ignoring frame without batch or video info",
                self.shared.label
            );
            return;
        };
        let camera_index = header.camera_index as usize;
        if camera_index >= MAX_CAMERAS {
            tracing::error!("{} frame header camera index out of range", self.shared.label);
            return;
        }
        if self.calibration[camera_index].is_none() {
            tracing::error!(
                "{} ignoring frame without camera calibration",
                self.shared.label
            );
            return;
        }

        let mut pending = PendingFrame {
            header,
            image: StreamedBuffer::default(),
            depth: StreamedBuffer::default(),
        };
        pending.image.reset(header.image_bytes as usize);
        pending.depth.reset(header.depth_bytes as usize);
        if pending.image.complete && pending.depth.complete {
            // Degenerate empty frame; nothing to wait for.
            self.on_frame(pending);
            return;
        }
        self.pending = Some(pending);
    }

    fn on_payload_chunk(&mut self, channel: Channel, data: &[u8]) {
        let Some(pending) = self.pending.as_mut() else {
            tracing::error!("{} ignoring payload data with no header", self.shared.label);
            return;
        };
        let buffer = match channel {
            Channel::Image => &mut pending.image,
            _ => &mut pending.depth,
        };
        buffer.accumulate(data);
        if pending.image.complete && pending.depth.complete {
            let pending = self.pending.take().expect("pending frame present");
            self.on_frame(pending);
        }
    }

    fn on_frame(&mut self, pending: PendingFrame) {
        let batch = self.batch.clone().expect("batch info checked at header");
        let video_info = self.video_info.clone().expect("video info checked");
        let camera_index = pending.header.camera_index as usize;
        let calibration = self.calibration[camera_index]
            .clone()
            .expect("calibration checked at header");

        let camera_count = batch.camera_count as usize;
        if self.decoders.len() != camera_count {
            self.decoders = (0..camera_count)
                .map(|_| DecoderPipeline::new(self.factory.clone()))
                .collect();
        }
        if camera_index >= self.decoders.len() {
            tracing::error!("{} camera index beyond batch camera count", self.shared.label);
            return;
        }

        let status = self.shared.last_status();
        let capture_mode =
            CaptureMode::try_from(status.mode).unwrap_or(CaptureMode::CaptureLowQ);

        let info = Arc::new(FrameInfo {
            guid: self.shared.server_guid(),
            batch,
            video_info,
            calibration,
            extrinsics: self.extrinsics[camera_index].clone(),
            capture_mode,
            header: pending.header,
            image: pending.image.data,
            depth: pending.depth.data,
        });

        let client = self.client.clone();
        self.decoders[camera_index].process(
            info,
            Arc::new(move |decoded| client.on_decoded_frame(decoded)),
        );
    }

    fn on_control(&mut self, message: Message) {
        match message {
            Message::Status {
                mode,
                capture_status,
                camera_count,
                camera_status,
            } => {
                *self.shared.last_status.lock() = StatusSnapshot {
                    mode: mode as u8,
                    capture_status: capture_status as u8,
                    camera_count,
                    camera_status,
                };
            }
            Message::VideoInfo(info) => {
                self.video_info = Some(Arc::new(info));
            }
            Message::BatchInfo(info) => {
                // Convert the sender's boot timeline to ours.
                let video_boot_usec = self.shared.conn.from_remote_time(info.video_boot_usec);
                self.batch = Some(Arc::new(BatchMeta {
                    camera_count: info.camera_count,
                    video_boot_usec,
                    video_epoch_usec: 0,
                }));
            }
            Message::Calibration {
                camera_index,
                calibration,
            } => {
                if (camera_index as usize) < MAX_CAMERAS {
                    tracing::info!(
                        "{} set calibration for camera {camera_index}",
                        self.shared.label
                    );
                    self.calibration[camera_index as usize] = Some(Arc::new(calibration));
                } else {
                    tracing::error!(
                        "{} camera index {camera_index} out of range",
                        self.shared.label
                    );
                }
            }
            Message::Extrinsics {
                camera_index,
                extrinsics,
            } => {
                if (camera_index as usize) < MAX_CAMERAS {
                    tracing::info!(
                        "{} updated extrinsics for camera {camera_index}: identity={}",
                        self.shared.label,
                        extrinsics.is_identity
                    );
                    self.extrinsics[camera_index as usize] = Some(Arc::new(extrinsics));
                }
            }
            Message::FrameHeader(header) => self.on_frame_header(header),
            other => {
                tracing::error!(
                    "{} ignored unexpected control message {:?}",
                    self.shared.label,
                    other.message_type()
                );
            }
        }
    }
}

impl ConnectionHandler for CaptureConnection {
    fn on_connect(&mut self) {
        tracing::info!("{} server connected", self.shared.label);
        // Keep announcing the name until the peer confirms Direct; the
        // peer may be a rendezvous server that needs it repeatedly.
        self.needs_connect_name = true;
    }

    fn on_data(&mut self, channel: Channel, data: &[u8]) {
        let message = match Message::decode(data) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!("{} dropping bad message: {e}", self.shared.label);
                return;
            }
        };
        match (channel, message) {
            (Channel::Rendezvous, Message::ConnectResult {
                result,
                server_guid,
                ..
            }) => self.on_connect_result(result, server_guid),
            (Channel::Authentication, Message::AuthServerHello { public_data }) => {
                self.hello_count += 1;
                if self.hello_count > 1 {
                    tracing::error!(
                        "{} ignoring AuthServerHello #{}",
                        self.shared.label,
                        self.hello_count
                    );
                    return;
                }
                self.on_auth_server_hello(&public_data);
            }
            (Channel::Authentication, Message::AuthServerProof { response2 }) => {
                self.proof_count += 1;
                if self.proof_count > 1 {
                    tracing::error!(
                        "{} ignoring AuthServerProof #{}",
                        self.shared.label,
                        self.proof_count
                    );
                    return;
                }
                self.on_auth_server_proof(&response2);
            }
            (Channel::Authentication, Message::AuthResult { result }) => {
                self.result_count += 1;
                if self.result_count > 1 {
                    tracing::error!(
                        "{} ignoring AuthResult #{}",
                        self.shared.label,
                        self.result_count
                    );
                    return;
                }
                self.on_auth_result(result);
            }
            (channel, message) => {
                tracing::error!(
                    "{} ignored unexpected message {:?} on channel {channel:?}",
                    self.shared.label,
                    message.message_type()
                );
            }
        }
    }

    fn on_secure_data(&mut self, channel: Channel, data: &[u8]) {
        match channel {
            Channel::Control => match Message::decode(data) {
                Ok(message) => self.on_control(message),
                Err(e) => tracing::error!("{} dropping bad message: {e}", self.shared.label),
            },
            Channel::Image | Channel::Depth => self.on_payload_chunk(channel, data),
            // The auth result is the server's first encrypted message.
            Channel::Authentication => match Message::decode(data) {
                Ok(Message::AuthResult { result }) => {
                    self.result_count += 1;
                    if self.result_count > 1 {
                        tracing::error!(
                            "{} ignoring AuthResult #{}",
                            self.shared.label,
                            self.result_count
                        );
                        return;
                    }
                    self.on_auth_result(result);
                }
                Ok(other) => tracing::error!(
                    "{} unsupported auth message {:?}",
                    self.shared.label,
                    other.message_type()
                ),
                Err(e) => tracing::error!("{} dropping bad message: {e}", self.shared.label),
            },
            other => {
                tracing::error!("{} invalid channel {other:?}", self.shared.label);
            }
        }
    }

    fn on_tick(&mut self, now_usec: u64) {
        let due = self.last_connect_request_usec == 0
            || now_usec.saturating_sub(self.last_connect_request_usec) > CONNECT_NAME_INTERVAL_USEC;
        if self.needs_connect_name && due {
            self.last_connect_request_usec = now_usec.max(1);
            self.send_connect_name();
        }
    }

    fn on_close(&mut self) {
        tracing::warn!("{} disconnected from peer", self.shared.label);
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.authenticated.store(false, Ordering::SeqCst);
        self.client.on_connection_closed(&self.shared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streamed_buffer_accumulates_chunks() {
        let mut buffer = StreamedBuffer::default();
        buffer.reset(10);
        assert!(!buffer.accumulate(&[1; 4]));
        assert!(!buffer.accumulate(&[2; 4]));
        assert!(buffer.accumulate(&[3; 2]));
        assert!(buffer.complete);
        assert_eq!(&buffer.data[..4], &[1; 4]);
        assert_eq!(&buffer.data[8..], &[3; 2]);
    }

    #[test]
    fn streamed_buffer_rejects_overflow() {
        let mut buffer = StreamedBuffer::default();
        buffer.reset(4);
        assert!(!buffer.accumulate(&[0; 8]));
        assert_eq!(buffer.received, 0);
    }

    #[test]
    fn zero_length_buffer_is_immediately_complete() {
        let mut buffer = StreamedBuffer::default();
        buffer.reset(0);
        assert!(buffer.complete);
    }
}
