//! End-to-end scenarios over the loopback transport with the synthetic
//! camera and reference software codecs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use volcap_capture::camera::SyntheticProvider;
use volcap_capture::codec::SoftwareCodecFactory;
use volcap_capture::{BatchProcessor, CaptureManager, RuntimeConfig};
use volcap_client::CaptureClient;
use volcap_proto::pake::{server_store, stored_to_base64};
use volcap_server::CaptureServer;
use volcap_transport::loopback::LoopbackNetwork;
use volcap_types::{CaptureMode, StreamState};

struct ServerFixture {
    server: Arc<CaptureServer>,
    manager: Arc<CaptureManager>,
}

impl ServerFixture {
    fn start(
        network: &Arc<LoopbackNetwork>,
        name: &str,
        password: &str,
        port: u16,
        cameras: usize,
    ) -> Self {
        let stored = stored_to_base64(&server_store(password));
        let config = Arc::new(RuntimeConfig::new());
        let server =
            CaptureServer::new(network.clone(), name, &stored, port, None, false).unwrap();
        let broadcast = {
            let server = server.clone();
            Arc::new(move |batch| server.broadcast_video(batch))
        };
        let processor =
            BatchProcessor::new(config.clone(), Arc::new(SoftwareCodecFactory), broadcast);
        let manager = CaptureManager::new(
            Arc::new(SyntheticProvider::new(cameras)),
            config,
            processor,
        );
        server.attach_manager(manager.clone());
        server.start().unwrap();
        Self { server, manager }
    }

    fn stop(self) {
        self.manager.set_mode(CaptureMode::Disabled);
        self.server.shutdown();
        self.manager.shutdown();
    }
}

fn wait_until<F: FnMut() -> bool>(what: &str, deadline: Duration, mut check: F) {
    let t0 = Instant::now();
    while !check() {
        assert!(t0.elapsed() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn single_camera_happy_path() {
    let network = LoopbackNetwork::new();
    let fixture = ServerFixture::start(&network, "studio-a", "hunter2", 7101, 1);

    let client = CaptureClient::new(network);
    client.playback_settings(150);
    client.connect("localhost", 7101, "studio-a", "hunter2");

    let mut latest = None;
    wait_until("first decoded batch", Duration::from_secs(30), || {
        client.set_server_capture_mode(CaptureMode::CaptureLowQ);
        let (batch, _status) = client.get();
        if let Some(batch) = batch {
            latest = Some(batch);
            true
        } else {
            false
        }
    });

    let batch = latest.unwrap();
    assert_eq!(batch.frames.len(), 1);
    let frame = &batch.frames[0];

    // The wire payload was real: compressed image and depth bytes flowed.
    assert!(frame.info.header.image_bytes >= 1);
    assert!(frame.info.header.depth_bytes >= 1);
    assert_eq!(frame.info.header.exposure_usec, 10_000);

    // Decoded NV12 frame at the capture resolution.
    let color = frame.color.as_ref().expect("decoded color plane");
    assert_eq!(color.width, 1280);
    assert_eq!(color.height, 720);
    assert_eq!(color.y.len(), 1280 * 720);

    // Regenerated mesh geometry.
    assert!(frame.floats_count() > 0);
    assert!(frame.vertices.iter().any(|&v| v != 0.0));
    assert!(frame.indices_count() > 0);
    assert_eq!(frame.depth_width, 320);
    assert_eq!(frame.depth_height, 288);

    // The stream keeps flowing with monotonic presentation times.
    let first_usec = batch.video_boot_usec;
    let mut next_usec = first_usec;
    wait_until("follow-up batch", Duration::from_secs(20), || {
        let (batch, _status) = client.get();
        match batch {
            Some(batch) if batch.video_boot_usec > first_usec => {
                next_usec = batch.video_boot_usec;
                true
            }
            _ => false,
        }
    });
    assert!(next_usec > first_usec);

    client.shutdown();
    fixture.stop();
}

#[test]
fn wrong_password_is_surfaced_and_connection_closed() {
    let network = LoopbackNetwork::new();
    let fixture = ServerFixture::start(&network, "studio-b", "xyz", 7102, 1);

    let client = CaptureClient::new(network);
    client.connect("localhost", 7102, "studio-b", "abc");

    wait_until("incorrect-password state", Duration::from_secs(20), || {
        let (_batch, status) = client.get();
        status.state == StreamState::IncorrectPassword
    });

    // No frames can have been delivered.
    let (batch, _status) = client.get();
    assert!(batch.is_none());

    client.shutdown();
    fixture.stop();
}

#[test]
fn record_then_play_back() {
    let network = LoopbackNetwork::new();
    let fixture = ServerFixture::start(&network, "studio-c", "pw", 7103, 1);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("take.vcap");

    let client = CaptureClient::new(network.clone());
    client.playback_settings(150);
    client.connect("localhost", 7103, "studio-c", "pw");
    client.record(Some(&path)).unwrap();

    wait_until("live stream", Duration::from_secs(30), || {
        client.set_server_capture_mode(CaptureMode::CaptureLowQ);
        client.get().0.is_some()
    });

    // Unpausing requests a keyframe so the recording starts decodable.
    client.record_pause(false);
    wait_until("recorded batches", Duration::from_secs(30), || {
        client.get_recording_state().video_frame_count >= 5
    });
    // Pause before sampling the counters so no batch lands in between.
    client.record_pause(true);
    let recorded = client.get_recording_state();
    assert!(recorded.video_frame_count >= 5);
    assert!(recorded.file_size_bytes > 0);
    client.record(None).unwrap();
    client.shutdown();
    fixture.stop();

    // The container holds per-camera frames in order, with a keyframe to
    // start decoding from.
    let mut reader = volcap_container::ContainerReader::open(&path).unwrap();
    let mut batch_infos = 0u64;
    let mut frame_numbers = Vec::new();
    let mut keyframes = 0;
    loop {
        match reader.next_event().unwrap() {
            volcap_container::ContainerEvent::EndOfFile => break,
            volcap_container::ContainerEvent::BatchInfo(_) => batch_infos += 1,
            volcap_container::ContainerEvent::Frame(frame) => {
                if frame.back_reference == 0 {
                    keyframes += 1;
                }
                frame_numbers.push(frame.frame_number);
            }
            _ => {}
        }
    }
    assert_eq!(batch_infos, recorded.video_frame_count);
    assert!(keyframes >= 1, "recording must contain a sync point");
    for pair in frame_numbers.windows(2) {
        assert!(pair[0] < pair[1], "frame numbers must stay ordered");
    }

    // Play the file back through a fresh client.
    let playback_client = CaptureClient::new(LoopbackNetwork::new());
    playback_client.playback_settings(100);
    assert!(playback_client.playback_read_file(&path));
    playback_client.playback_tricks(false, false);

    wait_until("playback frames", Duration::from_secs(30), || {
        playback_client.get().0.is_some()
    });
    wait_until("playback EOF", Duration::from_secs(30), || {
        playback_client.get_playback_state().video_frame >= batch_infos
    });
    let state = playback_client.get_playback_state();
    assert_eq!(state.video_frame, batch_infos);

    playback_client.shutdown();
}

#[test]
fn keyframe_cadence_on_the_wire() {
    let network = LoopbackNetwork::new();
    let fixture = ServerFixture::start(&network, "studio-d", "", 7104, 1);

    let client = CaptureClient::new(network);
    client.playback_settings(100);
    client.connect("localhost", 7104, "studio-d", "");

    // Collect presented frames for a bit over two seconds of stream time.
    let mut seen: Vec<(u32, i32)> = Vec::new();
    let t0 = Instant::now();
    while t0.elapsed() < Duration::from_secs(8) {
        client.set_server_capture_mode(CaptureMode::CaptureLowQ);
        if let (Some(batch), _) = client.get() {
            for frame in &batch.frames {
                let key = (frame.info.header.frame_number, frame.info.header.back_reference);
                if seen.last() != Some(&key) {
                    seen.push(key);
                }
            }
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    let keyframes = seen.iter().filter(|(_, backref)| *backref == 0).count();
    let p_frames = seen.iter().filter(|(_, backref)| *backref == -1).count();
    assert!(keyframes >= 1, "at least the opening keyframe");
    assert!(p_frames > keyframes, "P-frames dominate at a 1 s cadence");

    client.shutdown();
    fixture.stop();
}
