//! Headless viewer.
//!
//! Connects to a capture server, optionally records the stream, or plays a
//! recorded container. Useful for soak tests and debugging a rig without a
//! rendering front-end.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;

use volcap_client::CaptureClient;
use volcap_proto::CAPTURE_SERVER_PORT;
use volcap_transport::loopback::LoopbackNetwork;
use volcap_types::CaptureMode;

#[derive(Parser, Debug)]
#[command(name = "volcap-viewer", about = "headless volcap viewer client")]
struct Cli {
    /// Capture server host.
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Capture server port.
    #[arg(long, default_value_t = CAPTURE_SERVER_PORT)]
    port: u16,

    /// Capture server name.
    #[arg(long, default_value = "default")]
    name: String,

    /// Access password.
    #[arg(long, default_value = "")]
    password: String,

    /// Record the stream to this container file.
    #[arg(long)]
    record: Option<PathBuf>,

    /// Play back this container instead of connecting.
    #[arg(long)]
    playback: Option<PathBuf>,

    /// Loop playback at end of file.
    #[arg(long)]
    loop_playback: bool,

    /// Dejitter queue depth in milliseconds.
    #[arg(long, default_value_t = 500)]
    dejitter_msec: u32,

    /// How long to run before exiting, in seconds. 0 runs until ctrl-c.
    #[arg(long, default_value_t = 0)]
    duration_sec: u64,

    /// Request this capture mode once live (low, high, calibration).
    #[arg(long)]
    mode: Option<String>,
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    let _guard = volcap_logging::init();

    let network = LoopbackNetwork::new();
    let client = CaptureClient::new(network);
    client.playback_settings(cli.dejitter_msec);

    if let Some(path) = &cli.playback {
        if !client.playback_read_file(path) {
            eyre::bail!("could not open {}", path.display());
        }
        client.playback_tricks(false, cli.loop_playback);
    } else {
        client.connect(&cli.host, cli.port, &cli.name, &cli.password);
        if let Some(path) = &cli.record {
            client.record(Some(path))?;
            client.record_pause(false);
        }
    }

    let (stop_tx, stop_rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;

    let started = Instant::now();
    let mut last_report = Instant::now();
    let mut frames_seen = 0u64;
    loop {
        if stop_rx.recv_timeout(Duration::from_millis(100)).is_ok() {
            break;
        }
        if cli.duration_sec > 0 && started.elapsed() >= Duration::from_secs(cli.duration_sec) {
            break;
        }

        if let Some(mode) = &cli.mode {
            let mode = match mode.as_str() {
                "high" => CaptureMode::CaptureHighQ,
                "calibration" => CaptureMode::Calibration,
                _ => CaptureMode::CaptureLowQ,
            };
            // Coalesced internally; retried until a server is live.
            client.set_server_capture_mode(mode);
        }

        let (batch, status) = client.get();
        if let Some(batch) = batch {
            frames_seen += 1;
            if last_report.elapsed() > Duration::from_secs(2) {
                last_report = Instant::now();
                tracing::info!(
                    "state={:?} perspectives={} t={} usec frames={}",
                    status.state,
                    batch.frames.len(),
                    batch.video_boot_usec,
                    frames_seen
                );
            }
        } else if last_report.elapsed() > Duration::from_secs(2) {
            last_report = Instant::now();
            tracing::info!("state={:?} waiting for frames...", status.state);
        }
    }

    let playback = client.get_playback_state();
    let recording = client.get_recording_state();
    tracing::info!(
        "exiting: playback frame={} recording frames={} bytes={}",
        playback.video_frame,
        recording.video_frame_count,
        recording.file_size_bytes
    );
    client.shutdown();
    Ok(())
}
