//! Capture server daemon.
//!
//! Drives the attached camera cluster and serves authenticated viewers.
//! With `--synthetic-cameras N` it runs against the software camera and
//! codec, which is useful for bench setups without hardware.

use std::sync::Arc;

use clap::Parser;

use volcap_capture::camera::SyntheticProvider;
use volcap_capture::codec::SoftwareCodecFactory;
use volcap_capture::{BatchProcessor, CaptureManager, RuntimeConfig};
use volcap_proto::{CAPTURE_SERVER_PORT, RENDEZVOUS_SERVER_PORT};
use volcap_server::CaptureServer;
use volcap_transport::loopback::LoopbackNetwork;
use volcap_types::CaptureMode;

#[derive(Parser, Debug)]
#[command(name = "volcap-server", about = "volcap capture server")]
struct Cli {
    /// Server name viewers connect to.
    #[arg(long, default_value = "default")]
    name: String,

    /// Base64 stored password data (see `volcap-server --make-password`).
    #[arg(long, default_value = "")]
    password_data: String,

    /// Generate stored password data for the given password and exit.
    #[arg(long)]
    make_password: Option<String>,

    /// UDP listen port.
    #[arg(long, default_value_t = CAPTURE_SERVER_PORT)]
    port: u16,

    /// Rendezvous server host.
    #[arg(long, default_value = "localhost")]
    rendezvous_host: String,

    /// Rendezvous server port.
    #[arg(long, default_value_t = RENDEZVOUS_SERVER_PORT)]
    rendezvous_port: u16,

    /// Participate in multi-server TDMA scheduling.
    #[arg(long)]
    multi_server: bool,

    /// Use N synthetic cameras instead of real hardware.
    #[arg(long, default_value_t = 2)]
    synthetic_cameras: usize,

    /// Start capturing immediately in this mode (low, high, calibration).
    #[arg(long)]
    mode: Option<String>,

    /// Log file path.
    #[arg(long)]
    log_file: Option<std::path::PathBuf>,
}

fn parse_mode(mode: &str) -> eyre::Result<CaptureMode> {
    Ok(match mode {
        "low" => CaptureMode::CaptureLowQ,
        "high" => CaptureMode::CaptureHighQ,
        "calibration" => CaptureMode::Calibration,
        "disabled" => CaptureMode::Disabled,
        other => eyre::bail!("unknown mode `{other}`"),
    })
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    let _guard = volcap_logging::start(cli.log_file.as_deref(), false)?;

    if let Some(password) = &cli.make_password {
        let stored = volcap_proto::pake::server_store(password);
        println!("{}", volcap_proto::pake::stored_to_base64(&stored));
        return Ok(());
    }

    let network = LoopbackNetwork::new();
    let config = Arc::new(RuntimeConfig::new());

    let server = CaptureServer::new(
        network,
        &cli.name,
        &cli.password_data,
        cli.port,
        Some((cli.rendezvous_host.clone(), cli.rendezvous_port)),
        cli.multi_server,
    )?;

    let broadcast = {
        let server = server.clone();
        Arc::new(move |batch| server.broadcast_video(batch))
    };
    let processor = BatchProcessor::new(config.clone(), Arc::new(SoftwareCodecFactory), broadcast);
    let manager = CaptureManager::new(
        Arc::new(SyntheticProvider::new(cli.synthetic_cameras)),
        config,
        processor,
    );
    server.attach_manager(manager.clone());
    server.start()?;

    if let Some(mode) = &cli.mode {
        manager.set_mode(parse_mode(mode)?);
    }

    tracing::info!("capture server `{}` listening on port {}", cli.name, cli.port);

    let (stop_tx, stop_rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;
    let _ = stop_rx.recv();

    tracing::info!("shutting down");
    manager.set_mode(CaptureMode::Disabled);
    server.shutdown();
    manager.shutdown();
    Ok(())
}
