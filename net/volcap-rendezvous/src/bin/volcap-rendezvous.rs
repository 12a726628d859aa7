//! Rendezvous server daemon.

use clap::Parser;

use volcap_proto::RENDEZVOUS_SERVER_PORT;
use volcap_rendezvous::RendezvousServer;
use volcap_transport::loopback::LoopbackNetwork;

#[derive(Parser, Debug)]
#[command(name = "volcap-rendezvous", about = "volcap rendezvous server")]
struct Cli {
    /// UDP listen port.
    #[arg(long, default_value_t = RENDEZVOUS_SERVER_PORT)]
    port: u16,

    /// Log file path.
    #[arg(long)]
    log_file: Option<std::path::PathBuf>,
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    let _guard = volcap_logging::start(cli.log_file.as_deref(), false)?;

    let network = LoopbackNetwork::new();
    let server = RendezvousServer::new(network, cli.port);
    server.start();

    let (stop_tx, stop_rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;
    let _ = stop_rx.recv();

    server.shutdown();
    Ok(())
}
