//! Capture server <-> rendezvous server integration over loopback.

use std::sync::Arc;
use std::time::{Duration, Instant};

use volcap_capture::camera::SyntheticProvider;
use volcap_capture::codec::SoftwareCodecFactory;
use volcap_capture::{BatchProcessor, CaptureManager, RuntimeConfig};
use volcap_rendezvous::RendezvousServer;
use volcap_server::CaptureServer;
use volcap_transport::loopback::LoopbackNetwork;
use volcap_types::{CaptureMode, CaptureStatus};

fn wait_until<F: FnMut() -> bool>(what: &str, deadline: Duration, mut check: F) {
    let t0 = Instant::now();
    while !check() {
        assert!(t0.elapsed() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn multi_server_capture_waits_for_tdma_slots() {
    let network = LoopbackNetwork::new();

    let rendezvous = RendezvousServer::new(network.clone(), 7300);
    rendezvous.start();

    let config = Arc::new(RuntimeConfig::new());
    let server = CaptureServer::new(
        network.clone(),
        "rig-1",
        "",
        7301,
        Some(("localhost".to_string(), 7300)),
        true,
    )
    .unwrap();
    let broadcast = {
        let server = server.clone();
        Arc::new(move |batch| server.broadcast_video(batch))
    };
    let processor = BatchProcessor::new(config.clone(), Arc::new(SoftwareCodecFactory), broadcast);
    let manager = CaptureManager::new(Arc::new(SyntheticProvider::new(2)), config, processor);
    server.attach_manager(manager.clone());
    server.start().unwrap();

    // Registration and the TDMA request both ride the background tick.
    wait_until("registration", Duration::from_secs(15), || {
        rendezvous.registered_count() == 1
    });
    wait_until("TDMA slots", Duration::from_secs(15), || {
        manager.tdma_slot_count() == 2
    });

    // With slots assigned, multi-server capture can start.
    manager.set_mode(CaptureMode::CaptureLowQ);
    wait_until("capturing", Duration::from_secs(15), || {
        manager.status() == CaptureStatus::Capturing
    });

    manager.set_mode(CaptureMode::Disabled);
    server.shutdown();
    manager.shutdown();
    rendezvous.shutdown();
}
