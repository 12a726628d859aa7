//! Outbound link from a capture server to the rendezvous server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use volcap_proto::{Channel, Message};
use volcap_transport::{Connection, ConnectionHandler, Network};

use crate::CaptureServer;

pub(crate) struct RendezvousLink {
    conn: Arc<dyn Connection>,
    alive: Arc<AtomicBool>,
}

impl RendezvousLink {
    pub(crate) fn connect(
        server: &Arc<CaptureServer>,
        host: &str,
        port: u16,
    ) -> volcap_transport::Result<Self> {
        let alive = Arc::new(AtomicBool::new(true));
        let handler_alive = alive.clone();
        let handler_server = server.clone();
        let conn = server.network.connect(
            host,
            port,
            Box::new(move |conn| {
                Box::new(RendezvousHandler {
                    server: handler_server.clone(),
                    conn,
                    alive: handler_alive.clone(),
                })
            }),
        )?;
        Ok(Self { conn, alive })
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn request_tdma(&self, camera_count: u8) {
        let msg = Message::RequestTdma { camera_count };
        if let Err(e) = self.conn.send(Channel::Rendezvous, &msg.encode()) {
            tracing::error!("TDMA request failed: {e}");
        }
    }
}

impl Drop for RendezvousLink {
    fn drop(&mut self) {
        self.conn.close();
    }
}

struct RendezvousHandler {
    server: Arc<CaptureServer>,
    conn: Arc<dyn Connection>,
    alive: Arc<AtomicBool>,
}

impl ConnectionHandler for RendezvousHandler {
    fn on_connect(&mut self) {
        tracing::info!("rendezvous server connected; registering `{}`", self.server.name());
        let msg = Message::RegisterCaptureServer {
            name: self.server.name().to_string(),
            guid: self.server.guid(),
        };
        if let Err(e) = self.conn.send(Channel::Rendezvous, &msg.encode()) {
            tracing::error!("capture server registration failed: {e}");
        }
    }

    fn on_data(&mut self, channel: Channel, data: &[u8]) {
        if channel != Channel::Rendezvous {
            return;
        }
        match Message::decode(data) {
            Ok(Message::AssignTdma { offsets }) => {
                tracing::info!(
                    "got TDMA slot assignment from rendezvous server: count={}",
                    offsets.len()
                );
                self.server.on_tdma_assignment(offsets);
            }
            Ok(other) => {
                tracing::info!(
                    "unexpected message {:?} from rendezvous server",
                    other.message_type()
                );
            }
            Err(e) => tracing::error!("bad rendezvous message: {e}"),
        }
    }

    fn on_secure_data(&mut self, _channel: Channel, _data: &[u8]) {
        // The rendezvous link is unauthenticated; nothing arrives here.
    }

    fn on_close(&mut self) {
        tracing::warn!("disconnected from rendezvous server");
        self.alive.store(false, Ordering::SeqCst);
        self.server.on_rendezvous_closed();
    }
}
