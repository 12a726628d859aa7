//! Rendezvous server.
//!
//! Keeps the name -> capture-server registry and arbitrates TDMA slots so
//! depth-camera laser pulses from different hosts do not interfere. Once a
//! viewer reaches its capture server directly, the rendezvous server is out
//! of the data path entirely.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use volcap_proto::{Channel, Message};
use volcap_transport::{Connection, ConnectionHandler, Network};
use volcap_types::ConnectResult;

/// One registered capture server.
struct Registration {
    /// Connection identity used for reclamation.
    link_id: u64,
    name: String,
    guid: u64,
    tdma_slots: Vec<i16>,
}

#[derive(Default)]
struct Registry {
    servers: Vec<Registration>,
}

impl Registry {
    fn find_by_name(&self, name: &str) -> Option<&Registration> {
        self.servers
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
    }

    fn find_by_link(&mut self, link_id: u64) -> Option<&mut Registration> {
        self.servers.iter_mut().find(|r| r.link_id == link_id)
    }

    /// Allocate `count` slots not used by any registered server. Slots
    /// spread around zero: 0, -1, 1, -2, 2, ...
    fn allocate_slots(&self, count: usize) -> Vec<i16> {
        let used: Vec<i16> = self
            .servers
            .iter()
            .flat_map(|r| r.tdma_slots.iter().copied())
            .collect();
        let mut slots = Vec::with_capacity(count);
        let mut index = 0usize;
        while slots.len() < count {
            let candidate = spread(index);
            index += 1;
            if !used.contains(&candidate) && !slots.contains(&candidate) {
                slots.push(candidate);
            }
        }
        slots
    }
}

fn spread(index: usize) -> i16 {
    let half = (index / 2) as i16;
    if index % 2 == 0 {
        half
    } else {
        -(half + 1)
    }
}

pub struct RendezvousServer {
    port: u16,
    network: Arc<dyn Network>,
    registry: Arc<Mutex<Registry>>,
    next_link_id: Arc<AtomicU64>,
}

impl RendezvousServer {
    pub fn new(network: Arc<dyn Network>, port: u16) -> Arc<Self> {
        Arc::new(Self {
            port,
            network,
            registry: Arc::new(Mutex::new(Registry::default())),
            next_link_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let registry = self.registry.clone();
        let next_link_id = self.next_link_id.clone();
        self.network.listen(
            self.port,
            Box::new(move |conn| {
                Box::new(PeerHandler {
                    conn,
                    registry: registry.clone(),
                    link_id: next_link_id.fetch_add(1, Ordering::SeqCst),
                })
            }),
        );
        tracing::info!("rendezvous server listening on port {}", self.port);
    }

    pub fn shutdown(&self) {
        self.network.stop_listening(self.port);
    }

    pub fn registered_count(&self) -> usize {
        self.registry.lock().servers.len()
    }
}

struct PeerHandler {
    conn: Arc<dyn Connection>,
    registry: Arc<Mutex<Registry>>,
    link_id: u64,
}

impl PeerHandler {
    fn send(&self, message: &Message) {
        if let Err(e) = self.conn.send(Channel::Rendezvous, &message.encode()) {
            tracing::error!("rendezvous send failed: {e}");
        }
    }

    fn on_register(&mut self, name: String, guid: u64) {
        let mut registry = self.registry.lock();
        // A restarted server re-registers under the same name with a fresh
        // guid; the newest registration wins.
        registry
            .servers
            .retain(|r| !r.name.eq_ignore_ascii_case(&name));
        tracing::info!("registered capture server `{name}` guid={guid:#018x}");
        registry.servers.push(Registration {
            link_id: self.link_id,
            name,
            guid,
            tdma_slots: Vec::new(),
        });
    }

    fn on_request_tdma(&mut self, camera_count: u8) {
        let mut registry = self.registry.lock();
        if registry.find_by_link(self.link_id).is_none() {
            tracing::warn!("TDMA request from unregistered peer");
            return;
        }
        // Release this server's old slots before allocating the new set.
        if let Some(registration) = registry.find_by_link(self.link_id) {
            registration.tdma_slots.clear();
        }
        let slots = registry.allocate_slots(camera_count as usize);
        if let Some(registration) = registry.find_by_link(self.link_id) {
            registration.tdma_slots = slots.clone();
            tracing::info!(
                "assigned TDMA slots {slots:?} to `{}`",
                registration.name
            );
        }
        drop(registry);
        self.send(&Message::AssignTdma { offsets: slots });
    }

    fn on_connect_name(&mut self, name: String, ignore_guids: Vec<u64>) {
        let registry = self.registry.lock();
        match registry.find_by_name(&name) {
            Some(registration) if !ignore_guids.contains(&registration.guid) => {
                // Relay brokering is the transport's peer-to-peer upgrade;
                // the registry's contribution ends at naming the guid.
                self.send(&Message::ConnectResult {
                    result: ConnectResult::Connecting,
                    server_count: registry.servers.len() as u16,
                    server_guid: registration.guid,
                });
            }
            Some(_) => {
                self.send(&Message::ConnectResult {
                    result: ConnectResult::NotReady,
                    server_count: registry.servers.len() as u16,
                    server_guid: 0,
                });
            }
            None => {
                self.send(&Message::ConnectResult {
                    result: ConnectResult::NotFound,
                    server_count: registry.servers.len() as u16,
                    server_guid: 0,
                });
            }
        }
    }
}

impl ConnectionHandler for PeerHandler {
    fn on_data(&mut self, channel: Channel, data: &[u8]) {
        if channel != Channel::Rendezvous {
            tracing::error!("unexpected channel {channel:?} at rendezvous server");
            return;
        }
        match Message::decode(data) {
            Ok(Message::RegisterCaptureServer { name, guid }) => self.on_register(name, guid),
            Ok(Message::RequestTdma { camera_count }) => self.on_request_tdma(camera_count),
            Ok(Message::ConnectName { name, ignore_guids }) => {
                self.on_connect_name(name, ignore_guids)
            }
            Ok(other) => tracing::error!(
                "unsupported rendezvous message {:?}",
                other.message_type()
            ),
            Err(e) => tracing::error!("bad rendezvous message: {e}"),
        }
    }

    fn on_secure_data(&mut self, _channel: Channel, _data: &[u8]) {
        // The rendezvous protocol is unauthenticated by design.
    }

    fn on_close(&mut self) {
        let mut registry = self.registry.lock();
        let before = registry.servers.len();
        registry.servers.retain(|r| r.link_id != self.link_id);
        if registry.servers.len() != before {
            tracing::info!("capture server disconnected; slots reclaimed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_spread_is_distinct_and_centered() {
        let slots: Vec<i16> = (0..5).map(spread).collect();
        assert_eq!(slots, vec![0, -1, 1, -2, 2]);
    }

    #[test]
    fn allocation_avoids_used_slots() {
        let mut registry = Registry::default();
        registry.servers.push(Registration {
            link_id: 1,
            name: "a".into(),
            guid: 1,
            tdma_slots: vec![0, -1],
        });
        let slots = registry.allocate_slots(3);
        assert_eq!(slots.len(), 3);
        for slot in &slots {
            assert!(![0i16, -1].contains(slot));
        }
    }
}
