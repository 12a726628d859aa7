//! In-process transport: connected endpoint pairs over crossbeam channels.
//!
//! Every endpoint runs a pump thread that delivers inbound events to the
//! connection handler and fires `on_tick` every 10 ms. Messages sent after
//! keys are installed carry an HMAC-SHA256 tag; the receiver verifies the
//! tag against its own keys, so two peers that derived different keys (for
//! example from different passwords) observe delivery failure just like a
//! real AEAD transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;

use volcap_util::TerminateFlag;

use crate::{
    Channel, Connection, ConnectionKeys, Error, HandlerFactory, KeyBehavior, Result,
};

type HmacSha256 = Hmac<Sha256>;

enum Event {
    Connected,
    Data {
        channel: Channel,
        data: Vec<u8>,
        tag: Option<[u8; 32]>,
    },
    Close,
}

struct KeyState {
    keys: Option<ConnectionKeys>,
    /// With `WaitForPeer`, encryption of our own sends is deferred until a
    /// verified message arrives from the peer.
    send_active: bool,
}

struct Endpoint {
    label: String,
    peer_tx: crossbeam_channel::Sender<Event>,
    key_state: Mutex<KeyState>,
    terminated: TerminateFlag,
}

impl Endpoint {
    fn compute_tag(key: &[u8; 32], channel: Channel, data: &[u8]) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(key).expect("hmac key length");
        mac.update(&(channel as u32).to_le_bytes());
        mac.update(data);
        mac.finalize().into_bytes().into()
    }
}

impl Connection for Endpoint {
    fn send(&self, channel: Channel, data: &[u8]) -> Result<()> {
        if self.terminated.is_set() {
            return Err(Error::Closed);
        }
        let tag = {
            let state = self.key_state.lock();
            match &state.keys {
                Some(keys) if state.send_active => {
                    Some(Self::compute_tag(&keys.send_key, channel, data))
                }
                _ => None,
            }
        };
        self.peer_tx
            .send(Event::Data {
                channel,
                data: data.to_vec(),
                tag,
            })
            .map_err(|_| Error::Closed)
    }

    fn set_keys(&self, keys: ConnectionKeys, behavior: KeyBehavior) {
        let mut state = self.key_state.lock();
        state.keys = Some(keys);
        state.send_active = matches!(behavior, KeyBehavior::Immediate);
    }

    fn close(&self) {
        if !self.terminated.is_set() {
            self.terminated.set();
            let _ = self.peer_tx.send(Event::Close);
        }
    }

    fn remote_label(&self) -> String {
        self.label.clone()
    }

    fn from_remote_time(&self, remote_boot_usec: u64) -> u64 {
        // Both ends of a loopback pair share the process boot clock.
        remote_boot_usec
    }
}

const TICK_INTERVAL: Duration = Duration::from_millis(10);

fn spawn_pump(
    name: String,
    endpoint: Arc<Endpoint>,
    rx: crossbeam_channel::Receiver<Event>,
    mut factory: impl FnMut(Arc<dyn Connection>) -> Box<dyn crate::ConnectionHandler> + Send + 'static,
) {
    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            let conn: Arc<dyn Connection> = endpoint.clone();
            let mut handler = factory(conn);
            loop {
                match rx.recv_timeout(TICK_INTERVAL) {
                    Ok(Event::Connected) => handler.on_connect(),
                    Ok(Event::Data { channel, data, tag }) => match tag {
                        None => handler.on_data(channel, &data),
                        Some(tag) => {
                            let verified = {
                                let mut state = endpoint.key_state.lock();
                                match &state.keys {
                                    Some(keys) => {
                                        let expected =
                                            Endpoint::compute_tag(&keys.recv_key, channel, &data);
                                        if expected == tag {
                                            // First verified message flips a
                                            // wait-for-peer side to encrypting.
                                            state.send_active = true;
                                            true
                                        } else {
                                            false
                                        }
                                    }
                                    None => false,
                                }
                            };
                            if verified {
                                handler.on_secure_data(channel, &data);
                            } else {
                                tracing::warn!(
                                    "{} dropping undecryptable message on channel {:?}",
                                    endpoint.label,
                                    channel
                                );
                            }
                        }
                    },
                    Ok(Event::Close) => {
                        endpoint.terminated.set();
                        handler.on_close();
                        return;
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        if endpoint.terminated.is_set() {
                            handler.on_close();
                            return;
                        }
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                        handler.on_close();
                        return;
                    }
                }
                handler.on_tick(volcap_util::boot_usec());
            }
        })
        .expect("spawn transport pump");
}

/// In-process network: listeners keyed by port, connections as endpoint
/// pairs.
#[derive(Default)]
pub struct LoopbackNetwork {
    listeners: Mutex<HashMap<u16, HandlerFactory>>,
}

impl crate::Network for LoopbackNetwork {
    fn listen(&self, port: u16, factory: HandlerFactory) {
        LoopbackNetwork::listen(self, port, factory);
    }

    fn stop_listening(&self, port: u16) {
        LoopbackNetwork::stop_listening(self, port);
    }

    fn connect(
        &self,
        _host: &str,
        port: u16,
        factory: HandlerFactory,
    ) -> Result<Arc<dyn Connection>> {
        LoopbackNetwork::connect(self, port, factory)
    }
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a listener. The factory is invoked for every inbound
    /// connection.
    pub fn listen(&self, port: u16, factory: HandlerFactory) {
        self.listeners.lock().insert(port, factory);
    }

    pub fn stop_listening(&self, port: u16) {
        self.listeners.lock().remove(&port);
    }

    /// Connect to a listener, returning the dialer-side connection.
    pub fn connect(&self, port: u16, mut dialer_factory: HandlerFactory) -> Result<Arc<dyn Connection>> {
        let (a_tx, a_rx) = crossbeam_channel::unbounded();
        let (b_tx, b_rx) = crossbeam_channel::unbounded();

        let dialer = Arc::new(Endpoint {
            label: format!("[peer :{port}]"),
            peer_tx: b_tx,
            key_state: Mutex::new(KeyState {
                keys: None,
                send_active: false,
            }),
            terminated: TerminateFlag::new(),
        });
        let listener = Arc::new(Endpoint {
            label: "[peer dialer]".to_string(),
            peer_tx: a_tx.clone(),
            key_state: Mutex::new(KeyState {
                keys: None,
                send_active: false,
            }),
            terminated: TerminateFlag::new(),
        });

        {
            let mut listeners = self.listeners.lock();
            let factory = listeners.get_mut(&port).ok_or(Error::NoListener(port))?;
            let handler = factory(listener.clone());
            let mut handler = Some(handler);
            spawn_pump(
                format!("loopback-accept-{port}"),
                listener,
                b_rx,
                move |_conn| handler.take().expect("factory called once"),
            );
        }

        let handler = dialer_factory(dialer.clone());
        let mut handler = Some(handler);
        spawn_pump(
            format!("loopback-dial-{port}"),
            dialer.clone(),
            a_rx,
            move |_conn| handler.take().expect("factory called once"),
        );

        // Both sides observe the connect event first.
        let _ = a_tx.send(Event::Connected);
        let _ = dialer.peer_tx.send(Event::Connected);

        Ok(dialer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConnectionHandler;
    use std::sync::mpsc;

    struct Echo {
        conn: Arc<dyn Connection>,
    }

    impl ConnectionHandler for Echo {
        fn on_data(&mut self, channel: Channel, data: &[u8]) {
            let mut reply = data.to_vec();
            reply.reverse();
            let _ = self.conn.send(channel, &reply);
        }
        fn on_secure_data(&mut self, channel: Channel, data: &[u8]) {
            self.on_data(channel, data);
        }
    }

    struct Probe {
        tx: mpsc::Sender<(Channel, Vec<u8>, bool)>,
    }

    impl ConnectionHandler for Probe {
        fn on_data(&mut self, channel: Channel, data: &[u8]) {
            let _ = self.tx.send((channel, data.to_vec(), false));
        }
        fn on_secure_data(&mut self, channel: Channel, data: &[u8]) {
            let _ = self.tx.send((channel, data.to_vec(), true));
        }
    }

    #[test]
    fn plaintext_round_trip() {
        let net = LoopbackNetwork::new();
        net.listen(
            1000,
            Box::new(|conn| Box::new(Echo { conn }) as Box<dyn ConnectionHandler>),
        );

        let (tx, rx) = mpsc::channel();
        let conn = net
            .connect(
                1000,
                Box::new(move |_conn| Box::new(Probe { tx: tx.clone() }) as Box<dyn ConnectionHandler>),
            )
            .unwrap();

        conn.send(Channel::Control, b"abc").unwrap();
        let (channel, data, secure) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(channel, Channel::Control);
        assert_eq!(data, b"cba");
        assert!(!secure);
        conn.close();
    }

    #[test]
    fn mismatched_keys_drop_messages() {
        let net = LoopbackNetwork::new();
        let (server_tx, server_rx) = mpsc::channel();
        net.listen(
            1001,
            Box::new(move |conn| {
                conn.set_keys(
                    ConnectionKeys {
                        send_key: [1; 32],
                        recv_key: [2; 32],
                    },
                    KeyBehavior::Immediate,
                );
                Box::new(Probe {
                    tx: server_tx.clone(),
                }) as Box<dyn ConnectionHandler>
            }),
        );

        let (client_tx, _client_rx) = mpsc::channel();
        let conn = net
            .connect(
                1001,
                Box::new(move |_conn| {
                    Box::new(Probe {
                        tx: client_tx.clone(),
                    }) as Box<dyn ConnectionHandler>
                }),
            )
            .unwrap();

        // Client keys do not match what the server expects.
        conn.set_keys(
            ConnectionKeys {
                send_key: [9; 32],
                recv_key: [9; 32],
            },
            KeyBehavior::Immediate,
        );
        conn.send(Channel::Control, b"secret").unwrap();
        assert!(server_rx.recv_timeout(Duration::from_millis(300)).is_err());
        conn.close();
    }

    #[test]
    fn matched_keys_deliver_secure() {
        let net = LoopbackNetwork::new();
        let (server_tx, server_rx) = mpsc::channel();
        net.listen(
            1002,
            Box::new(move |conn| {
                conn.set_keys(
                    ConnectionKeys {
                        send_key: [7; 32],
                        recv_key: [8; 32],
                    },
                    KeyBehavior::WaitForPeer,
                );
                Box::new(Probe {
                    tx: server_tx.clone(),
                }) as Box<dyn ConnectionHandler>
            }),
        );

        let (client_tx, _client_rx) = mpsc::channel();
        let conn = net
            .connect(
                1002,
                Box::new(move |_conn| {
                    Box::new(Probe {
                        tx: client_tx.clone(),
                    }) as Box<dyn ConnectionHandler>
                }),
            )
            .unwrap();

        conn.set_keys(
            ConnectionKeys {
                send_key: [8; 32],
                recv_key: [7; 32],
            },
            KeyBehavior::Immediate,
        );
        conn.send(Channel::Image, b"frame").unwrap();
        let (channel, data, secure) = server_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(channel, Channel::Image);
        assert_eq!(data, b"frame");
        assert!(secure);
        conn.close();
    }
}
