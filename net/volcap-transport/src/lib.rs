//! Transport interface between the volcap core and its reliable-UDP engine.
//!
//! The real engine (congestion control, FEC, NAT traversal, AEAD) is an
//! external collaborator. The core only needs the surface defined here:
//! multiple logical channels, on-demand symmetric keying, and a tick
//! callback. [`loopback`] provides a faithful in-process implementation used
//! by tests and single-host demos; it authenticates "encrypted" messages
//! with an HMAC tag so that key disagreement is observable exactly like a
//! failed AEAD open.

use std::sync::Arc;

pub mod loopback;

pub use volcap_proto::Channel;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("connection closed")]
    Closed,
    #[error("no listener on port {0}")]
    NoListener(u16),
    #[error("send queue full")]
    SendQueueFull,
}

/// Which symmetric key a side sends with once keys are installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    Client,
    Server,
}

/// How installed keys take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyBehavior {
    /// Encrypt everything sent from now on.
    Immediate,
    /// Keep keys staged until the peer sends a message that verifies, then
    /// switch fully. Used by the handshake responder so an in-flight
    /// plaintext message cannot kill the connection.
    WaitForPeer,
}

/// Symmetric keys installed on a connection, as derived by the PAKE.
#[derive(Clone)]
pub struct ConnectionKeys {
    pub send_key: [u8; 32],
    pub recv_key: [u8; 32],
}

/// One connection to a peer.
pub trait Connection: Send + Sync {
    /// Queue one message on a logical channel. Stream-internal order is
    /// preserved for the reliable channels.
    fn send(&self, channel: Channel, data: &[u8]) -> Result<()>;

    /// Install symmetric keys. After this, outbound traffic is encrypted
    /// (subject to `behavior`) and inbound encrypted traffic is delivered
    /// through `on_secure_data`.
    fn set_keys(&self, keys: ConnectionKeys, behavior: KeyBehavior);

    /// Begin closing. `on_close` fires on the handler afterwards.
    fn close(&self);

    /// Human-readable remote address for log lines.
    fn remote_label(&self) -> String;

    /// Convert a peer boot-relative timestamp to the local boot timeline.
    fn from_remote_time(&self, remote_boot_usec: u64) -> u64;
}

/// Callbacks delivered by the transport thread for one connection.
///
/// All methods are invoked from a single transport-owned thread, never
/// concurrently, in the order events occurred.
pub trait ConnectionHandler: Send {
    fn on_connect(&mut self) {}

    /// Plaintext message (pre-handshake channels).
    fn on_data(&mut self, channel: Channel, data: &[u8]);

    /// Message that arrived encrypted and verified against the installed
    /// keys.
    fn on_secure_data(&mut self, channel: Channel, data: &[u8]);

    /// Called roughly every 10 ms.
    fn on_tick(&mut self, _now_usec: u64) {}

    fn on_close(&mut self) {}
}

/// Builds a handler for a newly established connection.
pub type HandlerFactory =
    Box<dyn FnMut(Arc<dyn Connection>) -> Box<dyn ConnectionHandler> + Send>;

/// The dial/listen surface of a transport engine.
pub trait Network: Send + Sync {
    /// Register a listener; the factory runs once per inbound connection.
    fn listen(&self, port: u16, factory: HandlerFactory);

    fn stop_listening(&self, port: u16);

    /// Dial a peer. The loopback engine ignores `host`.
    fn connect(&self, host: &str, port: u16, factory: HandlerFactory)
        -> Result<Arc<dyn Connection>>;
}
