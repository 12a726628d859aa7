//! Wire protocol for the capture server / rendezvous server / viewer client
//! triangle.
//!
//! Message payloads are packed little-endian with a 1-byte type tag first,
//! so they stay bit-compatible with non-Rust peers. The encoding lives in
//! [`wire`]; the password-authenticated key exchange in [`pake`].

pub mod pake;
pub mod wire;

pub use wire::{Message, MessageType};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("message truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("wrong message size: expected {expected} bytes, got {got}")]
    WrongSize { expected: usize, got: usize },
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("{0}")]
    InvalidCode(#[from] volcap_types::InvalidCode),
    #[error("pake: {0}")]
    Pake(#[from] pake::PakeError),
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// UDP listen port for direct capture-server connections.
pub const CAPTURE_SERVER_PORT: u16 = 28772;

/// UDP listen port for the rendezvous server.
pub const RENDEZVOUS_SERVER_PORT: u16 = 28773;

/// Bandwidth limit per connection, bytes per second.
pub const BANDWIDTH_LIMIT_BPS: u32 = 16 * 1000 * 1000;

/// Largest single message on the image/depth channels; frame payloads are
/// chunked to this size.
pub const MAX_CHUNK_BYTES: usize = 16000;

/// Outbound batches queued per viewer connection before dropping.
pub const MAX_QUEUED_BATCHES: usize = 30;

/// Maximum length of a capture server name on the wire.
pub const SERVER_NAME_MAX: usize = 256;

/// Logical transport channels. Rendezvous through depth are reliable and
/// in-order; the unordered channel carries only keyframe requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Channel {
    Rendezvous = 50,
    Authentication = 51,
    Control = 52,
    Image = 53,
    Depth = 54,
    Unordered = 200,
}

/// Sanitize a fixed-size wire name field that may or may not be
/// NUL-terminated.
pub fn sanitize_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end])
        .chars()
        .filter(|c| !c.is_control())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_handles_unterminated_and_control_bytes() {
        let mut raw = [0u8; 8];
        raw[..5].copy_from_slice(b"cam\x01a");
        assert_eq!(sanitize_name(&raw), "cama");
        assert_eq!(sanitize_name(b"abcdefgh"), "abcdefgh");
        assert_eq!(sanitize_name(&[0u8; 4]), "");
    }
}
