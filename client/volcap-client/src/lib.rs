//! Viewer client core.
//!
//! Bytes flow `transport -> per-camera decode pipeline -> dejitter queue ->
//! frame delivery`, with optional recording to a container file and
//! playback of recorded containers through the same dejitter queue.

pub mod api;
pub mod connection;
pub mod decode;
pub mod dejitter;
pub mod playback;
pub mod recorder;

pub use api::{CaptureClient, ClientStatus, PlaybackState, RecordingState};
pub use decode::{DecodedFrame, FrameInfo};
pub use dejitter::{DecodedBatch, DejitterQueue};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("transport: {0}")]
    Transport(#[from] volcap_transport::Error),
    #[error("container: {0}")]
    Container(#[from] volcap_container::Error),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("not connected")]
    NotConnected,
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}
