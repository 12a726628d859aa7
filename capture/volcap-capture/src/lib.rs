//! Capture-host core.
//!
//! Frames flow `camera driver -> frame matcher -> per-camera compression
//! pipeline -> batch callback`. The network front (`volcap-server`) sits on
//! the far side of the batch callback.

pub mod camera;
pub mod clock;
pub mod codec;
pub mod config;
pub mod depth;
pub mod device;
pub mod manager;
pub mod mesh;
pub mod nal;
pub mod pipeline;

pub use camera::{CameraFrame, CameraProvider, CameraSettings, ColorFormat, RgbdCamera, SyncMode};
pub use config::RuntimeConfig;
pub use device::{CaptureDevice, RawFrame};
pub use manager::{BatchCallback, CaptureManager};
pub use pipeline::{Batch, BatchProcessor, FrameOutput};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("camera: {0}")]
    Camera(String),
    #[error("camera read timeout")]
    Timeout,
    #[error("codec: {0}")]
    Codec(String),
    #[error("depth payload corrupt: {0}")]
    DepthCorrupt(&'static str),
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Camera(msg.to_string())
    }
}
