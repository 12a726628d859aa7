//! Shared data model for the volcap capture platform.
//!
//! These types are used on both sides of the wire and inside the container
//! file format. The wire and file representations themselves live in
//! `volcap-proto` and `volcap-container`; everything here is the in-memory
//! form.

use serde::{Deserialize, Serialize};

/// Maximum number of cameras attached to one capture host.
pub const MAX_CAMERAS: usize = 8;

#[derive(thiserror::Error, Debug)]
#[error("invalid {what} code {code}")]
pub struct InvalidCode {
    pub what: &'static str,
    pub code: u32,
}

/// Uniquely identifies a camera in a multi-server rig.
///
/// The guid is random per capture-server process start; the index is 0-based
/// in deterministic order per host. Stable for the lifetime of one capture
/// server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CameraIdentity {
    pub server_guid: u64,
    pub camera_index: u32,
}

impl CameraIdentity {
    pub fn new(server_guid: u64, camera_index: u32) -> Self {
        Self {
            server_guid,
            camera_index,
        }
    }
}

/// Lens distortion model for intrinsics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u32)]
pub enum LensModel {
    #[default]
    Unknown = 0,
    Theta = 1,
    Poly3K = 2,
    Rational6KT = 3,
    BrownConrady = 4,
}

impl TryFrom<u32> for LensModel {
    type Error = InvalidCode;
    fn try_from(code: u32) -> Result<Self, InvalidCode> {
        Ok(match code {
            0 => LensModel::Unknown,
            1 => LensModel::Theta,
            2 => LensModel::Poly3K,
            3 => LensModel::Rational6KT,
            4 => LensModel::BrownConrady,
            code => {
                return Err(InvalidCode {
                    what: "lens model",
                    code,
                })
            }
        })
    }
}

/// Intrinsic parameters for one sensor (color or depth).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub width: i32,
    pub height: i32,
    pub lens_model: LensModel,
    pub cx: f32,
    pub cy: f32,
    pub fx: f32,
    pub fy: f32,
    pub k: [f32; 6],
    pub codx: f32,
    pub cody: f32,
    pub p1: f32,
    pub p2: f32,
}

/// Full calibration for one camera.
///
/// `rotation_from_depth`/`translation_from_depth` map a 3D point in the
/// depth sensor frame to the color sensor frame: `Q = P * R + T`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CameraCalibration {
    pub color: CameraIntrinsics,
    pub depth: CameraIntrinsics,
    pub rotation_from_depth: [f32; 9],
    pub translation_from_depth: [f32; 3],
}

/// Rigid transform from a camera mesh frame into the shared scene frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraExtrinsics {
    pub is_identity: bool,
    /// Row-major 4x4. Ignored when `is_identity` is set.
    pub transform: [f32; 16],
}

impl Default for CameraExtrinsics {
    fn default() -> Self {
        Self {
            is_identity: true,
            transform: IDENTITY_TRANSFORM,
        }
    }
}

pub const IDENTITY_TRANSFORM: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// Color/depth codec selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum VideoType {
    /// Used for depth compression only.
    Lossless = 0,
    H264 = 1,
    H265 = 2,
}

impl TryFrom<u8> for VideoType {
    type Error = InvalidCode;
    fn try_from(code: u8) -> Result<Self, InvalidCode> {
        Ok(match code {
            0 => VideoType::Lossless,
            1 => VideoType::H264,
            2 => VideoType::H265,
            code => {
                return Err(InvalidCode {
                    what: "video type",
                    code: code.into(),
                })
            }
        })
    }
}

/// Capture mode requested by the operator or a viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum CaptureMode {
    #[default]
    Disabled = 0,
    Calibration = 1,
    CaptureLowQ = 2,
    CaptureHighQ = 3,
}

impl TryFrom<u8> for CaptureMode {
    type Error = InvalidCode;
    fn try_from(code: u8) -> Result<Self, InvalidCode> {
        Ok(match code {
            0 => CaptureMode::Disabled,
            1 => CaptureMode::Calibration,
            2 => CaptureMode::CaptureLowQ,
            3 => CaptureMode::CaptureHighQ,
            code => {
                return Err(InvalidCode {
                    what: "capture mode",
                    code: code.into(),
                })
            }
        })
    }
}

impl std::fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CaptureMode::Disabled => "Disabled",
            CaptureMode::Calibration => "Calibration",
            CaptureMode::CaptureLowQ => "CaptureLowQ",
            CaptureMode::CaptureHighQ => "CaptureHighQ",
        };
        f.write_str(name)
    }
}

/// Overall capture-host status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum CaptureStatus {
    #[default]
    Idle = 0,
    Initializing = 1,
    Capturing = 2,
    NoCameras = 3,
    BadUsbConnection = 4,
    FirmwareVersionMismatch = 5,
    SyncCableMisconfigured = 6,
}

impl CaptureStatus {
    /// True for the states that abort start-up.
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            CaptureStatus::Idle | CaptureStatus::Initializing | CaptureStatus::Capturing
        )
    }
}

impl TryFrom<u8> for CaptureStatus {
    type Error = InvalidCode;
    fn try_from(code: u8) -> Result<Self, InvalidCode> {
        Ok(match code {
            0 => CaptureStatus::Idle,
            1 => CaptureStatus::Initializing,
            2 => CaptureStatus::Capturing,
            3 => CaptureStatus::NoCameras,
            4 => CaptureStatus::BadUsbConnection,
            5 => CaptureStatus::FirmwareVersionMismatch,
            6 => CaptureStatus::SyncCableMisconfigured,
            code => {
                return Err(InvalidCode {
                    what: "capture status",
                    code: code.into(),
                })
            }
        })
    }
}

/// Per-camera status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum CameraStatus {
    #[default]
    Idle = 0,
    Initializing = 1,
    StartFailed = 2,
    Capturing = 3,
    ReadFailed = 4,
    SlowWarning = 5,
}

impl TryFrom<u8> for CameraStatus {
    type Error = InvalidCode;
    fn try_from(code: u8) -> Result<Self, InvalidCode> {
        Ok(match code {
            0 => CameraStatus::Idle,
            1 => CameraStatus::Initializing,
            2 => CameraStatus::StartFailed,
            3 => CameraStatus::Capturing,
            4 => CameraStatus::ReadFailed,
            5 => CameraStatus::SlowWarning,
            code => {
                return Err(InvalidCode {
                    what: "camera status",
                    code: code.into(),
                })
            }
        })
    }
}

/// Result of a viewer's connect-by-name attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectResult {
    NotFound = 0,
    NotReady = 1,
    Connecting = 2,
    /// Already on the right server.
    Direct = 3,
    /// Server name does not match.
    WrongName = 4,
}

impl TryFrom<u8> for ConnectResult {
    type Error = InvalidCode;
    fn try_from(code: u8) -> Result<Self, InvalidCode> {
        Ok(match code {
            0 => ConnectResult::NotFound,
            1 => ConnectResult::NotReady,
            2 => ConnectResult::Connecting,
            3 => ConnectResult::Direct,
            4 => ConnectResult::WrongName,
            code => {
                return Err(InvalidCode {
                    what: "connect result",
                    code: code.into(),
                })
            }
        })
    }
}

/// Result of password authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AuthResult {
    Deny = 0,
    Accept = 1,
}

impl TryFrom<u8> for AuthResult {
    type Error = InvalidCode;
    fn try_from(code: u8) -> Result<Self, InvalidCode> {
        Ok(match code {
            0 => AuthResult::Deny,
            1 => AuthResult::Accept,
            code => {
                return Err(InvalidCode {
                    what: "auth result",
                    code: code.into(),
                })
            }
        })
    }
}

/// Client-visible stream state, ordered so that the most severe state across
/// connections can be aggregated with `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum StreamState {
    #[default]
    Idle = 0,
    ServerOffline = 1,
    ServerBusy = 2,
    Relaying = 3,
    Authenticating = 4,
    IncorrectPassword = 5,
    Live = 6,
}

/// Compression settings applied on the capture server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionSettings {
    pub color_bitrate: u32,
    /// 1-51, 1 = best.
    pub color_quality: u8,
    pub color_video: VideoType,
    /// Always lossless in calibration mode regardless of this setting.
    pub depth_video: VideoType,
    /// 0 disables, 1-100 enables.
    pub denoise_pct: u8,
    /// Temporal stabilization filter. Always on in calibration mode.
    pub stabilization_filter: bool,
    /// Removes low-confidence boundary pixels to reduce inter-camera seams.
    pub edge_filter: bool,
    /// Removes nearfield objects from the backdrop. Close-up captures only.
    pub face_painting_fix: bool,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            color_bitrate: 4_000_000,
            color_quality: 25,
            color_video: VideoType::H264,
            depth_video: VideoType::Lossless,
            denoise_pct: 100,
            stabilization_filter: true,
            edge_filter: true,
            face_painting_fix: false,
        }
    }
}

/// Cylindrical clip region request, in scene coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClipSettings {
    pub enabled: bool,
    pub radius_m: f32,
    pub floor_m: f32,
    pub ceiling_m: f32,
}

impl Default for ClipSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            radius_m: 1.5,
            floor_m: -0.5,
            ceiling_m: 2.2,
        }
    }
}

/// A clip request resolved against one camera's extrinsics, ready for the
/// mesher to cull against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipRegion {
    /// Row-major 4x4 transform into the scene frame.
    pub extrinsics: [f32; 16],
    pub radius: f32,
    pub floor: f32,
    pub ceiling: f32,
}

/// Exposure control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureSettings {
    pub auto_enabled: bool,
    pub exposure_usec: u32,
    pub awb_usec: u32,
}

impl Default for ExposureSettings {
    fn default() -> Self {
        Self {
            auto_enabled: true,
            exposure_usec: 0,
            awb_usec: 0,
        }
    }
}

/// Per-camera lighting correction applied by the video encoder ProcAmp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LightingSettings {
    /// -100.0 to +100.0.
    pub brightness: f32,
    /// 0.0 to 10.0.
    pub saturation: f32,
}

impl Default for LightingSettings {
    fn default() -> Self {
        Self {
            brightness: 0.0,
            saturation: 1.0,
        }
    }
}

/// Parameters of the coded color video stream.
///
/// Changes bump the video-info epoch; each connection resends this before
/// the first batch that follows the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub video_type: VideoType,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub bitrate: u32,
}

impl Default for VideoInfo {
    fn default() -> Self {
        Self {
            video_type: VideoType::H264,
            width: 0,
            height: 0,
            framerate: 0,
            bitrate: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_codes_round_trip() {
        for code in 0..=4u8 {
            let r = ConnectResult::try_from(code).unwrap();
            assert_eq!(r as u8, code);
        }
        for code in 0..=3u8 {
            let m = CaptureMode::try_from(code).unwrap();
            assert_eq!(m as u8, code);
        }
        for code in 0..=6u8 {
            let s = CaptureStatus::try_from(code).unwrap();
            assert_eq!(s as u8, code);
        }
        assert!(VideoType::try_from(3).is_err());
        assert!(CaptureMode::try_from(4).is_err());
    }

    #[test]
    fn stream_state_orders_by_severity() {
        assert!(StreamState::Live > StreamState::Authenticating);
        assert!(StreamState::IncorrectPassword > StreamState::ServerOffline);
        assert_eq!(
            StreamState::Idle.max(StreamState::Authenticating),
            StreamState::Authenticating
        );
    }

    #[test]
    fn identity_extrinsics_default() {
        let e = CameraExtrinsics::default();
        assert!(e.is_identity);
        assert_eq!(e.transform, IDENTITY_TRANSFORM);
    }
}
