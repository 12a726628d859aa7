//! Packed little-endian message codec.
//!
//! Every message starts with a 1-byte type tag. Fixed-size messages are
//! rejected when the payload length does not match exactly; the two
//! variable-length messages (`ConnectName`, `AssignTdma`) carry their own
//! element counts.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use volcap_types::{
    AuthResult, CameraCalibration, CameraExtrinsics, CameraIntrinsics, CaptureMode, CaptureStatus,
    CompressionSettings, ConnectResult, LensModel, VideoInfo, VideoType, MAX_CAMERAS,
};

use crate::pake::{PUBLIC_DATA_BYTES, RESPONSE1_BYTES, RESPONSE2_BYTES, RESPONSE3_BYTES};
use crate::{sanitize_name, Error, Result, SERVER_NAME_MAX};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    RegisterCaptureServer = 0,
    RequestTdma = 1,
    AssignTdma = 2,
    ConnectName = 3,
    ConnectResult = 4,
    AuthServerHello = 5,
    AuthClientReply = 6,
    AuthServerProof = 7,
    AuthClientProof = 8,
    AuthResult = 9,
    RequestKeyframe = 10,
    SetMode = 11,
    SetExposure = 12,
    SetClip = 13,
    SetCompression = 14,
    SetLighting = 15,
    Status = 16,
    Calibration = 17,
    Extrinsics = 18,
    VideoInfo = 19,
    BatchInfo = 20,
    FrameHeader = 21,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;
    fn try_from(tag: u8) -> Result<Self> {
        use MessageType::*;
        Ok(match tag {
            0 => RegisterCaptureServer,
            1 => RequestTdma,
            2 => AssignTdma,
            3 => ConnectName,
            4 => ConnectResult,
            5 => AuthServerHello,
            6 => AuthClientReply,
            7 => AuthServerProof,
            8 => AuthClientProof,
            9 => AuthResult,
            10 => RequestKeyframe,
            11 => SetMode,
            12 => SetExposure,
            13 => SetClip,
            14 => SetCompression,
            15 => SetLighting,
            16 => Status,
            17 => Calibration,
            18 => Extrinsics,
            19 => VideoInfo,
            20 => BatchInfo,
            21 => FrameHeader,
            other => return Err(Error::UnknownType(other)),
        })
    }
}

/// Frame metadata preceding the chunked image/depth bytes of one camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameHeader {
    /// Unique incrementing number for each frame of the camera.
    pub frame_number: u32,
    /// 0 for a standalone keyframe, -1 when the immediately prior frame
    /// from the same camera is referenced.
    pub back_reference: i32,
    pub is_final_frame: bool,
    pub camera_index: u32,
    pub accelerometer: [f32; 3],
    pub image_bytes: u32,
    pub depth_bytes: u32,
    pub exposure_usec: u32,
    pub awb_usec: u32,
    pub iso_speed: u32,
    pub brightness: f32,
    pub saturation: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchInfo {
    /// Maximum number of camera frames that might follow.
    pub camera_count: u32,
    /// Shutter time in microseconds since boot of the sending server.
    pub video_boot_usec: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    RegisterCaptureServer {
        name: String,
        guid: u64,
    },
    RequestTdma {
        camera_count: u8,
    },
    AssignTdma {
        offsets: Vec<i16>,
    },
    ConnectName {
        name: String,
        ignore_guids: Vec<u64>,
    },
    ConnectResult {
        result: ConnectResult,
        server_count: u16,
        server_guid: u64,
    },
    AuthServerHello {
        public_data: [u8; PUBLIC_DATA_BYTES],
    },
    AuthClientReply {
        response1: [u8; RESPONSE1_BYTES],
    },
    AuthServerProof {
        response2: [u8; RESPONSE2_BYTES],
    },
    AuthClientProof {
        response3: [u8; RESPONSE3_BYTES],
    },
    AuthResult {
        result: AuthResult,
    },
    RequestKeyframe,
    SetMode {
        mode: CaptureMode,
    },
    SetExposure {
        auto_enabled: bool,
        exposure_usec: u32,
        awb_usec: u32,
    },
    SetClip {
        enabled: bool,
        radius_m: f32,
        floor_m: f32,
        ceiling_m: f32,
    },
    SetCompression {
        settings: CompressionSettings,
    },
    SetLighting {
        camera_index: i32,
        brightness: f32,
        saturation: f32,
    },
    Status {
        mode: CaptureMode,
        capture_status: CaptureStatus,
        camera_count: u32,
        camera_status: [u8; MAX_CAMERAS],
    },
    Calibration {
        camera_index: u32,
        calibration: CameraCalibration,
    },
    Extrinsics {
        camera_index: u32,
        extrinsics: CameraExtrinsics,
    },
    VideoInfo(VideoInfo),
    BatchInfo(BatchInfo),
    FrameHeader(FrameHeader),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        use Message::*;
        match self {
            RegisterCaptureServer { .. } => MessageType::RegisterCaptureServer,
            RequestTdma { .. } => MessageType::RequestTdma,
            AssignTdma { .. } => MessageType::AssignTdma,
            ConnectName { .. } => MessageType::ConnectName,
            ConnectResult { .. } => MessageType::ConnectResult,
            AuthServerHello { .. } => MessageType::AuthServerHello,
            AuthClientReply { .. } => MessageType::AuthClientReply,
            AuthServerProof { .. } => MessageType::AuthServerProof,
            AuthClientProof { .. } => MessageType::AuthClientProof,
            AuthResult { .. } => MessageType::AuthResult,
            RequestKeyframe => MessageType::RequestKeyframe,
            SetMode { .. } => MessageType::SetMode,
            SetExposure { .. } => MessageType::SetExposure,
            SetClip { .. } => MessageType::SetClip,
            SetCompression { .. } => MessageType::SetCompression,
            SetLighting { .. } => MessageType::SetLighting,
            Status { .. } => MessageType::Status,
            Calibration { .. } => MessageType::Calibration,
            Extrinsics { .. } => MessageType::Extrinsics,
            VideoInfo(_) => MessageType::VideoInfo,
            BatchInfo(_) => MessageType::BatchInfo,
            FrameHeader(_) => MessageType::FrameHeader,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.push(self.message_type() as u8);
        // Writes to Vec cannot fail.
        self.encode_body(&mut buf).expect("vec write");
        buf
    }

    fn encode_body(&self, w: &mut Vec<u8>) -> std::io::Result<()> {
        use Message::*;
        match self {
            RegisterCaptureServer { name, guid } => {
                write_name(w, name)?;
                w.write_u64::<LittleEndian>(*guid)?;
            }
            RequestTdma { camera_count } => {
                w.write_u8(*camera_count)?;
            }
            AssignTdma { offsets } => {
                w.write_u8(offsets.len() as u8)?;
                for offset in offsets {
                    w.write_i16::<LittleEndian>(*offset)?;
                }
            }
            ConnectName { name, ignore_guids } => {
                write_name(w, name)?;
                w.write_u16::<LittleEndian>(ignore_guids.len() as u16)?;
                for guid in ignore_guids {
                    w.write_u64::<LittleEndian>(*guid)?;
                }
            }
            ConnectResult {
                result,
                server_count,
                server_guid,
            } => {
                w.write_u8(*result as u8)?;
                w.write_u16::<LittleEndian>(*server_count)?;
                w.write_u64::<LittleEndian>(*server_guid)?;
            }
            AuthServerHello { public_data } => w.write_all(public_data)?,
            AuthClientReply { response1 } => w.write_all(response1)?,
            AuthServerProof { response2 } => w.write_all(response2)?,
            AuthClientProof { response3 } => w.write_all(response3)?,
            AuthResult { result } => w.write_u8(*result as u8)?,
            RequestKeyframe => {}
            SetMode { mode } => w.write_u8(*mode as u8)?,
            SetExposure {
                auto_enabled,
                exposure_usec,
                awb_usec,
            } => {
                w.write_i32::<LittleEndian>(i32::from(*auto_enabled))?;
                w.write_u32::<LittleEndian>(*exposure_usec)?;
                w.write_u32::<LittleEndian>(*awb_usec)?;
            }
            SetClip {
                enabled,
                radius_m,
                floor_m,
                ceiling_m,
            } => {
                w.write_i32::<LittleEndian>(i32::from(*enabled))?;
                w.write_f32::<LittleEndian>(*radius_m)?;
                w.write_f32::<LittleEndian>(*floor_m)?;
                w.write_f32::<LittleEndian>(*ceiling_m)?;
            }
            SetCompression { settings } => {
                w.write_u32::<LittleEndian>(settings.color_bitrate)?;
                w.write_u8(settings.color_quality)?;
                w.write_u8(settings.color_video as u8)?;
                w.write_u8(settings.depth_video as u8)?;
                w.write_u8(settings.denoise_pct)?;
                w.write_u8(u8::from(settings.stabilization_filter))?;
                w.write_u8(u8::from(settings.edge_filter))?;
                w.write_u8(u8::from(settings.face_painting_fix))?;
            }
            SetLighting {
                camera_index,
                brightness,
                saturation,
            } => {
                w.write_i32::<LittleEndian>(*camera_index)?;
                w.write_f32::<LittleEndian>(*brightness)?;
                w.write_f32::<LittleEndian>(*saturation)?;
            }
            Status {
                mode,
                capture_status,
                camera_count,
                camera_status,
            } => {
                w.write_u8(*mode as u8)?;
                w.write_u8(*capture_status as u8)?;
                w.write_u32::<LittleEndian>(*camera_count)?;
                w.write_all(camera_status)?;
            }
            Calibration {
                camera_index,
                calibration,
            } => {
                w.write_u32::<LittleEndian>(*camera_index)?;
                write_calibration(w, calibration)?;
            }
            Extrinsics {
                camera_index,
                extrinsics,
            } => {
                w.write_u32::<LittleEndian>(*camera_index)?;
                w.write_i32::<LittleEndian>(i32::from(extrinsics.is_identity))?;
                for v in extrinsics.transform {
                    w.write_f32::<LittleEndian>(v)?;
                }
            }
            VideoInfo(info) => {
                w.write_u8(info.video_type as u8)?;
                w.write_u32::<LittleEndian>(info.width)?;
                w.write_u32::<LittleEndian>(info.height)?;
                w.write_u32::<LittleEndian>(info.framerate)?;
                w.write_u32::<LittleEndian>(info.bitrate)?;
            }
            BatchInfo(info) => {
                w.write_u32::<LittleEndian>(info.camera_count)?;
                w.write_u64::<LittleEndian>(info.video_boot_usec)?;
            }
            FrameHeader(h) => {
                w.write_u32::<LittleEndian>(h.frame_number)?;
                w.write_i32::<LittleEndian>(h.back_reference)?;
                w.write_u8(u8::from(h.is_final_frame))?;
                w.write_u32::<LittleEndian>(h.camera_index)?;
                for v in h.accelerometer {
                    w.write_f32::<LittleEndian>(v)?;
                }
                w.write_u32::<LittleEndian>(h.image_bytes)?;
                w.write_u32::<LittleEndian>(h.depth_bytes)?;
                w.write_u32::<LittleEndian>(h.exposure_usec)?;
                w.write_u32::<LittleEndian>(h.awb_usec)?;
                w.write_u32::<LittleEndian>(h.iso_speed)?;
                w.write_f32::<LittleEndian>(h.brightness)?;
                w.write_f32::<LittleEndian>(h.saturation)?;
            }
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Message> {
        if data.is_empty() {
            return Err(Error::Truncated { need: 1, have: 0 });
        }
        let message_type = MessageType::try_from(data[0])?;
        let body = &data[1..];

        if let Some(expected) = fixed_body_size(message_type) {
            if body.len() != expected {
                return Err(Error::WrongSize {
                    expected: expected + 1,
                    got: data.len(),
                });
            }
        }

        let mut r = Cursor::new(body);
        use MessageType as T;
        let msg = match message_type {
            T::RegisterCaptureServer => {
                let name = read_name(&mut r)?;
                let guid = r.read_u64::<LittleEndian>()?;
                Message::RegisterCaptureServer { name, guid }
            }
            T::RequestTdma => Message::RequestTdma {
                camera_count: r.read_u8()?,
            },
            T::AssignTdma => {
                let count = r.read_u8()? as usize;
                if body.len() != 1 + count * 2 {
                    return Err(Error::WrongSize {
                        expected: 2 + count * 2,
                        got: data.len(),
                    });
                }
                let mut offsets = Vec::with_capacity(count);
                for _ in 0..count {
                    offsets.push(r.read_i16::<LittleEndian>()?);
                }
                Message::AssignTdma { offsets }
            }
            T::ConnectName => {
                let name = read_name(&mut r)?;
                let count = r.read_u16::<LittleEndian>()? as usize;
                if body.len() != SERVER_NAME_MAX + 2 + count * 8 {
                    return Err(Error::WrongSize {
                        expected: 1 + SERVER_NAME_MAX + 2 + count * 8,
                        got: data.len(),
                    });
                }
                let mut ignore_guids = Vec::with_capacity(count);
                for _ in 0..count {
                    ignore_guids.push(r.read_u64::<LittleEndian>()?);
                }
                Message::ConnectName { name, ignore_guids }
            }
            T::ConnectResult => Message::ConnectResult {
                result: ConnectResult::try_from(r.read_u8()?)?,
                server_count: r.read_u16::<LittleEndian>()?,
                server_guid: r.read_u64::<LittleEndian>()?,
            },
            T::AuthServerHello => {
                let mut public_data = [0u8; PUBLIC_DATA_BYTES];
                r.read_exact(&mut public_data)?;
                Message::AuthServerHello { public_data }
            }
            T::AuthClientReply => {
                let mut response1 = [0u8; RESPONSE1_BYTES];
                r.read_exact(&mut response1)?;
                Message::AuthClientReply { response1 }
            }
            T::AuthServerProof => {
                let mut response2 = [0u8; RESPONSE2_BYTES];
                r.read_exact(&mut response2)?;
                Message::AuthServerProof { response2 }
            }
            T::AuthClientProof => {
                let mut response3 = [0u8; RESPONSE3_BYTES];
                r.read_exact(&mut response3)?;
                Message::AuthClientProof { response3 }
            }
            T::AuthResult => Message::AuthResult {
                result: AuthResult::try_from(r.read_u8()?)?,
            },
            T::RequestKeyframe => Message::RequestKeyframe,
            T::SetMode => Message::SetMode {
                mode: CaptureMode::try_from(r.read_u8()?)?,
            },
            T::SetExposure => Message::SetExposure {
                auto_enabled: r.read_i32::<LittleEndian>()? != 0,
                exposure_usec: r.read_u32::<LittleEndian>()?,
                awb_usec: r.read_u32::<LittleEndian>()?,
            },
            T::SetClip => Message::SetClip {
                enabled: r.read_i32::<LittleEndian>()? != 0,
                radius_m: r.read_f32::<LittleEndian>()?,
                floor_m: r.read_f32::<LittleEndian>()?,
                ceiling_m: r.read_f32::<LittleEndian>()?,
            },
            T::SetCompression => Message::SetCompression {
                settings: CompressionSettings {
                    color_bitrate: r.read_u32::<LittleEndian>()?,
                    color_quality: r.read_u8()?,
                    color_video: VideoType::try_from(r.read_u8()?)?,
                    depth_video: VideoType::try_from(r.read_u8()?)?,
                    denoise_pct: r.read_u8()?,
                    stabilization_filter: r.read_u8()? != 0,
                    edge_filter: r.read_u8()? != 0,
                    face_painting_fix: r.read_u8()? != 0,
                },
            },
            T::SetLighting => Message::SetLighting {
                camera_index: r.read_i32::<LittleEndian>()?,
                brightness: r.read_f32::<LittleEndian>()?,
                saturation: r.read_f32::<LittleEndian>()?,
            },
            T::Status => {
                let mode = CaptureMode::try_from(r.read_u8()?)?;
                let capture_status = CaptureStatus::try_from(r.read_u8()?)?;
                let camera_count = r.read_u32::<LittleEndian>()?;
                let mut camera_status = [0u8; MAX_CAMERAS];
                r.read_exact(&mut camera_status)?;
                Message::Status {
                    mode,
                    capture_status,
                    camera_count,
                    camera_status,
                }
            }
            T::Calibration => Message::Calibration {
                camera_index: r.read_u32::<LittleEndian>()?,
                calibration: read_calibration(&mut r)?,
            },
            T::Extrinsics => {
                let camera_index = r.read_u32::<LittleEndian>()?;
                let is_identity = r.read_i32::<LittleEndian>()? != 0;
                let mut transform = [0f32; 16];
                for v in transform.iter_mut() {
                    *v = r.read_f32::<LittleEndian>()?;
                }
                Message::Extrinsics {
                    camera_index,
                    extrinsics: CameraExtrinsics {
                        is_identity,
                        transform,
                    },
                }
            }
            T::VideoInfo => Message::VideoInfo(VideoInfo {
                video_type: VideoType::try_from(r.read_u8()?)?,
                width: r.read_u32::<LittleEndian>()?,
                height: r.read_u32::<LittleEndian>()?,
                framerate: r.read_u32::<LittleEndian>()?,
                bitrate: r.read_u32::<LittleEndian>()?,
            }),
            T::BatchInfo => Message::BatchInfo(BatchInfo {
                camera_count: r.read_u32::<LittleEndian>()?,
                video_boot_usec: r.read_u64::<LittleEndian>()?,
            }),
            T::FrameHeader => {
                let frame_number = r.read_u32::<LittleEndian>()?;
                let back_reference = r.read_i32::<LittleEndian>()?;
                let is_final_frame = r.read_u8()? != 0;
                let camera_index = r.read_u32::<LittleEndian>()?;
                let mut accelerometer = [0f32; 3];
                for v in accelerometer.iter_mut() {
                    *v = r.read_f32::<LittleEndian>()?;
                }
                Message::FrameHeader(FrameHeader {
                    frame_number,
                    back_reference,
                    is_final_frame,
                    camera_index,
                    accelerometer,
                    image_bytes: r.read_u32::<LittleEndian>()?,
                    depth_bytes: r.read_u32::<LittleEndian>()?,
                    exposure_usec: r.read_u32::<LittleEndian>()?,
                    awb_usec: r.read_u32::<LittleEndian>()?,
                    iso_speed: r.read_u32::<LittleEndian>()?,
                    brightness: r.read_f32::<LittleEndian>()?,
                    saturation: r.read_f32::<LittleEndian>()?,
                })
            }
        };
        Ok(msg)
    }
}

const INTRINSICS_BYTES: usize = 68;
const CALIBRATION_BYTES: usize = 2 * INTRINSICS_BYTES + 9 * 4 + 3 * 4;

/// Body size (excluding the tag byte) for fixed-size messages.
fn fixed_body_size(message_type: MessageType) -> Option<usize> {
    use MessageType as T;
    Some(match message_type {
        T::RegisterCaptureServer => SERVER_NAME_MAX + 8,
        T::RequestTdma => 1,
        T::AssignTdma | T::ConnectName => return None,
        T::ConnectResult => 1 + 2 + 8,
        T::AuthServerHello => PUBLIC_DATA_BYTES,
        T::AuthClientReply => RESPONSE1_BYTES,
        T::AuthServerProof => RESPONSE2_BYTES,
        T::AuthClientProof => RESPONSE3_BYTES,
        T::AuthResult => 1,
        T::RequestKeyframe => 0,
        T::SetMode => 1,
        T::SetExposure => 12,
        T::SetClip => 16,
        T::SetCompression => 11,
        T::SetLighting => 12,
        T::Status => 2 + 4 + MAX_CAMERAS,
        T::Calibration => 4 + CALIBRATION_BYTES,
        T::Extrinsics => 4 + 4 + 64,
        T::VideoInfo => 1 + 16,
        T::BatchInfo => 12,
        T::FrameHeader => 53,
    })
}

fn write_name(w: &mut Vec<u8>, name: &str) -> std::io::Result<()> {
    let mut field = [0u8; SERVER_NAME_MAX];
    let bytes = name.as_bytes();
    let len = bytes.len().min(SERVER_NAME_MAX - 1);
    field[..len].copy_from_slice(&bytes[..len]);
    w.write_all(&field)
}

fn read_name(r: &mut Cursor<&[u8]>) -> Result<String> {
    let mut field = [0u8; SERVER_NAME_MAX];
    r.read_exact(&mut field)?;
    Ok(sanitize_name(&field))
}

fn write_intrinsics(w: &mut Vec<u8>, i: &CameraIntrinsics) -> std::io::Result<()> {
    w.write_i32::<LittleEndian>(i.width)?;
    w.write_i32::<LittleEndian>(i.height)?;
    w.write_u32::<LittleEndian>(i.lens_model as u32)?;
    w.write_f32::<LittleEndian>(i.cx)?;
    w.write_f32::<LittleEndian>(i.cy)?;
    w.write_f32::<LittleEndian>(i.fx)?;
    w.write_f32::<LittleEndian>(i.fy)?;
    for k in i.k {
        w.write_f32::<LittleEndian>(k)?;
    }
    w.write_f32::<LittleEndian>(i.codx)?;
    w.write_f32::<LittleEndian>(i.cody)?;
    w.write_f32::<LittleEndian>(i.p1)?;
    w.write_f32::<LittleEndian>(i.p2)
}

fn read_intrinsics(r: &mut Cursor<&[u8]>) -> Result<CameraIntrinsics> {
    let width = r.read_i32::<LittleEndian>()?;
    let height = r.read_i32::<LittleEndian>()?;
    let lens_model = LensModel::try_from(r.read_u32::<LittleEndian>()?)?;
    let cx = r.read_f32::<LittleEndian>()?;
    let cy = r.read_f32::<LittleEndian>()?;
    let fx = r.read_f32::<LittleEndian>()?;
    let fy = r.read_f32::<LittleEndian>()?;
    let mut k = [0f32; 6];
    for v in k.iter_mut() {
        *v = r.read_f32::<LittleEndian>()?;
    }
    Ok(CameraIntrinsics {
        width,
        height,
        lens_model,
        cx,
        cy,
        fx,
        fy,
        k,
        codx: r.read_f32::<LittleEndian>()?,
        cody: r.read_f32::<LittleEndian>()?,
        p1: r.read_f32::<LittleEndian>()?,
        p2: r.read_f32::<LittleEndian>()?,
    })
}

pub(crate) fn write_calibration(w: &mut Vec<u8>, c: &CameraCalibration) -> std::io::Result<()> {
    write_intrinsics(w, &c.color)?;
    write_intrinsics(w, &c.depth)?;
    for v in c.rotation_from_depth {
        w.write_f32::<LittleEndian>(v)?;
    }
    for v in c.translation_from_depth {
        w.write_f32::<LittleEndian>(v)?;
    }
    Ok(())
}

pub(crate) fn read_calibration(r: &mut Cursor<&[u8]>) -> Result<CameraCalibration> {
    let color = read_intrinsics(r)?;
    let depth = read_intrinsics(r)?;
    let mut rotation_from_depth = [0f32; 9];
    for v in rotation_from_depth.iter_mut() {
        *v = r.read_f32::<LittleEndian>()?;
    }
    let mut translation_from_depth = [0f32; 3];
    for v in translation_from_depth.iter_mut() {
        *v = r.read_f32::<LittleEndian>()?;
    }
    Ok(CameraCalibration {
        color,
        depth,
        rotation_from_depth,
        translation_from_depth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) -> Message {
        Message::decode(&msg.encode()).unwrap()
    }

    #[test]
    fn fixed_sizes_match_layout() {
        // Sizes are part of the protocol; a change here breaks peers.
        assert_eq!(
            Message::Status {
                mode: CaptureMode::Disabled,
                capture_status: CaptureStatus::Idle,
                camera_count: 0,
                camera_status: [0; MAX_CAMERAS],
            }
            .encode()
            .len(),
            15
        );
        assert_eq!(
            Message::FrameHeader(FrameHeader {
                frame_number: 0,
                back_reference: 0,
                is_final_frame: false,
                camera_index: 0,
                accelerometer: [0.0; 3],
                image_bytes: 0,
                depth_bytes: 0,
                exposure_usec: 0,
                awb_usec: 0,
                iso_speed: 0,
                brightness: 0.0,
                saturation: 1.0,
            })
            .encode()
            .len(),
            54
        );
        assert_eq!(
            Message::BatchInfo(BatchInfo {
                camera_count: 1,
                video_boot_usec: 2,
            })
            .encode()
            .len(),
            13
        );
        assert_eq!(
            Message::Calibration {
                camera_index: 0,
                calibration: CameraCalibration::default(),
            }
            .encode()
            .len(),
            1 + 4 + 184
        );
        assert_eq!(
            Message::AuthServerHello {
                public_data: [0; PUBLIC_DATA_BYTES]
            }
            .encode()
            .len(),
            37
        );
        assert_eq!(Message::RequestKeyframe.encode().len(), 1);
    }

    #[test]
    fn connect_name_round_trips_with_guids() {
        let msg = Message::ConnectName {
            name: "studio-a".into(),
            ignore_guids: vec![1, 0xdead_beef_0000_0001],
        };
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn assign_tdma_round_trips() {
        let msg = Message::AssignTdma {
            offsets: vec![2, 1, 0, -1],
        };
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn frame_header_round_trips() {
        let msg = Message::FrameHeader(FrameHeader {
            frame_number: 42,
            back_reference: -1,
            is_final_frame: true,
            camera_index: 3,
            accelerometer: [0.5, -9.8, 0.25],
            image_bytes: 100,
            depth_bytes: 200,
            exposure_usec: 10_000,
            awb_usec: 4500,
            iso_speed: 800,
            brightness: 10.0,
            saturation: 1.5,
        });
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn calibration_round_trips() {
        let mut calibration = CameraCalibration::default();
        calibration.color.width = 1280;
        calibration.color.height = 720;
        calibration.color.fx = 601.5;
        calibration.color.lens_model = LensModel::BrownConrady;
        calibration.depth.width = 320;
        calibration.depth.height = 288;
        calibration.rotation_from_depth[0] = 1.0;
        calibration.translation_from_depth = [0.032, 0.0, 0.0];
        let msg = Message::Calibration {
            camera_index: 2,
            calibration,
        };
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn wrong_size_is_rejected() {
        let mut bytes = Message::RequestTdma { camera_count: 4 }.encode();
        bytes.push(0);
        assert!(matches!(
            Message::decode(&bytes),
            Err(Error::WrongSize { .. })
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(matches!(
            Message::decode(&[200, 0, 0]),
            Err(Error::UnknownType(200))
        ));
    }

    #[test]
    fn overlong_name_is_truncated_not_panicking() {
        let long: String = std::iter::repeat('x').take(400).collect();
        let msg = Message::ConnectName {
            name: long,
            ignore_guids: vec![],
        };
        match round_trip(msg) {
            Message::ConnectName { name, .. } => assert_eq!(name.len(), SERVER_NAME_MAX - 1),
            other => panic!("unexpected {other:?}"),
        }
    }
}
