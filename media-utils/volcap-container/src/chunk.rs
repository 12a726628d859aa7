//! Chunk-level encode/decode.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use volcap_types::{
    CameraCalibration, CameraExtrinsics, CameraIdentity, CameraIntrinsics, LensModel, VideoInfo,
    VideoType, IDENTITY_TRANSFORM,
};

use crate::{Error, FileBatchInfo, FileFrame, Result};

pub const CHUNK_HEADER_BYTES: usize = 8;

const INTRINSICS_BYTES: usize = 68;
const IDENTITY_BYTES: usize = 12;
pub const CALIBRATION_BODY_BYTES: usize = IDENTITY_BYTES + 2 * INTRINSICS_BYTES + 36 + 12;
pub const EXTRINSICS_BODY_BYTES: usize = IDENTITY_BYTES + 36 + 12;
pub const VIDEO_INFO_BODY_BYTES: usize = IDENTITY_BYTES + 20;
pub const BATCH_INFO_BODY_BYTES: usize = 20;
pub const FRAME_HEADER_BODY_BYTES: usize = 61;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChunkType {
    Calibration = 0,
    Extrinsics = 1,
    VideoInfo = 2,
    BatchInfo = 3,
    Frame = 4,
}

impl ChunkType {
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => ChunkType::Calibration,
            1 => ChunkType::Extrinsics,
            2 => ChunkType::VideoInfo,
            3 => ChunkType::BatchInfo,
            4 => ChunkType::Frame,
            _ => return None,
        })
    }
}

pub fn write_chunk_header<W: Write>(w: &mut W, chunk_type: ChunkType, length: usize) -> Result<()> {
    w.write_u32::<LittleEndian>(length as u32)?;
    w.write_u32::<LittleEndian>(chunk_type as u32)?;
    Ok(())
}

fn write_identity<W: Write>(w: &mut W, identity: &CameraIdentity) -> Result<()> {
    w.write_u64::<LittleEndian>(identity.server_guid)?;
    w.write_u32::<LittleEndian>(identity.camera_index)?;
    Ok(())
}

fn read_identity(r: &mut Cursor<&[u8]>) -> Result<CameraIdentity> {
    Ok(CameraIdentity {
        server_guid: r.read_u64::<LittleEndian>()?,
        camera_index: r.read_u32::<LittleEndian>()?,
    })
}

fn write_intrinsics<W: Write>(w: &mut W, i: &CameraIntrinsics) -> Result<()> {
    w.write_i32::<LittleEndian>(i.width)?;
    w.write_i32::<LittleEndian>(i.height)?;
    w.write_u32::<LittleEndian>(i.lens_model as u32)?;
    for v in [i.cx, i.cy, i.fx, i.fy] {
        w.write_f32::<LittleEndian>(v)?;
    }
    for v in i.k {
        w.write_f32::<LittleEndian>(v)?;
    }
    for v in [i.codx, i.cody, i.p1, i.p2] {
        w.write_f32::<LittleEndian>(v)?;
    }
    Ok(())
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

pub fn write_calibration<W: Write>(
    w: &mut W,
    identity: &CameraIdentity,
    calibration: &CameraCalibration,
) -> Result<()> {
    write_chunk_header(w, ChunkType::Calibration, CALIBRATION_BODY_BYTES)?;
    write_identity(w, identity)?;
    write_intrinsics(w, &calibration.color)?;
    write_intrinsics(w, &calibration.depth)?;
    for v in calibration.rotation_from_depth {
        w.write_f32::<LittleEndian>(v)?;
    }
    for v in calibration.translation_from_depth {
        w.write_f32::<LittleEndian>(v)?;
    }
    Ok(())
}

pub fn read_calibration(body: &[u8]) -> Result<(CameraIdentity, CameraCalibration)> {
    let mut r = Cursor::new(body);
    let identity = read_identity(&mut r)?;
    let color = read_intrinsics(&mut r)?;
    let depth = read_intrinsics(&mut r)?;
    let mut rotation_from_depth = [0f32; 9];
    for v in rotation_from_depth.iter_mut() {
        *v = r.read_f32::<LittleEndian>()?;
    }
    let mut translation_from_depth = [0f32; 3];
    for v in translation_from_depth.iter_mut() {
        *v = r.read_f32::<LittleEndian>()?;
    }
    Ok((
        identity,
        CameraCalibration {
            color,
            depth,
            rotation_from_depth,
            translation_from_depth,
        },
    ))
}

/// Extrinsics are stored as rotation + translation; identity transforms are
/// never written, so the stored form is always a real pose.
pub fn write_extrinsics<W: Write>(
    w: &mut W,
    identity: &CameraIdentity,
    extrinsics: &CameraExtrinsics,
) -> Result<()> {
    write_chunk_header(w, ChunkType::Extrinsics, EXTRINSICS_BODY_BYTES)?;
    write_identity(w, identity)?;
    let t = &extrinsics.transform;
    for row in 0..3 {
        for col in 0..3 {
            w.write_f32::<LittleEndian>(t[row * 4 + col])?;
        }
    }
    for row in 0..3 {
        w.write_f32::<LittleEndian>(t[row * 4 + 3])?;
    }
    Ok(())
}

pub fn read_extrinsics(body: &[u8]) -> Result<(CameraIdentity, CameraExtrinsics)> {
    let mut r = Cursor::new(body);
    let identity = read_identity(&mut r)?;
    let mut rotation = [0f32; 9];
    for v in rotation.iter_mut() {
        *v = r.read_f32::<LittleEndian>()?;
    }
    let mut translation = [0f32; 3];
    for v in translation.iter_mut() {
        *v = r.read_f32::<LittleEndian>()?;
    }
    let mut transform = IDENTITY_TRANSFORM;
    for row in 0..3 {
        for col in 0..3 {
            transform[row * 4 + col] = rotation[row * 3 + col];
        }
        transform[row * 4 + 3] = translation[row];
    }
    Ok((
        identity,
        CameraExtrinsics {
            is_identity: false,
            transform,
        },
    ))
}

pub fn write_video_info<W: Write>(
    w: &mut W,
    identity: &CameraIdentity,
    info: &VideoInfo,
) -> Result<()> {
    write_chunk_header(w, ChunkType::VideoInfo, VIDEO_INFO_BODY_BYTES)?;
    write_identity(w, identity)?;
    w.write_u32::<LittleEndian>(info.video_type as u32)?;
    w.write_u32::<LittleEndian>(info.width)?;
    w.write_u32::<LittleEndian>(info.height)?;
    w.write_u32::<LittleEndian>(info.framerate)?;
    w.write_u32::<LittleEndian>(info.bitrate)?;
    Ok(())
}

pub fn read_video_info(body: &[u8]) -> Result<(CameraIdentity, VideoInfo)> {
    let mut r = Cursor::new(body);
    let identity = read_identity(&mut r)?;
    let video_type = VideoType::try_from(r.read_u32::<LittleEndian>()? as u8)?;
    Ok((
        identity,
        VideoInfo {
            video_type,
            width: r.read_u32::<LittleEndian>()?,
            height: r.read_u32::<LittleEndian>()?,
            framerate: r.read_u32::<LittleEndian>()?,
            bitrate: r.read_u32::<LittleEndian>()?,
        },
    ))
}

pub fn write_batch_info<W: Write>(w: &mut W, info: &FileBatchInfo) -> Result<()> {
    write_chunk_header(w, ChunkType::BatchInfo, BATCH_INFO_BODY_BYTES)?;
    w.write_u32::<LittleEndian>(info.max_camera_count)?;
    w.write_u64::<LittleEndian>(info.video_usec)?;
    w.write_u64::<LittleEndian>(info.video_epoch_usec)?;
    Ok(())
}

pub fn read_batch_info(body: &[u8]) -> Result<FileBatchInfo> {
    let mut r = Cursor::new(body);
    Ok(FileBatchInfo {
        max_camera_count: r.read_u32::<LittleEndian>()?,
        video_usec: r.read_u64::<LittleEndian>()?,
        video_epoch_usec: r.read_u64::<LittleEndian>()?,
    })
}

pub fn write_frame<W: Write>(w: &mut W, frame: &FileFrame) -> Result<()> {
    let body_len = FRAME_HEADER_BODY_BYTES + frame.image.len() + frame.depth.len();
    write_chunk_header(w, ChunkType::Frame, body_len)?;
    w.write_u8(u8::from(frame.is_final_frame))?;
    write_identity(w, &frame.identity)?;
    w.write_u32::<LittleEndian>(frame.frame_number)?;
    w.write_i32::<LittleEndian>(frame.back_reference)?;
    w.write_u32::<LittleEndian>(frame.image.len() as u32)?;
    w.write_u32::<LittleEndian>(frame.depth.len() as u32)?;
    for v in frame.accelerometer {
        w.write_f32::<LittleEndian>(v)?;
    }
    w.write_u32::<LittleEndian>(frame.exposure_usec)?;
    w.write_u32::<LittleEndian>(frame.awb_usec)?;
    w.write_u32::<LittleEndian>(frame.iso_speed)?;
    w.write_f32::<LittleEndian>(frame.brightness)?;
    w.write_f32::<LittleEndian>(frame.saturation)?;
    w.write_all(&frame.image)?;
    w.write_all(&frame.depth)?;
    Ok(())
}

pub fn read_frame(body: &[u8]) -> Result<FileFrame> {
    if body.len() < FRAME_HEADER_BODY_BYTES {
        return Err(Error::TruncatedChunk {
            chunk_type: ChunkType::Frame as u32,
            want: FRAME_HEADER_BODY_BYTES,
            have: body.len(),
        });
    }
    let mut r = Cursor::new(body);
    let is_final_frame = r.read_u8()? != 0;
    let identity = read_identity(&mut r)?;
    let frame_number = r.read_u32::<LittleEndian>()?;
    let back_reference = r.read_i32::<LittleEndian>()?;
    let image_bytes = r.read_u32::<LittleEndian>()? as usize;
    let depth_bytes = r.read_u32::<LittleEndian>()? as usize;
    let mut accelerometer = [0f32; 3];
    for v in accelerometer.iter_mut() {
        *v = r.read_f32::<LittleEndian>()?;
    }
    let exposure_usec = r.read_u32::<LittleEndian>()?;
    let awb_usec = r.read_u32::<LittleEndian>()?;
    let iso_speed = r.read_u32::<LittleEndian>()?;
    let brightness = r.read_f32::<LittleEndian>()?;
    let saturation = r.read_f32::<LittleEndian>()?;

    let have = body.len() - FRAME_HEADER_BODY_BYTES;
    if image_bytes + depth_bytes > have {
        return Err(Error::TruncatedChunk {
            chunk_type: ChunkType::Frame as u32,
            want: image_bytes + depth_bytes,
            have,
        });
    }
    let mut image = vec![0u8; image_bytes];
    r.read_exact(&mut image)?;
    let mut depth = vec![0u8; depth_bytes];
    r.read_exact(&mut depth)?;

    Ok(FileFrame {
        identity,
        is_final_frame,
        frame_number,
        back_reference,
        accelerometer,
        exposure_usec,
        awb_usec,
        iso_speed,
        brightness,
        saturation,
        image,
        depth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_chunk_round_trips() {
        let frame = FileFrame {
            identity: CameraIdentity::new(0xfeed, 1),
            is_final_frame: true,
            frame_number: 7,
            back_reference: -1,
            accelerometer: [0.0, -9.8, 0.1],
            exposure_usec: 10_000,
            awb_usec: 4500,
            iso_speed: 400,
            brightness: 0.0,
            saturation: 1.0,
            image: vec![1, 2, 3, 4],
            depth: vec![5, 6],
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).unwrap();
        assert_eq!(
            buf.len(),
            CHUNK_HEADER_BYTES + FRAME_HEADER_BODY_BYTES + 4 + 2
        );
        let decoded = read_frame(&buf[CHUNK_HEADER_BYTES..]).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn extrinsics_round_trip_reconstructs_pose() {
        let mut transform = IDENTITY_TRANSFORM;
        transform[3] = 1.5; // x translation
        transform[0] = 0.0;
        transform[1] = -1.0;
        transform[4] = 1.0;
        transform[5] = 0.0;
        let identity = CameraIdentity::new(9, 0);
        let ext = CameraExtrinsics {
            is_identity: false,
            transform,
        };
        let mut buf = Vec::new();
        write_extrinsics(&mut buf, &identity, &ext).unwrap();
        let (id2, ext2) = read_extrinsics(&buf[CHUNK_HEADER_BYTES..]).unwrap();
        assert_eq!(id2, identity);
        assert!(!ext2.is_identity);
        assert_eq!(ext2.transform, transform);
    }

    #[test]
    fn truncated_frame_is_detected() {
        let frame = FileFrame {
            identity: CameraIdentity::new(1, 0),
            is_final_frame: false,
            frame_number: 0,
            back_reference: 0,
            accelerometer: [0.0; 3],
            exposure_usec: 0,
            awb_usec: 0,
            iso_speed: 0,
            brightness: 0.0,
            saturation: 1.0,
            image: vec![0; 16],
            depth: vec![0; 16],
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).unwrap();
        let cut = buf.len() - 8;
        assert!(read_frame(&buf[CHUNK_HEADER_BYTES..cut]).is_err());
    }
}
