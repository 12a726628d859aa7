//! Video codec session interface.
//!
//! Hardware encode/decode is a vendor collaborator (Quick Sync, NVENC and
//! friends). Sessions are strictly single-thread-owner and decoded frames
//! are owning handles that release their backend reference on drop; some
//! backends support only one outstanding surface, so frames must not
//! accumulate.
//!
//! [`SoftwareCodecFactory`] is the in-tree reference implementation. Its
//! encoder emits structurally valid Annex-B (SPS/PPS parameter NALs plus a
//! slice NAL with a real first-slice flag), so the NAL parser, keyframe
//! parameter-set prepending, and the decoder's resync rules run unmodified
//! against it.

use volcap_types::VideoType;

use crate::camera::unwrap_pseudo_mjpeg;
use crate::nal;
use crate::{Error, Result};

/// Encoder post-processing parameters; changing these does not force an
/// encoder re-initialization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcAmp {
    pub enabled: bool,
    pub denoise_pct: u8,
    pub brightness: f32,
    pub saturation: f32,
}

impl Default for ProcAmp {
    fn default() -> Self {
        Self {
            enabled: true,
            denoise_pct: 0,
            brightness: 0.0,
            saturation: 1.0,
        }
    }
}

/// Full encoder configuration. Any change outside [`ProcAmp`] requires a
/// new session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncoderParams {
    pub codec: VideoType,
    pub bitrate: u32,
    /// 1-51, 1 = best.
    pub quality: u8,
    pub framerate: u32,
    pub width: u32,
    pub height: u32,
    pub intra_refresh_cycle: u32,
    pub intra_refresh_qp_delta: i32,
    pub procamp: ProcAmp,
}

impl EncoderParams {
    /// Equality ignoring ProcAmp, which can change on a live session.
    pub fn requires_reinit(&self, other: &EncoderParams) -> bool {
        let mut a = *self;
        let mut b = *other;
        a.procamp = ProcAmp::default();
        b.procamp = ProcAmp::default();
        a != b
    }
}

/// NV12 surface: full-resolution Y plane plus interleaved half-resolution
/// UV plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nv12Image {
    pub width: u32,
    pub height: u32,
    pub y: Vec<u8>,
    pub uv: Vec<u8>,
}

impl Nv12Image {
    pub fn from_packed(width: u32, height: u32, data: &[u8]) -> Result<Self> {
        let luma = (width * height) as usize;
        let chroma = luma / 2;
        if data.len() < luma + chroma {
            return Err(Error::Codec(format!(
                "NV12 buffer too small: {} < {}",
                data.len(),
                luma + chroma
            )));
        }
        Ok(Self {
            width,
            height,
            y: data[..luma].to_vec(),
            uv: data[luma..luma + chroma].to_vec(),
        })
    }
}

/// A decoded frame as an owning handle; the backend reference is released
/// on drop.
pub struct DecodedImage {
    pub image: Nv12Image,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl DecodedImage {
    pub fn new(image: Nv12Image) -> Self {
        Self {
            image,
            release: None,
        }
    }

    pub fn with_release(image: Nv12Image, release: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            image,
            release: Some(release),
        }
    }
}

impl Drop for DecodedImage {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DecodedImage {{ {}x{} }}",
            self.image.width, self.image.height
        )
    }
}

pub trait VideoEncoderSession: Send {
    /// Encode one frame to an Annex-B access unit.
    fn encode(&mut self, image: &Nv12Image, keyframe: bool) -> Result<Vec<u8>>;

    /// Apply new ProcAmp settings to the live session. Returns false when
    /// the backend needs a full re-initialization instead.
    fn change_procamp(&mut self, procamp: &ProcAmp) -> bool;
}

pub trait VideoDecoderSession: Send {
    fn decode(&mut self, data: &[u8]) -> Result<DecodedImage>;
}

pub trait JpegDecoderSession: Send {
    fn decode(&mut self, data: &[u8]) -> Result<DecodedImage>;
}

pub trait CodecFactory: Send + Sync {
    fn create_encoder(&self, params: &EncoderParams) -> Result<Box<dyn VideoEncoderSession>>;
    /// `config` is the start of the stream including parameter sets.
    fn create_video_decoder(
        &self,
        codec: VideoType,
        config: &[u8],
    ) -> Result<Box<dyn VideoDecoderSession>>;
    fn create_jpeg_decoder(&self) -> Result<Box<dyn JpegDecoderSession>>;
}

// ---------------------------------------------------------------------------
// Reference software codec

const SOFT_MAGIC: &[u8; 4] = b"VSWC";
const START_CODE: [u8; 3] = [0, 0, 1];
// nal_ref_idc=3 type=7 (SPS), type=8 (PPS), type=5 (IDR), ref_idc=2 type=1.
const NAL_SPS: u8 = 0x67;
const NAL_PPS: u8 = 0x68;
const NAL_IDR: u8 = 0x65;
const NAL_NON_IDR: u8 = 0x41;

pub struct SoftwareCodecFactory;

impl CodecFactory for SoftwareCodecFactory {
    fn create_encoder(&self, params: &EncoderParams) -> Result<Box<dyn VideoEncoderSession>> {
        Ok(Box::new(SoftwareEncoder {
            params: *params,
            encoded_count: 0,
        }))
    }

    fn create_video_decoder(
        &self,
        _codec: VideoType,
        config: &[u8],
    ) -> Result<Box<dyn VideoDecoderSession>> {
        let mut decoder = SoftwareDecoder {
            width: 0,
            height: 0,
        };
        // The stream must open with parameter sets; a session cannot be
        // created from a P-frame.
        decoder.scan_parameters(config);
        if decoder.width == 0 {
            return Err(Error::Codec("no parameter sets at stream start".into()));
        }
        Ok(Box::new(decoder))
    }

    fn create_jpeg_decoder(&self) -> Result<Box<dyn JpegDecoderSession>> {
        Ok(Box::new(SoftwareJpegDecoder {}))
    }
}

struct SoftwareEncoder {
    params: EncoderParams,
    encoded_count: u64,
}

impl SoftwareEncoder {
    fn push_nal(out: &mut Vec<u8>, header: u8, payload: &[u8]) {
        out.extend_from_slice(&START_CODE);
        out.push(header);
        out.extend_from_slice(payload);
    }
}

impl VideoEncoderSession for SoftwareEncoder {
    fn encode(&mut self, image: &Nv12Image, keyframe: bool) -> Result<Vec<u8>> {
        if image.width != self.params.width || image.height != self.params.height {
            return Err(Error::Codec(format!(
                "frame {}x{} does not match session {}x{}",
                image.width, image.height, self.params.width, self.params.height
            )));
        }
        let mut out = Vec::with_capacity(image.y.len() + image.uv.len() + 64);
        if keyframe {
            let mut sps = Vec::with_capacity(16);
            sps.extend_from_slice(SOFT_MAGIC);
            sps.extend_from_slice(&self.params.width.to_le_bytes());
            sps.extend_from_slice(&self.params.height.to_le_bytes());
            sps.extend_from_slice(&self.params.framerate.to_le_bytes());
            Self::push_nal(&mut out, NAL_SPS, &sps);
            Self::push_nal(&mut out, NAL_PPS, &[0x01]);
        }
        // first_mb_in_slice = 0 as Exp-Golomb: a single '1' bit.
        let mut slice = Vec::with_capacity(1 + image.y.len() + image.uv.len());
        slice.push(0x80);
        slice.extend_from_slice(&image.y);
        slice.extend_from_slice(&image.uv);
        Self::push_nal(&mut out, if keyframe { NAL_IDR } else { NAL_NON_IDR }, &slice);
        self.encoded_count += 1;
        Ok(out)
    }

    fn change_procamp(&mut self, procamp: &ProcAmp) -> bool {
        self.params.procamp = *procamp;
        true
    }
}

struct SoftwareDecoder {
    width: u32,
    height: u32,
}

impl SoftwareDecoder {
    fn scan_parameters(&mut self, data: &[u8]) {
        nal::enumerate_annexb_nalus(data, |payload| {
            if payload.len() >= 17 && payload[0] == NAL_SPS && &payload[1..5] == SOFT_MAGIC {
                self.width = u32::from_le_bytes(payload[5..9].try_into().expect("slice length"));
                self.height = u32::from_le_bytes(payload[9..13].try_into().expect("slice length"));
            }
        });
    }
}

impl VideoDecoderSession for SoftwareDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<DecodedImage> {
        self.scan_parameters(data);
        if self.width == 0 {
            return Err(Error::Codec("decode before parameter sets".into()));
        }
        let mut slice: Option<Vec<u8>> = None;
        nal::enumerate_annexb_nalus(data, |payload| {
            // Skip the NAL header byte and the one-byte slice header.
            if payload.len() > 2 && (payload[0] == NAL_IDR || payload[0] == NAL_NON_IDR) {
                slice = Some(payload[2..].to_vec());
            }
        });
        let slice = slice.ok_or_else(|| Error::Codec("no slice in access unit".into()))?;
        let image = Nv12Image::from_packed(self.width, self.height, &slice)?;
        Ok(DecodedImage::new(image))
    }
}

struct SoftwareJpegDecoder {}

impl JpegDecoderSession for SoftwareJpegDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<DecodedImage> {
        let (width, height, nv12) = unwrap_pseudo_mjpeg(data)
            .ok_or_else(|| Error::Codec("not a pseudo-MJPEG payload".into()))?;
        Ok(DecodedImage::new(Nv12Image::from_packed(
            width, height, nv12,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_params(width: u32, height: u32) -> EncoderParams {
        EncoderParams {
            codec: VideoType::H264,
            bitrate: 4_000_000,
            quality: 25,
            framerate: 30,
            width,
            height,
            intra_refresh_cycle: 15,
            intra_refresh_qp_delta: -5,
            procamp: ProcAmp::default(),
        }
    }

    fn test_image(width: u32, height: u32) -> Nv12Image {
        let luma = (width * height) as usize;
        Nv12Image {
            width,
            height,
            y: (0..luma).map(|i| (i % 251) as u8).collect(),
            uv: vec![128; luma / 2],
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let factory = SoftwareCodecFactory;
        let mut encoder = factory.create_encoder(&test_params(64, 32)).unwrap();
        let image = test_image(64, 32);
        let access_unit = encoder.encode(&image, true).unwrap();

        let mut decoder = factory
            .create_video_decoder(VideoType::H264, &access_unit)
            .unwrap();
        let decoded = decoder.decode(&access_unit).unwrap();
        assert_eq!(decoded.image, image);
    }

    #[test]
    fn keyframes_carry_parameter_sets() {
        let factory = SoftwareCodecFactory;
        let mut encoder = factory.create_encoder(&test_params(16, 16)).unwrap();
        let image = test_image(16, 16);

        let keyframe = encoder.encode(&image, true).unwrap();
        let parsed = nal::parse_video(false, &keyframe);
        assert!(!parsed.parameters.is_empty());
        assert_eq!(parsed.pictures.len(), 1);

        let p_frame = encoder.encode(&image, false).unwrap();
        let parsed = nal::parse_video(false, &p_frame);
        assert!(parsed.parameters.is_empty());
        assert_eq!(parsed.pictures.len(), 1);
    }

    #[test]
    fn decoder_refuses_p_frame_initialization() {
        let factory = SoftwareCodecFactory;
        let mut encoder = factory.create_encoder(&test_params(16, 16)).unwrap();
        let image = test_image(16, 16);
        let _ = encoder.encode(&image, true).unwrap();
        let p_frame = encoder.encode(&image, false).unwrap();
        assert!(factory
            .create_video_decoder(VideoType::H264, &p_frame)
            .is_err());
    }

    #[test]
    fn procamp_change_does_not_require_reinit() {
        let a = test_params(64, 64);
        let mut b = a;
        b.procamp.brightness = 50.0;
        assert!(!a.requires_reinit(&b));
        b.bitrate = 1;
        assert!(a.requires_reinit(&b));
    }
}
