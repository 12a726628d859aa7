//! Annex-B bitstream handling.
//!
//! Hardware encoders emit one access unit per encode call as Annex-B NAL
//! units. The parser splits them, captures parameter sets (SPS/PPS, plus
//! VPS for HEVC) separately, keeps picture slices, and strips SEI and AUD.
//! Parameter sets are prepended to every outgoing keyframe so a receiver
//! never needs out-of-band decoder configuration.

use h264_reader::nal::{NalHeader, UnitType};

/// Find the next 00 00 01 start code at or after `from`.
pub fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    if data.len() < 3 {
        return None;
    }
    (from..data.len() - 2).find(|&i| data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1)
}

/// Invoke `callback(payload)` for each NAL unit in an Annex-B stream.
/// Payloads exclude the start code; a trailing zero from a 4-byte start
/// code of the following NAL is trimmed.
pub fn enumerate_annexb_nalus<F: FnMut(&[u8])>(data: &[u8], mut callback: F) -> usize {
    let mut count = 0;
    let mut start = match find_start_code(data, 0) {
        Some(i) => i + 3,
        None => return 0,
    };
    loop {
        match find_start_code(data, start) {
            Some(next) => {
                let mut end = next;
                // 4-byte start code: 00 00 00 01.
                if end > start && data[end - 1] == 0 {
                    end -= 1;
                }
                callback(&data[start..end]);
                count += 1;
                start = next + 3;
            }
            None => {
                callback(&data[start..]);
                count += 1;
                return count;
            }
        }
    }
}

/// Bit-level reader for slice header fields.
struct BitReader<'a> {
    data: &'a [u8],
    bit: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, bit: 0 }
    }

    fn read_bit(&mut self) -> u32 {
        let byte = self.bit / 8;
        if byte >= self.data.len() {
            return 0;
        }
        let shift = 7 - (self.bit % 8);
        self.bit += 1;
        u32::from((self.data[byte] >> shift) & 1)
    }

    fn read_bits(&mut self, count: u32) -> u32 {
        let mut v = 0;
        for _ in 0..count {
            v = (v << 1) | self.read_bit();
        }
        v
    }

    fn read_exp_golomb(&mut self) -> u32 {
        let mut zeros = 0u32;
        while zeros < 32 && self.read_bit() == 0 {
            zeros += 1;
        }
        if zeros == 0 {
            return 0;
        }
        self.read_bits(zeros) + (1 << zeros) - 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NalClass {
    ParameterSet,
    Slice { first_slice: bool },
    Discard,
}

fn classify_h264(payload: &[u8]) -> NalClass {
    if payload.is_empty() || payload[0] & 0x80 != 0 {
        tracing::error!("encoder produced an invalid NAL unit");
        return NalClass::Discard;
    }
    let Some(header) = NalHeader::new(payload[0]).ok() else {
        return NalClass::Discard;
    };
    match header.nal_unit_type() {
        UnitType::SeqParameterSet | UnitType::PicParameterSet => NalClass::ParameterSet,
        UnitType::SliceLayerWithoutPartitioningIdr
        | UnitType::SliceLayerWithoutPartitioningNonIdr => {
            let mut bits = BitReader::new(&payload[1..]);
            let first_mb_in_slice = bits.read_exp_golomb();
            NalClass::Slice {
                first_slice: first_mb_in_slice == 0,
            }
        }
        // SEI exists to let the decoder buffer frames; parameter sets ride
        // in front of keyframes instead, so both SEI and AUD are dropped.
        UnitType::SEI | UnitType::AccessUnitDelimiter => NalClass::Discard,
        other => {
            tracing::warn!("unhandled AVC NAL unit {:?} in encoder output", other);
            NalClass::Discard
        }
    }
}

fn classify_hevc(payload: &[u8]) -> NalClass {
    if payload.len() < 2 || payload[0] & 0x80 != 0 {
        tracing::error!("encoder produced an invalid NAL unit");
        return NalClass::Discard;
    }
    let header = u16::from_be_bytes([payload[0], payload[1]]);
    let nal_unit_type = (header >> 9) & 0x3f;
    match nal_unit_type {
        // VPS / SPS / PPS.
        32..=34 => NalClass::ParameterSet,
        // TRAIL_R, IDR_W_RADL, CRA.
        1 | 19 | 21 => {
            let mut bits = BitReader::new(&payload[2..]);
            let first_slice = bits.read_bit() != 0;
            NalClass::Slice { first_slice }
        }
        // AUD and SEI.
        35 | 39 => NalClass::Discard,
        other => {
            tracing::warn!("unhandled HEVC NAL unit {other} in encoder output");
            NalClass::Discard
        }
    }
}

const START_CODE: [u8; 3] = [0, 0, 1];

/// Result of splitting one encoder access unit.
#[derive(Debug, Default, Clone)]
pub struct ParsedVideo {
    /// Concatenated parameter-set NALs, each with a start code.
    pub parameters: Vec<u8>,
    /// Coded pictures; each is the concatenation of its slice NALs with
    /// start codes.
    pub pictures: Vec<Vec<u8>>,
    pub nal_unit_count: usize,
}

/// Split an Annex-B access unit into parameter sets and pictures.
pub fn parse_video(is_hevc: bool, data: &[u8]) -> ParsedVideo {
    let mut parsed = ParsedVideo::default();
    let mut started_picture = false;
    parsed.nal_unit_count = enumerate_annexb_nalus(data, |payload| {
        let class = if is_hevc {
            classify_hevc(payload)
        } else {
            classify_h264(payload)
        };
        match class {
            NalClass::ParameterSet => {
                parsed.parameters.extend_from_slice(&START_CODE);
                parsed.parameters.extend_from_slice(payload);
            }
            NalClass::Slice { first_slice } => {
                if first_slice || !started_picture {
                    parsed.pictures.push(Vec::new());
                    started_picture = true;
                }
                if let Some(picture) = parsed.pictures.last_mut() {
                    picture.extend_from_slice(&START_CODE);
                    picture.extend_from_slice(payload);
                }
            }
            NalClass::Discard => {}
        }
    });
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_three_and_four_byte_start_codes() {
        let mut nals = Vec::new();
        let data = [
            0, 0, 0, 1, 9, 10, 10, //
            0, 0, 1, 3, 20, //
            0, 0, 0, 1, 99, 99,
        ];
        enumerate_annexb_nalus(&data, |p| nals.push(p.to_vec()));
        assert_eq!(nals.len(), 3);
        assert_eq!(nals[0], &[9, 10, 10]);
        assert_eq!(nals[1], &[3, 20]);
        assert_eq!(nals[2], &[99, 99]);
    }

    #[test]
    fn empty_input_yields_no_nalus() {
        let mut count = 0;
        enumerate_annexb_nalus(&[], |_| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn exp_golomb_decodes_small_values() {
        // '1' -> 0
        assert_eq!(BitReader::new(&[0b1000_0000]).read_exp_golomb(), 0);
        // '010' -> 1
        assert_eq!(BitReader::new(&[0b0100_0000]).read_exp_golomb(), 1);
        // '011' -> 2
        assert_eq!(BitReader::new(&[0b0110_0000]).read_exp_golomb(), 2);
        // '00100' -> 3
        assert_eq!(BitReader::new(&[0b0010_0000]).read_exp_golomb(), 3);
    }

    #[test]
    fn h264_parameter_sets_and_slices_are_separated() {
        // SPS (type 7), PPS (type 8), SEI (type 6), IDR slice (type 5)
        // with first_mb_in_slice = 0 (leading '1' bit).
        let mut data = Vec::new();
        data.extend_from_slice(&[0, 0, 1, 0x67, 0xAA, 0xBB]);
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCC]);
        data.extend_from_slice(&[0, 0, 1, 0x06, 0x01, 0x02]);
        data.extend_from_slice(&[0, 0, 1, 0x65, 0x80, 0x11, 0x22]);

        let parsed = parse_video(false, &data);
        assert_eq!(parsed.nal_unit_count, 4);
        assert_eq!(parsed.parameters, &[0, 0, 1, 0x67, 0xAA, 0xBB, 0, 0, 1, 0x68, 0xCC]);
        assert_eq!(parsed.pictures.len(), 1);
        assert_eq!(parsed.pictures[0], &[0, 0, 1, 0x65, 0x80, 0x11, 0x22]);
    }

    #[test]
    fn multi_slice_picture_stays_one_picture() {
        // Two slices: first_mb_in_slice 0 then nonzero.
        let mut data = Vec::new();
        data.extend_from_slice(&[0, 0, 1, 0x65, 0x80, 0x11]);
        // first_mb_in_slice = 1 -> '010' -> 0b0100_0000
        data.extend_from_slice(&[0, 0, 1, 0x41, 0x40, 0x22]);
        let parsed = parse_video(false, &data);
        assert_eq!(parsed.pictures.len(), 1);
        assert_eq!(parsed.pictures[0].len(), 12);
    }
}
