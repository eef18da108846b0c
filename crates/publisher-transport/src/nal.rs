//! NAL unit parsing and FLV packaging.
//!
//! Encoders emit H.264 in **Annex B** form (start-code delimited) while
//! RTMP/FLV expects **AVCC** (4-byte length prefixes) plus a one-time AVC
//! decoder configuration record. AAC audio rides in FLV audio tags with a
//! one-time AudioSpecificConfig.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use publisher_encoder::ParameterSets;

/// NAL unit types relevant for H.264.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NalUnitType {
    /// Non-IDR slice (P/B frame).
    NonIdrSlice = 1,
    /// IDR slice (keyframe).
    IdrSlice = 5,
    /// Supplemental Enhancement Information.
    Sei = 6,
    /// Sequence Parameter Set.
    Sps = 7,
    /// Picture Parameter Set.
    Pps = 8,
    /// Access Unit Delimiter.
    Aud = 9,
    /// Other/unknown NAL type.
    Other = 0,
}

impl From<u8> for NalUnitType {
    fn from(byte: u8) -> Self {
        match byte & 0x1F {
            1 => NalUnitType::NonIdrSlice,
            5 => NalUnitType::IdrSlice,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::Aud,
            _ => NalUnitType::Other,
        }
    }
}

/// A single NAL unit, header byte included, start code excluded.
#[derive(Debug, Clone)]
pub struct NalUnit {
    pub nal_type: NalUnitType,
    pub data: Bytes,
}

/// Length of the start code at `pos`, if any.
fn start_code_at(data: &[u8], pos: usize) -> Option<usize> {
    match data.get(pos..) {
        Some([0, 0, 1, ..]) => Some(3),
        Some([0, 0, 0, 1, ..]) => Some(4),
        _ => None,
    }
}

/// Split an Annex B stream into NAL units.
///
/// Accepts 3- and 4-byte start codes. Units are slices of `data`.
pub fn parse_annex_b(data: &Bytes) -> Vec<NalUnit> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i < data.len() {
        match start_code_at(data, i) {
            Some(len) => {
                starts.push((i, i + len));
                i += len;
            }
            None => i += 1,
        }
    }

    starts
        .iter()
        .enumerate()
        .filter_map(|(n, &(_, nal_start))| {
            let nal_end = starts.get(n + 1).map_or(data.len(), |&(next, _)| next);
            (nal_start < nal_end).then(|| {
                let unit = data.slice(nal_start..nal_end);
                NalUnit {
                    nal_type: NalUnitType::from(unit[0]),
                    data: unit,
                }
            })
        })
        .collect()
}

/// Drop a leading 3- or 4-byte start code.
pub fn strip_start_code(record: &Bytes) -> Bytes {
    match start_code_at(record, 0) {
        Some(len) => record.slice(len..),
        None => record.clone(),
    }
}

/// Convert NAL units to AVCC format with 4-byte length prefixes.
pub fn nals_to_avcc(nals: &[NalUnit]) -> Bytes {
    let mut buf = BytesMut::with_capacity(nals.iter().map(|n| n.data.len() + 4).sum());

    for nal in nals {
        buf.put_u32(nal.data.len() as u32);
        buf.put_slice(&nal.data);
    }

    buf.freeze()
}

/// Build an AVC Decoder Configuration Record from SPS and PPS.
///
/// Layout (ISO 14496-15): version, profile, compatibility, level,
/// `0xFF` (4-byte NAL lengths), `0xE1` (one SPS), SPS length + data,
/// PPS count, PPS length + data.
pub fn build_avc_decoder_config(sps: &[u8], pps: &[u8]) -> Option<Bytes> {
    if sps.len() < 4 {
        debug!(len = sps.len(), "SPS too short");
        return None;
    }

    let mut buf = BytesMut::with_capacity(11 + sps.len() + pps.len());

    buf.put_u8(0x01);
    buf.put_u8(sps[1]); // profile_idc
    buf.put_u8(sps[2]); // constraint flags
    buf.put_u8(sps[3]); // level_idc
    buf.put_u8(0xFF);
    buf.put_u8(0xE1);
    buf.put_u16(sps.len() as u16);
    buf.put_slice(sps);
    buf.put_u8(0x01);
    buf.put_u16(pps.len() as u16);
    buf.put_slice(pps);

    debug!(
        sps_len = sps.len(),
        pps_len = pps.len(),
        total_len = buf.len(),
        "Built AVC decoder configuration record"
    );

    Some(buf.freeze())
}

/// FLV video tag payload carrying the AVC sequence header for `sets`.
///
/// Returns `None` for HEVC parameter sets, which classic FLV cannot carry.
pub fn avc_sequence_header(sets: &ParameterSets) -> Option<Bytes> {
    if sets.vps.is_some() {
        debug!("HEVC parameter sets have no FLV sequence header");
        return None;
    }
    let sps = strip_start_code(&sets.sps);
    let pps = strip_start_code(&sets.pps);
    let record = build_avc_decoder_config(&sps, &pps)?;
    Some(build_flv_video_tag(&record, true, true, 0))
}

/// Build an FLV video tag payload for H.264 data.
///
/// Byte 0 is frame type (1 key, 2 inter) and codec id 7; byte 1 is the
/// AVC packet type (0 sequence header, 1 NALU); bytes 2..5 are the signed
/// composition time offset.
pub fn build_flv_video_tag(
    data: &[u8],
    is_keyframe: bool,
    is_sequence_header: bool,
    composition_time: i32,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + data.len());

    let frame_type = if is_keyframe { 0x10 } else { 0x20 };
    buf.put_u8(frame_type | 0x07);
    buf.put_u8(if is_sequence_header { 0x00 } else { 0x01 });

    let ct = composition_time as u32;
    buf.put_u8(((ct >> 16) & 0xFF) as u8);
    buf.put_u8(((ct >> 8) & 0xFF) as u8);
    buf.put_u8((ct & 0xFF) as u8);

    buf.put_slice(data);
    buf.freeze()
}

/// Build an FLV audio tag payload for AAC data.
///
/// `0xAF` is AAC, 44 kHz, 16-bit, stereo; the second byte is 0 for the
/// AudioSpecificConfig and 1 for raw frames.
pub fn build_flv_audio_tag(data: &[u8], is_config: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + data.len());
    buf.put_u8(0xAF);
    buf.put_u8(if is_config { 0x00 } else { 0x01 });
    buf.put_slice(data);
    buf.freeze()
}

/// Remove SPS/PPS/AUD units; parameter sets travel in the sequence header.
pub fn filter_parameter_sets(nals: Vec<NalUnit>) -> Vec<NalUnit> {
    nals.into_iter()
        .filter(|nal| {
            !matches!(
                nal.nal_type,
                NalUnitType::Sps | NalUnitType::Pps | NalUnitType::Aud
            )
        })
        .collect()
}
