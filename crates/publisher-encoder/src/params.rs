//! Codec parameter-set recovery.
//!
//! Decoders need the VPS/SPS/PPS records before they can interpret any
//! access unit. Encoders hand them out in one of three shapes:
//!
//! - **Concatenated** (H.265 format metadata): a single `csd-0` record
//!   holding VPS, SPS and PPS, each preceded by a `00 00 00 01` start code.
//! - **Separate** (H.264 format metadata): `csd-0` holds the SPS and
//!   `csd-1` the PPS; nothing to scan.
//! - **Configuration buffer** (fallback): an output buffer flagged as codec
//!   config that carries SPS and PPS back to back.
//!
//! Locating works on byte ranges; the resulting [`ParameterSets`] are
//! zero-copy slices of the source buffer.

use std::ops::Range;

use bytes::Bytes;
use tracing::debug;

use publisher_ipc::VideoCodec;

use crate::codec::FormatMetadata;

/// Four-byte Annex B start code.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Byte ranges of each parameter-set record within a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSetRanges {
    pub vps: Option<Range<usize>>,
    pub sps: Range<usize>,
    pub pps: Range<usize>,
}

/// Recovered parameter-set records, start codes included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSets {
    pub vps: Option<Bytes>,
    pub sps: Bytes,
    pub pps: Bytes,
}

impl ParameterSets {
    /// Slice `buffer` along `ranges` without copying.
    pub fn from_ranges(buffer: &Bytes, ranges: &ParameterSetRanges) -> Self {
        Self {
            vps: ranges.vps.clone().map(|r| buffer.slice(r)),
            sps: buffer.slice(ranges.sps.clone()),
            pps: buffer.slice(ranges.pps.clone()),
        }
    }

    /// Records that already arrive one per buffer.
    pub fn from_separate(sps: Bytes, pps: Bytes) -> Self {
        Self {
            vps: None,
            sps,
            pps,
        }
    }
}

/// Locate VPS/SPS/PPS in a concatenated configuration record.
///
/// Scans byte by byte keeping a run length of consecutive zero bytes. A
/// `0x01` seen while the run length is exactly 3 marks a start code at
/// `index - 3`. The first record always begins at offset 0; the second and
/// second boundary starts the SPS and the last boundary starts the PPS, so
/// records between the second and the last one fold into the SPS range.
///
/// Returns `None` when fewer than three boundaries are present.
pub fn locate_concatenated(buffer: &[u8]) -> Option<ParameterSetRanges> {
    let mut zero_run = 0usize;
    let mut sps_start = 0usize;
    let mut pps_start = 0usize;
    let mut found = 0usize;

    for (index, &byte) in buffer.iter().enumerate() {
        if zero_run == 3 && byte == 0x01 {
            match found {
                0 => {}
                1 => sps_start = index - 3,
                _ => pps_start = index - 3,
            }
            found += 1;
        }

        if byte == 0x00 {
            zero_run += 1;
        } else {
            zero_run = 0;
        }
    }

    if found < 3 {
        debug!(found, len = buffer.len(), "Too few start codes in configuration record");
        return None;
    }

    Some(ParameterSetRanges {
        vps: Some(0..sps_start),
        sps: sps_start..pps_start,
        pps: pps_start..buffer.len(),
    })
}

/// Locate SPS/PPS in a codec-config output buffer.
///
/// Looks for the exact `00 00 00 01` pattern; the first match starts the
/// SPS and the second the PPS. A match in the last four bytes would leave
/// an empty PPS and is not considered.
pub fn locate_in_config_buffer(buffer: &[u8]) -> Option<ParameterSetRanges> {
    let mut sps_start: Option<usize> = None;
    let limit = buffer.len().saturating_sub(START_CODE.len());

    for index in 0..limit {
        if buffer[index..index + START_CODE.len()] != START_CODE {
            continue;
        }
        match sps_start {
            None => sps_start = Some(index),
            Some(sps) => {
                return Some(ParameterSetRanges {
                    vps: None,
                    sps: sps..index,
                    pps: index..buffer.len(),
                })
            }
        }
    }

    debug!(len = buffer.len(), "Config buffer lacks two start codes");
    None
}

/// Recover parameter sets from the one-time format metadata.
pub fn extract_from_format(format: &FormatMetadata) -> Option<ParameterSets> {
    match format.codec {
        VideoCodec::H265 => {
            let csd0 = format.csd0.as_ref()?;
            let ranges = locate_concatenated(csd0)?;
            Some(ParameterSets::from_ranges(csd0, &ranges))
        }
        VideoCodec::H264 => {
            let sps = format.csd0.clone()?;
            let pps = format.csd1.clone()?;
            Some(ParameterSets::from_separate(sps, pps))
        }
    }
}

/// Recover SPS/PPS from a buffer flagged as codec configuration.
pub fn extract_from_config_buffer(buffer: &Bytes) -> Option<ParameterSets> {
    let ranges = locate_in_config_buffer(buffer)?;
    Some(ParameterSets::from_ranges(buffer, &ranges))
}
