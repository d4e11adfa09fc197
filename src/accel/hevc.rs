//! HEVC (H.265) decode core model.

use tracing::warn;

use super::CodecFormat;
use super::bitstream::{
    AnnexBUnit, BitReader, BitResult, BitstreamError, next_annex_b_unit,
    remove_emulation_prevention,
};
use super::model::{FormatSyntax, ModelCore, ModelParams, ProfileSupport, StreamHeaders, SyntaxUnit};

pub type HevcCore = ModelCore<HevcSyntax>;

pub const NAL_TRAIL_N: u8 = 0;
pub const NAL_TRAIL_R: u8 = 1;
pub const NAL_IDR_W_RADL: u8 = 19;
pub const NAL_VPS: u8 = 32;
pub const NAL_SPS: u8 = 33;
pub const NAL_PPS: u8 = 34;
pub const NAL_AUD: u8 = 35;
pub const NAL_PREFIX_SEI: u8 = 39;

const PROFILE_MAIN_STILL: u32 = 3;

#[derive(Debug, Default)]
pub struct HevcSyntax;

pub fn nal_type(header: u8) -> u8 {
    (header >> 1) & 0x3F
}

fn is_slice(nal_type: u8) -> bool {
    nal_type <= 9 || (16..=21).contains(&nal_type)
}

fn is_irap(nal_type: u8) -> bool {
    (16..=23).contains(&nal_type)
}

/// Sub-layer non-reference pictures (TRAIL_N, TSA_N, ...).
fn is_non_reference(nal_type: u8) -> bool {
    nal_type <= 14 && nal_type % 2 == 0
}

fn first_slice_in_picture(payload: &[u8]) -> bool {
    payload.first().is_some_and(|byte| byte & 0x80 != 0)
}

impl FormatSyntax for HevcSyntax {
    const FORMAT: CodecFormat = CodecFormat::Hevc;
    const REORDERS: bool = true;

    fn next_unit(&mut self, data: &[u8], params: &ModelParams) -> SyntaxUnit {
        let unit = next_annex_b_unit(data);
        let AnnexBUnit::Nal { payload, len } = unit else {
            return SyntaxUnit::Skip { len: unit.len() };
        };
        let nal = &data[payload];
        if nal.len() < 2 {
            return SyntaxUnit::Skip { len };
        }
        let kind = nal_type(nal[0]);
        match kind {
            NAL_SPS => SyntaxUnit::Sequence {
                headers: sequence_headers(&nal[2..], params),
                len,
            },
            _ if is_slice(kind) && first_slice_in_picture(&nal[2..]) => SyntaxUnit::Picture {
                reference: !is_non_reference(kind),
                keyframe: is_irap(kind),
                len,
            },
            _ => SyntaxUnit::Skip { len },
        }
    }
}

fn sequence_headers(payload: &[u8], params: &ModelParams) -> StreamHeaders {
    match parse_sps(payload) {
        Ok(sps) if sps.width > 0 && sps.height > 0 => sps.headers(),
        _ => {
            warn!("failed to parse HEVC SPS, using fallback picture size");
            StreamHeaders {
                width: params.fallback_width,
                height: params.fallback_height,
                bit_depth: 8,
                profile: 0,
                support: ProfileSupport::Supported,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HevcSps {
    pub profile_idc: u32,
    pub chroma_format_idc: u32,
    pub bit_depth: u8,
    pub width: u32,
    pub height: u32,
}

impl HevcSps {
    /// Main, Main 10 and Main Still Picture at 4:2:0 only.
    pub fn support(&self) -> ProfileSupport {
        if self.profile_idc > PROFILE_MAIN_STILL || self.chroma_format_idc != 1 {
            ProfileSupport::Unsupported
        } else {
            ProfileSupport::Supported
        }
    }

    pub fn headers(&self) -> StreamHeaders {
        StreamHeaders {
            width: self.width,
            height: self.height,
            bit_depth: self.bit_depth,
            profile: self.profile_idc,
            support: self.support(),
        }
    }
}

/// Parses an SPS payload (two byte NAL header excluded).
pub fn parse_sps(payload: &[u8]) -> BitResult<HevcSps> {
    let rbsp = remove_emulation_prevention(payload);
    let mut reader = BitReader::new(&rbsp);
    reader.skip_bits(4)?; // sps_video_parameter_set_id
    let max_sub_layers_minus1 = reader.read_bits(3)? as usize;
    reader.skip_bits(1)?; // sps_temporal_id_nesting_flag

    // profile_tier_level
    reader.skip_bits(3)?; // general_profile_space, general_tier_flag
    let profile_idc = reader.read_bits(5)?;
    reader.skip_bits(32 + 4 + 43 + 1)?;
    reader.skip_bits(8)?; // general_level_idc
    let mut sub_layers = Vec::with_capacity(max_sub_layers_minus1);
    for _ in 0..max_sub_layers_minus1 {
        sub_layers.push((reader.read_flag()?, reader.read_flag()?));
    }
    if max_sub_layers_minus1 > 0 {
        reader.skip_bits(2 * (8 - max_sub_layers_minus1))?;
    }
    for (profile_present, level_present) in sub_layers {
        if profile_present {
            reader.skip_bits(88)?;
        }
        if level_present {
            reader.skip_bits(8)?;
        }
    }

    reader.read_ue()?; // sps_seq_parameter_set_id
    let chroma_format_idc = reader.read_ue()?;
    if chroma_format_idc == 3 {
        reader.read_flag()?; // separate_colour_plane_flag
    }
    let coded_width = reader.read_ue()?;
    let coded_height = reader.read_ue()?;
    let (left, right, top, bottom) = if reader.read_flag()? {
        (
            reader.read_ue()?,
            reader.read_ue()?,
            reader.read_ue()?,
            reader.read_ue()?,
        )
    } else {
        (0, 0, 0, 0)
    };
    let bit_depth = reader
        .read_ue()?
        .checked_add(8)
        .ok_or(BitstreamError::OutOfRange("bit_depth_luma_minus8"))?;

    let sub_width = if matches!(chroma_format_idc, 1 | 2) { 2 } else { 1 };
    let sub_height = if chroma_format_idc == 1 { 2 } else { 1 };
    Ok(HevcSps {
        profile_idc,
        chroma_format_idc,
        bit_depth: bit_depth.min(16) as u8,
        width: crop(coded_width, sub_width, left, right)
            .ok_or(BitstreamError::OutOfRange("conf_win_left_offset"))?,
        height: crop(coded_height, sub_height, top, bottom)
            .ok_or(BitstreamError::OutOfRange("conf_win_top_offset"))?,
    })
}

fn crop(coded: u32, sub_sampling: u32, start: u32, end: u32) -> Option<u32> {
    let window = start.checked_add(end)?.checked_mul(sub_sampling)?;
    Some(coded.saturating_sub(window))
}

/// Groups an Annex B stream into access units, start codes included.
pub fn access_units(data: &[u8]) -> Vec<Vec<u8>> {
    let mut units = Vec::new();
    let mut current = Vec::new();
    let mut has_picture = false;
    let mut offset = 0;
    while offset < data.len() {
        let unit = next_annex_b_unit(&data[offset..]);
        let len = unit.len();
        if let AnnexBUnit::Nal { payload, .. } = &unit {
            let nal = &data[offset..][payload.clone()];
            if nal.len() >= 2 {
                let kind = nal_type(nal[0]);
                let starts_unit = match kind {
                    NAL_VPS | NAL_SPS | NAL_PPS | NAL_AUD | NAL_PREFIX_SEI => has_picture,
                    _ => has_picture && is_slice(kind) && first_slice_in_picture(&nal[2..]),
                };
                if starts_unit {
                    units.push(std::mem::take(&mut current));
                    has_picture = false;
                }
                if is_slice(kind) {
                    has_picture = true;
                }
            }
        }
        current.extend_from_slice(&data[offset..offset + len]);
        offset += len;
    }
    if !current.is_empty() {
        units.push(current);
    }
    units
}
