//! H.264 (AVC) decode core model.
//!
//! Walks Annex B byte streams: SPS units become sequence headers, the first
//! slice of every picture becomes a picture unit, everything else is skipped.

use tracing::warn;

use super::CodecFormat;
use super::bitstream::{
    AnnexBUnit, BitReader, BitResult, BitstreamError, next_annex_b_unit,
    remove_emulation_prevention,
};
use super::model::{FormatSyntax, ModelCore, ModelParams, ProfileSupport, StreamHeaders, SyntaxUnit};

pub type H264Core = ModelCore<H264Syntax>;

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

const PROFILE_CAVLC_444: u32 = 44;
const PROFILE_EXTENDED: u32 = 88;
const PROFILE_HIGH_444: u32 = 244;

/// Profiles whose SPS carries chroma format and bit depth fields.
const HIGH_PROFILES: [u32; 12] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134];

#[derive(Debug, Default)]
pub struct H264Syntax;

impl FormatSyntax for H264Syntax {
    const FORMAT: CodecFormat = CodecFormat::H264;
    const REORDERS: bool = true;

    fn next_unit(&mut self, data: &[u8], params: &ModelParams) -> SyntaxUnit {
        let unit = next_annex_b_unit(data);
        let AnnexBUnit::Nal { payload, len } = unit else {
            return SyntaxUnit::Skip { len: unit.len() };
        };
        let nal = &data[payload];
        let Some(&header) = nal.first() else {
            return SyntaxUnit::Skip { len };
        };
        let nal_type = header & 0x1F;
        let nal_ref_idc = (header >> 5) & 0x03;
        match nal_type {
            NAL_SPS => SyntaxUnit::Sequence {
                headers: sequence_headers(&nal[1..], params),
                len,
            },
            NAL_SLICE | NAL_IDR if first_mb_in_slice(&nal[1..]) == Some(0) => {
                SyntaxUnit::Picture {
                    reference: nal_ref_idc != 0,
                    keyframe: nal_type == NAL_IDR,
                    len,
                }
            }
            _ => SyntaxUnit::Skip { len },
        }
    }
}

fn sequence_headers(payload: &[u8], params: &ModelParams) -> StreamHeaders {
    match parse_sps(payload) {
        Ok(sps) if sps.width > 0 && sps.height > 0 => sps.headers(),
        Ok(sps) => {
            warn!(width = sps.width, height = sps.height, "SPS has an empty picture size");
            fallback_headers(sps.profile_idc, params)
        }
        Err(err) => {
            warn!(error = %err, "failed to parse SPS");
            fallback_headers(0, params)
        }
    }
}

fn fallback_headers(profile: u32, params: &ModelParams) -> StreamHeaders {
    StreamHeaders {
        width: params.fallback_width,
        height: params.fallback_height,
        bit_depth: 8,
        profile,
        support: ProfileSupport::Supported,
    }
}

/// Fields of a sequence parameter set the core cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u32,
    pub chroma_format_idc: u32,
    pub bit_depth: u8,
    pub width: u32,
    pub height: u32,
}

impl SpsInfo {
    pub fn support(&self) -> ProfileSupport {
        match self.profile_idc {
            PROFILE_HIGH_444 | PROFILE_CAVLC_444 => ProfileSupport::Unsupported,
            _ if self.chroma_format_idc == 3 => ProfileSupport::Unsupported,
            PROFILE_EXTENDED => ProfileSupport::AdvancedTooling,
            _ => ProfileSupport::Supported,
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

/// Parses an SPS payload (NAL header byte excluded).
pub fn parse_sps(payload: &[u8]) -> BitResult<SpsInfo> {
    let rbsp = remove_emulation_prevention(payload);
    let mut reader = BitReader::new(&rbsp);
    let profile_idc = reader.read_bits(8)?;
    reader.skip_bits(8)?; // constraint flags
    reader.skip_bits(8)?; // level_idc
    reader.read_ue()?; // seq_parameter_set_id

    let mut chroma_format_idc = 1;
    let mut bit_depth = 8;
    if HIGH_PROFILES.contains(&profile_idc) {
        chroma_format_idc = reader.read_ue()?;
        if chroma_format_idc == 3 {
            reader.read_flag()?; // separate_colour_plane_flag
        }
        bit_depth = reader
            .read_ue()?
            .checked_add(8)
            .ok_or(BitstreamError::OutOfRange("bit_depth_luma_minus8"))?;
        reader.read_ue()?; // bit_depth_chroma_minus8
        reader.read_flag()?; // qpprime_y_zero_transform_bypass_flag
        if reader.read_flag()? {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if reader.read_flag()? {
                    skip_scaling_list(&mut reader, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    reader.read_ue()?; // log2_max_frame_num_minus4
    match reader.read_ue()? {
        0 => {
            reader.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
        }
        1 => {
            reader.read_flag()?; // delta_pic_order_always_zero_flag
            reader.read_se()?; // offset_for_non_ref_pic
            reader.read_se()?; // offset_for_top_to_bottom_field
            let cycle = reader.read_ue()?;
            for _ in 0..cycle {
                reader.read_se()?;
            }
        }
        _ => {}
    }
    reader.read_ue()?; // max_num_ref_frames
    reader.read_flag()?; // gaps_in_frame_num_value_allowed_flag
    let width_in_mbs = reader.read_ue()? + 1;
    let height_in_map_units = reader.read_ue()? + 1;
    let frame_mbs_only = reader.read_flag()?;
    if !frame_mbs_only {
        reader.read_flag()?; // mb_adaptive_frame_field_flag
    }
    reader.read_flag()?; // direct_8x8_inference_flag
    let (crop_left, crop_right, crop_top, crop_bottom) = if reader.read_flag()? {
        (
            reader.read_ue()?,
            reader.read_ue()?,
            reader.read_ue()?,
            reader.read_ue()?,
        )
    } else {
        (0, 0, 0, 0)
    };

    let field_factor = if frame_mbs_only { 1 } else { 2 };
    let (crop_unit_x, crop_unit_y) = match chroma_format_idc {
        0 => (1, field_factor),
        1 => (2, 2 * field_factor),
        2 => (2, field_factor),
        _ => (1, field_factor),
    };
    let width = cropped_size(width_in_mbs, 16, crop_unit_x, crop_left, crop_right)
        .ok_or(BitstreamError::OutOfRange("pic_width_in_mbs_minus1"))?;
    let height = cropped_size(
        height_in_map_units,
        16 * field_factor,
        crop_unit_y,
        crop_top,
        crop_bottom,
    )
    .ok_or(BitstreamError::OutOfRange("pic_height_in_map_units_minus1"))?;

    Ok(SpsInfo {
        profile_idc,
        chroma_format_idc,
        bit_depth: bit_depth.min(16) as u8,
        width,
        height,
    })
}

/// Coded size in samples minus the frame cropping window, or `None` when a
/// field does not fit in 32 bits.
fn cropped_size(units: u32, unit_size: u32, crop_unit: u32, start: u32, end: u32) -> Option<u32> {
    let coded = units.checked_mul(unit_size)?;
    let crop = start.checked_add(end)?.checked_mul(crop_unit)?;
    Some(coded.saturating_sub(crop))
}

fn skip_scaling_list(reader: &mut BitReader<'_>, size: usize) -> BitResult<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta_scale = reader.read_se()?;
            if !(-128..=127).contains(&delta_scale) {
                return Err(BitstreamError::OutOfRange("delta_scale"));
            }
            next_scale = (last_scale + delta_scale + 256) % 256;
        }
        last_scale = if next_scale != 0 {
            next_scale
        } else {
            last_scale
        };
    }
    Ok(())
}

/// `first_mb_in_slice` of a slice payload (NAL header byte excluded).
pub fn first_mb_in_slice(payload: &[u8]) -> Option<u32> {
    let head = &payload[..payload.len().min(8)];
    let rbsp = remove_emulation_prevention(head);
    BitReader::new(&rbsp).read_ue().ok()
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
        if let AnnexBUnit::Nal { payload, .. } = &unit
            && let Some(&header) = data[offset..][payload.clone()].first()
        {
            let nal = &data[offset..][payload.clone()];
            let nal_type = header & 0x1F;
            let first_slice = matches!(nal_type, NAL_SLICE | NAL_IDR)
                && first_mb_in_slice(&nal[1..]) == Some(0);
            let starts_unit = match nal_type {
                NAL_AUD | NAL_SEI | NAL_SPS | NAL_PPS => has_picture,
                _ => first_slice && has_picture,
            };
            if starts_unit {
                units.push(std::mem::take(&mut current));
                has_picture = false;
            }
            if matches!(nal_type, NAL_SLICE | NAL_IDR) {
                has_picture = true;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::synth;

    #[test]
    fn parses_high_profile_sps_with_cropping() {
        let sps = synth::h264_sps(1920, 1080, 100, 10);
        let info = parse_sps(&sps[5..]).unwrap();
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
        assert_eq!(info.bit_depth, 10);
        assert_eq!(info.support(), ProfileSupport::Supported);
    }

    #[test]
    fn parses_baseline_sps() {
        let sps = synth::h264_sps(352, 288, 66, 8);
        let info = parse_sps(&sps[5..]).unwrap();
        assert_eq!((info.width, info.height, info.bit_depth), (352, 288, 8));
        assert_eq!(info.chroma_format_idc, 1);
    }

    #[test]
    fn profile_support_classification() {
        let extended = parse_sps(&synth::h264_sps(64, 64, 88, 8)[5..]).unwrap();
        assert_eq!(extended.support(), ProfileSupport::AdvancedTooling);
        let high_444 = parse_sps(&synth::h264_sps(64, 64, 244, 8)[5..]).unwrap();
        assert_eq!(high_444.support(), ProfileSupport::Unsupported);
    }

    #[test]
    fn truncated_sps_falls_back_to_configured_size() {
        let params = ModelParams::default();
        let mut syntax = H264Syntax;
        let unit = syntax.next_unit(&[0, 0, 1, 0x67, 0x64], &params);
        let SyntaxUnit::Sequence { headers, len } = unit else {
            panic!("expected sequence unit, got {unit:?}");
        };
        assert_eq!(len, 5);
        assert_eq!((headers.width, headers.height), (640, 360));
    }

    #[test]
    fn overflowing_picture_size_is_out_of_range() {
        let wide = synth::h264_sps_fields(66, 8, 1 << 28, 17, (0, 0));
        assert_eq!(
            parse_sps(&wide[5..]),
            Err(BitstreamError::OutOfRange("pic_width_in_mbs_minus1"))
        );

        let cropped = synth::h264_sps_fields(66, 8, 21, 17, (u32::MAX - 1, 0));
        assert!(matches!(
            parse_sps(&cropped[5..]),
            Err(BitstreamError::OutOfRange(_))
        ));

        let params = ModelParams::default();
        let SyntaxUnit::Sequence { headers, .. } = H264Syntax.next_unit(&wide, &params) else {
            panic!("expected sequence unit");
        };
        assert_eq!((headers.width, headers.height), (640, 360));
    }

    #[test]
    fn classifies_slices() {
        let params = ModelParams::default();
        let mut syntax = H264Syntax;
        let idr = synth::h264_slice(true, true, 32);
        assert_eq!(
            syntax.next_unit(&idr, &params),
            SyntaxUnit::Picture {
                reference: true,
                keyframe: true,
                len: idr.len()
            }
        );
        let b = synth::h264_slice(false, false, 32);
        assert_eq!(
            syntax.next_unit(&b, &params),
            SyntaxUnit::Picture {
                reference: false,
                keyframe: false,
                len: b.len()
            }
        );
        let pps = synth::h264_pps();
        assert_eq!(
            syntax.next_unit(&pps, &params),
            SyntaxUnit::Skip { len: pps.len() }
        );
    }

    #[test]
    fn groups_access_units() {
        let stream = synth::SynthStream::new(CodecFormat::H264, 176, 144).gop("IPBB");
        let packets = stream.packets(4);
        let joined: Vec<u8> = packets.iter().flat_map(|p| p.data.clone()).collect();
        let units = access_units(&joined);
        assert_eq!(units.len(), 4);
        assert_eq!(units[0], packets[0].data);
        assert_eq!(units[3], packets[3].data);
    }
}
