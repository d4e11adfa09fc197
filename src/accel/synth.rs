//! Synthetic elementary streams.
//!
//! Builds syntactically valid headers and picture units the software cores
//! understand: real SPS/VPS/PPS layouts and slice headers, followed by filler
//! payload instead of residual data. Used by the tests and `vpu-pipeline synth`.

use super::CodecFormat;
use super::bitstream::{BitWriter, add_emulation_prevention};
use super::{h264, hevc, vp9};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Intra,
    Predicted,
    Bidirectional,
}

impl FrameKind {
    fn is_reference(self) -> bool {
        !matches!(self, FrameKind::Bidirectional)
    }
}

/// One access unit of a synthetic stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthPacket {
    pub data: Vec<u8>,
    /// Display position of the picture.
    pub pts: i64,
    /// Decode position of the picture.
    pub dts: i64,
    pub keyframe: bool,
}

#[derive(Debug, Clone)]
pub struct SynthStream {
    format: CodecFormat,
    width: u32,
    height: u32,
    bit_depth: u8,
    profile: Option<u32>,
    gop: Vec<FrameKind>,
    payload_bytes: usize,
}

impl SynthStream {
    pub fn new(format: CodecFormat, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
            bit_depth: 8,
            profile: None,
            gop: vec![
                FrameKind::Intra,
                FrameKind::Predicted,
                FrameKind::Bidirectional,
                FrameKind::Bidirectional,
            ],
            payload_bytes: 64,
        }
    }

    /// Frame types in decode order, one character each: `I`, `P` or `B`.
    /// The pattern repeats; VP9 treats `B` like `P`.
    pub fn gop(mut self, pattern: &str) -> Self {
        let gop: Vec<FrameKind> = pattern
            .chars()
            .filter_map(|c| match c.to_ascii_uppercase() {
                'I' => Some(FrameKind::Intra),
                'P' => Some(FrameKind::Predicted),
                'B' => Some(FrameKind::Bidirectional),
                _ => None,
            })
            .collect();
        if !gop.is_empty() {
            self.gop = gop;
        }
        self
    }

    pub fn bit_depth(mut self, bit_depth: u8) -> Self {
        self.bit_depth = bit_depth;
        self
    }

    pub fn profile(mut self, profile: u32) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Filler bytes carried by every picture unit.
    pub fn payload_bytes(mut self, bytes: usize) -> Self {
        self.payload_bytes = bytes;
        self
    }

    pub fn format(&self) -> CodecFormat {
        self.format
    }

    fn resolved_profile(&self) -> u32 {
        self.profile.unwrap_or(match (self.format, self.bit_depth > 8) {
            (CodecFormat::H264, false) => 100,
            (CodecFormat::H264, true) => 110,
            (CodecFormat::Hevc, false) => 1,
            (CodecFormat::Hevc, true) => 2,
            (CodecFormat::Vp9, false) => 0,
            (CodecFormat::Vp9, true) => 2,
        })
    }

    fn kind_at(&self, index: usize) -> FrameKind {
        match self.format {
            CodecFormat::Vp9 if self.gop[index % self.gop.len()] != FrameKind::Intra => {
                FrameKind::Predicted
            }
            _ => self.gop[index % self.gop.len()],
        }
    }

    /// Sequence level headers emitted in front of every intra picture.
    pub fn headers(&self) -> Vec<u8> {
        let profile = self.resolved_profile();
        match self.format {
            CodecFormat::H264 => {
                let mut out = h264_sps(self.width, self.height, profile, self.bit_depth);
                out.extend(h264_pps());
                out
            }
            CodecFormat::Hevc => {
                let mut out = hevc_vps();
                out.extend(hevc_sps(self.width, self.height, profile, self.bit_depth));
                out.extend(hevc_pps());
                out
            }
            CodecFormat::Vp9 => Vec::new(),
        }
    }

    /// Display position of each of the first `count` pictures. Reference
    /// pictures are shown once the next reference picture arrives.
    fn display_order(&self, count: usize) -> Vec<i64> {
        let mut order = Vec::with_capacity(count);
        let mut held = None;
        for index in 0..count {
            let kind = self.kind_at(index);
            if self.format.is_annex_b() && kind.is_reference() {
                if let Some(previous) = held.replace(index) {
                    order.push(previous);
                }
            } else {
                order.push(index);
            }
        }
        order.extend(held);
        let mut positions = vec![0i64; count];
        for (position, index) in order.into_iter().enumerate() {
            positions[index] = position as i64;
        }
        positions
    }

    pub fn packets(&self, count: usize) -> Vec<SynthPacket> {
        let positions = self.display_order(count);
        (0..count)
            .map(|index| {
                let kind = self.kind_at(index);
                let keyframe = kind == FrameKind::Intra;
                let mut data = if keyframe { self.headers() } else { Vec::new() };
                match self.format {
                    CodecFormat::H264 => data.extend(h264_slice(
                        keyframe,
                        kind.is_reference(),
                        self.payload_bytes,
                    )),
                    CodecFormat::Hevc => {
                        let nal_type = match kind {
                            FrameKind::Intra => hevc::NAL_IDR_W_RADL,
                            FrameKind::Predicted => hevc::NAL_TRAIL_R,
                            FrameKind::Bidirectional => hevc::NAL_TRAIL_N,
                        };
                        data.extend(hevc_slice(nal_type, self.payload_bytes));
                    }
                    CodecFormat::Vp9 => data.extend(vp9_frame(
                        keyframe,
                        self.width,
                        self.height,
                        self.bit_depth,
                        self.payload_bytes,
                    )),
                }
                SynthPacket {
                    data,
                    pts: positions[index],
                    dts: index as i64,
                    keyframe,
                }
            })
            .collect()
    }
}

fn filler(writer: &mut BitWriter, bytes: usize) {
    for i in 0..bytes {
        writer.write_bits(((i * 37 + 11) % 251) as u64 | 0x01, 8);
    }
}

fn annex_b_nal(header: &[u8], writer: BitWriter) -> Vec<u8> {
    let mut out = START_CODE.to_vec();
    out.extend_from_slice(header);
    out.extend(add_emulation_prevention(&writer.into_bytes()));
    out
}

pub fn h264_sps(width: u32, height: u32, profile_idc: u32, bit_depth: u8) -> Vec<u8> {
    let width_in_mbs = width.div_ceil(16);
    let height_in_mbs = height.div_ceil(16);
    let crop_right = (width_in_mbs * 16 - width) / 2;
    let crop_bottom = (height_in_mbs * 16 - height) / 2;
    h264_sps_fields(
        profile_idc,
        bit_depth,
        width_in_mbs - 1,
        height_in_mbs - 1,
        (crop_right, crop_bottom),
    )
}

/// SPS written from raw syntax element values, without range checks.
pub fn h264_sps_fields(
    profile_idc: u32,
    bit_depth: u8,
    pic_width_in_mbs_minus1: u32,
    pic_height_in_map_units_minus1: u32,
    (crop_right, crop_bottom): (u32, u32),
) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.write_bits(profile_idc as u64, 8);
    w.write_bits(0, 8); // constraint flags
    w.write_bits(40, 8); // level 4.0
    w.write_ue(0); // seq_parameter_set_id
    if [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134].contains(&profile_idc) {
        w.write_ue(1); // chroma_format_idc
        w.write_ue(bit_depth.saturating_sub(8) as u32);
        w.write_ue(bit_depth.saturating_sub(8) as u32);
        w.write_flag(false); // qpprime_y_zero_transform_bypass_flag
        w.write_flag(false); // seq_scaling_matrix_present_flag
    }
    w.write_ue(0); // log2_max_frame_num_minus4
    w.write_ue(0); // pic_order_cnt_type
    w.write_ue(2); // log2_max_pic_order_cnt_lsb_minus4
    w.write_ue(4); // max_num_ref_frames
    w.write_flag(false);
    w.write_ue(pic_width_in_mbs_minus1);
    w.write_ue(pic_height_in_map_units_minus1);
    w.write_flag(true); // frame_mbs_only_flag
    w.write_flag(true); // direct_8x8_inference_flag
    let cropping = crop_right > 0 || crop_bottom > 0;
    w.write_flag(cropping);
    if cropping {
        w.write_ue(0);
        w.write_ue(crop_right);
        w.write_ue(0);
        w.write_ue(crop_bottom);
    }
    w.write_flag(false); // vui_parameters_present_flag
    w.write_trailing_bits();
    annex_b_nal(&[0x67], w)
}

pub fn h264_pps() -> Vec<u8> {
    let mut w = BitWriter::new();
    w.write_ue(0); // pic_parameter_set_id
    w.write_ue(0); // seq_parameter_set_id
    w.write_flag(false); // entropy_coding_mode_flag
    w.write_flag(false);
    w.write_ue(0); // num_slice_groups_minus1
    w.write_ue(0);
    w.write_ue(0);
    w.write_flag(false);
    w.write_bits(0, 2);
    w.write_se(0);
    w.write_se(0);
    w.write_se(0);
    w.write_flag(true); // deblocking_filter_control_present_flag
    w.write_flag(false);
    w.write_flag(false);
    w.write_trailing_bits();
    annex_b_nal(&[0x68], w)
}

pub fn h264_slice(idr: bool, reference: bool, payload_bytes: usize) -> Vec<u8> {
    let nal_ref_idc: u8 = if idr || reference { 3 } else { 0 };
    let nal_type = if idr { h264::NAL_IDR } else { h264::NAL_SLICE };
    let slice_type = match (idr, reference) {
        (true, _) => 7,
        (false, true) => 5,
        (false, false) => 6,
    };
    let mut w = BitWriter::new();
    w.write_ue(0); // first_mb_in_slice
    w.write_ue(slice_type);
    w.write_ue(0); // pic_parameter_set_id
    filler(&mut w, payload_bytes);
    w.write_trailing_bits();
    annex_b_nal(&[(nal_ref_idc << 5) | nal_type], w)
}

fn hevc_header(nal_type: u8) -> [u8; 2] {
    [nal_type << 1, 0x01]
}

pub fn hevc_vps() -> Vec<u8> {
    let mut w = BitWriter::new();
    w.write_bits(0, 4); // vps_video_parameter_set_id
    w.write_bits(0b11, 2);
    w.write_bits(0, 6); // vps_max_layers_minus1
    w.write_bits(0, 3); // vps_max_sub_layers_minus1
    w.write_flag(true);
    w.write_bits(0xFFFF, 16);
    w.write_trailing_bits();
    annex_b_nal(&hevc_header(hevc::NAL_VPS), w)
}

pub fn hevc_sps(width: u32, height: u32, profile_idc: u32, bit_depth: u8) -> Vec<u8> {
    let coded_width = width.next_multiple_of(8);
    let coded_height = height.next_multiple_of(8);
    let mut w = BitWriter::new();
    w.write_bits(0, 4); // sps_video_parameter_set_id
    w.write_bits(0, 3); // sps_max_sub_layers_minus1
    w.write_flag(true); // sps_temporal_id_nesting_flag
    w.write_bits(0, 3); // general_profile_space, general_tier_flag
    w.write_bits(profile_idc as u64, 5);
    w.write_bits(1u64 << (31 - profile_idc.min(31)), 32);
    w.write_bits(0b1001, 4); // progressive, interlaced, non_packed, frame_only
    w.write_bits(0, 43);
    w.write_bits(0, 1);
    w.write_bits(93, 8); // general_level_idc
    w.write_ue(0); // sps_seq_parameter_set_id
    w.write_ue(1); // chroma_format_idc
    w.write_ue(coded_width);
    w.write_ue(coded_height);
    let crop_right = (coded_width - width) / 2;
    let crop_bottom = (coded_height - height) / 2;
    let cropping = crop_right > 0 || crop_bottom > 0;
    w.write_flag(cropping);
    if cropping {
        w.write_ue(0);
        w.write_ue(crop_right);
        w.write_ue(0);
        w.write_ue(crop_bottom);
    }
    w.write_ue(bit_depth.saturating_sub(8) as u32);
    w.write_ue(bit_depth.saturating_sub(8) as u32);
    w.write_ue(4); // log2_max_pic_order_cnt_lsb_minus4
    w.write_trailing_bits();
    annex_b_nal(&hevc_header(hevc::NAL_SPS), w)
}

pub fn hevc_pps() -> Vec<u8> {
    let mut w = BitWriter::new();
    w.write_ue(0); // pps_pic_parameter_set_id
    w.write_ue(0); // pps_seq_parameter_set_id
    w.write_bits(0, 7);
    w.write_ue(0);
    w.write_ue(0);
    w.write_se(0);
    w.write_trailing_bits();
    annex_b_nal(&hevc_header(hevc::NAL_PPS), w)
}

pub fn hevc_slice(nal_type: u8, payload_bytes: usize) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.write_flag(true); // first_slice_segment_in_pic_flag
    if (16..=23).contains(&nal_type) {
        w.write_flag(false); // no_output_of_prior_pics_flag
    }
    w.write_ue(0); // slice_pic_parameter_set_id
    filler(&mut w, payload_bytes);
    w.write_trailing_bits();
    annex_b_nal(&hevc_header(nal_type), w)
}

/// One VP9 frame: uncompressed header followed by filler.
pub fn vp9_frame(
    key_frame: bool,
    width: u32,
    height: u32,
    bit_depth: u8,
    payload_bytes: usize,
) -> Vec<u8> {
    let profile = if bit_depth > 8 { 2u64 } else { 0 };
    let mut w = BitWriter::new();
    w.write_bits(vp9::FRAME_MARKER as u64, 2);
    w.write_bits(profile & 1, 1);
    w.write_bits(profile >> 1, 1);
    w.write_flag(false); // show_existing_frame
    w.write_flag(!key_frame); // frame_type
    w.write_flag(true); // show_frame
    w.write_flag(false); // error_resilient_mode
    if key_frame {
        w.write_bits(vp9::SYNC_CODE as u64, 24);
        if profile >= 2 {
            w.write_flag(bit_depth > 10);
        }
        w.write_bits(1, 3); // color_space BT.601
        w.write_flag(false); // color_range
        w.write_bits((width - 1) as u64, 16);
        w.write_bits((height - 1) as u64, 16);
        w.write_flag(false); // render_and_frame_size_different
    } else {
        w.write_flag(false); // intra_only
        w.write_flag(false); // reset_frame_context
    }
    filler(&mut w, payload_bytes);
    w.into_bytes()
}
