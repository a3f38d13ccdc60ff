// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::anyhow;
use anyhow::Context;
use enumn::N;

use crate::codec::h264::nalu::Nalu;
use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::nalu_reader::NaluReader;

pub(super) const DEFAULT_4X4_INTRA: [u8; 16] = [
    6, 13, 13, 20, 20, 20, 28, 28, 28, 28, 32, 32, 32, 37, 37, 42,
];

pub(super) const DEFAULT_4X4_INTER: [u8; 16] = [
    10, 14, 14, 20, 20, 20, 24, 24, 24, 24, 27, 27, 27, 30, 30, 34,
];

pub(super) const DEFAULT_8X8_INTRA: [u8; 64] = [
    6, 10, 10, 13, 11, 13, 16, 16, 16, 16, 18, 18, 18, 18, 18, 23, 23, 23, 23, 23, 23, 25, 25, 25,
    25, 25, 25, 25, 27, 27, 27, 27, 27, 27, 27, 27, 29, 29, 29, 29, 29, 29, 29, 31, 31, 31, 31, 31,
    31, 33, 33, 33, 33, 33, 36, 36, 36, 36, 38, 38, 38, 40, 40, 42,
];

pub(super) const DEFAULT_8X8_INTER: [u8; 64] = [
    9, 13, 13, 15, 13, 15, 17, 17, 17, 17, 19, 19, 19, 19, 19, 21, 21, 21, 21, 21, 21, 22, 22, 22,
    22, 22, 22, 22, 24, 24, 24, 24, 24, 24, 24, 24, 25, 25, 25, 25, 25, 25, 25, 27, 27, 27, 27, 27,
    27, 28, 28, 28, 28, 28, 30, 30, 30, 30, 32, 32, 32, 33, 33, 35,
];

const MAX_PPS_COUNT: u16 = 256;
const MAX_SPS_COUNT: u8 = 32;

/// The maximum number of pictures in the DPB, as per A.3.1, clause h)
pub const DPB_MAX_SIZE: usize = 16;

/// Size of a macroblock in luma samples.
pub const MB_SIZE: u32 = 16;

/// Profiles that carry chroma format, bit depth and scaling matrices in the SPS.
const HIGH_PROFILE_IDCS: [u8; 13] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

pub(super) fn has_chroma_info(profile_idc: u8) -> bool {
    HIGH_PROFILE_IDCS.contains(&profile_idc)
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
/// See table 7-6 in the specification.
pub enum SliceType {
    #[default]
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    /// Whether the slice only uses intra prediction.
    pub fn is_intra(&self) -> bool {
        matches!(self, SliceType::I | SliceType::Si)
    }
}

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Profile {
    Baseline = 66,
    Main = 77,
    Extended = 88,
    High = 100,
    High10 = 110,
    High422P = 122,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    #[default]
    L1 = 10,
    L1B = 9,
    L1_1 = 11,
    L1_2 = 12,
    L1_3 = 13,
    L2_0 = 20,
    L2_1 = 21,
    L2_2 = 22,
    L3 = 30,
    L3_1 = 31,
    L3_2 = 32,
    L4 = 40,
    L4_1 = 41,
    L4_2 = 42,
    L5 = 50,
    L5_1 = 51,
    L5_2 = 52,
    L6 = 60,
    L6_1 = 61,
    L6_2 = 62,
}

/// Scaling matrices as read with 7.3.2.1.1.1, in the order they appear in the
/// bitstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScalingLists {
    pub list_4x4: [[u8; 16]; 6],
    pub list_8x8: [[u8; 64]; 6],
}

impl Default for ScalingLists {
    fn default() -> Self {
        Self {
            list_4x4: [[0; 16]; 6],
            list_8x8: [[0; 64]; 6],
        }
    }
}

impl ScalingLists {
    /// Flat_4x4_16 and Flat_8x8_16, (7-8) and (7-9).
    fn flat() -> Self {
        Self {
            list_4x4: [[16; 16]; 6],
            list_8x8: [[16; 64]; 6],
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HrdParams {
    pub cpb_cnt_minus1: u8,
    pub bit_rate_scale: u8,
    pub cpb_size_scale: u8,
    pub bit_rate_value_minus1: [u32; 32],
    pub cpb_size_value_minus1: [u32; 32],
    pub cbr_flag: [bool; 32],
    pub initial_cpb_removal_delay_length_minus1: u8,
    pub cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub time_offset_length: u8,
}

/// VUI parameters, Annex E.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VuiParams {
    pub aspect_ratio_info_present_flag: bool,
    pub aspect_ratio_idc: u8,
    pub sar_width: u16,
    pub sar_height: u16,

    pub overscan_info_present_flag: bool,
    pub overscan_appropriate_flag: bool,

    pub video_signal_type_present_flag: bool,
    /// Inferred to be 5 (unspecified) when absent.
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,

    pub chroma_loc_info_present_flag: bool,
    pub chroma_sample_loc_type_top_field: u8,
    pub chroma_sample_loc_type_bottom_field: u8,

    /// Specifies that `num_units_in_tick`, `time_scale` and
    /// `fixed_frame_rate_flag` are present.
    pub timing_info_present_flag: bool,
    /// Number of `time_scale` units in one clock tick. A frame lasts two ticks.
    pub num_units_in_tick: u32,
    /// Number of time units that pass in one second.
    pub time_scale: u32,
    pub fixed_frame_rate_flag: bool,

    pub nal_hrd_parameters_present_flag: bool,
    pub nal_hrd_parameters: HrdParams,
    pub vcl_hrd_parameters_present_flag: bool,
    pub vcl_hrd_parameters: HrdParams,
    pub low_delay_hrd_flag: bool,

    pub pic_struct_present_flag: bool,

    pub bitstream_restriction_flag: bool,
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub max_bytes_per_pic_denom: u32,
    pub max_bits_per_mb_denom: u32,
    pub log2_max_mv_length_horizontal: u32,
    pub log2_max_mv_length_vertical: u32,
    pub max_num_reorder_frames: u32,
    pub max_dec_frame_buffering: u32,
}

impl Default for VuiParams {
    fn default() -> Self {
        Self {
            aspect_ratio_info_present_flag: false,
            aspect_ratio_idc: 0,
            sar_width: 0,
            sar_height: 0,
            overscan_info_present_flag: false,
            overscan_appropriate_flag: false,
            video_signal_type_present_flag: false,
            video_format: 5,
            video_full_range_flag: false,
            colour_description_present_flag: false,
            colour_primaries: 2,
            transfer_characteristics: 2,
            matrix_coefficients: 2,
            chroma_loc_info_present_flag: false,
            chroma_sample_loc_type_top_field: 0,
            chroma_sample_loc_type_bottom_field: 0,
            timing_info_present_flag: false,
            num_units_in_tick: 0,
            time_scale: 0,
            fixed_frame_rate_flag: false,
            nal_hrd_parameters_present_flag: false,
            nal_hrd_parameters: Default::default(),
            vcl_hrd_parameters_present_flag: false,
            vcl_hrd_parameters: Default::default(),
            low_delay_hrd_flag: false,
            pic_struct_present_flag: false,
            bitstream_restriction_flag: false,
            motion_vectors_over_pic_boundaries_flag: false,
            max_bytes_per_pic_denom: 0,
            max_bits_per_mb_denom: 0,
            log2_max_mv_length_horizontal: 0,
            log2_max_mv_length_vertical: 0,
            max_num_reorder_frames: 0,
            max_dec_frame_buffering: 0,
        }
    }
}

/// A H264 Sequence Parameter Set, 7.3.2.1.1.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    pub seq_parameter_set_id: u8,

    /// Profile to which the coded video sequence conforms
    pub profile_idc: u8,

    pub constraint_set0_flag: bool,
    pub constraint_set1_flag: bool,
    pub constraint_set2_flag: bool,
    pub constraint_set3_flag: bool,
    pub constraint_set4_flag: bool,
    pub constraint_set5_flag: bool,

    pub level_idc: Level,

    /// 1 (4:2:0) unless a high profile says otherwise.
    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub qpprime_y_zero_transform_bypass_flag: bool,

    pub seq_scaling_matrix_present_flag: bool,
    pub scaling_lists: ScalingLists,

    /// MaxFrameNum = 2 ^ (log2_max_frame_num_minus4 + 4)
    pub log2_max_frame_num_minus4: u8,

    /// Method used to decode the picture order count, clause 8.2.1.
    pub pic_order_cnt_type: u8,

    /// MaxPicOrderCntLsb = 2 ^ (log2_max_pic_order_cnt_lsb_minus4 + 4)
    pub log2_max_pic_order_cnt_lsb_minus4: u8,

    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    /// One entry per reference frame in the POC cycle.
    pub offset_for_ref_frame: Vec<i32>,

    /// Maximum number of reference frames any picture of the sequence may use.
    pub max_num_ref_frames: u8,
    pub gaps_in_frame_num_value_allowed_flag: bool,

    pub pic_width_in_mbs_minus1: u16,
    pub pic_height_in_map_units_minus1: u16,

    /// Every coded picture is a frame made of frame macroblocks.
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,

    pub frame_cropping_flag: bool,
    /// Cropping offsets, in crop units (see [`Sps::crop_unit_x_y`]).
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,

    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
}

impl Sps {
    /// Width of the decoded pictures, in samples. See 7-13 through 7-17.
    pub const fn coded_width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 as u32 + 1) * MB_SIZE
    }

    /// Height of the decoded pictures, in samples. See 7-13 through 7-17.
    pub const fn coded_height(&self) -> u32 {
        (self.pic_height_in_map_units_minus1 as u32 + 1)
            * MB_SIZE
            * (2 - self.frame_mbs_only_flag as u32)
    }

    /// Width of the displayed pictures, after cropping.
    pub fn width(&self) -> u32 {
        let (left, right, _, _) = self.crop_samples();
        self.coded_width() - left - right
    }

    /// Height of the displayed pictures, after cropping.
    pub fn height(&self) -> u32 {
        let (_, _, top, bottom) = self.crop_samples();
        self.coded_height() - top - bottom
    }

    /// Returns `ChromaArrayType`, as computed in the specification.
    pub const fn chroma_array_type(&self) -> u8 {
        match self.separate_colour_plane_flag {
            false => self.chroma_format_idc,
            true => 0,
        }
    }

    /// Returns `SubWidthC` and `SubHeightC`, table 6-1.
    fn sub_width_height_c(&self) -> (u32, u32) {
        match (self.chroma_format_idc, self.separate_colour_plane_flag) {
            (1, false) => (2, 2),
            (2, false) => (2, 1),
            _ => (1, 1),
        }
    }

    /// Returns `CropUnitX` and `CropUnitY`, 7-19 through 7-22.
    pub fn crop_unit_x_y(&self) -> (u32, u32) {
        let field_factor = 2 - u32::from(self.frame_mbs_only_flag);
        match self.chroma_array_type() {
            0 => (1, field_factor),
            _ => {
                let (sub_width_c, sub_height_c) = self.sub_width_height_c();
                (sub_width_c, sub_height_c * field_factor)
            }
        }
    }

    /// Same as MaxPicOrderCntLsb. See 7-11 in the specification.
    pub fn max_pic_order_cnt_lsb(&self) -> u32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }

    /// Number of DPB slots needed to decode the stream: every reference frame
    /// plus the picture being decoded.
    pub fn dpb_slot_count(&self) -> usize {
        usize::from(self.max_num_ref_frames) + 1
    }

    /// Luma samples cropped from the left, right, top and bottom edges.
    fn crop_samples(&self) -> (u32, u32, u32, u32) {
        if !self.frame_cropping_flag {
            return (0, 0, 0, 0);
        }

        let (crop_unit_x, crop_unit_y) = self.crop_unit_x_y();
        (
            crop_unit_x * self.frame_crop_left_offset,
            crop_unit_x * self.frame_crop_right_offset,
            crop_unit_y * self.frame_crop_top_offset,
            crop_unit_y * self.frame_crop_bottom_offset,
        )
    }

    /// Frame rate signalled in the VUI as `(numerator, denominator)` frames
    /// per second. A frame lasts two clock ticks, E.2.1.
    pub fn frame_rate(&self) -> Option<(u32, u32)> {
        let vui = &self.vui_parameters;
        if !self.vui_parameters_present_flag || !vui.timing_info_present_flag {
            return None;
        }

        Some((vui.time_scale, vui.num_units_in_tick.checked_mul(2)?))
    }
}

#[derive(Default)]
pub struct SpsBuilder(Sps);

impl SpsBuilder {
    pub fn new() -> Self {
        Self(Sps {
            chroma_format_idc: 1,
            frame_mbs_only_flag: true,
            ..Default::default()
        })
    }

    pub fn seq_parameter_set_id(mut self, value: u8) -> Self {
        self.0.seq_parameter_set_id = value;
        self
    }

    pub fn profile_idc(mut self, value: Profile) -> Self {
        self.0.profile_idc = value as u8;
        self
    }

    pub fn level_idc(mut self, value: Level) -> Self {
        self.0.level_idc = value;
        self
    }

    /// Crops the given number of luma samples from the bottom and right
    /// edges.
    fn crop_bottom_right(mut self, bottom: u32, right: u32) -> Self {
        let (crop_unit_x, crop_unit_y) = self.0.crop_unit_x_y();

        self.0.frame_cropping_flag = true;
        self.0.frame_crop_bottom_offset = bottom / crop_unit_y;
        self.0.frame_crop_right_offset = right / crop_unit_x;
        self
    }

    /// Sets the macroblock counts covering `width` x `height` and crops the
    /// excess on the right and bottom edges.
    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        let mb_width = width.div_ceil(MB_SIZE);
        let mb_height = height.div_ceil(MB_SIZE);

        self.0.pic_width_in_mbs_minus1 = (mb_width - 1) as u16;
        self.0.pic_height_in_map_units_minus1 = (mb_height - 1) as u16;

        let coded_width = mb_width * MB_SIZE;
        let coded_height = mb_height * MB_SIZE;

        if coded_width != width || coded_height != height {
            self = self.crop_bottom_right(coded_height - height, coded_width - width);
        }

        self
    }

    pub fn max_num_ref_frames(mut self, value: u8) -> Self {
        self.0.max_num_ref_frames = value;
        self
    }

    pub fn frame_mbs_only_flag(mut self, value: bool) -> Self {
        self.0.frame_mbs_only_flag = value;
        self
    }

    /// Signals a fixed frame rate of `fps` frames per second in the VUI
    /// timing info, with one clock tick per field.
    pub fn frame_rate(mut self, fps: u32) -> Self {
        let vui = &mut self.0.vui_parameters;
        vui.timing_info_present_flag = true;
        vui.num_units_in_tick = 1;
        vui.time_scale = fps * 2;
        vui.fixed_frame_rate_flag = true;

        self.0.vui_parameters_present_flag = true;
        self
    }

    pub fn pic_order_cnt_type(mut self, value: u8) -> Self {
        self.0.pic_order_cnt_type = value;
        self
    }

    pub fn log2_max_pic_order_cnt_lsb_minus4(mut self, value: u8) -> Self {
        self.0.log2_max_pic_order_cnt_lsb_minus4 = value;
        self
    }

    pub fn build(self) -> Rc<Sps> {
        Rc::new(self.0)
    }
}

/// A H264 Picture Parameter Set, 7.3.2.2.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,

    /// CABAC if set, CAVLC otherwise.
    pub entropy_coding_mode_flag: bool,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    /// Only a single slice group is supported.
    pub num_slice_groups_minus1: u32,

    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,

    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,

    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,

    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,

    pub transform_8x8_mode_flag: bool,
    pub pic_scaling_matrix_present_flag: bool,
    pub scaling_lists: ScalingLists,
    /// Inferred to be `chroma_qp_index_offset` when absent.
    pub second_chroma_qp_index_offset: i8,

    /// The SPS referenced by this PPS.
    pub sps: Rc<Sps>,
}

pub struct PpsBuilder(Pps);

impl PpsBuilder {
    pub fn new(sps: Rc<Sps>) -> Self {
        PpsBuilder(Pps {
            pic_parameter_set_id: 0,
            seq_parameter_set_id: sps.seq_parameter_set_id,
            entropy_coding_mode_flag: false,
            bottom_field_pic_order_in_frame_present_flag: false,
            num_slice_groups_minus1: 0,
            num_ref_idx_l0_default_active_minus1: 0,
            num_ref_idx_l1_default_active_minus1: 0,
            weighted_pred_flag: false,
            weighted_bipred_idc: 0,
            pic_init_qp_minus26: 0,
            pic_init_qs_minus26: 0,
            chroma_qp_index_offset: 0,
            deblocking_filter_control_present_flag: false,
            constrained_intra_pred_flag: false,
            redundant_pic_cnt_present_flag: false,
            transform_8x8_mode_flag: false,
            pic_scaling_matrix_present_flag: false,
            scaling_lists: Default::default(),
            second_chroma_qp_index_offset: 0,
            sps,
        })
    }

    pub fn pic_parameter_set_id(mut self, value: u8) -> Self {
        self.0.pic_parameter_set_id = value;
        self
    }

    pub fn entropy_coding_mode_flag(mut self, value: bool) -> Self {
        self.0.entropy_coding_mode_flag = value;
        self
    }

    pub fn pic_init_qp_minus26(mut self, value: i8) -> Self {
        self.0.pic_init_qp_minus26 = value;
        self
    }

    pub fn build(self) -> Rc<Pps> {
        Rc::new(self.0)
    }
}

/// The slice header fields needed to drive a frame decode, 7.3.3. Parsing
/// stops after the picture order count syntax elements.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_mb_in_slice: u32,
    pub slice_type: SliceType,
    pub pic_parameter_set_id: u8,
    pub colour_plane_id: u8,
    /// `log2_max_frame_num_minus4 + 4` bits in the bitstream.
    pub frame_num: u16,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub idr_pic_id: u16,
    /// `log2_max_pic_order_cnt_lsb_minus4 + 4` bits in the bitstream.
    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
}

/// A H264 slice: its parsed header and the NAL unit carrying it.
pub struct Slice<'a> {
    pub header: SliceHeader,
    pub nalu: Nalu<'a>,
}

#[derive(Debug, Default)]
pub struct Parser {
    active_spses: BTreeMap<u8, Rc<Sps>>,
    active_ppses: BTreeMap<u8, Rc<Pps>>,
}

impl Parser {
    fn default_scaling_list_4x4(i: usize) -> [u8; 16] {
        // Table 7-2.
        if i < 3 {
            DEFAULT_4X4_INTRA
        } else {
            DEFAULT_4X4_INTER
        }
    }

    fn default_scaling_list_8x8(i: usize) -> [u8; 64] {
        if i % 2 == 0 {
            DEFAULT_8X8_INTRA
        } else {
            DEFAULT_8X8_INTER
        }
    }

    /// Fall-back rule for an absent 4x4 list, table 7-2.
    fn fallback_4x4(lists: &[[u8; 16]; 6], i: usize, intra: &[u8; 16], inter: &[u8; 16]) -> [u8; 16] {
        match i {
            0 => *intra,
            3 => *inter,
            _ => lists[i - 1],
        }
    }

    /// Fall-back rule for an absent 8x8 list, table 7-2.
    fn fallback_8x8(lists: &[[u8; 64]; 6], i: usize, intra: &[u8; 64], inter: &[u8; 64]) -> [u8; 64] {
        match i {
            0 => *intra,
            1 => *inter,
            _ => lists[i - 2],
        }
    }

    /// Reads one scaling list. Returns `true` if the default list must be used.
    fn parse_scaling_list(r: &mut NaluReader, scaling_list: &mut [u8]) -> anyhow::Result<bool> {
        // 7.3.2.1.1.1
        let mut last_scale = 8u8;
        let mut next_scale = 8u8;

        for j in 0..scaling_list.len() {
            if next_scale != 0 {
                let delta_scale = r.read_se_bounded::<i32>(-128, 127)?;
                next_scale = ((i32::from(last_scale) + delta_scale + 256) % 256) as u8;
                if j == 0 && next_scale == 0 {
                    return Ok(true);
                }
            }

            scaling_list[j] = if next_scale == 0 {
                last_scale
            } else {
                next_scale
            };

            last_scale = scaling_list[j];
        }

        Ok(false)
    }

    /// Reads the 4x4 lists and `num_8x8` 8x8 lists, falling back on the
    /// given lists for absent ones.
    fn parse_scaling_lists(
        r: &mut NaluReader,
        lists: &mut ScalingLists,
        num_8x8: usize,
        fallback_4x4: (&[u8; 16], &[u8; 16]),
        fallback_8x8: (&[u8; 64], &[u8; 64]),
    ) -> anyhow::Result<()> {
        for i in 0..6 {
            if r.read_bit()? {
                if Parser::parse_scaling_list(r, &mut lists.list_4x4[i])? {
                    lists.list_4x4[i] = Parser::default_scaling_list_4x4(i);
                }
            } else {
                lists.list_4x4[i] =
                    Parser::fallback_4x4(&lists.list_4x4, i, fallback_4x4.0, fallback_4x4.1);
            }
        }

        for i in 0..num_8x8 {
            if r.read_bit()? {
                if Parser::parse_scaling_list(r, &mut lists.list_8x8[i])? {
                    lists.list_8x8[i] = Parser::default_scaling_list_8x8(i);
                }
            } else {
                lists.list_8x8[i] =
                    Parser::fallback_8x8(&lists.list_8x8, i, fallback_8x8.0, fallback_8x8.1);
            }
        }

        Ok(())
    }

    fn parse_hrd(r: &mut NaluReader, hrd: &mut HrdParams) -> anyhow::Result<()> {
        hrd.cpb_cnt_minus1 = r.read_ue_max(31)?;
        hrd.bit_rate_scale = r.read_bits(4)?;
        hrd.cpb_size_scale = r.read_bits(4)?;

        for sched_sel_idx in 0..=usize::from(hrd.cpb_cnt_minus1) {
            hrd.bit_rate_value_minus1[sched_sel_idx] = r.read_ue()?;
            hrd.cpb_size_value_minus1[sched_sel_idx] = r.read_ue()?;
            hrd.cbr_flag[sched_sel_idx] = r.read_bit()?;
        }

        hrd.initial_cpb_removal_delay_length_minus1 = r.read_bits(5)?;
        hrd.cpb_removal_delay_length_minus1 = r.read_bits(5)?;
        hrd.dpb_output_delay_length_minus1 = r.read_bits(5)?;
        hrd.time_offset_length = r.read_bits(5)?;
        Ok(())
    }

    fn parse_vui(r: &mut NaluReader, vui: &mut VuiParams) -> anyhow::Result<()> {
        vui.aspect_ratio_info_present_flag = r.read_bit()?;
        if vui.aspect_ratio_info_present_flag {
            vui.aspect_ratio_idc = r.read_bits(8)?;
            if vui.aspect_ratio_idc == 255 {
                vui.sar_width = r.read_bits(16)?;
                vui.sar_height = r.read_bits(16)?;
            }
        }

        vui.overscan_info_present_flag = r.read_bit()?;
        if vui.overscan_info_present_flag {
            vui.overscan_appropriate_flag = r.read_bit()?;
        }

        vui.video_signal_type_present_flag = r.read_bit()?;
        if vui.video_signal_type_present_flag {
            vui.video_format = r.read_bits(3)?;
            vui.video_full_range_flag = r.read_bit()?;
            vui.colour_description_present_flag = r.read_bit()?;
            if vui.colour_description_present_flag {
                vui.colour_primaries = r.read_bits(8)?;
                vui.transfer_characteristics = r.read_bits(8)?;
                vui.matrix_coefficients = r.read_bits(8)?;
            }
        }

        vui.chroma_loc_info_present_flag = r.read_bit()?;
        if vui.chroma_loc_info_present_flag {
            vui.chroma_sample_loc_type_top_field = r.read_ue_max(5)?;
            vui.chroma_sample_loc_type_bottom_field = r.read_ue_max(5)?;
        }

        vui.timing_info_present_flag = r.read_bit()?;
        if vui.timing_info_present_flag {
            vui.num_units_in_tick = r.read_bits(32)?;
            if vui.num_units_in_tick == 0 {
                return Err(anyhow!(
                    "num_units_in_tick == 0, which is not allowed by E.2.1"
                ));
            }

            vui.time_scale = r.read_bits(32)?;
            if vui.time_scale == 0 {
                return Err(anyhow!("time_scale == 0, which is not allowed by E.2.1"));
            }

            vui.fixed_frame_rate_flag = r.read_bit()?;
        }

        vui.nal_hrd_parameters_present_flag = r.read_bit()?;
        if vui.nal_hrd_parameters_present_flag {
            Parser::parse_hrd(r, &mut vui.nal_hrd_parameters)?;
        }

        vui.vcl_hrd_parameters_present_flag = r.read_bit()?;
        if vui.vcl_hrd_parameters_present_flag {
            Parser::parse_hrd(r, &mut vui.vcl_hrd_parameters)?;
        }

        if vui.nal_hrd_parameters_present_flag || vui.vcl_hrd_parameters_present_flag {
            vui.low_delay_hrd_flag = r.read_bit()?;
        }

        vui.pic_struct_present_flag = r.read_bit()?;
        vui.bitstream_restriction_flag = r.read_bit()?;

        if vui.bitstream_restriction_flag {
            vui.motion_vectors_over_pic_boundaries_flag = r.read_bit()?;
            vui.max_bytes_per_pic_denom = r.read_ue()?;
            vui.max_bits_per_mb_denom = r.read_ue_max(16)?;
            vui.log2_max_mv_length_horizontal = r.read_ue_max(16)?;
            vui.log2_max_mv_length_vertical = r.read_ue_max(16)?;
            vui.max_num_reorder_frames = r.read_ue()?;
            vui.max_dec_frame_buffering = r.read_ue()?;
        }

        Ok(())
    }

    /// Parse a SPS and add it to the list of active SPSes.
    ///
    /// Returns a reference to the new SPS.
    pub fn parse_sps(&mut self, nalu: &Nalu) -> anyhow::Result<&Rc<Sps>> {
        if !matches!(nalu.header.type_, NaluType::Sps) {
            return Err(anyhow!(
                "Invalid NALU type, expected {:?}, got {:?}",
                NaluType::Sps,
                nalu.header.type_
            ));
        }

        let mut r = NaluReader::new(nalu.rbsp());
        let mut sps = Sps {
            profile_idc: r.read_bits(8)?,
            constraint_set0_flag: r.read_bit()?,
            constraint_set1_flag: r.read_bit()?,
            constraint_set2_flag: r.read_bit()?,
            constraint_set3_flag: r.read_bit()?,
            constraint_set4_flag: r.read_bit()?,
            constraint_set5_flag: r.read_bit()?,
            ..Default::default()
        };

        // reserved_zero_2bits
        r.skip_bits(2)?;

        let level: u8 = r.read_bits(8)?;
        sps.level_idc = Level::n(level).with_context(|| format!("Unsupported level {}", level))?;
        sps.seq_parameter_set_id = r.read_ue_max(u32::from(MAX_SPS_COUNT) - 1)?;

        if has_chroma_info(sps.profile_idc) {
            sps.chroma_format_idc = r.read_ue_max(3)?;
            if sps.chroma_format_idc == 3 {
                sps.separate_colour_plane_flag = r.read_bit()?;
            }

            sps.bit_depth_luma_minus8 = r.read_ue_max(6)?;
            sps.bit_depth_chroma_minus8 = r.read_ue_max(6)?;
            sps.qpprime_y_zero_transform_bypass_flag = r.read_bit()?;
            sps.seq_scaling_matrix_present_flag = r.read_bit()?;

            if sps.seq_scaling_matrix_present_flag {
                let num_8x8 = if sps.chroma_format_idc != 3 { 2 } else { 6 };
                Parser::parse_scaling_lists(
                    &mut r,
                    &mut sps.scaling_lists,
                    num_8x8,
                    (&DEFAULT_4X4_INTRA, &DEFAULT_4X4_INTER),
                    (&DEFAULT_8X8_INTRA, &DEFAULT_8X8_INTER),
                )?;
            } else {
                sps.scaling_lists = ScalingLists::flat();
            }
        } else {
            sps.chroma_format_idc = 1;
            sps.scaling_lists = ScalingLists::flat();
        }

        sps.log2_max_frame_num_minus4 = r.read_ue_max(12)?;

        sps.pic_order_cnt_type = r.read_ue_max(2)?;

        if sps.pic_order_cnt_type == 0 {
            sps.log2_max_pic_order_cnt_lsb_minus4 = r.read_ue_max(12)?;
        } else if sps.pic_order_cnt_type == 1 {
            sps.delta_pic_order_always_zero_flag = r.read_bit()?;
            sps.offset_for_non_ref_pic = r.read_se()?;
            sps.offset_for_top_to_bottom_field = r.read_se()?;
            let num_ref_frames_in_pic_order_cnt_cycle: u8 = r.read_ue_max(254)?;

            sps.offset_for_ref_frame = (0..num_ref_frames_in_pic_order_cnt_cycle)
                .map(|_| r.read_se())
                .collect::<anyhow::Result<_>>()?;
        }

        sps.max_num_ref_frames = r.read_ue_max(DPB_MAX_SIZE as u32)?;
        sps.gaps_in_frame_num_value_allowed_flag = r.read_bit()?;
        sps.pic_width_in_mbs_minus1 = r.read_ue()?;
        sps.pic_height_in_map_units_minus1 = r.read_ue()?;
        sps.frame_mbs_only_flag = r.read_bit()?;

        if !sps.frame_mbs_only_flag {
            sps.mb_adaptive_frame_field_flag = r.read_bit()?;
        }

        sps.direct_8x8_inference_flag = r.read_bit()?;
        sps.frame_cropping_flag = r.read_bit()?;

        if sps.frame_cropping_flag {
            sps.frame_crop_left_offset = r.read_ue()?;
            sps.frame_crop_right_offset = r.read_ue()?;
            sps.frame_crop_top_offset = r.read_ue()?;
            sps.frame_crop_bottom_offset = r.read_ue()?;

            // The visible area must stay non-empty.
            let (crop_unit_x, crop_unit_y) = sps.crop_unit_x_y();

            sps.frame_crop_left_offset
                .checked_add(sps.frame_crop_right_offset)
                .and_then(|r| r.checked_mul(crop_unit_x))
                .and_then(|r| sps.coded_width().checked_sub(r))
                .filter(|w| *w > 0)
                .ok_or(anyhow!("Invalid frame crop width"))?;

            sps.frame_crop_top_offset
                .checked_add(sps.frame_crop_bottom_offset)
                .and_then(|r| r.checked_mul(crop_unit_y))
                .and_then(|r| sps.coded_height().checked_sub(r))
                .filter(|h| *h > 0)
                .ok_or(anyhow!("Invalid frame crop height"))?;
        }

        sps.vui_parameters_present_flag = r.read_bit()?;
        if sps.vui_parameters_present_flag {
            Parser::parse_vui(&mut r, &mut sps.vui_parameters)?;
        }

        let key = sps.seq_parameter_set_id;

        if !self.active_spses.contains_key(&key)
            && self.active_spses.len() >= usize::from(MAX_SPS_COUNT)
        {
            return Err(anyhow!(
                "Broken data: Number of active SPSs > MAX_SPS_COUNT"
            ));
        }

        let sps = Rc::new(sps);
        self.active_spses.remove(&key);
        Ok(self.active_spses.entry(key).or_insert(sps))
    }

    pub fn parse_pps(&mut self, nalu: &Nalu) -> anyhow::Result<&Rc<Pps>> {
        if !matches!(nalu.header.type_, NaluType::Pps) {
            return Err(anyhow!(
                "Invalid NALU type, expected {:?}, got {:?}",
                NaluType::Pps,
                nalu.header.type_
            ));
        }

        let mut r = NaluReader::new(nalu.rbsp());
        let pic_parameter_set_id = r.read_ue_max(u32::from(MAX_PPS_COUNT) - 1)?;
        let seq_parameter_set_id = r.read_ue_max(u32::from(MAX_SPS_COUNT) - 1)?;
        let sps = self.get_sps(seq_parameter_set_id).context(
            "Broken stream: stream references a SPS that has not been successfully parsed",
        )?;
        let mut pps = Pps {
            pic_parameter_set_id,
            seq_parameter_set_id,
            entropy_coding_mode_flag: r.read_bit()?,
            bottom_field_pic_order_in_frame_present_flag: r.read_bit()?,
            num_slice_groups_minus1: r.read_ue_max(7)?,
            num_ref_idx_l0_default_active_minus1: 0,
            num_ref_idx_l1_default_active_minus1: 0,
            weighted_pred_flag: false,
            weighted_bipred_idc: 0,
            pic_init_qp_minus26: 0,
            pic_init_qs_minus26: 0,
            chroma_qp_index_offset: 0,
            deblocking_filter_control_present_flag: false,
            constrained_intra_pred_flag: false,
            redundant_pic_cnt_present_flag: false,
            transform_8x8_mode_flag: false,
            pic_scaling_matrix_present_flag: false,
            scaling_lists: Default::default(),
            second_chroma_qp_index_offset: 0,
            sps: Rc::clone(sps),
        };

        if pps.num_slice_groups_minus1 > 0 {
            return Err(anyhow!("Stream contain unsupported/unimplemented NALs"));
        }

        pps.num_ref_idx_l0_default_active_minus1 = r.read_ue_max(31)?;
        pps.num_ref_idx_l1_default_active_minus1 = r.read_ue_max(31)?;

        pps.weighted_pred_flag = r.read_bit()?;
        pps.weighted_bipred_idc = r.read_bits(2)?;

        let qp_bd_offset_y = i32::from(6 * (sps.bit_depth_luma_minus8));
        pps.pic_init_qp_minus26 = r.read_se_bounded(-(26 + qp_bd_offset_y), 25)?;
        pps.pic_init_qs_minus26 = r.read_se_bounded(-26, 25)?;

        pps.chroma_qp_index_offset = r.read_se_bounded(-12, 12)?;
        pps.second_chroma_qp_index_offset = pps.chroma_qp_index_offset;

        pps.deblocking_filter_control_present_flag = r.read_bit()?;
        pps.constrained_intra_pred_flag = r.read_bit()?;
        pps.redundant_pic_cnt_present_flag = r.read_bit()?;

        if r.has_more_rsbp_data() {
            pps.transform_8x8_mode_flag = r.read_bit()?;
            pps.pic_scaling_matrix_present_flag = r.read_bit()?;

            if pps.pic_scaling_matrix_present_flag {
                let num_8x8 = match (pps.transform_8x8_mode_flag, sps.chroma_format_idc) {
                    (false, _) => 0,
                    (true, 3) => 6,
                    (true, _) => 2,
                };

                // Table 7-2: fall-back rule A without a SPS matrix, rule B
                // otherwise.
                let sps_lists = &sps.scaling_lists;
                let (fallback_4x4, fallback_8x8) = if sps.seq_scaling_matrix_present_flag {
                    (
                        (&sps_lists.list_4x4[0], &sps_lists.list_4x4[3]),
                        (&sps_lists.list_8x8[0], &sps_lists.list_8x8[1]),
                    )
                } else {
                    (
                        (&DEFAULT_4X4_INTRA, &DEFAULT_4X4_INTER),
                        (&DEFAULT_8X8_INTRA, &DEFAULT_8X8_INTER),
                    )
                };

                Parser::parse_scaling_lists(
                    &mut r,
                    &mut pps.scaling_lists,
                    num_8x8,
                    fallback_4x4,
                    fallback_8x8,
                )?;
            }

            pps.second_chroma_qp_index_offset = r.read_se_bounded(-12, 12)?;
        }

        if !pps.pic_scaling_matrix_present_flag {
            pps.scaling_lists = sps.scaling_lists.clone();
        }

        let key = pps.pic_parameter_set_id;

        if !self.active_ppses.contains_key(&key)
            && self.active_ppses.len() >= usize::from(MAX_PPS_COUNT)
        {
            return Err(anyhow!(
                "Broken Data: number of active PPSs > MAX_PPS_COUNT"
            ));
        }

        let pps = Rc::new(pps);
        self.active_ppses.remove(&key);
        Ok(self.active_ppses.entry(key).or_insert(pps))
    }

    /// Parses the slice header of `nalu` up to and including the picture
    /// order count fields.
    pub fn parse_slice_header<'a>(&self, nalu: Nalu<'a>) -> anyhow::Result<Slice<'a>> {
        if !nalu.header.type_.is_slice() {
            return Err(anyhow!(
                "Invalid NALU type: {:?} is not a slice NALU",
                nalu.header.type_
            ));
        }

        let mut r = NaluReader::new(nalu.rbsp());

        let mut header = SliceHeader {
            first_mb_in_slice: r.read_ue()?,
            ..Default::default()
        };

        let slice_type = r.read_ue_max::<u8>(9)? % 5;
        header.slice_type = SliceType::n(slice_type)
            .with_context(|| format!("Invalid slice type {}", slice_type))?;

        header.pic_parameter_set_id = r.read_ue_max(u32::from(MAX_PPS_COUNT) - 1)?;

        let pps = self.get_pps(header.pic_parameter_set_id).context(
            "Broken stream: slice references PPS that has not been successfully parsed.",
        )?;

        let sps = &pps.sps;

        if sps.separate_colour_plane_flag {
            header.colour_plane_id = r.read_bits(2)?;
        }

        header.frame_num = r.read_bits(usize::from(sps.log2_max_frame_num_minus4) + 4)?;

        if !sps.frame_mbs_only_flag {
            header.field_pic_flag = r.read_bit()?;
            if header.field_pic_flag {
                header.bottom_field_flag = r.read_bit()?;
            }
        }

        if nalu.header.idr_pic_flag {
            header.idr_pic_id = r.read_ue_max(0xffff)?;
        }

        if sps.pic_order_cnt_type == 0 {
            header.pic_order_cnt_lsb =
                r.read_bits(usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4)?;

            if pps.bottom_field_pic_order_in_frame_present_flag && !header.field_pic_flag {
                header.delta_pic_order_cnt_bottom = r.read_se()?;
            }
        }

        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            header.delta_pic_order_cnt[0] = r.read_se()?;
            if pps.bottom_field_pic_order_in_frame_present_flag && !header.field_pic_flag {
                header.delta_pic_order_cnt[1] = r.read_se()?;
            }
        }

        Ok(Slice { header, nalu })
    }

    pub fn get_sps(&self, sps_id: u8) -> Option<&Rc<Sps>> {
        self.active_spses.get(&sps_id)
    }

    pub fn get_pps(&self, pps_id: u8) -> Option<&Rc<Pps>> {
        self.active_ppses.get(&pps_id)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codec::h264::synthesizer::Synthesizer;
    use crate::codec::h264::test_streams::StreamBuilder;

    fn first_nalu(buf: &[u8]) -> Nalu<'_> {
        Nalu::next(&mut Cursor::new(buf)).unwrap()
    }

    #[test]
    fn parse_minimal_sps() {
        // 16x16, baseline defaults, profile_idc 0, level 1.
        let raw_sps = [0x00, 0x00, 0x00, 0x01, 0x07, 0x00, 0x00, 0x0a, 0xfb, 0x88];

        let mut parser = Parser::default();
        let sps = parser.parse_sps(&first_nalu(&raw_sps)).unwrap();

        assert_eq!(sps.level_idc, Level::L1);
        assert_eq!(sps.chroma_format_idc, 1);
        assert_eq!(sps.max_num_ref_frames, 0);
        assert!(sps.frame_mbs_only_flag);
        assert_eq!((sps.width(), sps.height()), (16, 16));
        assert_eq!(sps.dpb_slot_count(), 1);
    }

    #[test]
    fn parse_high_profile_sps_pps() {
        let sps = SpsBuilder::new()
            .seq_parameter_set_id(3)
            .profile_idc(Profile::High)
            .level_idc(Level::L4_1)
            .resolution(1920, 1080)
            .max_num_ref_frames(4)
            .log2_max_pic_order_cnt_lsb_minus4(2)
            .build();
        let pps = PpsBuilder::new(Rc::clone(&sps))
            .pic_parameter_set_id(5)
            .entropy_coding_mode_flag(true)
            .build();

        let mut stream = Vec::new();
        Synthesizer::<Sps, &mut Vec<u8>>::synthesize(3, &sps, &mut stream, true).unwrap();
        Synthesizer::<Pps, &mut Vec<u8>>::synthesize(3, &pps, &mut stream, true).unwrap();

        let mut cursor = Cursor::new(&stream[..]);
        let mut parser = Parser::default();

        let parsed_sps = parser
            .parse_sps(&Nalu::next(&mut cursor).unwrap())
            .unwrap()
            .clone();
        assert_eq!(parsed_sps.seq_parameter_set_id, 3);
        assert_eq!(parsed_sps.profile_idc, Profile::High as u8);
        assert_eq!(parsed_sps.level_idc, Level::L4_1);
        assert_eq!(parsed_sps.chroma_format_idc, 1);
        assert!(!parsed_sps.seq_scaling_matrix_present_flag);
        assert_eq!(parsed_sps.scaling_lists, ScalingLists::flat());
        assert_eq!(parsed_sps.max_num_ref_frames, 4);
        assert_eq!(parsed_sps.max_pic_order_cnt_lsb(), 64);
        assert_eq!((parsed_sps.width(), parsed_sps.height()), (1920, 1080));

        let parsed_pps = parser.parse_pps(&Nalu::next(&mut cursor).unwrap()).unwrap();
        assert_eq!(parsed_pps.pic_parameter_set_id, 5);
        assert_eq!(parsed_pps.seq_parameter_set_id, 3);
        assert!(parsed_pps.entropy_coding_mode_flag);
        assert_eq!(parsed_pps.scaling_lists, ScalingLists::flat());
    }

    #[test]
    fn pps_with_unknown_sps() {
        let sps = SpsBuilder::new().seq_parameter_set_id(1).resolution(64, 64).build();
        let pps = PpsBuilder::new(sps).build();

        let mut stream = Vec::new();
        Synthesizer::<Pps, &mut Vec<u8>>::synthesize(3, &pps, &mut stream, true).unwrap();

        let mut parser = Parser::default();
        assert!(parser.parse_pps(&first_nalu(&stream)).is_err());
    }

    #[test]
    fn cropped_dimensions() {
        let stream = StreamBuilder::new(800, 600, 1).parameter_sets().build();
        let mut parser = Parser::default();
        let sps = parser.parse_sps(&first_nalu(&stream)).unwrap();

        assert_eq!(sps.pic_width_in_mbs_minus1, 49);
        assert_eq!(sps.pic_height_in_map_units_minus1, 37);
        assert!(sps.frame_cropping_flag);
        // 8 rows cropped at the bottom, 4 crop units of 2 lines.
        assert_eq!(sps.frame_crop_bottom_offset, 4);
        assert_eq!((sps.coded_width(), sps.coded_height()), (800, 608));
        assert_eq!((sps.width(), sps.height()), (800, 600));
    }

    #[test]
    fn field_coded_height_doubles() {
        let sps = Sps {
            pic_width_in_mbs_minus1: 0,
            pic_height_in_map_units_minus1: 1,
            frame_mbs_only_flag: false,
            chroma_format_idc: 1,
            ..Default::default()
        };

        assert_eq!(sps.coded_height(), 64);
        assert_eq!(sps.crop_unit_x_y(), (2, 4));
    }

    #[test]
    fn vui_frame_rate() {
        let sps = SpsBuilder::new().resolution(64, 64).frame_rate(30).build();
        assert_eq!(sps.frame_rate(), Some((60, 2)));

        let sps = SpsBuilder::new().resolution(64, 64).build();
        assert_eq!(sps.frame_rate(), None);
    }

    #[test]
    fn slice_header_fields() {
        let stream = StreamBuilder::new(64, 48, 2)
            .parameter_sets()
            .idr(0)
            .p(1, 6)
            .build();

        let mut cursor = Cursor::new(&stream[..]);
        let mut parser = Parser::default();
        parser.parse_sps(&Nalu::next(&mut cursor).unwrap()).unwrap();
        parser.parse_pps(&Nalu::next(&mut cursor).unwrap()).unwrap();

        let idr = parser
            .parse_slice_header(Nalu::next(&mut cursor).unwrap())
            .unwrap();
        assert!(idr.nalu.header.idr_pic_flag);
        assert_eq!(idr.nalu.header.ref_idc, 3);
        assert!(idr.header.slice_type.is_intra());
        assert_eq!(idr.header.frame_num, 0);
        assert_eq!(idr.header.pic_order_cnt_lsb, 0);

        let p = parser
            .parse_slice_header(Nalu::next(&mut cursor).unwrap())
            .unwrap();
        assert!(!p.nalu.header.idr_pic_flag);
        assert!(p.header.slice_type.is_p());
        assert_eq!(p.header.frame_num, 1);
        assert_eq!(p.header.pic_order_cnt_lsb, 6);
    }

    #[test]
    fn slice_without_pps() {
        let stream = StreamBuilder::new(64, 48, 2).idr(0).build();
        let parser = Parser::default();
        assert!(parser.parse_slice_header(first_nalu(&stream)).is_err());
    }

    #[test]
    fn invalid_sps_crop_width() {
        // Cropping offsets larger than the coded picture.
        let invalid_sps = vec![
            0x00, 0x00, 0x01, 0x07, 0x00, 0x00, 0x0a, 0xfb, 0xb0, 0x32, 0xc0, 0xca, 0x80,
        ];

        let mut parser = Parser::default();
        let nalu = first_nalu(&invalid_sps);
        assert_eq!(nalu.header.type_, NaluType::Sps);
        parser.parse_sps(&nalu).unwrap_err();
    }
}
