// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Write;

use thiserror::Error;

use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::nalu_writer::NaluWriter;
use crate::codec::h264::nalu_writer::NaluWriterError;
use crate::codec::h264::parser::has_chroma_info;
use crate::codec::h264::parser::HrdParams;
use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::ScalingLists;
use crate::codec::h264::parser::Sps;
use crate::codec::h264::parser::DEFAULT_4X4_INTER;
use crate::codec::h264::parser::DEFAULT_4X4_INTRA;
use crate::codec::h264::parser::DEFAULT_8X8_INTER;
use crate::codec::h264::parser::DEFAULT_8X8_INTRA;

mod private {
    pub trait NaluStruct {}
}

impl private::NaluStruct for Sps {}

impl private::NaluStruct for Pps {}

#[derive(Error, Debug)]
pub enum SynthesizerError {
    #[error("tried to synthesize unsupported settings")]
    Unsupported,
    #[error(transparent)]
    NaluWriter(#[from] NaluWriterError),
}

pub type SynthesizerResult<T> = Result<T, SynthesizerError>;

/// Encodes parameter sets into Annex B NAL units, the inverse of
/// [`crate::codec::h264::parser::Parser`].
pub struct Synthesizer<'n, N: private::NaluStruct, W: Write> {
    writer: NaluWriter<W>,
    nalu: &'n N,
}

/// Extended Sample Aspect Ratio, table E-1.
const EXTENDED_SAR: u8 = 255;

impl<N: private::NaluStruct, W: Write> Synthesizer<'_, N, W> {
    fn u<T: Into<u32>>(&mut self, bits: usize, value: T) -> SynthesizerResult<()> {
        self.writer.write_u(bits, value)?;
        Ok(())
    }

    fn ue<T: Into<u32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_ue(value)?;
        Ok(())
    }

    fn se<T: Into<i32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_se(value)?;
        Ok(())
    }

    /// 7.3.2.1.1.1, as deltas from the previous coefficient.
    fn scaling_list(&mut self, list: &[u8], default: &[u8]) -> SynthesizerResult<()> {
        if list == default {
            // next_scale == 0 on the first coefficient selects the default.
            self.se(-8)?;
            return Ok(());
        }

        // Trailing repeats of the last coefficient are implied.
        let mut run = list.len();
        while run > 1 && list[run - 2] == list[run - 1] {
            run -= 1;
        }

        let mut last_scale = 8;
        for scale in &list[..run] {
            self.se(i32::from(*scale) - last_scale)?;
            last_scale = i32::from(*scale);
        }

        if run < list.len() {
            self.se(-last_scale)?;
        }

        Ok(())
    }

    /// Writes `num_8x8` present flags and lists after the six 4x4 ones. A
    /// zeroed list is written as absent.
    fn scaling_lists(&mut self, lists: &ScalingLists, num_8x8: usize) -> SynthesizerResult<()> {
        for (i, list) in lists.list_4x4.iter().enumerate() {
            let default = if i < 3 {
                &DEFAULT_4X4_INTRA
            } else {
                &DEFAULT_4X4_INTER
            };

            let present = *list != [0; 16];
            self.u(1, present)?;
            if present {
                self.scaling_list(list, default)?;
            }
        }

        for (i, list) in lists.list_8x8.iter().take(num_8x8).enumerate() {
            let default = if i % 2 == 0 {
                &DEFAULT_8X8_INTRA
            } else {
                &DEFAULT_8X8_INTER
            };

            let present = *list != [0; 64];
            self.u(1, present)?;
            if present {
                self.scaling_list(list, default)?;
            }
        }

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, Sps, W> {
    pub fn synthesize(
        ref_idc: u8,
        sps: &'n Sps,
        writer: W,
        ep_enabled: bool,
    ) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: sps,
        };

        s.writer.write_header(ref_idc, NaluType::Sps)?;
        s.seq_parameter_set_data()?;
        s.writer.write_trailing_bits()?;
        Ok(())
    }

    fn hrd_parameters(&mut self, hrd_params: &HrdParams) -> SynthesizerResult<()> {
        self.ue(hrd_params.cpb_cnt_minus1)?;
        self.u(4, hrd_params.bit_rate_scale)?;
        self.u(4, hrd_params.cpb_size_scale)?;

        for i in 0..=usize::from(hrd_params.cpb_cnt_minus1) {
            self.ue(hrd_params.bit_rate_value_minus1[i])?;
            self.ue(hrd_params.cpb_size_value_minus1[i])?;
            self.u(1, hrd_params.cbr_flag[i])?;
        }

        self.u(5, hrd_params.initial_cpb_removal_delay_length_minus1)?;
        self.u(5, hrd_params.cpb_removal_delay_length_minus1)?;
        self.u(5, hrd_params.dpb_output_delay_length_minus1)?;
        self.u(5, hrd_params.time_offset_length)?;

        Ok(())
    }

    fn vui_parameters(&mut self) -> SynthesizerResult<()> {
        // E.1.1
        let vui = &self.nalu.vui_parameters;

        self.u(1, vui.aspect_ratio_info_present_flag)?;
        if vui.aspect_ratio_info_present_flag {
            self.u(8, vui.aspect_ratio_idc)?;
            if vui.aspect_ratio_idc == EXTENDED_SAR {
                self.u(16, vui.sar_width)?;
                self.u(16, vui.sar_height)?;
            }
        }

        self.u(1, vui.overscan_info_present_flag)?;
        if vui.overscan_info_present_flag {
            self.u(1, vui.overscan_appropriate_flag)?;
        }

        self.u(1, vui.video_signal_type_present_flag)?;
        if vui.video_signal_type_present_flag {
            self.u(3, vui.video_format)?;
            self.u(1, vui.video_full_range_flag)?;

            self.u(1, vui.colour_description_present_flag)?;
            if vui.colour_description_present_flag {
                self.u(8, vui.colour_primaries)?;
                self.u(8, vui.transfer_characteristics)?;
                self.u(8, vui.matrix_coefficients)?;
            }
        }

        self.u(1, vui.chroma_loc_info_present_flag)?;
        if vui.chroma_loc_info_present_flag {
            self.ue(vui.chroma_sample_loc_type_top_field)?;
            self.ue(vui.chroma_sample_loc_type_bottom_field)?;
        }

        self.u(1, vui.timing_info_present_flag)?;
        if vui.timing_info_present_flag {
            self.u(32, vui.num_units_in_tick)?;
            self.u(32, vui.time_scale)?;
            self.u(1, vui.fixed_frame_rate_flag)?;
        }

        self.u(1, vui.nal_hrd_parameters_present_flag)?;
        if vui.nal_hrd_parameters_present_flag {
            self.hrd_parameters(&vui.nal_hrd_parameters)?;
        }

        self.u(1, vui.vcl_hrd_parameters_present_flag)?;
        if vui.vcl_hrd_parameters_present_flag {
            self.hrd_parameters(&vui.vcl_hrd_parameters)?;
        }

        if vui.nal_hrd_parameters_present_flag || vui.vcl_hrd_parameters_present_flag {
            self.u(1, vui.low_delay_hrd_flag)?;
        }

        self.u(1, vui.pic_struct_present_flag)?;

        self.u(1, vui.bitstream_restriction_flag)?;
        if vui.bitstream_restriction_flag {
            self.u(1, vui.motion_vectors_over_pic_boundaries_flag)?;
            self.ue(vui.max_bytes_per_pic_denom)?;
            self.ue(vui.max_bits_per_mb_denom)?;
            self.ue(vui.log2_max_mv_length_horizontal)?;
            self.ue(vui.log2_max_mv_length_vertical)?;
            self.ue(vui.max_num_reorder_frames)?;
            self.ue(vui.max_dec_frame_buffering)?;
        }

        Ok(())
    }

    fn seq_parameter_set_data(&mut self) -> SynthesizerResult<()> {
        // 7.3.2.1.1
        let sps = self.nalu;

        self.u(8, sps.profile_idc)?;
        self.u(1, sps.constraint_set0_flag)?;
        self.u(1, sps.constraint_set1_flag)?;
        self.u(1, sps.constraint_set2_flag)?;
        self.u(1, sps.constraint_set3_flag)?;
        self.u(1, sps.constraint_set4_flag)?;
        self.u(1, sps.constraint_set5_flag)?;
        self.u(2, /* reserved_zero_2bits */ 0u32)?;
        self.u(8, sps.level_idc as u32)?;
        self.ue(sps.seq_parameter_set_id)?;

        if has_chroma_info(sps.profile_idc) {
            self.ue(sps.chroma_format_idc)?;

            if sps.chroma_format_idc == 3 {
                self.u(1, sps.separate_colour_plane_flag)?;
            }

            self.ue(sps.bit_depth_luma_minus8)?;
            self.ue(sps.bit_depth_chroma_minus8)?;
            self.u(1, sps.qpprime_y_zero_transform_bypass_flag)?;
            self.u(1, sps.seq_scaling_matrix_present_flag)?;

            if sps.seq_scaling_matrix_present_flag {
                let num_8x8 = if sps.chroma_format_idc != 3 { 2 } else { 6 };
                self.scaling_lists(&sps.scaling_lists, num_8x8)?;
            }
        }

        self.ue(sps.log2_max_frame_num_minus4)?;
        self.ue(sps.pic_order_cnt_type)?;

        if sps.pic_order_cnt_type == 0 {
            self.ue(sps.log2_max_pic_order_cnt_lsb_minus4)?;
        } else if sps.pic_order_cnt_type == 1 {
            if sps.offset_for_ref_frame.len() > 255 {
                return Err(SynthesizerError::Unsupported);
            }

            self.u(1, sps.delta_pic_order_always_zero_flag)?;
            self.se(sps.offset_for_non_ref_pic)?;
            self.se(sps.offset_for_top_to_bottom_field)?;
            self.ue(sps.offset_for_ref_frame.len() as u32)?;

            for offset in &sps.offset_for_ref_frame {
                self.se(*offset)?;
            }
        }

        self.ue(sps.max_num_ref_frames)?;
        self.u(1, sps.gaps_in_frame_num_value_allowed_flag)?;
        self.ue(sps.pic_width_in_mbs_minus1)?;
        self.ue(sps.pic_height_in_map_units_minus1)?;
        self.u(1, sps.frame_mbs_only_flag)?;
        if !sps.frame_mbs_only_flag {
            self.u(1, sps.mb_adaptive_frame_field_flag)?;
        }
        self.u(1, sps.direct_8x8_inference_flag)?;

        self.u(1, sps.frame_cropping_flag)?;
        if sps.frame_cropping_flag {
            self.ue(sps.frame_crop_left_offset)?;
            self.ue(sps.frame_crop_right_offset)?;
            self.ue(sps.frame_crop_top_offset)?;
            self.ue(sps.frame_crop_bottom_offset)?;
        }

        self.u(1, sps.vui_parameters_present_flag)?;
        if sps.vui_parameters_present_flag {
            self.vui_parameters()?;
        }

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, Pps, W> {
    pub fn synthesize(
        ref_idc: u8,
        pps: &'n Pps,
        writer: W,
        ep_enabled: bool,
    ) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: pps,
        };

        s.writer.write_header(ref_idc, NaluType::Pps)?;
        s.pic_parameter_set_rbsp()?;
        s.writer.write_trailing_bits()?;
        Ok(())
    }

    fn pic_parameter_set_rbsp(&mut self) -> SynthesizerResult<()> {
        // 7.3.2.2
        let pps = self.nalu;

        self.ue(pps.pic_parameter_set_id)?;
        self.ue(pps.seq_parameter_set_id)?;
        self.u(1, pps.entropy_coding_mode_flag)?;
        self.u(1, pps.bottom_field_pic_order_in_frame_present_flag)?;

        self.ue(pps.num_slice_groups_minus1)?;
        if pps.num_slice_groups_minus1 > 0 {
            return Err(SynthesizerError::Unsupported);
        }

        self.ue(pps.num_ref_idx_l0_default_active_minus1)?;
        self.ue(pps.num_ref_idx_l1_default_active_minus1)?;
        self.u(1, pps.weighted_pred_flag)?;
        self.u(2, pps.weighted_bipred_idc)?;
        self.se(pps.pic_init_qp_minus26)?;
        self.se(pps.pic_init_qs_minus26)?;
        self.se(pps.chroma_qp_index_offset)?;
        self.u(1, pps.deblocking_filter_control_present_flag)?;
        self.u(1, pps.constrained_intra_pred_flag)?;
        self.u(1, pps.redundant_pic_cnt_present_flag)?;

        if !(pps.transform_8x8_mode_flag
            || pps.pic_scaling_matrix_present_flag
            || pps.second_chroma_qp_index_offset != pps.chroma_qp_index_offset)
        {
            return Ok(());
        }

        self.u(1, pps.transform_8x8_mode_flag)?;
        self.u(1, pps.pic_scaling_matrix_present_flag)?;

        if pps.pic_scaling_matrix_present_flag {
            let num_8x8 = match (pps.transform_8x8_mode_flag, pps.sps.chroma_format_idc) {
                (false, _) => 0,
                (true, 3) => 6,
                (true, _) => 2,
            };
            self.scaling_lists(&pps.scaling_lists, num_8x8)?;
        }

        self.se(pps.second_chroma_qp_index_offset)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codec::h264::nalu::Nalu;
    use crate::codec::h264::parser::Level;
    use crate::codec::h264::parser::Parser;
    use crate::codec::h264::parser::PpsBuilder;
    use crate::codec::h264::parser::Profile;
    use crate::codec::h264::parser::SpsBuilder;

    #[test]
    fn synthesize_minimal_sps() {
        let raw_sps_buf = [0x00, 0x00, 0x00, 0x01, 0x07, 0x00, 0x00, 0x0a, 0xfb, 0x88];

        let mut parser = Parser::default();
        let nalu = Nalu::next(&mut Cursor::new(&raw_sps_buf[..])).unwrap();
        let sps = parser.parse_sps(&nalu).unwrap();

        let mut buf = Vec::<u8>::new();
        Synthesizer::<'_, Sps, _>::synthesize(0, sps, &mut buf, false).unwrap();

        assert_eq!(buf, raw_sps_buf);
    }

    #[test]
    fn synthesize_sps_pps() {
        let raw_sps_pps = [
            0x00, 0x00, 0x00, 0x01, 0x07, 0x4d, 0x40, 0x0d, 0xa9, 0x18, 0x28, 0x3e, 0x60, 0x0d,
            0x41, 0x80, 0x41, 0xad, 0xb0, 0xad, 0x7b, 0xdf, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08,
            0xde, 0x09, 0x88,
        ];

        let mut buf = Vec::<u8>::new();
        let mut cursor = Cursor::new(&raw_sps_pps[..]);
        let mut parser = Parser::default();

        let sps = parser.parse_sps(&Nalu::next(&mut cursor).unwrap()).unwrap();
        assert_eq!(sps.profile_idc, Profile::Main as u8);
        assert_eq!(sps.level_idc, Level::L1_3);
        Synthesizer::<'_, Sps, _>::synthesize(0, sps, &mut buf, false).unwrap();

        let pps = parser.parse_pps(&Nalu::next(&mut cursor).unwrap()).unwrap();
        Synthesizer::<'_, Pps, _>::synthesize(0, pps, &mut buf, false).unwrap();

        assert_eq!(buf, raw_sps_pps);
    }

    #[test]
    fn built_parameter_sets_survive_parsing() {
        let sps = SpsBuilder::new()
            .profile_idc(Profile::Main)
            .level_idc(Level::L3_1)
            .resolution(800, 600)
            .max_num_ref_frames(1)
            .log2_max_pic_order_cnt_lsb_minus4(4)
            .frame_rate(25)
            .build();
        let pps = PpsBuilder::new(sps.clone()).build();

        let mut buf = Vec::<u8>::new();
        Synthesizer::<'_, Sps, _>::synthesize(3, &sps, &mut buf, true).unwrap();
        Synthesizer::<'_, Pps, _>::synthesize(3, &pps, &mut buf, true).unwrap();

        let mut cursor = Cursor::new(&buf[..]);
        let mut parser = Parser::default();

        let parsed = parser
            .parse_sps(&Nalu::next(&mut cursor).unwrap())
            .unwrap()
            .clone();
        assert_eq!(parsed.profile_idc, Profile::Main as u8);
        assert_eq!(parsed.level_idc, Level::L3_1);
        assert_eq!((parsed.width(), parsed.height()), (800, 600));
        assert_eq!(parsed.max_num_ref_frames, 1);
        assert_eq!(parsed.log2_max_pic_order_cnt_lsb_minus4, 4);
        assert_eq!(parsed.frame_rate(), Some((50, 2)));
        // Non-high profiles carry no chroma information and get flat lists.
        assert_eq!(
            Sps {
                scaling_lists: parsed.scaling_lists.clone(),
                ..(*sps).clone()
            },
            *parsed
        );

        let parsed_pps = parser.parse_pps(&Nalu::next(&mut cursor).unwrap()).unwrap();
        assert_eq!(parsed_pps.sps, parsed);
        assert_eq!(parsed_pps.pic_init_qp_minus26, pps.pic_init_qp_minus26);
    }

    #[test]
    fn synthesize_sps_scaling_lists() {
        let mut sps = Sps {
            profile_idc: Profile::High as u8,
            chroma_format_idc: 1,
            seq_scaling_matrix_present_flag: true,
            frame_mbs_only_flag: true,
            ..Default::default()
        };

        sps.scaling_lists.list_4x4 =
            [[11, 20, 10, 20, 10, 22, 10, 20, 10, 20, 13, 20, 10, 20, 10, 24]; 6];
        sps.scaling_lists.list_8x8[0] = DEFAULT_8X8_INTRA;
        for (i, coeff) in sps.scaling_lists.list_8x8[1].iter_mut().enumerate() {
            *coeff = if i < 40 { 10 + (i % 7) as u8 } else { 77 };
        }

        let mut buf = Vec::<u8>::new();
        Synthesizer::<'_, Sps, _>::synthesize(0, &sps, &mut buf, false).unwrap();

        let mut parser = Parser::default();
        let nalu = Nalu::next(&mut Cursor::new(&buf[..])).unwrap();
        let parsed = parser.parse_sps(&nalu).unwrap();

        assert_eq!(sps.scaling_lists, parsed.scaling_lists);
    }

    #[test]
    fn slice_groups_are_unsupported() {
        let sps = SpsBuilder::new().resolution(64, 64).build();
        let mut pps = (*PpsBuilder::new(sps).build()).clone();
        pps.num_slice_groups_minus1 = 1;

        let mut buf = Vec::<u8>::new();
        assert!(matches!(
            Synthesizer::<'_, Pps, _>::synthesize(0, &pps, &mut buf, false),
            Err(SynthesizerError::Unsupported)
        ));
    }
}
