// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Builds small Annex B streams for unit tests.

use std::rc::Rc;

use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::nalu_writer::NaluWriter;
use crate::codec::h264::parser::Level;
use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::PpsBuilder;
use crate::codec::h264::parser::Profile;
use crate::codec::h264::parser::SliceType;
use crate::codec::h264::parser::Sps;
use crate::codec::h264::parser::SpsBuilder;
use crate::codec::h264::synthesizer::Synthesizer;

pub struct StreamBuilder {
    sps: Rc<Sps>,
    pps: Rc<Pps>,
    data: Vec<u8>,
}

impl StreamBuilder {
    /// Main profile, MaxPicOrderCntLsb of 256 and MaxFrameNum of 16.
    pub fn new(width: u32, height: u32, max_num_ref_frames: u8) -> Self {
        let sps = SpsBuilder::new()
            .profile_idc(Profile::Main)
            .level_idc(Level::L4)
            .resolution(width, height)
            .max_num_ref_frames(max_num_ref_frames)
            .log2_max_pic_order_cnt_lsb_minus4(4)
            .build();

        Self::with_sps(sps)
    }

    pub fn with_sps(sps: Rc<Sps>) -> Self {
        let pps = PpsBuilder::new(Rc::clone(&sps)).build();

        Self {
            sps,
            pps,
            data: Vec::new(),
        }
    }

    pub fn parameter_sets(mut self) -> Self {
        Synthesizer::<Sps, _>::synthesize(3, &self.sps, &mut self.data, true).unwrap();
        Synthesizer::<Pps, _>::synthesize(3, &self.pps, &mut self.data, true).unwrap();
        self
    }

    /// Writes a slice header up to the POC fields, followed by a few bytes
    /// standing in for the macroblock layer.
    pub fn slice(
        mut self,
        idr: bool,
        ref_idc: u8,
        slice_type: SliceType,
        frame_num: u16,
        pic_order_cnt_lsb: u16,
    ) -> Self {
        let sps = &self.sps;
        let type_ = if idr {
            NaluType::SliceIdr
        } else {
            NaluType::Slice
        };

        let mut writer = NaluWriter::new(&mut self.data, true);
        writer.write_header(ref_idc, type_).unwrap();
        writer.write_ue(0u32).unwrap();
        writer.write_ue(slice_type as u32 + 5).unwrap();
        writer.write_ue(self.pps.pic_parameter_set_id).unwrap();
        writer
            .write_u(usize::from(sps.log2_max_frame_num_minus4) + 4, frame_num)
            .unwrap();
        if idr {
            writer.write_ue(0u32).unwrap();
        }
        writer
            .write_u(
                usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4,
                pic_order_cnt_lsb,
            )
            .unwrap();
        writer.write_u(16, 0xb00fu32 ^ u32::from(pic_order_cnt_lsb)).unwrap();
        writer.write_trailing_bits().unwrap();
        drop(writer);

        self
    }

    pub fn idr(self, pic_order_cnt_lsb: u16) -> Self {
        self.slice(true, 3, SliceType::I, 0, pic_order_cnt_lsb)
    }

    /// A reference P picture.
    pub fn p(self, frame_num: u16, pic_order_cnt_lsb: u16) -> Self {
        self.slice(false, 2, SliceType::P, frame_num, pic_order_cnt_lsb)
    }

    /// A P picture no other picture refers to.
    pub fn non_ref_p(self, frame_num: u16, pic_order_cnt_lsb: u16) -> Self {
        self.slice(false, 0, SliceType::P, frame_num, pic_order_cnt_lsb)
    }

    /// Appends an SEI unit, which decoding skips.
    pub fn sei(mut self) -> Self {
        self.data
            .extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x06, 0x05, 0x01, 0xff, 0x80]);
        self
    }

    pub fn sps(&self) -> &Rc<Sps> {
        &self.sps
    }

    pub fn build(self) -> Vec<u8> {
        self.data
    }
}
