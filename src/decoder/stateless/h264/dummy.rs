// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the decoder
//! run so we can test it in isolation.

use std::rc::Rc;

use crate::backend::dummy::*;
use crate::bitstream_utils::NalStream;
use crate::codec::h264::dpb::DecodeSlots;
use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::Slice;
use crate::codec::h264::parser::Sps;
use crate::codec::h264::picture::PictureData;
use crate::decoder::stateless::h264::StatelessH264DecoderBackend;
use crate::decoder::stateless::h264::H264;
use crate::decoder::stateless::StatelessBackendError;
use crate::decoder::stateless::StatelessBackendResult;
use crate::decoder::stateless::StatelessDecoder;

impl StatelessH264DecoderBackend for Backend {
    fn new_sequence(&mut self, sps: &Rc<Sps>, _: &Rc<Pps>) -> StatelessBackendResult<()> {
        if !self.dpb_and_output_coincide {
            return Err(StatelessBackendError::Unsupported(
                "DPB and output images must coincide".into(),
            ));
        }

        let num_slots = sps.dpb_slot_count();
        if num_slots > self.max_dpb_slots {
            return Err(StatelessBackendError::Unsupported(format!(
                "{} DPB slots requested, {} supported",
                num_slots, self.max_dpb_slots
            )));
        }

        self.num_slots = num_slots;
        self.record(BackendCall::NewSequence {
            coded_width: sps.coded_width(),
            coded_height: sps.coded_height(),
            num_slots,
        });
        Ok(())
    }

    fn decode_picture(
        &mut self,
        picture: &PictureData,
        slice: &Slice,
        slots: &DecodeSlots,
        _: &Dpb,
    ) -> StatelessBackendResult<()> {
        let index = self.num_decodes;
        self.num_decodes += 1;

        if self.fail_decode_at == Some(index) {
            return Err(StatelessBackendError::Submission(format!(
                "decode {} rejected",
                index
            )));
        }

        let bitstream = slice.nalu.with_start_code();
        self.record(BackendCall::Decode {
            setup: slots.setup,
            references: slots.references.clone(),
            frame_num: picture.frame_num,
            key: picture.key,
            size: bitstream.len(),
            crc: crc32fast::hash(bitstream),
        });
        Ok(())
    }
}

impl StatelessDecoder<H264, Backend> {
    // Creates a new instance of the decoder using the dummy backend.
    pub fn new_dummy(stream: NalStream) -> Self {
        Self::new(stream, Backend::new())
    }
}
