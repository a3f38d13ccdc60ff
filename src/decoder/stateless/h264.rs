// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#[cfg(test)]
mod dummy;
#[cfg(feature = "vulkan")]
mod vulkan;

use std::rc::Rc;
use std::time::Duration;

use log::debug;
use log::info;
use log::trace;

use crate::bitstream_utils::NalStream;
use crate::codec::h264::dpb::DecodeSlots;
use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::dpb::DpbSlot;
use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::parser::Parser;
use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::Slice;
use crate::codec::h264::parser::Sps;
use crate::codec::h264::picture::PicOrderCounter;
use crate::codec::h264::picture::PictureData;
use crate::decoder::stateless::StatelessCodec;
use crate::decoder::stateless::StatelessDecoder;
use crate::decoder::stateless::StatelessDecoderBackend;
use crate::decoder::stateless::StatelessBackendResult;
use crate::decoder::DecodeError;
use crate::decoder::DecoderState;

/// Stateless backend methods specific to H.264.
pub trait StatelessH264DecoderBackend: StatelessDecoderBackend {
    /// Called once the parameter sets of the stream are known. Creates the
    /// hardware session with `sps.dpb_slot_count()` picture slots and uploads
    /// `sps` and `pps` as its only parameter sets.
    fn new_sequence(&mut self, sps: &Rc<Sps>, pps: &Rc<Pps>) -> StatelessBackendResult<()>;

    /// Decodes `slice` into `slots.setup`, predicting from `slots.references`.
    /// `dpb` describes the pictures currently held by every slot.
    ///
    /// Returns once the decode has completed.
    fn decode_picture(
        &mut self,
        picture: &PictureData,
        slice: &Slice,
        slots: &DecodeSlots,
        dpb: &Dpb,
    ) -> StatelessBackendResult<()>;
}

/// State of the H.264 decoder, independent of the backend.
pub struct H264DecoderState {
    /// H.264 bitstream parser.
    parser: Parser,

    /// The parameter sets the hardware session was created with.
    sps: Option<Rc<Sps>>,
    pps: Option<Rc<Pps>>,

    /// The decoded picture buffer.
    dpb: Dpb,

    poc: PicOrderCounter,

    /// Slot of the picture displayed last.
    displayed: Option<usize>,
}

impl Default for H264DecoderState {
    fn default() -> Self {
        Self {
            parser: Default::default(),
            sps: None,
            pps: None,
            dpb: Dpb::new(1),
            poc: PicOrderCounter::new(16),
            displayed: None,
        }
    }
}

/// [`StatelessCodec`] structure to use in order to create a H.264 stateless decoder.
///
/// # Accepted input
///
/// An Annex B byte stream of progressive, 8-bit 4:2:0 frames using
/// `pic_order_cnt_type` 0 and a single slice per picture. The stream is played in a loop.
pub struct H264;

impl StatelessCodec for H264 {
    type DecoderState = H264DecoderState;
}

/// Rejects the streams the decoding pipeline cannot handle.
fn check_supported(sps: &Sps) -> Result<(), DecodeError> {
    if sps.pic_order_cnt_type != 0 {
        return Err(DecodeError::UnsupportedStream(format!(
            "pic_order_cnt_type {}",
            sps.pic_order_cnt_type
        )));
    }

    if !sps.frame_mbs_only_flag {
        return Err(DecodeError::UnsupportedStream(
            "interlaced coding".into(),
        ));
    }

    if sps.chroma_format_idc != 1 || sps.separate_colour_plane_flag {
        return Err(DecodeError::UnsupportedStream(format!(
            "chroma_format_idc {}",
            sps.chroma_format_idc
        )));
    }

    if sps.bit_depth_luma_minus8 != 0 || sps.bit_depth_chroma_minus8 != 0 {
        return Err(DecodeError::UnsupportedStream(format!(
            "bit depth {}/{}",
            sps.bit_depth_luma_minus8 + 8,
            sps.bit_depth_chroma_minus8 + 8
        )));
    }

    Ok(())
}

impl<B> StatelessDecoder<H264, B>
where
    B: StatelessH264DecoderBackend,
{
    pub fn new(stream: NalStream, backend: B) -> Self {
        Self {
            stream,
            codec: Default::default(),
            backend,
            state: DecoderState::Uninitialized,
        }
    }

    /// Marks the decoder as failed if `result` is a fatal error.
    fn fail_on_error<T>(&mut self, result: Result<T, DecodeError>) -> Result<T, DecodeError> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.state = DecoderState::Failed;
            }
        }

        result
    }

    fn ensure_active(&self) -> Result<(), DecodeError> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(DecodeError::InvalidState(self.state))
        }
    }

    /// Reads the parameter sets at the start of the stream and creates the
    /// hardware session from them.
    pub fn initialize(&mut self) -> Result<(), DecodeError> {
        if self.state != DecoderState::Uninitialized {
            return Err(DecodeError::InvalidState(self.state));
        }

        let result = self.create_session();
        self.fail_on_error(result)
    }

    fn create_session(&mut self) -> Result<(), DecodeError> {
        self.state = DecoderState::ParsingHeaders;
        let (sps, pps) = self.parse_headers()?;
        check_supported(&sps)?;

        self.backend.new_sequence(&sps, &pps)?;

        self.codec.dpb = Dpb::new(sps.dpb_slot_count());
        self.codec.poc = PicOrderCounter::from_sps(&sps);
        self.codec.sps = Some(sps);
        self.codec.pps = Some(pps);
        self.state = DecoderState::Ready;

        info!(
            "H.264 session ready: {}x{}, {} DPB slots",
            self.width(),
            self.height(),
            self.codec.dpb.len()
        );

        Ok(())
    }

    /// Parses NAL units until a PPS and the SPS it refers to are known. Later
    /// parameter sets in the stream are ignored.
    fn parse_headers(&mut self) -> Result<(Rc<Sps>, Rc<Pps>), DecodeError> {
        let start_loops = self.stream.loop_count();

        loop {
            if self.stream.loop_count() - start_loops >= 2 {
                return Err(DecodeError::MissingParameterSets);
            }

            let nalu = self.stream.next_nal()?;
            match nalu.header.type_ {
                NaluType::Sps => {
                    let sps = self.codec.parser.parse_sps(&nalu)?;
                    debug!(
                        "SPS {}: {}x{}, {} reference frames",
                        sps.seq_parameter_set_id,
                        sps.width(),
                        sps.height(),
                        sps.max_num_ref_frames
                    );
                }
                NaluType::Pps => {
                    let pps = self.codec.parser.parse_pps(&nalu)?;
                    debug!(
                        "PPS {} referring to SPS {}",
                        pps.pic_parameter_set_id, pps.seq_parameter_set_id
                    );
                    return Ok((Rc::clone(&pps.sps), Rc::clone(pps)));
                }
                type_ if type_.is_slice() => return Err(DecodeError::MissingParameterSets),
                type_ => trace!("Ignoring {:?} before the parameter sets", type_),
            }
        }
    }

    /// Decodes pictures until the slot the next picture would be decoded
    /// into holds a picture that has not been displayed yet. The deferred
    /// picture is decoded by a later call.
    ///
    /// Returns the number of pictures decoded.
    pub fn decode_ahead(&mut self) -> Result<usize, DecodeError> {
        self.ensure_active()?;
        let result = self.decode_until_blocked();
        self.fail_on_error(result)
    }

    fn decode_until_blocked(&mut self) -> Result<usize, DecodeError> {
        let start_loops = self.stream.loop_count();
        let mut decoded = 0;

        loop {
            if decoded == 0 && self.stream.loop_count() - start_loops >= 2 {
                return Err(DecodeError::NoPictures);
            }

            let nalu = self.stream.next_nal()?;
            if !nalu.header.type_.is_slice() {
                trace!("Ignoring {:?} at offset {}", nalu.header.type_, nalu.offset);
                continue;
            }

            let slice = self.codec.parser.parse_slice_header(nalu)?;
            if slice.header.first_mb_in_slice != 0 {
                debug!(
                    "Skipping slice starting at macroblock {}",
                    slice.header.first_mb_in_slice
                );
                continue;
            }

            let idr = slice.nalu.header.idr_pic_flag;
            let setup = self.codec.dpb.next_setup_slot(idr);
            if self.codec.dpb.slot(setup).is_some_and(DpbSlot::is_pending) {
                let offset = slice.nalu.offset;
                self.stream.rewind(offset);
                trace!("Slot {} not displayed yet, deferring picture", setup);
                return Ok(decoded);
            }

            self.state = DecoderState::Decoding;

            let nal_ref_idc = slice.nalu.header.ref_idc;
            let key = self.codec.poc.next(
                slice.header.pic_order_cnt_lsb,
                idr,
                nal_ref_idc != 0,
            );
            let picture = PictureData {
                frame_num: slice.header.frame_num,
                nal_ref_idc,
                idr,
                idr_pic_id: slice.header.idr_pic_id,
                pic_order_cnt_lsb: slice.header.pic_order_cnt_lsb,
                key,
            };

            let slots = self.codec.dpb.begin_picture(idr);
            self.backend
                .decode_picture(&picture, &slice, &slots, &self.codec.dpb)?;
            self.codec.dpb.finish_picture(
                slots.setup,
                picture.frame_num,
                picture.key,
                picture.is_reference(),
            );

            decoded += 1;
        }
    }

    /// Picks the undisplayed picture that comes first in display order and
    /// converts it into `target`, if any.
    ///
    /// Returns the slot of the displayed picture, or `None` if every decoded
    /// picture has been displayed already.
    pub fn display(
        &mut self,
        target: Option<&B::DisplayTarget>,
    ) -> Result<Option<usize>, DecodeError> {
        self.ensure_active()?;

        let Some(slot) = self.codec.dpb.select_for_display() else {
            return Ok(None);
        };

        self.state = DecoderState::Displaying;
        if let Some(target) = target {
            let result = self
                .backend
                .convert_picture(slot, target)
                .map_err(DecodeError::from);
            self.fail_on_error(result)?;
        }

        self.codec.displayed = Some(slot);
        Ok(Some(slot))
    }

    pub fn sps(&self) -> Option<&Rc<Sps>> {
        self.codec.sps.as_ref()
    }

    pub fn pps(&self) -> Option<&Rc<Pps>> {
        self.codec.pps.as_ref()
    }

    pub fn dpb(&self) -> &Dpb {
        &self.codec.dpb
    }

    /// Slot of the picture displayed last.
    pub fn displayed_slot(&self) -> Option<usize> {
        self.codec.displayed
    }

    /// Visible width of the pictures, 0 before initialization.
    pub fn width(&self) -> u32 {
        self.codec.sps.as_ref().map_or(0, |sps| sps.width())
    }

    /// Visible height of the pictures, 0 before initialization.
    pub fn height(&self) -> u32 {
        self.codec.sps.as_ref().map_or(0, |sps| sps.height())
    }

    /// Duration of a frame as signalled by the VUI timing info, if present.
    pub fn frame_interval(&self) -> Option<Duration> {
        let (num, den) = self.codec.sps.as_ref()?.frame_rate()?;
        if num == 0 {
            return None;
        }

        Some(Duration::from_nanos(
            u64::from(den) * 1_000_000_000 / u64::from(num),
        ))
    }
}
