// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::rc::Rc;

use ash::vk;
use ash::vk::native::StdVideoDecodeH264PictureInfo;
use ash::vk::native::StdVideoDecodeH264ReferenceInfo;
use log::debug;
use log::info;

use crate::backend::vulkan::bitstream::BitstreamBuffer;
use crate::backend::vulkan::capabilities::check_picture_format;
use crate::backend::vulkan::capabilities::DecodeCapabilities;
use crate::backend::vulkan::capabilities::H264Profile;
use crate::backend::vulkan::command::pipeline_barrier;
use crate::backend::vulkan::command::CommandContext;
use crate::backend::vulkan::decoder::Sequence;
use crate::backend::vulkan::picture::DpbPictures;
use crate::backend::vulkan::session::VideoSession;
use crate::backend::vulkan::VulkanBackend;
use crate::codec::h264::dpb::DecodeSlots;
use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::Slice;
use crate::codec::h264::parser::Sps;
use crate::codec::h264::picture::PictureData;
use crate::decoder::stateless::h264::StatelessH264DecoderBackend;
use crate::decoder::stateless::StatelessBackendError;
use crate::decoder::stateless::StatelessBackendResult;

fn std_reference_info(frame_num: u16, pic_order_cnt: i32) -> StdVideoDecodeH264ReferenceInfo {
    // SAFETY: plain-old-data structure, all zeroes is a valid value.
    let mut info: StdVideoDecodeH264ReferenceInfo = unsafe { std::mem::zeroed() };
    info.FrameNum = frame_num;
    info.PicOrderCnt = [pic_order_cnt, pic_order_cnt];
    info
}

fn std_picture_info(
    picture: &PictureData,
    slice: &Slice,
    sps_id: u8,
) -> StdVideoDecodeH264PictureInfo {
    // SAFETY: plain-old-data structure, all zeroes is a valid value.
    let mut info: StdVideoDecodeH264PictureInfo = unsafe { std::mem::zeroed() };
    info.flags.set_IdrPicFlag(u32::from(picture.idr));
    info.flags.set_is_intra(u32::from(slice.header.slice_type.is_intra()));
    info.flags.set_is_reference(u32::from(picture.is_reference()));
    info.seq_parameter_set_id = sps_id;
    info.pic_parameter_set_id = slice.header.pic_parameter_set_id;
    info.frame_num = picture.frame_num;
    info.idr_pic_id = picture.idr_pic_id;
    info.PicOrderCnt = [picture.key.pic_order_cnt, picture.key.pic_order_cnt];
    info
}

impl VulkanBackend {
    fn create_sequence(&self, sps: &Sps, pps: &Pps) -> StatelessBackendResult<Sequence> {
        let profile = H264Profile::from_sps(sps);
        let capabilities = DecodeCapabilities::query(&self.device, &profile)?;

        let coded_extent = vk::Extent2D {
            width: sps.coded_width(),
            height: sps.coded_height(),
        };
        let visible_extent = vk::Extent2D {
            width: sps.width(),
            height: sps.height(),
        };
        let num_slots = sps.dpb_slot_count();

        capabilities.check(
            coded_extent,
            num_slots as u32,
            u32::from(sps.max_num_ref_frames),
        )?;
        check_picture_format(&self.device, &profile)?;

        let session = VideoSession::new(
            &self.device,
            &profile,
            &capabilities,
            coded_extent,
            num_slots as u32,
            sps,
            pps,
        )?;
        let pictures = DpbPictures::new(
            &self.device,
            &profile,
            coded_extent,
            num_slots,
            self.conversion.ycbcr_conversion(),
        )?;
        let decode_commands = CommandContext::new(&self.device.device, self.device.decode_queue)?;
        let convert_commands =
            CommandContext::new(&self.device.device, self.device.compute_queue)?;

        let sampled_views: Vec<_> = pictures.iter().map(|p| p.sampled_view).collect();
        let descriptor_sets = self.conversion.allocate_sets(&sampled_views)?;

        Ok(Sequence {
            sps_id: sps.seq_parameter_set_id,
            profile,
            capabilities,
            coded_extent,
            visible_extent,
            session,
            pictures,
            descriptor_sets,
            decode_commands,
            convert_commands,
        })
    }

    /// Moves the pictures to the DPB layout and resets the session, which
    /// must happen before the first decode.
    fn reset_session(
        sequence: &Sequence,
        video_queue: &ash::khr::video_queue::Device,
    ) -> StatelessBackendResult<()> {
        let barriers = sequence.pictures.initial_barriers();
        let begin_info = vk::VideoBeginCodingInfoKHR::default()
            .video_session(sequence.session.handle())
            .video_session_parameters(sequence.session.parameters());
        let control_info = vk::VideoCodingControlInfoKHR::default()
            .flags(vk::VideoCodingControlFlagsKHR::RESET);
        let end_info = vk::VideoEndCodingInfoKHR::default();

        sequence
            .decode_commands
            .submit_and_wait(|device, cmd| {
                pipeline_barrier(device, cmd, &barriers);
                // SAFETY: the session and its parameters are alive, the command buffer is
                // recording on a queue supporting H.264 decode.
                unsafe {
                    (video_queue.fp().cmd_begin_video_coding_khr)(cmd, &begin_info);
                    (video_queue.fp().cmd_control_video_coding_khr)(cmd, &control_info);
                    (video_queue.fp().cmd_end_video_coding_khr)(cmd, &end_info);
                }
            })?;

        Ok(())
    }
}

impl StatelessH264DecoderBackend for VulkanBackend {
    fn new_sequence(&mut self, sps: &Rc<Sps>, pps: &Rc<Pps>) -> StatelessBackendResult<()> {
        // The previous sequence's descriptor sets must be back in the shared
        // pool before new ones are allocated. A failure below drops whatever
        // was created so far.
        self.sequence = None;

        let sequence = self.create_sequence(sps, pps)?;
        Self::reset_session(&sequence, &self.device.video_queue)?;

        info!(
            "Vulkan video session ready: {}x{} coded, {} DPB slots",
            sequence.coded_extent.width,
            sequence.coded_extent.height,
            sequence.pictures.len()
        );
        self.sequence = Some(sequence);
        Ok(())
    }

    fn decode_picture(
        &mut self,
        picture: &PictureData,
        slice: &Slice,
        slots: &DecodeSlots,
        dpb: &Dpb,
    ) -> StatelessBackendResult<()> {
        let device = &self.device;
        let sequence = self.sequence()?;

        let bitstream = BitstreamBuffer::new(
            device,
            &sequence.profile,
            slice.nalu.with_start_code(),
            sequence.capabilities.min_bitstream_buffer_size_alignment,
        )?;

        let picture_resource = |slot: usize| -> StatelessBackendResult<_> {
            let dpb_picture = sequence.pictures.get(slot).ok_or_else(|| {
                StatelessBackendError::Other(anyhow::anyhow!("no picture in slot {}", slot))
            })?;
            Ok(vk::VideoPictureResourceInfoKHR::default()
                .coded_extent(sequence.coded_extent)
                .base_array_layer(0)
                .image_view_binding(dpb_picture.decode_view))
        };

        let setup_resource = picture_resource(slots.setup)?;
        let reference_resources = slots
            .references
            .iter()
            .map(|&slot| picture_resource(slot))
            .collect::<StatelessBackendResult<Vec<_>>>()?;

        let setup_std = std_reference_info(picture.frame_num, picture.key.pic_order_cnt);
        let mut setup_h264 =
            vk::VideoDecodeH264DpbSlotInfoKHR::default().std_reference_info(&setup_std);
        let setup_slot = vk::VideoReferenceSlotInfoKHR::default()
            .slot_index(slots.setup as i32)
            .picture_resource(&setup_resource)
            .push_next(&mut setup_h264);

        let reference_std = slots
            .references
            .iter()
            .map(|&slot| {
                let dpb_slot = dpb.slot(slot).cloned().unwrap_or_default();
                let pic_order_cnt = dpb_slot.key.map_or(0, |key| key.pic_order_cnt);
                std_reference_info(dpb_slot.frame_num, pic_order_cnt)
            })
            .collect::<Vec<_>>();
        let mut reference_h264 = reference_std
            .iter()
            .map(|info| vk::VideoDecodeH264DpbSlotInfoKHR::default().std_reference_info(info))
            .collect::<Vec<_>>();
        let reference_slots = slots
            .references
            .iter()
            .zip(&reference_resources)
            .zip(reference_h264.iter_mut())
            .map(|((&slot, resource), h264)| {
                vk::VideoReferenceSlotInfoKHR::default()
                    .slot_index(slot as i32)
                    .picture_resource(resource)
                    .push_next(h264)
            })
            .collect::<Vec<_>>();

        // The setup picture is bound without a slot, it only becomes a
        // reference once decoded.
        let begin_slots = slots
            .references
            .iter()
            .zip(&reference_resources)
            .map(|(&slot, resource)| {
                vk::VideoReferenceSlotInfoKHR::default()
                    .slot_index(slot as i32)
                    .picture_resource(resource)
            })
            .chain(std::iter::once(
                vk::VideoReferenceSlotInfoKHR::default()
                    .slot_index(-1)
                    .picture_resource(&setup_resource),
            ))
            .collect::<Vec<_>>();

        let begin_info = vk::VideoBeginCodingInfoKHR::default()
            .video_session(sequence.session.handle())
            .video_session_parameters(sequence.session.parameters())
            .reference_slots(&begin_slots);

        let std_picture = std_picture_info(picture, slice, sequence.sps_id);
        let slice_offsets = [0u32];
        let mut h264_picture = vk::VideoDecodeH264PictureInfoKHR::default()
            .std_picture_info(&std_picture)
            .slice_offsets(&slice_offsets);
        let decode_info = vk::VideoDecodeInfoKHR::default()
            .src_buffer(bitstream.handle())
            .src_buffer_offset(0)
            .src_buffer_range(bitstream.size())
            .dst_picture_resource(setup_resource)
            .setup_reference_slot(&setup_slot)
            .reference_slots(&reference_slots)
            .push_next(&mut h264_picture);
        let end_info = vk::VideoEndCodingInfoKHR::default();

        sequence.decode_commands.submit_and_wait(|_, cmd| {
            // SAFETY: every picture resource, the bitstream buffer and the session are alive
            // until the submission completes, which `submit_and_wait` waits for.
            unsafe {
                (device.video_queue.fp().cmd_begin_video_coding_khr)(cmd, &begin_info);
                (device.video_decode_queue.fp().cmd_decode_video_khr)(cmd, &decode_info);
                (device.video_queue.fp().cmd_end_video_coding_khr)(cmd, &end_info);
            }
        })?;

        // Only released once the decode reading it has completed.
        drop(bitstream);

        debug!(
            "Decoded frame_num {} into slot {} with references {:?}",
            picture.frame_num, slots.setup, slots.references
        );
        Ok(())
    }
}
