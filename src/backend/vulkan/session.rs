// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The hardware video session, its memory and its parameter sets.

use std::ptr;
use std::sync::Arc;

use ash::vk;
use ash::vk::native::StdVideoH264PictureParameterSet;
use ash::vk::native::StdVideoH264ScalingLists;
use ash::vk::native::StdVideoH264SequenceParameterSet;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::vulkan::AllocationCreateDesc;
use gpu_allocator::vulkan::AllocationScheme;
use gpu_allocator::MemoryLocation;
use log::debug;
use log::error;

use crate::backend::vulkan::capabilities::std_level_idc;
use crate::backend::vulkan::capabilities::DecodeCapabilities;
use crate::backend::vulkan::capabilities::H264Profile;
use crate::backend::vulkan::VulkanDevice;
use crate::backend::vulkan::VulkanError;
use crate::backend::vulkan::PICTURE_FORMAT;
use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::ScalingLists;
use crate::codec::h264::parser::Sps;

/// A `VkVideoSessionKHR` with its bound memory and the parameters object
/// holding the stream's single SPS and PPS.
pub struct VideoSession {
    device: Arc<VulkanDevice>,
    session: vk::VideoSessionKHR,
    allocations: Vec<Allocation>,
    parameters: vk::VideoSessionParametersKHR,
}

impl VideoSession {
    /// Creates a session decoding pictures of `coded_extent` with `num_slots`
    /// DPB slots, binds its memory and uploads `sps` and `pps`.
    pub fn new(
        device: &Arc<VulkanDevice>,
        profile: &H264Profile,
        capabilities: &DecodeCapabilities,
        coded_extent: vk::Extent2D,
        num_slots: u32,
        sps: &Sps,
        pps: &Pps,
    ) -> Result<Self, VulkanError> {
        let mut h264_profile = profile.h264_info();
        let profile_info = profile.info(&mut h264_profile);

        let create_info = vk::VideoSessionCreateInfoKHR::default()
            .queue_family_index(device.decode_queue.family_index)
            .video_profile(&profile_info)
            .picture_format(PICTURE_FORMAT)
            .max_coded_extent(coded_extent)
            .reference_picture_format(PICTURE_FORMAT)
            .max_dpb_slots(num_slots)
            .max_active_reference_pictures(u32::from(sps.max_num_ref_frames))
            .std_header_version(&capabilities.std_header_version);

        let mut session = vk::VideoSessionKHR::null();
        // SAFETY: the create info and the profile chain it points to outlive the call.
        unsafe {
            (device.video_queue.fp().create_video_session_khr)(
                device.device.handle(),
                &create_info,
                ptr::null(),
                &mut session,
            )
        }
        .result()
        .map_err(VulkanError::call("vkCreateVideoSessionKHR"))?;

        // From here on, dropping `this` releases whatever was created so far.
        let mut this = Self {
            device: Arc::clone(device),
            session,
            allocations: Vec::new(),
            parameters: vk::VideoSessionParametersKHR::null(),
        };

        this.bind_memory()?;
        this.create_parameters(sps, pps)?;

        debug!(
            "Video session created: {}x{}, {} DPB slots",
            coded_extent.width, coded_extent.height, num_slots
        );
        Ok(this)
    }

    fn bind_memory(&mut self) -> Result<(), VulkanError> {
        let device = &self.device;
        let get_requirements = device
            .video_queue
            .fp()
            .get_video_session_memory_requirements_khr;

        let mut count = 0;
        // SAFETY: a null requirements pointer queries the number of bind indices.
        unsafe {
            get_requirements(
                device.device.handle(),
                self.session,
                &mut count,
                ptr::null_mut(),
            )
        }
        .result()
        .map_err(VulkanError::call("vkGetVideoSessionMemoryRequirementsKHR"))?;

        let mut requirements =
            vec![vk::VideoSessionMemoryRequirementsKHR::default(); count as usize];
        // SAFETY: `requirements` holds `count` default-initialized structures.
        unsafe {
            get_requirements(
                device.device.handle(),
                self.session,
                &mut count,
                requirements.as_mut_ptr(),
            )
        }
        .result()
        .map_err(VulkanError::call("vkGetVideoSessionMemoryRequirementsKHR"))?;
        requirements.truncate(count as usize);

        let mut binds = Vec::with_capacity(requirements.len());
        for requirement in &requirements {
            let allocation = device.allocator.lock().allocate(&AllocationCreateDesc {
                name: "video session",
                requirements: requirement.memory_requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })?;

            binds.push(
                vk::BindVideoSessionMemoryInfoKHR::default()
                    .memory_bind_index(requirement.memory_bind_index)
                    // SAFETY: the memory stays allocated until the session is destroyed.
                    .memory(unsafe { allocation.memory() })
                    .memory_offset(allocation.offset())
                    .memory_size(requirement.memory_requirements.size),
            );
            self.allocations.push(allocation);
        }

        // SAFETY: every bind info refers to a live allocation satisfying the requirements of
        // its bind index.
        unsafe {
            (device.video_queue.fp().bind_video_session_memory_khr)(
                device.device.handle(),
                self.session,
                binds.len() as u32,
                binds.as_ptr(),
            )
        }
        .result()
        .map_err(VulkanError::call("vkBindVideoSessionMemoryKHR"))?;

        debug!("Bound {} video session memory allocations", binds.len());
        Ok(())
    }

    fn create_parameters(&mut self, sps: &Sps, pps: &Pps) -> Result<(), VulkanError> {
        let sps_scaling_lists = std_scaling_lists(&sps.scaling_lists);
        let pps_scaling_lists = std_scaling_lists(&pps.scaling_lists);
        let std_sps = [std_sps(sps, &sps_scaling_lists)];
        let std_pps = [std_pps(pps, &pps_scaling_lists)];

        let add_info = vk::VideoDecodeH264SessionParametersAddInfoKHR::default()
            .std_sp_ss(&std_sps)
            .std_pp_ss(&std_pps);
        let mut h264_info = vk::VideoDecodeH264SessionParametersCreateInfoKHR::default()
            .max_std_sps_count(1)
            .max_std_pps_count(1)
            .parameters_add_info(&add_info);
        let create_info = vk::VideoSessionParametersCreateInfoKHR::default()
            .video_session(self.session)
            .push_next(&mut h264_info);

        // SAFETY: the parameter sets and the scaling lists they point to outlive the call.
        unsafe {
            (self.device.video_queue.fp().create_video_session_parameters_khr)(
                self.device.device.handle(),
                &create_info,
                ptr::null(),
                &mut self.parameters,
            )
        }
        .result()
        .map_err(VulkanError::call("vkCreateVideoSessionParametersKHR"))
    }

    pub fn handle(&self) -> vk::VideoSessionKHR {
        self.session
    }

    pub fn parameters(&self) -> vk::VideoSessionParametersKHR {
        self.parameters
    }
}

impl Drop for VideoSession {
    fn drop(&mut self) {
        let device = &self.device;
        // SAFETY: no command using the session is pending, every submission is waited for.
        // Destroying null handles is a no-op.
        unsafe {
            (device.video_queue.fp().destroy_video_session_parameters_khr)(
                device.device.handle(),
                self.parameters,
                ptr::null(),
            );
            (device.video_queue.fp().destroy_video_session_khr)(
                device.device.handle(),
                self.session,
                ptr::null(),
            );
        }

        let mut allocator = device.allocator.lock();
        for allocation in self.allocations.drain(..) {
            if let Err(e) = allocator.free(allocation) {
                error!("Failed to free video session memory: {}", e);
            }
        }
    }
}

fn std_scaling_lists(lists: &ScalingLists) -> StdVideoH264ScalingLists {
    // SAFETY: plain-old-data structure, all zeroes is a valid value.
    let mut std: StdVideoH264ScalingLists = unsafe { std::mem::zeroed() };
    std.scaling_list_present_mask = 0xff;
    std.ScalingList4x4 = lists.list_4x4;
    std.ScalingList8x8 = lists.list_8x8;
    std
}

/// `scaling_lists` must outlive the returned structure.
fn std_sps(sps: &Sps, scaling_lists: &StdVideoH264ScalingLists) -> StdVideoH264SequenceParameterSet {
    // SAFETY: plain-old-data structure, all zeroes is a valid value with null pointers.
    let mut std: StdVideoH264SequenceParameterSet = unsafe { std::mem::zeroed() };

    std.flags.set_constraint_set0_flag(u32::from(sps.constraint_set0_flag));
    std.flags.set_constraint_set1_flag(u32::from(sps.constraint_set1_flag));
    std.flags.set_constraint_set2_flag(u32::from(sps.constraint_set2_flag));
    std.flags.set_constraint_set3_flag(u32::from(sps.constraint_set3_flag));
    std.flags.set_constraint_set4_flag(u32::from(sps.constraint_set4_flag));
    std.flags.set_constraint_set5_flag(u32::from(sps.constraint_set5_flag));
    std.flags.set_direct_8x8_inference_flag(u32::from(sps.direct_8x8_inference_flag));
    std.flags.set_mb_adaptive_frame_field_flag(u32::from(sps.mb_adaptive_frame_field_flag));
    std.flags.set_frame_mbs_only_flag(u32::from(sps.frame_mbs_only_flag));
    std.flags.set_delta_pic_order_always_zero_flag(u32::from(sps.delta_pic_order_always_zero_flag));
    std.flags.set_separate_colour_plane_flag(u32::from(sps.separate_colour_plane_flag));
    std.flags.set_gaps_in_frame_num_value_allowed_flag(u32::from(
        sps.gaps_in_frame_num_value_allowed_flag,
    ));
    std.flags.set_qpprime_y_zero_transform_bypass_flag(u32::from(
        sps.qpprime_y_zero_transform_bypass_flag,
    ));
    std.flags.set_frame_cropping_flag(u32::from(sps.frame_cropping_flag));
    std.flags.set_seq_scaling_matrix_present_flag(u32::from(sps.seq_scaling_matrix_present_flag));

    std.profile_idc = u32::from(sps.profile_idc);
    std.level_idc = std_level_idc(sps.level_idc);
    std.chroma_format_idc = u32::from(sps.chroma_format_idc);
    std.seq_parameter_set_id = sps.seq_parameter_set_id;
    std.bit_depth_luma_minus8 = sps.bit_depth_luma_minus8;
    std.bit_depth_chroma_minus8 = sps.bit_depth_chroma_minus8;
    std.log2_max_frame_num_minus4 = sps.log2_max_frame_num_minus4;
    std.pic_order_cnt_type = u32::from(sps.pic_order_cnt_type);
    std.offset_for_non_ref_pic = sps.offset_for_non_ref_pic;
    std.offset_for_top_to_bottom_field = sps.offset_for_top_to_bottom_field;
    std.log2_max_pic_order_cnt_lsb_minus4 = sps.log2_max_pic_order_cnt_lsb_minus4;
    std.num_ref_frames_in_pic_order_cnt_cycle = sps.offset_for_ref_frame.len() as u8;
    std.max_num_ref_frames = sps.max_num_ref_frames;
    std.pic_width_in_mbs_minus1 = u32::from(sps.pic_width_in_mbs_minus1);
    std.pic_height_in_map_units_minus1 = u32::from(sps.pic_height_in_map_units_minus1);
    std.frame_crop_left_offset = sps.frame_crop_left_offset;
    std.frame_crop_right_offset = sps.frame_crop_right_offset;
    std.frame_crop_top_offset = sps.frame_crop_top_offset;
    std.frame_crop_bottom_offset = sps.frame_crop_bottom_offset;

    if !sps.offset_for_ref_frame.is_empty() {
        std.pOffsetForRefFrame = sps.offset_for_ref_frame.as_ptr();
    }
    if sps.seq_scaling_matrix_present_flag {
        std.pScalingLists = scaling_lists;
    }

    std
}

/// `scaling_lists` must outlive the returned structure.
fn std_pps(pps: &Pps, scaling_lists: &StdVideoH264ScalingLists) -> StdVideoH264PictureParameterSet {
    // SAFETY: plain-old-data structure, all zeroes is a valid value with null pointers.
    let mut std: StdVideoH264PictureParameterSet = unsafe { std::mem::zeroed() };

    std.flags.set_transform_8x8_mode_flag(u32::from(pps.transform_8x8_mode_flag));
    std.flags.set_redundant_pic_cnt_present_flag(u32::from(pps.redundant_pic_cnt_present_flag));
    std.flags.set_constrained_intra_pred_flag(u32::from(pps.constrained_intra_pred_flag));
    std.flags.set_deblocking_filter_control_present_flag(u32::from(
        pps.deblocking_filter_control_present_flag,
    ));
    std.flags.set_weighted_pred_flag(u32::from(pps.weighted_pred_flag));
    std.flags.set_bottom_field_pic_order_in_frame_present_flag(u32::from(
        pps.bottom_field_pic_order_in_frame_present_flag,
    ));
    std.flags.set_entropy_coding_mode_flag(u32::from(pps.entropy_coding_mode_flag));
    std.flags.set_pic_scaling_matrix_present_flag(u32::from(pps.pic_scaling_matrix_present_flag));

    std.seq_parameter_set_id = pps.seq_parameter_set_id;
    std.pic_parameter_set_id = pps.pic_parameter_set_id;
    std.num_ref_idx_l0_default_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
    std.num_ref_idx_l1_default_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;
    std.weighted_bipred_idc = u32::from(pps.weighted_bipred_idc);
    std.pic_init_qp_minus26 = pps.pic_init_qp_minus26;
    std.pic_init_qs_minus26 = pps.pic_init_qs_minus26;
    std.chroma_qp_index_offset = pps.chroma_qp_index_offset;
    std.second_chroma_qp_index_offset = pps.second_chroma_qp_index_offset;

    if pps.pic_scaling_matrix_present_flag {
        std.pScalingLists = scaling_lists;
    }

    std
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::parser::Level;
    use crate::codec::h264::parser::PpsBuilder;
    use crate::codec::h264::parser::Profile;
    use crate::codec::h264::parser::SpsBuilder;

    #[test]
    fn std_parameter_sets() {
        let sps = SpsBuilder::new()
            .profile_idc(Profile::High)
            .level_idc(Level::L4_1)
            .resolution(800, 600)
            .max_num_ref_frames(1)
            .log2_max_pic_order_cnt_lsb_minus4(4)
            .build();
        let pps = PpsBuilder::new(sps.clone())
            .entropy_coding_mode_flag(true)
            .pic_init_qp_minus26(-3)
            .build();

        let scaling_lists = std_scaling_lists(&sps.scaling_lists);
        let std = std_sps(&sps, &scaling_lists);
        assert_eq!(std.profile_idc, 100);
        assert_eq!(std.level_idc, 11);
        assert_eq!(std.chroma_format_idc, 1);
        assert_eq!(std.max_num_ref_frames, 1);
        assert_eq!(std.log2_max_pic_order_cnt_lsb_minus4, 4);
        assert_eq!(std.pic_width_in_mbs_minus1, 49);
        assert_eq!(std.pic_height_in_map_units_minus1, 37);
        assert_eq!(std.flags.frame_cropping_flag(), 1);
        assert_eq!(std.frame_crop_bottom_offset, 4);
        assert_eq!(std.flags.frame_mbs_only_flag(), 1);
        assert!(std.pScalingLists.is_null());

        let scaling_lists = std_scaling_lists(&pps.scaling_lists);
        let std = std_pps(&pps, &scaling_lists);
        assert_eq!(std.flags.entropy_coding_mode_flag(), 1);
        assert_eq!(std.pic_init_qp_minus26, -3);
        assert!(std.pScalingLists.is_null());
    }
}
