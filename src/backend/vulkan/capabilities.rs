// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Video profile description and capability queries.

use ash::vk;
use ash::vk::native::StdVideoH264LevelIdc;
use ash::vk::native::StdVideoH264ProfileIdc;
use log::debug;

use crate::backend::vulkan::VulkanDevice;
use crate::backend::vulkan::VulkanError;
use crate::backend::vulkan::PICTURE_FORMAT;
use crate::codec::h264::parser::Level;
use crate::codec::h264::parser::Sps;

/// A progressive, 8-bit 4:2:0 H.264 decode profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct H264Profile {
    pub std_profile_idc: StdVideoH264ProfileIdc,
}

impl H264Profile {
    pub fn from_sps(sps: &Sps) -> Self {
        Self {
            std_profile_idc: StdVideoH264ProfileIdc::from(sps.profile_idc),
        }
    }

    pub fn h264_info(&self) -> vk::VideoDecodeH264ProfileInfoKHR<'static> {
        vk::VideoDecodeH264ProfileInfoKHR::default()
            .std_profile_idc(self.std_profile_idc)
            .picture_layout(vk::VideoDecodeH264PictureLayoutFlagsKHR::PROGRESSIVE)
    }

    /// Builds the profile info chained to `h264`, which should come from
    /// [`H264Profile::h264_info`].
    pub fn info<'a>(
        &self,
        h264: &'a mut vk::VideoDecodeH264ProfileInfoKHR<'static>,
    ) -> vk::VideoProfileInfoKHR<'a> {
        vk::VideoProfileInfoKHR::default()
            .video_codec_operation(vk::VideoCodecOperationFlagsKHR::DECODE_H264)
            .chroma_subsampling(vk::VideoChromaSubsamplingFlagsKHR::TYPE_420)
            .luma_bit_depth(vk::VideoComponentBitDepthFlagsKHR::TYPE_8)
            .chroma_bit_depth(vk::VideoComponentBitDepthFlagsKHR::TYPE_8)
            .push_next(h264)
    }
}

/// Maps `level_idc` to its Vulkan Video enumerant.
pub fn std_level_idc(level: Level) -> StdVideoH264LevelIdc {
    match level {
        Level::L1 => 0,
        Level::L1B | Level::L1_1 => 1,
        Level::L1_2 => 2,
        Level::L1_3 => 3,
        Level::L2_0 => 4,
        Level::L2_1 => 5,
        Level::L2_2 => 6,
        Level::L3 => 7,
        Level::L3_1 => 8,
        Level::L3_2 => 9,
        Level::L4 => 10,
        Level::L4_1 => 11,
        Level::L4_2 => 12,
        Level::L5 => 13,
        Level::L5_1 => 14,
        Level::L5_2 => 15,
        Level::L6 => 16,
        Level::L6_1 => 17,
        Level::L6_2 => 18,
    }
}

/// What the device can do with a [`H264Profile`].
#[derive(Clone, Copy, Debug)]
pub struct DecodeCapabilities {
    pub flags: vk::VideoCapabilityFlagsKHR,
    pub decode_flags: vk::VideoDecodeCapabilityFlagsKHR,
    pub min_bitstream_buffer_offset_alignment: vk::DeviceSize,
    pub min_bitstream_buffer_size_alignment: vk::DeviceSize,
    pub picture_access_granularity: vk::Extent2D,
    pub min_coded_extent: vk::Extent2D,
    pub max_coded_extent: vk::Extent2D,
    pub max_dpb_slots: u32,
    pub max_active_reference_pictures: u32,
    pub max_level_idc: StdVideoH264LevelIdc,
    pub std_header_version: vk::ExtensionProperties,
}

impl DecodeCapabilities {
    pub fn query(device: &VulkanDevice, profile: &H264Profile) -> Result<Self, VulkanError> {
        let mut h264_profile = profile.h264_info();
        let profile_info = profile.info(&mut h264_profile);

        let mut h264_caps = vk::VideoDecodeH264CapabilitiesKHR::default();
        let mut decode_caps = vk::VideoDecodeCapabilitiesKHR::default();
        let mut caps = vk::VideoCapabilitiesKHR::default()
            .push_next(&mut decode_caps)
            .push_next(&mut h264_caps);

        // SAFETY: the physical device belongs to the instance the function table was loaded
        // from, and every structure of both chains outlives the call.
        unsafe {
            (device
                .video_queue_instance
                .fp()
                .get_physical_device_video_capabilities_khr)(
                device.physical_device,
                &profile_info,
                &mut caps,
            )
        }
        .result()
        .map_err(VulkanError::call("vkGetPhysicalDeviceVideoCapabilitiesKHR"))?;

        let capabilities = Self {
            flags: caps.flags,
            min_bitstream_buffer_offset_alignment: caps.min_bitstream_buffer_offset_alignment,
            min_bitstream_buffer_size_alignment: caps.min_bitstream_buffer_size_alignment,
            picture_access_granularity: caps.picture_access_granularity,
            min_coded_extent: caps.min_coded_extent,
            max_coded_extent: caps.max_coded_extent,
            max_dpb_slots: caps.max_dpb_slots,
            max_active_reference_pictures: caps.max_active_reference_pictures,
            std_header_version: caps.std_header_version,
            decode_flags: decode_caps.flags,
            max_level_idc: h264_caps.max_level_idc,
        };

        debug!("H.264 decode capabilities: {:?}", capabilities);
        Ok(capabilities)
    }

    /// Checks that a session with the given extent and slots can be created,
    /// and that the decoder can write its output to the DPB images.
    pub fn check(
        &self,
        coded_extent: vk::Extent2D,
        num_slots: u32,
        max_active_references: u32,
    ) -> Result<(), VulkanError> {
        if !self
            .decode_flags
            .contains(vk::VideoDecodeCapabilityFlagsKHR::DPB_AND_OUTPUT_COINCIDE)
        {
            return Err(VulkanError::Unsupported(
                "the decode output cannot coincide with the DPB picture".into(),
            ));
        }

        let min = self.min_coded_extent;
        let max = self.max_coded_extent;
        if coded_extent.width < min.width
            || coded_extent.height < min.height
            || coded_extent.width > max.width
            || coded_extent.height > max.height
        {
            return Err(VulkanError::Unsupported(format!(
                "coded extent {}x{} outside of {}x{} to {}x{}",
                coded_extent.width,
                coded_extent.height,
                min.width,
                min.height,
                max.width,
                max.height
            )));
        }

        if num_slots > self.max_dpb_slots {
            return Err(VulkanError::Unsupported(format!(
                "{} DPB slots needed, {} supported",
                num_slots, self.max_dpb_slots
            )));
        }

        if max_active_references > self.max_active_reference_pictures {
            return Err(VulkanError::Unsupported(format!(
                "{} reference pictures needed, {} supported",
                max_active_references, self.max_active_reference_pictures
            )));
        }

        Ok(())
    }
}

/// Checks that decoded pictures can be stored as [`PICTURE_FORMAT`] images
/// usable as decode output, DPB picture and sampled image at once.
pub fn check_picture_format(device: &VulkanDevice, profile: &H264Profile) -> Result<(), VulkanError> {
    let usage = picture_usage();

    let mut h264_profile = profile.h264_info();
    let profiles = [profile.info(&mut h264_profile)];
    let mut profile_list = vk::VideoProfileListInfoKHR::default().profiles(&profiles);
    let format_info = vk::PhysicalDeviceVideoFormatInfoKHR::default()
        .image_usage(usage)
        .push_next(&mut profile_list);

    let get_formats = device
        .video_queue_instance
        .fp()
        .get_physical_device_video_format_properties_khr;

    let mut count = 0;
    // SAFETY: a null properties pointer queries the number of formats.
    unsafe {
        get_formats(
            device.physical_device,
            &format_info,
            &mut count,
            std::ptr::null_mut(),
        )
    }
    .result()
    .map_err(VulkanError::call("vkGetPhysicalDeviceVideoFormatPropertiesKHR"))?;

    let mut formats = vec![vk::VideoFormatPropertiesKHR::default(); count as usize];
    // SAFETY: `formats` holds `count` default-initialized structures.
    unsafe {
        get_formats(
            device.physical_device,
            &format_info,
            &mut count,
            formats.as_mut_ptr(),
        )
    }
    .result()
    .map_err(VulkanError::call("vkGetPhysicalDeviceVideoFormatPropertiesKHR"))?;
    formats.truncate(count as usize);

    if formats.iter().any(|format| format.format == PICTURE_FORMAT) {
        Ok(())
    } else {
        Err(VulkanError::Unsupported(format!(
            "{:?} not among the picture formats {:?}",
            PICTURE_FORMAT,
            formats.iter().map(|format| format.format).collect::<Vec<_>>()
        )))
    }
}

/// Usage of the DPB images: decoded into, referenced and sampled by the
/// conversion pass.
pub(crate) fn picture_usage() -> vk::ImageUsageFlags {
    vk::ImageUsageFlags::VIDEO_DECODE_DST_KHR
        | vk::ImageUsageFlags::VIDEO_DECODE_DPB_KHR
        | vk::ImageUsageFlags::SAMPLED
}
