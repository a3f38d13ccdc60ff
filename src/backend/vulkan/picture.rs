// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::vulkan::AllocationCreateDesc;
use gpu_allocator::vulkan::AllocationScheme;
use gpu_allocator::MemoryLocation;
use log::debug;
use log::error;

use crate::backend::vulkan::capabilities::picture_usage;
use crate::backend::vulkan::capabilities::H264Profile;
use crate::backend::vulkan::command::image_barrier;
use crate::backend::vulkan::VulkanDevice;
use crate::backend::vulkan::VulkanError;
use crate::backend::vulkan::PICTURE_FORMAT;

/// The image backing one DPB slot. It is both the decode output and the
/// reference picture.
pub struct DpbPicture {
    pub image: vk::Image,
    /// View bound as video picture resource.
    pub decode_view: vk::ImageView,
    /// View sampled through the YCbCr conversion.
    pub sampled_view: vk::ImageView,
    allocation: Option<Allocation>,
}

/// The pictures of every DPB slot of a session, indexed by slot.
pub struct DpbPictures {
    device: Arc<VulkanDevice>,
    pictures: Vec<DpbPicture>,
    extent: vk::Extent2D,
}

impl DpbPictures {
    pub fn new(
        device: &Arc<VulkanDevice>,
        profile: &H264Profile,
        extent: vk::Extent2D,
        num_slots: usize,
        ycbcr_conversion: vk::SamplerYcbcrConversion,
    ) -> Result<Self, VulkanError> {
        let mut this = Self {
            device: Arc::clone(device),
            pictures: Vec::with_capacity(num_slots),
            extent,
        };

        for _ in 0..num_slots {
            let picture = this.create_picture(profile, ycbcr_conversion)?;
            this.pictures.push(picture);
        }

        debug!(
            "Created {} DPB pictures of {}x{}",
            num_slots, extent.width, extent.height
        );
        Ok(this)
    }

    fn create_picture(
        &self,
        profile: &H264Profile,
        ycbcr_conversion: vk::SamplerYcbcrConversion,
    ) -> Result<DpbPicture, VulkanError> {
        let device = &*self.device.device;

        let mut h264_profile = profile.h264_info();
        let profiles = [profile.info(&mut h264_profile)];
        let mut profile_list = vk::VideoProfileListInfoKHR::default().profiles(&profiles);

        let families = self.device.picture_queue_families();
        let sharing_mode = if families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(PICTURE_FORMAT)
            .extent(vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(picture_usage())
            .sharing_mode(sharing_mode)
            .queue_family_indices(&families)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .push_next(&mut profile_list);

        // SAFETY: the create info and its profile list outlive the call.
        let image = unsafe { device.create_image(&image_info, None) }
            .map_err(VulkanError::call("vkCreateImage"))?;

        let mut picture = DpbPicture {
            image,
            decode_view: vk::ImageView::null(),
            sampled_view: vk::ImageView::null(),
            allocation: None,
        };

        if let Err(e) = self.bind_and_create_views(&mut picture, ycbcr_conversion) {
            self.destroy_picture(picture);
            return Err(e);
        }

        Ok(picture)
    }

    fn bind_and_create_views(
        &self,
        picture: &mut DpbPicture,
        ycbcr_conversion: vk::SamplerYcbcrConversion,
    ) -> Result<(), VulkanError> {
        let device = &*self.device.device;

        // SAFETY: `picture.image` was created from `device`.
        let requirements = unsafe { device.get_image_memory_requirements(picture.image) };
        let allocation = self.device.allocator.lock().allocate(&AllocationCreateDesc {
            name: "DPB picture",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        // SAFETY: the allocation satisfies the image requirements and is freed after the image
        // is destroyed.
        let bound = unsafe {
            device.bind_image_memory(picture.image, allocation.memory(), allocation.offset())
        };
        picture.allocation = Some(allocation);
        bound.map_err(VulkanError::call("vkBindImageMemory"))?;

        let subresource_range = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .level_count(1)
            .layer_count(1);

        let mut decode_usage = vk::ImageViewUsageCreateInfo::default().usage(
            vk::ImageUsageFlags::VIDEO_DECODE_DST_KHR | vk::ImageUsageFlags::VIDEO_DECODE_DPB_KHR,
        );
        let decode_view_info = vk::ImageViewCreateInfo::default()
            .image(picture.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(PICTURE_FORMAT)
            .subresource_range(subresource_range)
            .push_next(&mut decode_usage);
        // SAFETY: the image is bound to memory.
        picture.decode_view = unsafe { device.create_image_view(&decode_view_info, None) }
            .map_err(VulkanError::call("vkCreateImageView"))?;

        let mut sampled_usage =
            vk::ImageViewUsageCreateInfo::default().usage(vk::ImageUsageFlags::SAMPLED);
        let mut conversion_info =
            vk::SamplerYcbcrConversionInfo::default().conversion(ycbcr_conversion);
        let sampled_view_info = vk::ImageViewCreateInfo::default()
            .image(picture.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(PICTURE_FORMAT)
            .subresource_range(subresource_range)
            .push_next(&mut sampled_usage)
            .push_next(&mut conversion_info);
        // SAFETY: the image is bound to memory, the conversion is alive.
        picture.sampled_view = unsafe { device.create_image_view(&sampled_view_info, None) }
            .map_err(VulkanError::call("vkCreateImageView"))?;

        Ok(())
    }

    fn destroy_picture(&self, mut picture: DpbPicture) {
        let device = &*self.device.device;
        // SAFETY: the picture is not in use by any pending command. Destroying null handles is
        // a no-op.
        unsafe {
            device.destroy_image_view(picture.sampled_view, None);
            device.destroy_image_view(picture.decode_view, None);
            device.destroy_image(picture.image, None);
        }

        if let Some(allocation) = picture.allocation.take() {
            if let Err(e) = self.device.allocator.lock().free(allocation) {
                error!("Failed to free DPB picture memory: {}", e);
            }
        }
    }

    pub fn get(&self, slot: usize) -> Option<&DpbPicture> {
        self.pictures.get(slot)
    }

    pub fn len(&self) -> usize {
        self.pictures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pictures.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DpbPicture> {
        self.pictures.iter()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Barriers moving freshly created pictures to the DPB layout.
    pub fn initial_barriers(&self) -> Vec<vk::ImageMemoryBarrier2<'static>> {
        self.pictures
            .iter()
            .map(|picture| {
                image_barrier(
                    picture.image,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::VIDEO_DECODE_DPB_KHR,
                    (vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE),
                    (
                        vk::PipelineStageFlags2::VIDEO_DECODE_KHR,
                        vk::AccessFlags2::VIDEO_DECODE_READ_KHR
                            | vk::AccessFlags2::VIDEO_DECODE_WRITE_KHR,
                    ),
                )
            })
            .collect()
    }
}

impl Drop for DpbPictures {
    fn drop(&mut self) {
        for picture in std::mem::take(&mut self.pictures) {
            self.destroy_picture(picture);
        }
    }
}
