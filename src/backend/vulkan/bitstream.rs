// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::vulkan::AllocationCreateDesc;
use gpu_allocator::vulkan::AllocationScheme;
use gpu_allocator::MemoryLocation;
use log::error;
use log::trace;

use crate::align_up;
use crate::backend::vulkan::capabilities::H264Profile;
use crate::backend::vulkan::VulkanDevice;
use crate::backend::vulkan::VulkanError;

/// A host-visible buffer holding the bitstream of one decode operation.
pub struct BitstreamBuffer {
    device: Arc<VulkanDevice>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
}

impl BitstreamBuffer {
    /// Creates a buffer of `data.len()` rounded up to `size_alignment` bytes
    /// and copies `data` at its start.
    pub fn new(
        device: &Arc<VulkanDevice>,
        profile: &H264Profile,
        data: &[u8],
        size_alignment: vk::DeviceSize,
    ) -> Result<Self, VulkanError> {
        let size = align_up(data.len() as u64, size_alignment).max(1);

        let mut h264_profile = profile.h264_info();
        let profiles = [profile.info(&mut h264_profile)];
        let mut profile_list = vk::VideoProfileListInfoKHR::default().profiles(&profiles);
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::VIDEO_DECODE_SRC_KHR)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .push_next(&mut profile_list);

        // SAFETY: the create info and its profile list outlive the call.
        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .map_err(VulkanError::call("vkCreateBuffer"))?;

        let mut this = Self {
            device: Arc::clone(device),
            buffer,
            allocation: None,
            size,
        };
        this.bind_and_fill(data)?;

        trace!("Bitstream buffer of {} bytes for {} bytes of data", size, data.len());
        Ok(this)
    }

    fn bind_and_fill(&mut self, data: &[u8]) -> Result<(), VulkanError> {
        let device = &*self.device.device;

        // SAFETY: `self.buffer` was created from `device`.
        let requirements = unsafe { device.get_buffer_memory_requirements(self.buffer) };
        let mut allocation = self.device.allocator.lock().allocate(&AllocationCreateDesc {
            name: "bitstream",
            requirements,
            location: MemoryLocation::CpuToGpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        // SAFETY: the allocation satisfies the buffer requirements and outlives the buffer.
        let bound = unsafe {
            device.bind_buffer_memory(self.buffer, allocation.memory(), allocation.offset())
        };

        match allocation.mapped_slice_mut() {
            Some(mapped) => mapped[..data.len()].copy_from_slice(data),
            None => {
                self.allocation = Some(allocation);
                return Err(VulkanError::Call(
                    "vkMapMemory",
                    vk::Result::ERROR_MEMORY_MAP_FAILED,
                ));
            }
        }

        self.allocation = Some(allocation);
        bound.map_err(VulkanError::call("vkBindBufferMemory"))
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Size of the buffer, a multiple of the size alignment it was created
    /// with.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for BitstreamBuffer {
    fn drop(&mut self) {
        // SAFETY: the decode reading the buffer has completed.
        unsafe { self.device.device.destroy_buffer(self.buffer, None) };

        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator.lock().free(allocation) {
                error!("Failed to free bitstream memory: {}", e);
            }
        }
    }
}
