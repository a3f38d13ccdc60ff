// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Command buffer recording and fenced submission.

use std::sync::Arc;

use ash::vk;
use log::trace;

use crate::backend::vulkan::QueueInfo;
use crate::backend::vulkan::VulkanError;

/// A command buffer and the fence signalled when its last submission
/// completes. Freed on drop.
pub struct CommandContext {
    device: Arc<ash::Device>,
    queue: QueueInfo,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

impl CommandContext {
    pub fn new(device: &Arc<ash::Device>, queue: QueueInfo) -> Result<Self, VulkanError> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(queue.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        // SAFETY: the command pool belongs to `device` and is only used from this thread.
        let command_buffer = unsafe { device.allocate_command_buffers(&alloc_info) }
            .map_err(VulkanError::call("vkAllocateCommandBuffers"))?[0];

        // SAFETY: `device` is valid, the create info is default initialized.
        let fence = match unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) } {
            Ok(fence) => fence,
            Err(e) => {
                // SAFETY: the command buffer was never submitted.
                unsafe { device.free_command_buffers(queue.command_pool, &[command_buffer]) };
                return Err(VulkanError::Call("vkCreateFence", e));
            }
        };

        Ok(Self {
            device: Arc::clone(device),
            queue,
            command_buffer,
            fence,
        })
    }

    /// Records commands with `f` and submits them, then blocks until the
    /// device has executed them.
    pub fn submit_and_wait<F>(&self, f: F) -> Result<(), VulkanError>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let device = &*self.device;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        // SAFETY: the previous submission of the command buffer has completed, since every
        // submission is waited for before this method returns.
        unsafe {
            device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(VulkanError::call("vkResetCommandBuffer"))?;
            device
                .begin_command_buffer(self.command_buffer, &begin_info)
                .map_err(VulkanError::call("vkBeginCommandBuffer"))?;
        }

        f(device, self.command_buffer);

        let command_buffers = [self.command_buffer];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);

        // SAFETY: the command buffer is in the recording state and the fence is unsignaled.
        unsafe {
            device
                .end_command_buffer(self.command_buffer)
                .map_err(VulkanError::call("vkEndCommandBuffer"))?;
            device
                .queue_submit(self.queue.queue, &[submit_info], self.fence)
                .map_err(VulkanError::Submission)?;
            device
                .wait_for_fences(&[self.fence], true, u64::MAX)
                .map_err(VulkanError::FenceWait)?;
            device
                .reset_fences(&[self.fence])
                .map_err(VulkanError::FenceWait)?;
        }

        trace!("Submission on queue family {} complete", self.queue.family_index);
        Ok(())
    }
}

impl Drop for CommandContext {
    fn drop(&mut self) {
        // SAFETY: no submission is pending, `submit_and_wait` waits for all of them.
        unsafe {
            self.device.destroy_fence(self.fence, None);
            self.device
                .free_command_buffers(self.queue.command_pool, &[self.command_buffer]);
        }
    }
}

/// Builds a barrier moving the whole of `image` from `old_layout` to
/// `new_layout`.
pub(crate) fn image_barrier(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src: (vk::PipelineStageFlags2, vk::AccessFlags2),
    dst: (vk::PipelineStageFlags2, vk::AccessFlags2),
) -> vk::ImageMemoryBarrier2<'static> {
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(src.0)
        .src_access_mask(src.1)
        .dst_stage_mask(dst.0)
        .dst_access_mask(dst.1)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .level_count(1)
                .layer_count(1),
        )
}

/// Records `barriers`.
pub(crate) fn pipeline_barrier(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    barriers: &[vk::ImageMemoryBarrier2],
) {
    let dependency_info = vk::DependencyInfo::default().image_memory_barriers(barriers);
    // SAFETY: the command buffer is recording and the barriers refer to live images.
    unsafe { device.cmd_pipeline_barrier2(command_buffer, &dependency_info) };
}
