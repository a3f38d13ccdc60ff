// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Vulkan Video backend for the stateless H.264 decoder.
//!
//! The device, its queues and their command pools are created by the application and handed over
//! as a [`VulkanDevice`]. Every session gets its own [`decoder::VulkanBackend`], holding the
//! hardware video session and one DPB image per slot. All sessions share one
//! [`conversion::ConversionPipeline`] turning decoded pictures into RGBA images.
//!
//! Every submission waits on its own fence before returning, so decodes complete in submission
//! order and before any conversion reads their output.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::Allocator;
use gpu_allocator::vulkan::AllocatorCreateDesc;
use log::info;
use parking_lot::Mutex;
use thiserror::Error;

use crate::decoder::stateless::StatelessBackendError;

pub mod bitstream;
pub mod capabilities;
pub mod command;
pub mod conversion;
pub mod decoder;
pub mod picture;
pub mod session;

pub use conversion::ConversionConfig;
pub use conversion::ConversionPipeline;
pub use decoder::VulkanBackend;
pub use decoder::VulkanDisplayTarget;

/// Format of the decoded pictures.
pub const PICTURE_FORMAT: vk::Format = vk::Format::G8_B8R8_2PLANE_420_UNORM;

#[derive(Debug, Error)]
pub enum VulkanError {
    #[error("H.264 decoding is not supported: {0}")]
    Unsupported(String),
    #[error("{0} failed: {1}")]
    Call(&'static str, vk::Result),
    #[error("memory allocation failed: {0}")]
    MemoryAllocation(#[from] gpu_allocator::AllocationError),
    #[error("cannot load shader {0}: {1}")]
    Shader(String, std::io::Error),
    #[error("queue submission failed: {0}")]
    Submission(vk::Result),
    #[error("fence wait failed: {0}")]
    FenceWait(vk::Result),
}

impl VulkanError {
    /// Returns a closure wrapping the `vk::Result` of `call`, for use with `map_err`.
    pub(crate) fn call(call: &'static str) -> impl Fn(vk::Result) -> Self {
        move |result| VulkanError::Call(call, result)
    }
}

impl From<VulkanError> for StatelessBackendError {
    fn from(err: VulkanError) -> Self {
        match err {
            VulkanError::Unsupported(_) => StatelessBackendError::Unsupported(err.to_string()),
            VulkanError::MemoryAllocation(_)
            | VulkanError::Call(_, vk::Result::ERROR_OUT_OF_HOST_MEMORY)
            | VulkanError::Call(_, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
            | VulkanError::Call(_, vk::Result::ERROR_TOO_MANY_OBJECTS) => {
                StatelessBackendError::OutOfResources(err.to_string())
            }
            VulkanError::Call(_, vk::Result::ERROR_FEATURE_NOT_PRESENT)
            | VulkanError::Call(_, vk::Result::ERROR_FORMAT_NOT_SUPPORTED)
            | VulkanError::Call(_, vk::Result::ERROR_VIDEO_PROFILE_CODEC_NOT_SUPPORTED_KHR)
            | VulkanError::Call(_, vk::Result::ERROR_VIDEO_PROFILE_OPERATION_NOT_SUPPORTED_KHR)
            | VulkanError::Call(_, vk::Result::ERROR_VIDEO_PROFILE_FORMAT_NOT_SUPPORTED_KHR)
            | VulkanError::Call(_, vk::Result::ERROR_VIDEO_STD_VERSION_NOT_SUPPORTED_KHR) => {
                StatelessBackendError::Unsupported(err.to_string())
            }
            VulkanError::Call(..)
            | VulkanError::Shader(..)
            | VulkanError::Submission(_)
            | VulkanError::FenceWait(_) => StatelessBackendError::Submission(err.to_string()),
        }
    }
}

pub type SharedAllocator = Arc<Mutex<Allocator>>;

/// A queue and the command pool its command buffers are allocated from.
#[derive(Clone, Copy, Debug)]
pub struct QueueInfo {
    pub family_index: u32,
    pub queue: vk::Queue,
    pub command_pool: vk::CommandPool,
}

/// The device objects the backend runs on. They are created and destroyed by
/// the application.
pub struct VulkanDevice {
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) allocator: SharedAllocator,
    pub(crate) decode_queue: QueueInfo,
    pub(crate) compute_queue: QueueInfo,
    pub(crate) video_queue_instance: ash::khr::video_queue::Instance,
    pub(crate) video_queue: ash::khr::video_queue::Device,
    pub(crate) video_decode_queue: ash::khr::video_decode_queue::Device,
}

impl VulkanDevice {
    /// Wraps an application-created device. `device` must have been created
    /// with `VK_KHR_video_queue`, `VK_KHR_video_decode_queue`,
    /// `VK_KHR_video_decode_h264` and the `synchronization2` and
    /// `samplerYcbcrConversion` features of Vulkan 1.3 enabled.
    pub fn new(
        entry: &ash::Entry,
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: Arc<ash::Device>,
        decode_queue: QueueInfo,
        compute_queue: QueueInfo,
    ) -> Result<Self, VulkanError> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        let video_queue_instance = ash::khr::video_queue::Instance::new(entry, &instance);
        let video_queue = ash::khr::video_queue::Device::new(&instance, &device);
        let video_decode_queue = ash::khr::video_decode_queue::Device::new(&instance, &device);

        info!(
            "Vulkan device ready, decode queue family {}, compute queue family {}",
            decode_queue.family_index, compute_queue.family_index
        );

        Ok(Self {
            instance,
            physical_device,
            device,
            allocator: Arc::new(Mutex::new(allocator)),
            decode_queue,
            compute_queue,
            video_queue_instance,
            video_queue,
            video_decode_queue,
        })
    }

    pub fn device(&self) -> &Arc<ash::Device> {
        &self.device
    }

    pub fn allocator(&self) -> &SharedAllocator {
        &self.allocator
    }

    /// Queue families that access the DPB images.
    pub(crate) fn picture_queue_families(&self) -> Vec<u32> {
        let mut families = vec![self.decode_queue.family_index];
        if self.compute_queue.family_index != self.decode_queue.family_index {
            families.push(self.compute_queue.family_index);
        }
        families
    }
}
