// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use ash::vk;

use crate::backend::vulkan::capabilities::DecodeCapabilities;
use crate::backend::vulkan::capabilities::H264Profile;
use crate::backend::vulkan::command::CommandContext;
use crate::backend::vulkan::conversion::ConversionPipeline;
use crate::backend::vulkan::conversion::ConversionSets;
use crate::backend::vulkan::conversion::ConversionSource;
use crate::backend::vulkan::picture::DpbPictures;
use crate::backend::vulkan::session::VideoSession;
use crate::backend::vulkan::VulkanDevice;
use crate::decoder::stateless::StatelessBackendError;
use crate::decoder::stateless::StatelessBackendResult;
use crate::decoder::stateless::StatelessDecoderBackend;

/// An RGBA image decoded pictures are converted into.
///
/// The image must have been created with the `STORAGE` usage and a format
/// usable as storage image, and `view` must cover all of it.
#[derive(Clone, Copy, Debug)]
pub struct VulkanDisplayTarget {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
}

/// Everything created from the parameter sets of a stream. Dropping it
/// releases all of it.
pub(crate) struct Sequence {
    pub(crate) sps_id: u8,
    pub(crate) profile: H264Profile,
    pub(crate) capabilities: DecodeCapabilities,
    pub(crate) coded_extent: vk::Extent2D,
    pub(crate) visible_extent: vk::Extent2D,
    pub(crate) session: VideoSession,
    pub(crate) pictures: DpbPictures,
    pub(crate) descriptor_sets: ConversionSets,
    pub(crate) decode_commands: CommandContext,
    pub(crate) convert_commands: CommandContext,
}

/// Vulkan Video backend of one decoding session.
pub struct VulkanBackend {
    pub(crate) device: Arc<VulkanDevice>,
    pub(crate) conversion: Arc<ConversionPipeline>,
    pub(crate) sequence: Option<Sequence>,
}

impl VulkanBackend {
    pub fn new(device: Arc<VulkanDevice>, conversion: Arc<ConversionPipeline>) -> Self {
        Self {
            device,
            conversion,
            sequence: None,
        }
    }

    pub(crate) fn sequence(&self) -> StatelessBackendResult<&Sequence> {
        self.sequence
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no video session was created").into())
    }
}

impl StatelessDecoderBackend for VulkanBackend {
    type DisplayTarget = VulkanDisplayTarget;

    fn convert_picture(
        &mut self,
        slot: usize,
        target: &Self::DisplayTarget,
    ) -> StatelessBackendResult<()> {
        let sequence = self.sequence()?;
        let (picture, descriptor_set) = sequence
            .pictures
            .get(slot)
            .zip(sequence.descriptor_sets.get(slot))
            .ok_or_else(|| {
                StatelessBackendError::Other(anyhow::anyhow!("no picture in slot {}", slot))
            })?;

        let source = ConversionSource {
            image: picture.image,
            descriptor_set,
            visible_extent: sequence.visible_extent,
            coded_extent: sequence.coded_extent,
        };

        self.conversion
            .convert(&sequence.convert_commands, &source, target)?;
        Ok(())
    }
}
