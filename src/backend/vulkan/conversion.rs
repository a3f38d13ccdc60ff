// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Conversion of decoded NV12 pictures into RGBA images.
//!
//! One [`ConversionPipeline`] is shared by every session. It samples the DPB pictures through a
//! BT.709 YCbCr sampler and writes the result to a storage image with a compute shader working
//! on 16x16 tiles.

use std::ffi::CStr;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use ash::vk;
use log::debug;
use log::error;
use log::info;
use parking_lot::Mutex;

use crate::backend::vulkan::command::image_barrier;
use crate::backend::vulkan::command::pipeline_barrier;
use crate::backend::vulkan::command::CommandContext;
use crate::backend::vulkan::decoder::VulkanDisplayTarget;
use crate::backend::vulkan::VulkanDevice;
use crate::backend::vulkan::VulkanError;
use crate::backend::vulkan::PICTURE_FORMAT;
use crate::session::ManagerConfig;

/// Width and height of the workgroups of the conversion shader.
pub const WORKGROUP_SIZE: u32 = 16;

const ENTRY_POINT: &CStr = c"main";

/// Size of [`ConversionParams`] once pushed.
const PUSH_CONSTANTS_SIZE: u32 = 16;

#[derive(Clone, Debug)]
pub struct ConversionConfig {
    /// SPIR-V build of `shaders/nv12_to_rgba.comp`.
    pub shader_path: PathBuf,
    /// DPB slots a session may use.
    pub max_dpb_slots: u32,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            shader_path: PathBuf::from("shaders/nv12_to_rgba.spv"),
            max_dpb_slots: 17,
        }
    }
}

impl ConversionConfig {
    /// Descriptor sets needed for every session of `manager` to hold one set
    /// per DPB slot.
    pub fn pool_size(&self, manager: &ManagerConfig) -> u32 {
        (manager.max_sessions as u32).saturating_mul(self.max_dpb_slots)
    }
}

/// Push constants of the conversion shader.
#[derive(Clone, Copy, Debug, PartialEq)]
struct ConversionParams {
    output_extent: [u32; 2],
    /// Share of the picture that is visible, horizontally and vertically.
    uv_scale: [f32; 2],
}

impl ConversionParams {
    fn new(output: vk::Extent2D, visible: vk::Extent2D, coded: vk::Extent2D) -> Self {
        Self {
            output_extent: [output.width, output.height],
            uv_scale: [
                visible.width as f32 / coded.width.max(1) as f32,
                visible.height as f32 / coded.height.max(1) as f32,
            ],
        }
    }

    fn to_bytes(self) -> [u8; PUSH_CONSTANTS_SIZE as usize] {
        let mut bytes = [0u8; PUSH_CONSTANTS_SIZE as usize];
        bytes[0..4].copy_from_slice(&self.output_extent[0].to_ne_bytes());
        bytes[4..8].copy_from_slice(&self.output_extent[1].to_ne_bytes());
        bytes[8..12].copy_from_slice(&self.uv_scale[0].to_ne_bytes());
        bytes[12..16].copy_from_slice(&self.uv_scale[1].to_ne_bytes());
        bytes
    }
}

/// Part of the target written by a conversion. A larger target keeps the
/// picture at its size in the top left corner, a smaller one gets it scaled
/// down.
fn output_extent(visible: vk::Extent2D, target: vk::Extent2D) -> vk::Extent2D {
    vk::Extent2D {
        width: visible.width.min(target.width),
        height: visible.height.min(target.height),
    }
}

/// Number of workgroups covering `extent`.
fn dispatch_size(extent: vk::Extent2D) -> (u32, u32) {
    (
        extent.width.div_ceil(WORKGROUP_SIZE),
        extent.height.div_ceil(WORKGROUP_SIZE),
    )
}

/// Barriers recorded before the dispatch: the picture becomes sampleable and
/// the target writable.
///
/// They run on the compute queue, so they name no video decode stage. The
/// decode writing `source` has completed before the conversion is submitted.
fn barriers_before(
    source: vk::Image,
    target: vk::Image,
) -> [vk::ImageMemoryBarrier2<'static>; 2] {
    [
        image_barrier(
            source,
            vk::ImageLayout::VIDEO_DECODE_DPB_KHR,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            (vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE),
            (
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
            ),
        ),
        image_barrier(
            target,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
            (vk::PipelineStageFlags2::ALL_COMMANDS, vk::AccessFlags2::NONE),
            (
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_STORAGE_WRITE,
            ),
        ),
    ]
}

/// Barriers recorded after the dispatch: the target is left sampleable and
/// the picture goes back to the DPB layout. Later users of either image are
/// submitted once the conversion fence has signalled.
fn barriers_after(
    source: vk::Image,
    target: vk::Image,
) -> [vk::ImageMemoryBarrier2<'static>; 2] {
    [
        image_barrier(
            target,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            (
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_STORAGE_WRITE,
            ),
            (vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE),
        ),
        image_barrier(
            source,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::VIDEO_DECODE_DPB_KHR,
            (
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
            ),
            (vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE),
        ),
    ]
}

/// A pool conversion descriptor sets are returned to.
pub trait DescriptorSetPool {
    /// Returns `sets` to the pool. They must not be in use.
    fn free_sets(&self, sets: &[vk::DescriptorSet]) -> Result<(), VulkanError>;
}

/// The descriptor sets of one session, one per DPB slot. They go back to
/// their pool when dropped.
pub struct ConversionSets<P: DescriptorSetPool = ConversionPipeline> {
    pool: Arc<P>,
    sets: Vec<vk::DescriptorSet>,
}

impl<P: DescriptorSetPool> ConversionSets<P> {
    pub fn new(pool: Arc<P>, sets: Vec<vk::DescriptorSet>) -> Self {
        Self { pool, sets }
    }

    /// Set sampling the picture of `slot`.
    pub fn get(&self, slot: usize) -> Option<vk::DescriptorSet> {
        self.sets.get(slot).copied()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

impl<P: DescriptorSetPool> Drop for ConversionSets<P> {
    fn drop(&mut self) {
        if let Err(e) = self.pool.free_sets(&self.sets) {
            error!("Failed to free conversion descriptor sets: {}", e);
        }
    }
}

/// A picture to convert.
pub struct ConversionSource {
    pub image: vk::Image,
    pub descriptor_set: vk::DescriptorSet,
    pub visible_extent: vk::Extent2D,
    pub coded_extent: vk::Extent2D,
}

pub struct ConversionPipeline {
    device: Arc<ash::Device>,
    ycbcr_conversion: vk::SamplerYcbcrConversion,
    sampler: vk::Sampler,
    descriptor_set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    descriptor_pool: Mutex<vk::DescriptorPool>,
}

impl ConversionPipeline {
    /// Creates the pipeline shared by the sessions of a manager configured
    /// with `manager`.
    pub fn new(
        device: &VulkanDevice,
        config: &ConversionConfig,
        manager: &ManagerConfig,
    ) -> Result<Self, VulkanError> {
        let mut shader_file = File::open(&config.shader_path)
            .map_err(|e| VulkanError::Shader(config.shader_path.display().to_string(), e))?;
        let code = ash::util::read_spv(&mut shader_file)
            .map_err(|e| VulkanError::Shader(config.shader_path.display().to_string(), e))?;

        // Every handle starts out null so that a failure part way through is
        // cleaned up by `Drop`.
        let mut this = Self {
            device: Arc::clone(&device.device),
            ycbcr_conversion: vk::SamplerYcbcrConversion::null(),
            sampler: vk::Sampler::null(),
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            descriptor_pool: Mutex::new(vk::DescriptorPool::null()),
        };

        this.create_sampler()?;
        this.create_layouts()?;
        this.create_pipeline(&code)?;
        this.create_descriptor_pool(config.pool_size(manager))?;

        info!(
            "Conversion pipeline ready for {} sessions of up to {} DPB slots",
            manager.max_sessions, config.max_dpb_slots
        );
        Ok(this)
    }

    fn create_sampler(&mut self) -> Result<(), VulkanError> {
        let conversion_info = vk::SamplerYcbcrConversionCreateInfo::default()
            .format(PICTURE_FORMAT)
            .ycbcr_model(vk::SamplerYcbcrModelConversion::YCBCR_709)
            .ycbcr_range(vk::SamplerYcbcrRange::ITU_NARROW)
            .components(vk::ComponentMapping::default())
            .x_chroma_offset(vk::ChromaLocation::COSITED_EVEN)
            .y_chroma_offset(vk::ChromaLocation::COSITED_EVEN)
            .chroma_filter(vk::Filter::LINEAR)
            .force_explicit_reconstruction(false);

        // SAFETY: the device has the samplerYcbcrConversion feature enabled.
        self.ycbcr_conversion =
            unsafe { self.device.create_sampler_ycbcr_conversion(&conversion_info, None) }
                .map_err(VulkanError::call("vkCreateSamplerYcbcrConversion"))?;

        let mut ycbcr_info =
            vk::SamplerYcbcrConversionInfo::default().conversion(self.ycbcr_conversion);
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .push_next(&mut ycbcr_info);

        // SAFETY: the YCbCr conversion was created above.
        self.sampler = unsafe { self.device.create_sampler(&sampler_info, None) }
            .map_err(VulkanError::call("vkCreateSampler"))?;

        Ok(())
    }

    fn create_layouts(&mut self) -> Result<(), VulkanError> {
        // Samplers with a YCbCr conversion can only be used as immutable samplers.
        let immutable_samplers = [self.sampler];
        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
                .immutable_samplers(&immutable_samplers),
            vk::DescriptorSetLayoutBinding::default()
                .binding(1)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE),
        ];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);

        // SAFETY: the immutable sampler is alive.
        self.descriptor_set_layout =
            unsafe { self.device.create_descriptor_set_layout(&layout_info, None) }
                .map_err(VulkanError::call("vkCreateDescriptorSetLayout"))?;

        let set_layouts = [self.descriptor_set_layout];
        let push_constant_ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(PUSH_CONSTANTS_SIZE)];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);

        // SAFETY: the descriptor set layout was created above.
        self.pipeline_layout =
            unsafe { self.device.create_pipeline_layout(&pipeline_layout_info, None) }
                .map_err(VulkanError::call("vkCreatePipelineLayout"))?;

        Ok(())
    }

    fn create_pipeline(&mut self, code: &[u32]) -> Result<(), VulkanError> {
        let module_info = vk::ShaderModuleCreateInfo::default().code(code);
        // SAFETY: `code` was read by `read_spv`, which checks its size and alignment.
        let module = unsafe { self.device.create_shader_module(&module_info, None) }
            .map_err(VulkanError::call("vkCreateShaderModule"))?;

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(ENTRY_POINT);
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(self.pipeline_layout);

        // SAFETY: the shader module and the pipeline layout are alive.
        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };

        // SAFETY: the module is not needed once the pipeline is created.
        unsafe { self.device.destroy_shader_module(module, None) };

        self.pipeline = pipelines
            .map_err(|(_, e)| VulkanError::Call("vkCreateComputePipelines", e))?[0];
        debug!("Conversion compute pipeline created");
        Ok(())
    }

    fn create_descriptor_pool(&mut self, max_sets: u32) -> Result<(), VulkanError> {
        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(max_sets),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(max_sets),
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);

        // SAFETY: `device` is valid, the pool sizes are non-empty.
        *self.descriptor_pool.get_mut() =
            unsafe { self.device.create_descriptor_pool(&pool_info, None) }
                .map_err(VulkanError::call("vkCreateDescriptorPool"))?;

        Ok(())
    }

    pub fn ycbcr_conversion(&self) -> vk::SamplerYcbcrConversion {
        self.ycbcr_conversion
    }

    /// Allocates one descriptor set per view in `sampled_views`, with the
    /// view bound as the source picture.
    pub fn allocate_sets(
        self: &Arc<Self>,
        sampled_views: &[vk::ImageView],
    ) -> Result<ConversionSets, VulkanError> {
        if sampled_views.is_empty() {
            return Ok(ConversionSets::new(Arc::clone(self), Vec::new()));
        }

        let layouts = vec![self.descriptor_set_layout; sampled_views.len()];
        let pool = self.descriptor_pool.lock();
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(*pool)
            .set_layouts(&layouts);

        // SAFETY: the pool is externally synchronized through its mutex.
        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(VulkanError::call("vkAllocateDescriptorSets"))?;

        let image_infos: Vec<[vk::DescriptorImageInfo; 1]> = sampled_views
            .iter()
            .map(|view| {
                [vk::DescriptorImageInfo::default()
                    .image_view(*view)
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)]
            })
            .collect();
        let writes: Vec<vk::WriteDescriptorSet> = sets
            .iter()
            .zip(&image_infos)
            .map(|(set, image_info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(*set)
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(image_info)
            })
            .collect();

        // SAFETY: the sets were just allocated and are not in use.
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
        drop(pool);

        Ok(ConversionSets::new(Arc::clone(self), sets))
    }

    /// Converts `source` into `target` and waits for completion.
    ///
    /// `source` must be in the `VIDEO_DECODE_DPB_KHR` layout, to which it is
    /// returned. `target` ends up in `SHADER_READ_ONLY_OPTIMAL`.
    pub fn convert(
        &self,
        commands: &CommandContext,
        source: &ConversionSource,
        target: &VulkanDisplayTarget,
    ) -> Result<(), VulkanError> {
        let target_info = [vk::DescriptorImageInfo::default()
            .image_view(target.view)
            .image_layout(vk::ImageLayout::GENERAL)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(source.descriptor_set)
            .dst_binding(1)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .image_info(&target_info);

        // SAFETY: the previous conversion using this set has completed.
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };

        let extent = output_extent(source.visible_extent, target.extent);
        let params = ConversionParams::new(extent, source.visible_extent, source.coded_extent);
        let (groups_x, groups_y) = dispatch_size(extent);

        commands.submit_and_wait(|device, cmd| {
            pipeline_barrier(device, cmd, &barriers_before(source.image, target.image));

            // SAFETY: the pipeline, its layout and the descriptor set are alive and the images
            // are in the layouts the descriptors declare.
            unsafe {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipeline);
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::COMPUTE,
                    self.pipeline_layout,
                    0,
                    &[source.descriptor_set],
                    &[],
                );
                device.cmd_push_constants(
                    cmd,
                    self.pipeline_layout,
                    vk::ShaderStageFlags::COMPUTE,
                    0,
                    &params.to_bytes(),
                );
                device.cmd_dispatch(cmd, groups_x, groups_y, 1);
            }

            pipeline_barrier(device, cmd, &barriers_after(source.image, target.image));
        })?;

        debug!(
            "Converted picture into {}x{} of a {}x{} target",
            extent.width, extent.height, target.extent.width, target.extent.height
        );
        Ok(())
    }
}

impl DescriptorSetPool for ConversionPipeline {
    fn free_sets(&self, sets: &[vk::DescriptorSet]) -> Result<(), VulkanError> {
        if sets.is_empty() {
            return Ok(());
        }

        let pool = self.descriptor_pool.lock();
        // SAFETY: the pool was created with FREE_DESCRIPTOR_SET and the sets come from it.
        unsafe { self.device.free_descriptor_sets(*pool, sets) }
            .map_err(VulkanError::call("vkFreeDescriptorSets"))
    }
}

impl Drop for ConversionPipeline {
    fn drop(&mut self) {
        // SAFETY: no conversion is pending, `convert` waits for completion. Every session
        // holding descriptor sets from the pool holds a reference to `self`, so they are all
        // gone. Destroying null handles is a no-op.
        unsafe {
            self.device
                .destroy_descriptor_pool(*self.descriptor_pool.get_mut(), None);
            self.device.destroy_pipeline(self.pipeline, None);
            self.device
                .destroy_pipeline_layout(self.pipeline_layout, None);
            self.device
                .destroy_descriptor_set_layout(self.descriptor_set_layout, None);
            self.device.destroy_sampler(self.sampler, None);
            self.device
                .destroy_sampler_ycbcr_conversion(self.ycbcr_conversion, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use ash::vk::Handle;

    use super::*;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn dispatch_covers_the_output() {
        assert_eq!(dispatch_size(extent(800, 600)), (50, 38));
        assert_eq!(dispatch_size(extent(16, 16)), (1, 1));
        assert_eq!(dispatch_size(extent(17, 1)), (2, 1));
    }

    #[test]
    fn output_is_clamped_to_the_picture() {
        // An oversized target does not launch idle workgroups.
        let output = output_extent(extent(800, 600), extent(1920, 1080));
        assert_eq!((output.width, output.height), (800, 600));
        assert_eq!(dispatch_size(output), (50, 38));

        let output = output_extent(extent(800, 600), extent(400, 300));
        assert_eq!((output.width, output.height), (400, 300));

        let output = output_extent(extent(800, 600), extent(1000, 200));
        assert_eq!((output.width, output.height), (800, 200));
    }

    #[test]
    fn push_constants_crop_the_picture() {
        let params = ConversionParams::new(extent(400, 300), extent(800, 600), extent(800, 608));

        assert_eq!(params.output_extent, [400, 300]);
        assert_eq!(params.uv_scale[0], 1.0);
        assert!((params.uv_scale[1] - 600.0 / 608.0).abs() < f32::EPSILON);

        let bytes = params.to_bytes();
        assert_eq!(&bytes[0..4], &400u32.to_ne_bytes());
        assert_eq!(&bytes[8..12], &1.0f32.to_ne_bytes());
    }

    #[test]
    fn barriers_only_use_compute_stages() {
        let source = vk::Image::from_raw(1);
        let target = vk::Image::from_raw(2);
        let compute_stages =
            vk::PipelineStageFlags2::COMPUTE_SHADER | vk::PipelineStageFlags2::ALL_COMMANDS;
        let video_access =
            vk::AccessFlags2::VIDEO_DECODE_READ_KHR | vk::AccessFlags2::VIDEO_DECODE_WRITE_KHR;

        let before = barriers_before(source, target);
        let after = barriers_after(source, target);
        for barrier in before.iter().chain(after.iter()) {
            assert!(compute_stages.contains(barrier.src_stage_mask));
            assert!(compute_stages.contains(barrier.dst_stage_mask));
            assert!(!barrier.src_access_mask.intersects(video_access));
            assert!(!barrier.dst_access_mask.intersects(video_access));
        }

        assert_eq!(before[0].image, source);
        assert_eq!(before[0].old_layout, vk::ImageLayout::VIDEO_DECODE_DPB_KHR);
        assert_eq!(before[0].new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(before[1].new_layout, vk::ImageLayout::GENERAL);
        assert_eq!(after[0].new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(after[1].image, source);
        assert_eq!(after[1].new_layout, vk::ImageLayout::VIDEO_DECODE_DPB_KHR);
    }

    #[test]
    fn pool_size_follows_the_session_limit() {
        let config = ConversionConfig::default();
        let manager = ManagerConfig {
            max_sessions: 3,
            ..Default::default()
        };

        assert_eq!(config.pool_size(&manager), 3 * 17);
    }

    #[derive(Default)]
    struct RecordingPool {
        freed: RefCell<Vec<vk::DescriptorSet>>,
    }

    impl DescriptorSetPool for RecordingPool {
        fn free_sets(&self, sets: &[vk::DescriptorSet]) -> Result<(), VulkanError> {
            self.freed.borrow_mut().extend_from_slice(sets);
            Ok(())
        }
    }

    #[test]
    fn sets_go_back_to_the_pool_when_bootstrap_fails() {
        fn bootstrap(
            sets: ConversionSets<RecordingPool>,
            reset: Result<(), VulkanError>,
        ) -> Result<ConversionSets<RecordingPool>, VulkanError> {
            reset?;
            Ok(sets)
        }

        let pool = Arc::new(RecordingPool::default());
        let handles: Vec<_> = (1..=3).map(vk::DescriptorSet::from_raw).collect();

        let sets = ConversionSets::new(Arc::clone(&pool), handles.clone());
        assert_eq!(sets.len(), 3);
        assert_eq!(sets.get(1), Some(handles[1]));
        assert_eq!(sets.get(3), None);

        let reset_error = VulkanError::Call("vkQueueSubmit", vk::Result::ERROR_DEVICE_LOST);
        let result = bootstrap(sets, Err(reset_error));
        assert!(result.is_err());
        assert_eq!(*pool.freed.borrow(), handles);

        // Sets of a working session are only returned once it goes away.
        let sets = ConversionSets::new(Arc::clone(&pool), handles.clone());
        let sets = bootstrap(sets, Ok(())).unwrap();
        assert_eq!(pool.freed.borrow().len(), 3);
        drop(sets);
        assert_eq!(pool.freed.borrow().len(), 6);
    }
}
