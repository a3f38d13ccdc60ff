// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! vkdec, plays a looping H.264 stream through Vulkan Video and converts every displayed picture
//! into an RGBA image.

use std::ffi::c_char;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use argh::FromArgs;
use ash::vk;
use gpu_allocator::vulkan::AllocationCreateDesc;
use gpu_allocator::vulkan::AllocationScheme;
use gpu_allocator::MemoryLocation;
use log::info;
use log::warn;

use vkdec::backend::vulkan::ConversionConfig;
use vkdec::backend::vulkan::ConversionPipeline;
use vkdec::backend::vulkan::QueueInfo;
use vkdec::backend::vulkan::VulkanBackend;
use vkdec::backend::vulkan::VulkanDevice;
use vkdec::backend::vulkan::VulkanDisplayTarget;
use vkdec::session::ManagerConfig;
use vkdec::session::SessionConfig;
use vkdec::session::SessionManager;
use vkdec::session::DEFAULT_FRAME_INTERVAL;

/// Plays an H.264 Annex B stream in a loop with Vulkan Video
#[derive(Debug, FromArgs)]
struct Args {
    /// input H.264 Annex B file
    #[argh(positional)]
    input: PathBuf,

    /// SPIR-V build of shaders/nv12_to_rgba.comp
    #[argh(option, default = "PathBuf::from(\"shaders/nv12_to_rgba.spv\")")]
    shader: PathBuf,

    /// number of ticks to run
    #[argh(option, default = "300")]
    ticks: u32,

    /// pace playback with the frame rate signalled in the stream
    #[argh(switch)]
    stream_timing: bool,
}

/// Queue families able to decode and to run the conversion shader.
fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Option<(u32, u32)> {
    // SAFETY: `physical_device` was enumerated from `instance`.
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let decode = families
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::VIDEO_DECODE_KHR))?;
    let compute = families
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::COMPUTE))?;

    Some((decode as u32, compute as u32))
}

fn create_command_pool(device: &ash::Device, family_index: u32) -> anyhow::Result<QueueInfo> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        .queue_family_index(family_index);

    // SAFETY: the device was created with a queue of `family_index`.
    let (command_pool, queue) = unsafe {
        (
            device.create_command_pool(&pool_info, None)?,
            device.get_device_queue(family_index, 0),
        )
    };

    Ok(QueueInfo {
        family_index,
        queue,
        command_pool,
    })
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();
    let stream = fs::read(&args.input)
        .with_context(|| format!("cannot read {}", args.input.display()))?;

    // SAFETY: the entry outlives every object created from it, it is dropped last.
    let entry = unsafe { ash::Entry::load() }?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(c"vkdec")
        .api_version(vk::API_VERSION_1_3);
    let instance_info = vk::InstanceCreateInfo::default().application_info(&app_info);
    // SAFETY: the create info is valid for the duration of the call.
    let instance = unsafe { entry.create_instance(&instance_info, None) }?;

    // SAFETY: `instance` is valid.
    let (physical_device, (decode_family, compute_family)) =
        unsafe { instance.enumerate_physical_devices() }?
            .into_iter()
            .find_map(|pd| find_queue_families(&instance, pd).map(|families| (pd, families)))
            .ok_or_else(|| anyhow!("no device with a video decode queue"))?;

    let priorities = [1.0f32];
    let mut queue_infos = vec![vk::DeviceQueueCreateInfo::default()
        .queue_family_index(decode_family)
        .queue_priorities(&priorities)];
    if compute_family != decode_family {
        queue_infos.push(
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(compute_family)
                .queue_priorities(&priorities),
        );
    }

    let extensions: [*const c_char; 3] = [
        ash::khr::video_queue::NAME.as_ptr(),
        ash::khr::video_decode_queue::NAME.as_ptr(),
        ash::khr::video_decode_h264::NAME.as_ptr(),
    ];
    let mut features_11 =
        vk::PhysicalDeviceVulkan11Features::default().sampler_ycbcr_conversion(true);
    let mut features_13 = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);
    let device_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extensions)
        .push_next(&mut features_11)
        .push_next(&mut features_13);

    // SAFETY: `physical_device` belongs to `instance` and supports the requested queues.
    let device = Arc::new(unsafe { instance.create_device(physical_device, &device_info, None) }?);

    let decode_queue = create_command_pool(&device, decode_family)?;
    let compute_queue = create_command_pool(&device, compute_family)?;

    let vulkan = Arc::new(VulkanDevice::new(
        &entry,
        instance.clone(),
        physical_device,
        Arc::clone(&device),
        decode_queue,
        compute_queue,
    )?);

    let config = ManagerConfig {
        max_sessions: 1,
        session: SessionConfig {
            frame_interval: DEFAULT_FRAME_INTERVAL,
            use_stream_timing: args.stream_timing,
        },
    };
    let conversion = Arc::new(ConversionPipeline::new(
        &vulkan,
        &ConversionConfig {
            shader_path: args.shader.clone(),
            ..Default::default()
        },
        &config,
    )?);

    let mut manager = SessionManager::new(config, || {
        Ok(VulkanBackend::new(
            Arc::clone(&vulkan),
            Arc::clone(&conversion),
        ))
    });

    let id = manager.create_session(stream)?;
    let (width, height, interval) = {
        let session = manager
            .session(id)
            .ok_or_else(|| anyhow!("session {} vanished", id))?;
        (session.width(), session.height(), session.frame_interval())
    };
    info!("Playing {}x{} every {:?}", width, height, interval);

    let target_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(vk::Format::R8G8B8A8_UNORM)
        .extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    // SAFETY: the create info is valid for the duration of the call.
    let target_image = unsafe { device.create_image(&target_info, None) }?;
    // SAFETY: the image was just created from `device`.
    let requirements = unsafe { device.get_image_memory_requirements(target_image) };
    let target_allocation = vulkan.allocator().lock().allocate(&AllocationCreateDesc {
        name: "display target",
        requirements,
        location: MemoryLocation::GpuOnly,
        linear: false,
        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    })?;
    // SAFETY: the allocation satisfies the image requirements.
    unsafe {
        device.bind_image_memory(
            target_image,
            target_allocation.memory(),
            target_allocation.offset(),
        )
    }?;
    let view_info = vk::ImageViewCreateInfo::default()
        .image(target_image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(vk::Format::R8G8B8A8_UNORM)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .level_count(1)
                .layer_count(1),
        );
    // SAFETY: the image is bound to memory.
    let target_view = unsafe { device.create_image_view(&view_info, None) }?;

    manager.assign_display_target(
        id,
        VulkanDisplayTarget {
            image: target_image,
            view: target_view,
            extent: vk::Extent2D { width, height },
        },
    )?;

    for _ in 0..args.ticks {
        match manager.process_session(id, interval) {
            Ok(true) => {
                if let Some(session) = manager.session(id) {
                    info!(
                        "Frame {} displayed from slot {:?}",
                        session.frames_displayed(),
                        session.displayed_slot()
                    );
                }
            }
            Ok(false) => (),
            Err(e) => {
                warn!("Playback stopped: {} ({:?})", e, e.kind());
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    manager.close(id)?;
    drop(manager);
    drop(conversion);

    // SAFETY: every submission has completed and nothing uses the target anymore.
    unsafe {
        device.destroy_image_view(target_view, None);
        device.destroy_image(target_image, None);
    }
    vulkan.allocator().lock().free(target_allocation)?;

    // The allocator must be gone before the device is destroyed.
    drop(vulkan);

    // SAFETY: all objects created from the device and the instance have been destroyed.
    unsafe {
        device.destroy_command_pool(decode_queue.command_pool, None);
        device.destroy_command_pool(compute_queue.command_pool, None);
        device.destroy_device(None);
        instance.destroy_instance(None);
    }

    Ok(())
}
