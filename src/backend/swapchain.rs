// Swapchain - Window presentation
//
// Owns the presentable images together with everything whose lifetime is
// tied to them: color views, depth buffers, framebuffers, the render pass,
// and the per-frame-in-flight synchronization sets. Destroyed and rebuilt
// wholesale on resize or surface invalidation.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::sync::FrameSync;
use super::VulkanDevice;

/// How far the CPU may run ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Outcome of asking the presentation engine for the next image.
///
/// Out-of-date is a recoverable condition, not an error: the caller must
/// rebuild the swapchain and skip the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireStatus {
    /// Image acquired and the swapchain still matches the surface.
    Ready(u32),
    /// Image acquired but the swapchain no longer matches the surface
    /// exactly; still usable for this frame.
    Suboptimal(u32),
    /// The surface has changed and no image could be acquired.
    OutOfDate,
}

/// Outcome of submitting and presenting a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// Attachment formats of a swapchain. Must stay stable across recreation;
/// pipelines and render passes built against the old formats would silently
/// stop matching otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceFormats {
    pub color: vk::Format,
    pub depth: vk::Format,
}

impl SurfaceFormats {
    /// Fatal if the rebuilt swapchain came back with different formats.
    pub fn ensure_matches(&self, other: &SurfaceFormats) -> Result<()> {
        if self != other {
            bail!(
                "swapchain image or depth format has changed (was {:?}/{:?}, now {:?}/{:?})",
                self.color,
                self.depth,
                other.color,
                other.depth
            );
        }
        Ok(())
    }
}

struct DepthBuffer {
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
}

pub struct Swapchain {
    swapchain: vk::SwapchainKHR,
    swapchain_loader: ash::extensions::khr::Swapchain,
    image_views: Vec<vk::ImageView>,
    depth_buffers: Vec<DepthBuffer>,
    framebuffers: Vec<vk::Framebuffer>,
    render_pass: vk::RenderPass,
    frame_sync: Vec<FrameSync>,
    /// Fence of the frame that last rendered into each image, to detect an
    /// image handed back to us while still in flight.
    images_in_flight: Vec<vk::Fence>,
    formats: SurfaceFormats,
    extent: vk::Extent2D,
    current_frame: usize,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(
        device: Arc<VulkanDevice>,
        extent: vk::Extent2D,
        preferred_present_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        Self::build(device, extent, preferred_present_mode, vk::SwapchainKHR::null())
    }

    /// Rebuild against a new extent, seeded from the retired swapchain.
    ///
    /// The old swapchain is only read for its handle (faster image reuse by
    /// the driver) and its format metadata; the caller drops it afterwards.
    pub fn recreate(
        device: Arc<VulkanDevice>,
        extent: vk::Extent2D,
        preferred_present_mode: vk::PresentModeKHR,
        old: &Swapchain,
    ) -> Result<Self> {
        let rebuilt = Self::build(device, extent, preferred_present_mode, old.swapchain)?;
        old.formats.ensure_matches(&rebuilt.formats)?;
        Ok(rebuilt)
    }

    fn build(
        device: Arc<VulkanDevice>,
        window_extent: vk::Extent2D,
        preferred_present_mode: vk::PresentModeKHR,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Self> {
        let surface_caps = unsafe {
            device.surface_loader.get_physical_device_surface_capabilities(
                device.physical_device,
                device.surface,
            )
        }?;
        let surface_formats = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_formats(device.physical_device, device.surface)
        }?;
        let present_modes = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_present_modes(device.physical_device, device.surface)
        }?;

        let surface_format =
            choose_surface_format(&surface_formats).context("No suitable surface format")?;
        let present_mode = choose_present_mode(preferred_present_mode, &present_modes);
        let extent = choose_extent(&surface_caps, window_extent);
        let depth_format = find_depth_format(&device)?;

        log::info!(
            "Creating swapchain: {}x{}, {:?}, present mode {:?}",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode
        );

        // One more than the minimum so acquisition rarely blocks on the
        // presentation engine
        let mut image_count = surface_caps.min_image_count + 1;
        if surface_caps.max_image_count > 0 && image_count > surface_caps.max_image_count {
            image_count = surface_caps.max_image_count;
        }

        let swapchain_loader =
            ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        let images = unsafe { swapchain_loader.get_swapchain_images(swapchain) }?;
        log::info!("Swapchain has {} images", images.len());

        let image_views = create_image_views(&device, &images, surface_format.format)?;
        let render_pass = create_render_pass(&device, surface_format.format, depth_format)?;
        let depth_buffers = create_depth_buffers(&device, extent, depth_format, images.len())?;

        let framebuffers =
            create_framebuffers(&device, &image_views, &depth_buffers, render_pass, extent)?;

        let frame_sync = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|_| FrameSync::new(&device))
            .collect::<Result<Vec<_>>>()?;
        let images_in_flight = vec![vk::Fence::null(); images.len()];

        Ok(Self {
            swapchain,
            swapchain_loader,
            image_views,
            depth_buffers,
            framebuffers,
            render_pass,
            frame_sync,
            images_in_flight,
            formats: SurfaceFormats {
                color: surface_format.format,
                depth: depth_format,
            },
            extent,
            current_frame: 0,
            device,
        })
    }

    /// Acquire the next presentable image.
    ///
    /// Blocks on the current slot's in-flight fence first, which is what
    /// bounds CPU lead over the GPU to [`MAX_FRAMES_IN_FLIGHT`].
    pub fn acquire_next_image(&self) -> Result<AcquireStatus> {
        let sync = &self.frame_sync[self.current_frame];

        unsafe {
            self.device
                .device
                .wait_for_fences(&[sync.in_flight_fence], true, u64::MAX)
                .context("Failed waiting for in-flight fence")?;
        }

        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                sync.image_available,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, false)) => Ok(AcquireStatus::Ready(index)),
            Ok((index, true)) => Ok(AcquireStatus::Suboptimal(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireStatus::OutOfDate),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    /// Submit a recorded command buffer and present the image it rendered.
    ///
    /// Advances the frame-in-flight index afterwards.
    pub fn submit_and_present(
        &mut self,
        command_buffer: vk::CommandBuffer,
        image_index: u32,
    ) -> Result<PresentStatus> {
        let sync = &self.frame_sync[self.current_frame];
        let image_fence = self.images_in_flight[image_index as usize];

        unsafe {
            // The presentation engine may hand an image back while an older
            // frame is still rendering into it
            if image_fence != vk::Fence::null() {
                self.device
                    .device
                    .wait_for_fences(&[image_fence], true, u64::MAX)
                    .context("Failed waiting for image fence")?;
            }
            self.images_in_flight[image_index as usize] = sync.in_flight_fence;

            self.device
                .device
                .reset_fences(&[sync.in_flight_fence])
                .context("Failed to reset in-flight fence")?;
        }

        let wait_semaphores = [sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [sync.render_finished];
        let command_buffers = [command_buffer];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .device
                .queue_submit(
                    self.device.graphics_queue,
                    &[submit_info.build()],
                    sync.in_flight_fence,
                )
                .context("Failed to submit frame command buffer")?;
        }

        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let present = unsafe {
            self.swapchain_loader
                .queue_present(self.device.graphics_queue, &present_info)
        };

        self.current_frame = (self.current_frame + 1) % MAX_FRAMES_IN_FLIGHT;

        match present {
            Ok(false) => Ok(PresentStatus::Presented),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.framebuffers[image_index as usize]
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.extent.width as f32 / self.extent.height as f32
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for sync in &self.frame_sync {
                sync.destroy(&self.device.device);
            }
            for &framebuffer in &self.framebuffers {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
            self.device.device.destroy_render_pass(self.render_pass, None);
            for depth in &mut self.depth_buffers {
                self.device.device.destroy_image_view(depth.view, None);
                self.device.device.destroy_image(depth.image, None);
                if let Some(allocation) = depth.allocation.take() {
                    let _ = self.device.allocator.lock().free(allocation);
                }
            }
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

/// Prefer SRGB color for correct gamma
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// Use the configured mode if the surface supports it, otherwise fall back
/// to MAILBOX, then FIFO (which is always available).
fn choose_present_mode(
    preferred: vk::PresentModeKHR,
    available: &[vk::PresentModeKHR],
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        return preferred;
    }
    if available.contains(&vk::PresentModeKHR::MAILBOX) {
        return vk::PresentModeKHR::MAILBOX;
    }
    vk::PresentModeKHR::FIFO
}

fn choose_extent(
    caps: &vk::SurfaceCapabilitiesKHR,
    window_extent: vk::Extent2D,
) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: window_extent.width.clamp(
                caps.min_image_extent.width,
                caps.max_image_extent.width,
            ),
            height: window_extent.height.clamp(
                caps.min_image_extent.height,
                caps.max_image_extent.height,
            ),
        }
    }
}

/// Pick the first depth format with optimal-tiling attachment support.
fn find_depth_format(device: &VulkanDevice) -> Result<vk::Format> {
    const CANDIDATES: [vk::Format; 3] = [
        vk::Format::D32_SFLOAT,
        vk::Format::D32_SFLOAT_S8_UINT,
        vk::Format::D24_UNORM_S8_UINT,
    ];

    CANDIDATES
        .into_iter()
        .find(|&format| {
            let props = unsafe {
                device
                    .instance
                    .get_physical_device_format_properties(device.physical_device, format)
            };
            props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })
        .context("No supported depth attachment format")
}

fn create_image_views(
    device: &VulkanDevice,
    images: &[vk::Image],
    format: vk::Format,
) -> Result<Vec<vk::ImageView>> {
    images
        .iter()
        .map(|&image| {
            let create_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            unsafe {
                device
                    .device
                    .create_image_view(&create_info, None)
                    .context("Failed to create swapchain image view")
            }
        })
        .collect()
}

/// Single-subpass render pass: cleared color presented at the end, cleared
/// depth discarded at the end.
fn create_render_pass(
    device: &VulkanDevice,
    color_format: vk::Format,
    depth_format: vk::Format,
) -> Result<vk::RenderPass> {
    let color_attachment = vk::AttachmentDescription::builder()
        .format(color_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();

    let depth_attachment = vk::AttachmentDescription::builder()
        .format(depth_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let depth_attachment_ref = vk::AttachmentReference::builder()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachments = [color_attachment_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_attachments)
        .depth_stencil_attachment(&depth_attachment_ref)
        .build();

    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .build();

    let attachments = [color_attachment, depth_attachment];
    let subpasses = [subpass];
    let dependencies = [dependency];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe {
        device
            .device
            .create_render_pass(&render_pass_info, None)
            .context("Failed to create render pass")
    }
}

fn create_depth_buffers(
    device: &Arc<VulkanDevice>,
    extent: vk::Extent2D,
    format: vk::Format,
    count: usize,
) -> Result<Vec<DepthBuffer>> {
    (0..count)
        .map(|_| {
            let image_info = vk::ImageCreateInfo::builder()
                .image_type(vk::ImageType::TYPE_2D)
                .extent(vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(1)
                .format(format)
                .tiling(vk::ImageTiling::OPTIMAL)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
                .samples(vk::SampleCountFlags::TYPE_1)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);

            let image = unsafe { device.device.create_image(&image_info, None) }
                .context("Failed to create depth image")?;
            let requirements = unsafe { device.device.get_image_memory_requirements(image) };

            let allocation = device
                .allocator
                .lock()
                .allocate(&AllocationCreateDesc {
                    name: "depth buffer",
                    requirements,
                    location: MemoryLocation::GpuOnly,
                    linear: false,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .context("Failed to allocate depth image memory")?;

            unsafe {
                device
                    .device
                    .bind_image_memory(image, allocation.memory(), allocation.offset())
                    .context("Failed to bind depth image memory")?;
            }

            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::DEPTH,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            let view = unsafe { device.device.create_image_view(&view_info, None) }
                .context("Failed to create depth image view")?;

            Ok(DepthBuffer {
                image,
                view,
                allocation: Some(allocation),
            })
        })
        .collect()
}

fn create_framebuffers(
    device: &VulkanDevice,
    image_views: &[vk::ImageView],
    depth_buffers: &[DepthBuffer],
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> Result<Vec<vk::Framebuffer>> {
    image_views
        .iter()
        .zip(depth_buffers)
        .map(|(&view, depth)| {
            let attachments = [view, depth.view];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            unsafe {
                device
                    .device
                    .create_framebuffer(&framebuffer_info, None)
                    .context("Failed to create framebuffer")
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn surface_format_prefers_srgb() {
        let formats = [
            surface_format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            surface_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn surface_format_falls_back_to_first() {
        let formats = [surface_format(
            vk::Format::R8G8B8A8_UNORM,
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        )];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn present_mode_honors_preference_when_available() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(vk::PresentModeKHR::IMMEDIATE, &available),
            vk::PresentModeKHR::IMMEDIATE
        );
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(vk::PresentModeKHR::MAILBOX, &available),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_clamped_to_surface_limits() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 200,
                height: 200,
            },
            max_image_extent: vk::Extent2D {
                width: 1000,
                height: 1000,
            },
            ..Default::default()
        };
        let chosen = choose_extent(
            &caps,
            vk::Extent2D {
                width: 4000,
                height: 100,
            },
        );
        assert_eq!(chosen.width, 1000);
        assert_eq!(chosen.height, 200);
    }

    #[test]
    fn matching_formats_pass_the_stability_check() {
        let a = SurfaceFormats {
            color: vk::Format::B8G8R8A8_SRGB,
            depth: vk::Format::D32_SFLOAT,
        };
        assert!(a.ensure_matches(&a).is_ok());
    }

    #[test]
    fn changed_color_format_is_fatal() {
        let old = SurfaceFormats {
            color: vk::Format::B8G8R8A8_SRGB,
            depth: vk::Format::D32_SFLOAT,
        };
        let new = SurfaceFormats {
            color: vk::Format::R8G8B8A8_UNORM,
            depth: vk::Format::D32_SFLOAT,
        };
        let err = old.ensure_matches(&new).unwrap_err();
        assert!(err.to_string().contains("format has changed"));
    }
}
