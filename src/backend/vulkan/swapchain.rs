//! Vulkan swapchain, its image views and the framebuffers drawn into them.

use ash::vk;

use super::conversion::creation_error;
use crate::backend::ObjectKind;
use crate::error::GraphicsError;

/// What a swapchain is created from; owned by the backend.
pub struct SurfaceContext<'a> {
    pub device: &'a ash::Device,
    pub surface_fn: &'a ash::khr::surface::Instance,
    pub swapchain_fn: &'a ash::khr::swapchain::Device,
    pub physical_device: vk::PhysicalDevice,
    pub surface: vk::SurfaceKHR,
}

/// Preferences for a new swapchain.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainRequest {
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    pub image_count: u32,
    /// Format to keep when the surface still supports it.
    pub preferred_format: Option<vk::Format>,
}

pub struct VulkanSwapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl VulkanSwapchain {
    /// Create a swapchain, replacing `old` if given. `old` is not destroyed.
    pub fn new(
        ctx: &SurfaceContext<'_>,
        request: SwapchainRequest,
        old: vk::SwapchainKHR,
    ) -> Result<Self, GraphicsError> {
        let swapchain_error = |what: &str, e: vk::Result| {
            GraphicsError::SwapchainCreationFailed(format!("{what}: {e:?}"))
        };

        let capabilities = unsafe {
            ctx.surface_fn
                .get_physical_device_surface_capabilities(ctx.physical_device, ctx.surface)
        }
        .map_err(|e| swapchain_error("surface capabilities", e))?;
        let formats = unsafe {
            ctx.surface_fn
                .get_physical_device_surface_formats(ctx.physical_device, ctx.surface)
        }
        .map_err(|e| swapchain_error("surface formats", e))?;
        let present_modes = unsafe {
            ctx.surface_fn
                .get_physical_device_surface_present_modes(ctx.physical_device, ctx.surface)
        }
        .map_err(|e| swapchain_error("present modes", e))?;

        let surface_format = choose_surface_format(&formats, request.preferred_format)
            .ok_or_else(|| {
                GraphicsError::SwapchainCreationFailed("Surface has no formats".into())
            })?;
        let present_mode = choose_present_mode(&present_modes, request.vsync);
        let extent = choose_extent(&capabilities, request.width, request.height);

        let mut image_count = request.image_count.max(capabilities.min_image_count);
        if capabilities.max_image_count > 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(ctx.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old);

        let handle = unsafe { ctx.swapchain_fn.create_swapchain(&create_info, None) }
            .map_err(|e| swapchain_error("create", e))?;

        let images = match unsafe { ctx.swapchain_fn.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { ctx.swapchain_fn.destroy_swapchain(handle, None) };
                return Err(swapchain_error("images", e));
            }
        };

        let mut swapchain = Self {
            handle,
            images,
            views: Vec::new(),
            framebuffers: Vec::new(),
            format: surface_format.format,
            extent,
        };
        for &image in &swapchain.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .level_count(1)
                        .layer_count(1),
                );
            match unsafe { ctx.device.create_image_view(&view_info, None) } {
                Ok(view) => swapchain.views.push(view),
                Err(e) => {
                    swapchain.destroy(ctx.device, ctx.swapchain_fn);
                    return Err(creation_error(ObjectKind::ImageView)(e));
                }
            }
        }

        log::info!(
            "Created swapchain {}x{} ({:?}, {:?}, {} images)",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            swapchain.images.len()
        );
        Ok(swapchain)
    }

    /// Create one framebuffer per image for `render_pass`.
    pub fn create_framebuffers(
        &mut self,
        device: &ash::Device,
        render_pass: vk::RenderPass,
    ) -> Result<(), GraphicsError> {
        for &view in &self.views {
            let attachments = [view];
            let info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);
            let framebuffer = unsafe { device.create_framebuffer(&info, None) }
                .map_err(creation_error(ObjectKind::Framebuffer))?;
            self.framebuffers.push(framebuffer);
        }
        Ok(())
    }

    /// Destroy the framebuffers, views and the swapchain itself.
    ///
    /// The caller must ensure the device is idle.
    pub fn destroy(&mut self, device: &ash::Device, swapchain_fn: &ash::khr::swapchain::Device) {
        for framebuffer in self.framebuffers.drain(..) {
            unsafe { device.destroy_framebuffer(framebuffer, None) };
        }
        for view in self.views.drain(..) {
            unsafe { device.destroy_image_view(view, None) };
        }
        if self.handle != vk::SwapchainKHR::null() {
            unsafe { swapchain_fn.destroy_swapchain(self.handle, None) };
            self.handle = vk::SwapchainKHR::null();
        }
        self.images.clear();
    }
}

/// Render pass that clears a swapchain image and leaves it ready to present.
pub fn create_present_render_pass(
    device: &ash::Device,
    format: vk::Format,
) -> Result<vk::RenderPass, GraphicsError> {
    let attachments = [vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)];
    let color_refs = [vk::AttachmentReference::default()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];
    let subpasses = [vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)];
    let dependencies = [vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)];

    let info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);
    unsafe { device.create_render_pass(&info, None) }
        .map_err(creation_error(ObjectKind::RenderPass))
}

fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred: Option<vk::Format>,
) -> Option<vk::SurfaceFormatKHR> {
    let find = |format: vk::Format| {
        formats.iter().copied().find(|f| {
            f.format == format && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
    };
    preferred
        .and_then(find)
        .or_else(|| find(vk::Format::B8G8R8A8_SRGB))
        .or_else(|| formats.first().copied())
}

fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        // FIFO is always available
        vk::PresentModeKHR::FIFO
    }
}

fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vsync_forces_fifo() {
        let modes = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_extent_is_clamped_when_surface_leaves_it_open() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 1024,
            },
            ..Default::default()
        };
        let extent = choose_extent(&capabilities, 4096, 600);
        assert_eq!((extent.width, extent.height), (1024, 600));
    }

    #[test]
    fn test_preferred_format_is_kept() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        let chosen = choose_surface_format(&formats, Some(vk::Format::R8G8B8A8_UNORM));
        assert_eq!(chosen.map(|f| f.format), Some(vk::Format::R8G8B8A8_UNORM));
        let fallback = choose_surface_format(&formats, None);
        assert_eq!(fallback.map(|f| f.format), Some(vk::Format::B8G8R8A8_SRGB));
    }
}
