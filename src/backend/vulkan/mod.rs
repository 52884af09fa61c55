//! Vulkan backend implementation using ash
//!
//! Native objects are handed out as their raw Vulkan handle values, so
//! recording a command never needs a table lookup. Only buffers and images
//! keep extra state: the gpu-allocator allocation backing them.

mod commands;
mod conversion;
mod device;
mod instance;
mod pipeline;
mod swapchain;

use std::collections::HashMap;
use std::time::Duration;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{GraphicsError, GraphicsResult};
use crate::RendererConfig;

use conversion::*;
use instance::DebugMessenger;
use swapchain::{SurfaceContext, SwapchainRequest, VulkanSwapchain};

/// Descriptor pool capacity per descriptor type.
const DESCRIPTOR_POOL_SIZE: u32 = 1024;

fn timeout_nanos(timeout: Duration) -> u64 {
    timeout.as_nanos().min(u64::MAX as u128) as u64
}

struct SwapchainState {
    swapchain: VulkanSwapchain,
    /// Render pass every swapchain framebuffer is created for.
    render_pass: vk::RenderPass,
}

/// Memory backing buffers and images, keyed by the object's handle.
#[derive(Default)]
struct Allocations {
    buffers: HashMap<NativeHandle, Allocation>,
    images: HashMap<NativeHandle, Allocation>,
}

/// Vulkan backend
pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug: Option<DebugMessenger>,
    surface_fn: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    swapchain_fn: ash::khr::swapchain::Device,
    queue_family: u32,
    /// Queue access must be externally synchronized.
    queue: Mutex<vk::Queue>,
    allocator: Mutex<Option<Allocator>>,
    allocations: Mutex<Allocations>,
    descriptor_pool: Mutex<vk::DescriptorPool>,
    /// Layout of the standalone sets made by `create_sampled_image_descriptor`.
    sampled_image_layout: vk::DescriptorSetLayout,
    /// Color attachment count of every render pass, needed to size blend state.
    render_pass_colors: Mutex<HashMap<vk::RenderPass, usize>>,
    swapchain: Mutex<SwapchainState>,
    vsync: bool,
    requested_images: u32,
}

impl VulkanBackend {
    /// Create a device that presents to `window`.
    pub fn new<W>(window: &W, config: &RendererConfig) -> GraphicsResult<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GraphicsError::InitializationFailed(format!("No display handle: {e}")))?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(|e| GraphicsError::InitializationFailed(format!("No window handle: {e}")))?
            .as_raw();

        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            GraphicsError::InitializationFailed(format!("Failed to load Vulkan: {e}"))
        })?;
        let (instance, debug) =
            instance::create_instance(&entry, &config.app_name, display, config.validation)?;

        let surface_fn = ash::khr::surface::Instance::new(&entry, &instance);
        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display, window_handle, None)
        }
        .map_err(|e| {
            GraphicsError::InitializationFailed(format!("Failed to create surface: {e:?}"))
        })?;

        let selected = device::select_physical_device(&instance, &surface_fn, surface)?;
        log::info!("Using GPU: {}", selected.name);
        let device = device::create_logical_device(
            &instance,
            selected.physical_device,
            selected.queue_family,
        )?;
        let queue = unsafe { device.get_device_queue(selected.queue_family, 0) };
        let swapchain_fn = ash::khr::swapchain::Device::new(&instance, &device);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device: selected.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| {
            GraphicsError::InitializationFailed(format!("Failed to create allocator: {e}"))
        })?;

        let descriptor_pool = create_descriptor_pool(&device)?;
        let sampled_image_layout = create_sampled_image_layout(&device)?;

        let ctx = SurfaceContext {
            device: &device,
            surface_fn: &surface_fn,
            swapchain_fn: &swapchain_fn,
            physical_device: selected.physical_device,
            surface,
        };
        let request = SwapchainRequest {
            width: config.width.max(1),
            height: config.height.max(1),
            vsync: config.vsync,
            image_count: config.frames_in_flight,
            preferred_format: None,
        };
        let mut swapchain = VulkanSwapchain::new(&ctx, request, vk::SwapchainKHR::null())?;
        let render_pass = swapchain::create_present_render_pass(&device, swapchain.format)?;
        swapchain.create_framebuffers(&device, render_pass)?;

        let mut render_pass_colors = HashMap::new();
        render_pass_colors.insert(render_pass, 1);

        Ok(Self {
            _entry: entry,
            instance,
            debug,
            surface_fn,
            surface,
            physical_device: selected.physical_device,
            device,
            swapchain_fn,
            queue_family: selected.queue_family,
            queue: Mutex::new(queue),
            allocator: Mutex::new(Some(allocator)),
            allocations: Mutex::new(Allocations::default()),
            descriptor_pool: Mutex::new(descriptor_pool),
            sampled_image_layout,
            render_pass_colors: Mutex::new(render_pass_colors),
            swapchain: Mutex::new(SwapchainState {
                swapchain,
                render_pass,
            }),
            vsync: config.vsync,
            requested_images: config.frames_in_flight,
        })
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    fn surface_context(&self) -> SurfaceContext<'_> {
        SurfaceContext {
            device: &self.device,
            surface_fn: &self.surface_fn,
            swapchain_fn: &self.swapchain_fn,
            physical_device: self.physical_device,
            surface: self.surface,
        }
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> GraphicsResult<Allocation> {
        let mut allocator = self.allocator.lock();
        let allocator = allocator.as_mut().ok_or(GraphicsError::DeviceLost)?;
        allocator
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| match e {
                gpu_allocator::AllocationError::OutOfMemory => GraphicsError::OutOfMemory,
                other => GraphicsError::ResourceCreationFailed {
                    kind: if linear { ObjectKind::Buffer } else { ObjectKind::Image },
                    reason: other.to_string(),
                },
            })
    }

    fn free(&self, allocation: Allocation) {
        if let Some(allocator) = self.allocator.lock().as_mut() {
            if let Err(e) = allocator.free(allocation) {
                log::error!("VulkanBackend: failed to free allocation: {e}");
            }
        }
    }
}

fn create_descriptor_pool(device: &ash::Device) -> GraphicsResult<vk::DescriptorPool> {
    let pool_sizes = [
        vk::DescriptorType::UNIFORM_BUFFER,
        vk::DescriptorType::STORAGE_BUFFER,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    ]
    .map(|ty| vk::DescriptorPoolSize {
        ty,
        descriptor_count: DESCRIPTOR_POOL_SIZE,
    });
    let info = vk::DescriptorPoolCreateInfo::default()
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
        .max_sets(DESCRIPTOR_POOL_SIZE)
        .pool_sizes(&pool_sizes);
    unsafe { device.create_descriptor_pool(&info, None) }
        .map_err(creation_error(ObjectKind::DescriptorSet))
}

fn create_sampled_image_layout(device: &ash::Device) -> GraphicsResult<vk::DescriptorSetLayout> {
    let bindings = [vk::DescriptorSetLayoutBinding::default()
        .binding(0)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .descriptor_count(1)
        .stage_flags(vk::ShaderStageFlags::FRAGMENT)];
    let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    unsafe { device.create_descriptor_set_layout(&info, None) }
        .map_err(creation_error(ObjectKind::DescriptorSetLayout))
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan Backend"
    }

    // === Memory ===

    fn create_buffer(&self, desc: &BufferDescriptor) -> GraphicsResult<RawBuffer> {
        let info = vk::BufferCreateInfo::default()
            .size(desc.size.max(1))
            .usage(convert_buffer_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None) }
            .map_err(creation_error(ObjectKind::Buffer))?;

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let location = match desc.placement {
            MemoryPlacement::HostVisible => MemoryLocation::CpuToGpu,
            MemoryPlacement::DeviceLocal | MemoryPlacement::Auto => MemoryLocation::GpuOnly,
        };
        let name = desc.label.as_deref().unwrap_or("buffer");
        let allocation = match self.allocate(name, requirements, location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.free(allocation);
            return Err(creation_error(ObjectKind::Buffer)(e));
        }

        let handle = native(buffer);
        let host_visible = allocation.mapped_ptr().is_some();
        log::trace!(
            "VulkanBackend: created buffer {:?} {:?} (size: {}, host visible: {})",
            desc.label,
            handle,
            desc.size,
            host_visible
        );
        self.allocations.lock().buffers.insert(handle, allocation);
        Ok(RawBuffer {
            handle,
            size: desc.size,
            host_visible,
        })
    }

    fn write_buffer(&self, buffer: NativeHandle, offset: u64, data: &[u8]) -> GraphicsResult<()> {
        let mut allocations = self.allocations.lock();
        let allocation = allocations.buffers.get_mut(&buffer).ok_or_else(|| {
            GraphicsError::ResourceCreationFailed {
                kind: ObjectKind::Buffer,
                reason: format!("unknown buffer {buffer:?}"),
            }
        })?;
        let capacity = allocation.size();
        let mapped = allocation
            .mapped_slice_mut()
            .ok_or(GraphicsError::NotHostVisible)?;
        let end = offset as usize + data.len();
        if end > mapped.len() {
            return Err(GraphicsError::BufferTooSmall {
                capacity,
                requested: end as u64,
            });
        }
        mapped[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn create_image(&self, desc: &TextureDescriptor) -> GraphicsResult<NativeHandle> {
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(convert_texture_format(desc.format))
            .extent(vk::Extent3D {
                width: desc.width.max(1),
                height: desc.height.max(1),
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert_texture_usage(desc.usage, desc.format))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&info, None) }
            .map_err(creation_error(ObjectKind::Image))?;

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let name = desc.label.as_deref().unwrap_or("image");
        let allocation = match self.allocate(name, requirements, MemoryLocation::GpuOnly, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_image(image, None) };
            self.free(allocation);
            return Err(creation_error(ObjectKind::Image)(e));
        }

        let handle = native(image);
        log::trace!(
            "VulkanBackend: created image {:?} {:?} ({}x{} {:?})",
            desc.label,
            handle,
            desc.width,
            desc.height,
            desc.format
        );
        self.allocations.lock().images.insert(handle, allocation);
        Ok(handle)
    }

    fn create_image_view(
        &self,
        image: NativeHandle,
        desc: &TextureDescriptor,
    ) -> GraphicsResult<NativeHandle> {
        let info = vk::ImageViewCreateInfo::default()
            .image(raw(image))
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(convert_texture_format(desc.format))
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect_mask(desc.format))
                    .level_count(1)
                    .layer_count(1),
            );
        unsafe { self.device.create_image_view(&info, None) }
            .map(native)
            .map_err(creation_error(ObjectKind::ImageView))
    }

    fn create_sampler(&self, desc: &SamplerDescriptor) -> GraphicsResult<NativeHandle> {
        let address_mode = convert_address_mode(desc.address_mode);
        let anisotropy =
            desc.min_filter == FilterMode::Linear && desc.mag_filter == FilterMode::Linear;
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(convert_filter(desc.mag_filter))
            .min_filter(convert_filter(desc.min_filter))
            .mipmap_mode(convert_mipmap_mode(desc.mipmap_filter))
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .anisotropy_enable(anisotropy)
            .max_anisotropy(if anisotropy { 16.0 } else { 1.0 })
            .compare_enable(desc.compare.is_some())
            .compare_op(
                desc.compare
                    .map(convert_compare_function)
                    .unwrap_or(vk::CompareOp::ALWAYS),
            )
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);
        unsafe { self.device.create_sampler(&info, None) }
            .map(native)
            .map_err(creation_error(ObjectKind::Sampler))
    }

    // === Render passes and pipelines ===

    fn create_render_pass(&self, layout: &RenderPassLayout) -> GraphicsResult<NativeHandle> {
        let render_pass = pipeline::create_render_pass(&self.device, layout)?;
        self.render_pass_colors
            .lock()
            .insert(render_pass, layout.colors.len());
        Ok(native(render_pass))
    }

    fn swapchain_render_pass(&self) -> NativeHandle {
        native(self.swapchain.lock().render_pass)
    }

    fn create_framebuffer(
        &self,
        render_pass: NativeHandle,
        attachments: &[NativeHandle],
        width: u32,
        height: u32,
    ) -> GraphicsResult<NativeHandle> {
        let views: Vec<vk::ImageView> = attachments.iter().map(|a| raw(*a)).collect();
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(raw(render_pass))
            .attachments(&views)
            .width(width)
            .height(height)
            .layers(1);
        unsafe { self.device.create_framebuffer(&info, None) }
            .map(native)
            .map_err(creation_error(ObjectKind::Framebuffer))
    }

    fn swapchain_framebuffer(&self, image_index: u32) -> NativeHandle {
        self.swapchain
            .lock()
            .swapchain
            .framebuffers
            .get(image_index as usize)
            .copied()
            .map(native)
            .unwrap_or(NativeHandle::NULL)
    }

    fn create_pipeline(
        &self,
        desc: &PipelineDescriptor,
        render_pass: NativeHandle,
    ) -> GraphicsResult<RawPipeline> {
        let render_pass: vk::RenderPass = raw(render_pass);
        let color_count = self
            .render_pass_colors
            .lock()
            .get(&render_pass)
            .copied()
            .unwrap_or(1);
        log::debug!("VulkanBackend: creating pipeline {}", desc.label);
        pipeline::create_graphics_pipeline(&self.device, desc, render_pass, color_count)
    }

    fn allocate_descriptor_set(&self, set_layout: NativeHandle) -> GraphicsResult<NativeHandle> {
        let layouts = [raw::<vk::DescriptorSetLayout>(set_layout)];
        let pool = self.descriptor_pool.lock();
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(*pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info) }
            .map_err(creation_error(ObjectKind::DescriptorSet))?;
        sets.first()
            .copied()
            .map(native)
            .ok_or_else(|| GraphicsError::ResourceCreationFailed {
                kind: ObjectKind::DescriptorSet,
                reason: "driver returned no descriptor set".to_string(),
            })
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let buffer_infos: Vec<vk::DescriptorBufferInfo> = writes
            .iter()
            .map(|w| match w.resource {
                DescriptorResource::UniformBuffer { buffer, range }
                | DescriptorResource::StorageBuffer { buffer, range } => {
                    vk::DescriptorBufferInfo::default()
                        .buffer(raw(buffer))
                        .offset(0)
                        .range(range)
                }
                DescriptorResource::SampledImage { .. } => vk::DescriptorBufferInfo::default(),
            })
            .collect();
        let image_infos: Vec<vk::DescriptorImageInfo> = writes
            .iter()
            .map(|w| match w.resource {
                DescriptorResource::SampledImage { view, sampler } => {
                    vk::DescriptorImageInfo::default()
                        .image_view(raw(view))
                        .sampler(raw(sampler))
                        .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                }
                _ => vk::DescriptorImageInfo::default(),
            })
            .collect();

        let vk_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(raw(w.set))
                    .dst_binding(w.binding)
                    .dst_array_element(w.array_element);
                match w.resource {
                    DescriptorResource::UniformBuffer { .. } => write
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(std::slice::from_ref(&buffer_infos[i])),
                    DescriptorResource::StorageBuffer { .. } => write
                        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                        .buffer_info(std::slice::from_ref(&buffer_infos[i])),
                    DescriptorResource::SampledImage { .. } => write
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .image_info(std::slice::from_ref(&image_infos[i])),
                }
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }

    fn create_sampled_image_descriptor(
        &self,
        view: NativeHandle,
        sampler: NativeHandle,
    ) -> GraphicsResult<NativeHandle> {
        let set = self.allocate_descriptor_set(native(self.sampled_image_layout))?;
        self.update_descriptor_sets(&[DescriptorWrite {
            set,
            binding: 0,
            array_element: 0,
            resource: DescriptorResource::SampledImage { view, sampler },
        }]);
        Ok(set)
    }

    fn destroy(&self, kind: ObjectKind, handle: NativeHandle) {
        if handle.is_null() {
            return;
        }
        log::trace!("VulkanBackend: destroying {:?} {:?}", kind, handle);
        let device = &self.device;
        match kind {
            ObjectKind::Buffer => {
                let Some(allocation) = self.allocations.lock().buffers.remove(&handle) else {
                    log::error!("VulkanBackend: unknown buffer {:?} destroyed", handle);
                    return;
                };
                unsafe { device.destroy_buffer(raw(handle), None) };
                self.free(allocation);
            }
            ObjectKind::Image => {
                let Some(allocation) = self.allocations.lock().images.remove(&handle) else {
                    log::error!("VulkanBackend: unknown image {:?} destroyed", handle);
                    return;
                };
                unsafe { device.destroy_image(raw(handle), None) };
                self.free(allocation);
            }
            ObjectKind::ImageView => unsafe { device.destroy_image_view(raw(handle), None) },
            ObjectKind::Sampler => unsafe { device.destroy_sampler(raw(handle), None) },
            ObjectKind::Framebuffer => unsafe { device.destroy_framebuffer(raw(handle), None) },
            ObjectKind::RenderPass => {
                let render_pass: vk::RenderPass = raw(handle);
                self.render_pass_colors.lock().remove(&render_pass);
                unsafe { device.destroy_render_pass(render_pass, None) };
            }
            ObjectKind::Pipeline => unsafe { device.destroy_pipeline(raw(handle), None) },
            ObjectKind::PipelineLayout => unsafe {
                device.destroy_pipeline_layout(raw(handle), None)
            },
            ObjectKind::DescriptorSetLayout => unsafe {
                device.destroy_descriptor_set_layout(raw(handle), None)
            },
            ObjectKind::DescriptorSet => {
                let pool = self.descriptor_pool.lock();
                if let Err(e) = unsafe { device.free_descriptor_sets(*pool, &[raw(handle)]) } {
                    log::error!("VulkanBackend: failed to free descriptor set: {:?}", e);
                }
            }
            ObjectKind::CommandPool => unsafe { device.destroy_command_pool(raw(handle), None) },
            ObjectKind::Fence => unsafe { device.destroy_fence(raw(handle), None) },
            ObjectKind::Semaphore => unsafe { device.destroy_semaphore(raw(handle), None) },
        }
    }

    // === Command recording ===

    fn create_command_pool(&self, transient: bool) -> GraphicsResult<NativeHandle> {
        let mut flags = vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER;
        if transient {
            flags |= vk::CommandPoolCreateFlags::TRANSIENT;
        }
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.queue_family)
            .flags(flags);
        unsafe { self.device.create_command_pool(&info, None) }
            .map(native)
            .map_err(creation_error(ObjectKind::CommandPool))
    }

    fn reset_command_pool(&self, pool: NativeHandle) -> GraphicsResult<()> {
        unsafe {
            self.device
                .reset_command_pool(raw(pool), vk::CommandPoolResetFlags::empty())
        }
        .map_err(queue_error)
    }

    fn allocate_command_buffer(&self, pool: NativeHandle) -> GraphicsResult<NativeHandle> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(raw(pool))
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }
            .map_err(creation_error(ObjectKind::CommandPool))?;
        buffers
            .first()
            .copied()
            .map(native)
            .ok_or_else(|| GraphicsError::ResourceCreationFailed {
                kind: ObjectKind::CommandPool,
                reason: "driver returned no command buffer".to_string(),
            })
    }

    fn begin_command_buffer(&self, cmd: NativeHandle, one_time: bool) -> GraphicsResult<()> {
        let flags = if one_time {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        let info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe { self.device.begin_command_buffer(raw(cmd), &info) }.map_err(queue_error)
    }

    fn end_command_buffer(&self, cmd: NativeHandle) -> GraphicsResult<()> {
        unsafe { self.device.end_command_buffer(raw(cmd)) }.map_err(queue_error)
    }

    fn record(&self, cmd: NativeHandle, command: &GpuCommand) {
        commands::record_command(&self.device, raw(cmd), command);
    }

    // === Synchronization ===

    fn create_fence(&self, signaled: bool) -> GraphicsResult<NativeHandle> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        unsafe { self.device.create_fence(&info, None) }
            .map(native)
            .map_err(creation_error(ObjectKind::Fence))
    }

    fn wait_fence(&self, fence: NativeHandle, timeout: Duration) -> GraphicsResult<bool> {
        match unsafe {
            self.device
                .wait_for_fences(&[raw(fence)], true, timeout_nanos(timeout))
        } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(queue_error(e)),
        }
    }

    fn reset_fence(&self, fence: NativeHandle) -> GraphicsResult<()> {
        unsafe { self.device.reset_fences(&[raw(fence)]) }.map_err(queue_error)
    }

    fn create_semaphore(&self) -> GraphicsResult<NativeHandle> {
        let info = vk::SemaphoreCreateInfo::default();
        unsafe { self.device.create_semaphore(&info, None) }
            .map(native)
            .map_err(creation_error(ObjectKind::Semaphore))
    }

    fn submit(&self, info: &SubmitInfo) -> GraphicsResult<()> {
        let command_buffers: Vec<vk::CommandBuffer> =
            info.command_buffers.iter().map(|c| raw(*c)).collect();
        let wait_semaphores: Vec<vk::Semaphore> =
            info.wait_semaphores.iter().map(|s| raw(*s)).collect();
        let wait_stages =
            vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT; wait_semaphores.len()];
        let signal_semaphores: Vec<vk::Semaphore> =
            info.signal_semaphores.iter().map(|s| raw(*s)).collect();

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        let fence = info.fence.map(raw).unwrap_or_else(vk::Fence::null);

        let queue = self.queue.lock();
        unsafe { self.device.queue_submit(*queue, &[submit_info], fence) }.map_err(queue_error)
    }

    fn wait_idle(&self) -> GraphicsResult<()> {
        // Device-wide waits also require every queue to be externally synchronized
        let _queue = self.queue.lock();
        unsafe { self.device.device_wait_idle() }.map_err(queue_error)
    }

    // === Swapchain ===

    fn acquire_next_image(
        &self,
        signal: NativeHandle,
        timeout: Duration,
    ) -> GraphicsResult<AcquireOutcome> {
        let state = self.swapchain.lock();
        let result = unsafe {
            self.swapchain_fn.acquire_next_image(
                state.swapchain.handle,
                timeout_nanos(timeout),
                raw(signal),
                vk::Fence::null(),
            )
        };
        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => Ok(AcquireOutcome::Timeout),
            Err(e) => Err(queue_error(e)),
        }
    }

    fn present(&self, image_index: u32, wait: NativeHandle) -> GraphicsResult<PresentOutcome> {
        let state = self.swapchain.lock();
        let wait_semaphores = [raw::<vk::Semaphore>(wait)];
        let swapchains = [state.swapchain.handle];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let queue = self.queue.lock();
        match unsafe { self.swapchain_fn.queue_present(*queue, &present_info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(queue_error(e)),
        }
    }

    fn recreate_swapchain(&self, width: u32, height: u32) -> GraphicsResult<()> {
        self.wait_idle()?;
        let mut state = self.swapchain.lock();
        let request = SwapchainRequest {
            width: width.max(1),
            height: height.max(1),
            vsync: self.vsync,
            image_count: self.requested_images,
            preferred_format: Some(state.swapchain.format),
        };
        let ctx = self.surface_context();
        let mut replacement = VulkanSwapchain::new(&ctx, request, state.swapchain.handle)?;

        if replacement.format != state.swapchain.format {
            log::warn!(
                "VulkanBackend: swapchain format changed from {:?} to {:?}",
                state.swapchain.format,
                replacement.format
            );
            match swapchain::create_present_render_pass(&self.device, replacement.format) {
                Ok(render_pass) => {
                    let mut colors = self.render_pass_colors.lock();
                    colors.remove(&state.render_pass);
                    colors.insert(render_pass, 1);
                    unsafe { self.device.destroy_render_pass(state.render_pass, None) };
                    state.render_pass = render_pass;
                }
                Err(e) => {
                    replacement.destroy(&self.device, &self.swapchain_fn);
                    return Err(e);
                }
            }
        }
        if let Err(e) = replacement.create_framebuffers(&self.device, state.render_pass) {
            replacement.destroy(&self.device, &self.swapchain_fn);
            return Err(e);
        }

        let mut retired = std::mem::replace(&mut state.swapchain, replacement);
        retired.destroy(&self.device, &self.swapchain_fn);
        Ok(())
    }

    fn swapchain_extent(&self) -> (u32, u32) {
        let extent = self.swapchain.lock().swapchain.extent;
        (extent.width, extent.height)
    }

    fn swapchain_format(&self) -> TextureFormat {
        texture_format_from_vk(self.swapchain.lock().swapchain.format)
    }

    fn swapchain_image_count(&self) -> u32 {
        self.swapchain.lock().swapchain.images.len() as u32
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            log::error!("VulkanBackend: wait idle on drop failed: {:?}", e);
        }

        let allocations = std::mem::take(self.allocations.get_mut());
        let leaked = allocations.buffers.len() + allocations.images.len();
        if leaked > 0 {
            log::warn!("VulkanBackend: {} buffers and images still alive at drop", leaked);
        }
        for (handle, allocation) in allocations.buffers {
            unsafe { self.device.destroy_buffer(raw(handle), None) };
            self.free(allocation);
        }
        for (handle, allocation) in allocations.images {
            unsafe { self.device.destroy_image(raw(handle), None) };
            self.free(allocation);
        }

        let state = self.swapchain.get_mut();
        state.swapchain.destroy(&self.device, &self.swapchain_fn);
        unsafe {
            self.device.destroy_render_pass(state.render_pass, None);
            self.device
                .destroy_descriptor_set_layout(self.sampled_image_layout, None);
            self.device
                .destroy_descriptor_pool(*self.descriptor_pool.get_mut(), None);
        }

        // The allocator frees its memory blocks and must go before the device
        drop(self.allocator.get_mut().take());

        unsafe {
            self.device.destroy_device(None);
            self.surface_fn.destroy_surface(self.surface, None);
            if let Some(debug) = self.debug.take() {
                debug
                    .loader
                    .destroy_debug_utils_messenger(debug.messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        log::info!("VulkanBackend destroyed");
    }
}
