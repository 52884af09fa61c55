//! Core backend abstraction
//!
//! The rendering core talks to the GPU exclusively through [`GpuBackend`].
//! Native objects cross this boundary as opaque [`NativeHandle`]s tagged with
//! an [`ObjectKind`], which is all the deferred destruction queue needs to
//! free them later.

use std::time::Duration;

use crate::backend::types::*;
use crate::error::GraphicsResult;

/// Opaque native object handle (a Vulkan handle's raw value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NativeHandle(pub u64);

impl NativeHandle {
    pub const NULL: Self = Self(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// Kind of native object, selects the matching destroy call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Buffer,
    Image,
    ImageView,
    Sampler,
    Framebuffer,
    RenderPass,
    Pipeline,
    PipelineLayout,
    DescriptorSetLayout,
    DescriptorSet,
    CommandPool,
    Fence,
    Semaphore,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 13] = [
        ObjectKind::Buffer,
        ObjectKind::Image,
        ObjectKind::ImageView,
        ObjectKind::Sampler,
        ObjectKind::Framebuffer,
        ObjectKind::RenderPass,
        ObjectKind::Pipeline,
        ObjectKind::PipelineLayout,
        ObjectKind::DescriptorSetLayout,
        ObjectKind::DescriptorSet,
        ObjectKind::CommandPool,
        ObjectKind::Fence,
        ObjectKind::Semaphore,
    ];

    /// Order in which a full teardown destroys objects, lowest first.
    ///
    /// Memory-backed objects go first, then objects viewing them, then baked
    /// pipeline state, then pools and synchronization primitives.
    pub fn teardown_rank(self) -> u8 {
        match self {
            ObjectKind::DescriptorSet | ObjectKind::Buffer | ObjectKind::Image => 0,
            ObjectKind::ImageView | ObjectKind::Sampler | ObjectKind::Framebuffer => 1,
            ObjectKind::Pipeline
            | ObjectKind::PipelineLayout
            | ObjectKind::DescriptorSetLayout
            | ObjectKind::RenderPass => 2,
            ObjectKind::CommandPool | ObjectKind::Fence | ObjectKind::Semaphore => 3,
        }
    }
}

/// A native buffer and what the backend actually gave us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBuffer {
    pub handle: NativeHandle,
    pub size: u64,
    pub host_visible: bool,
}

/// A baked pipeline and the layouts it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPipeline {
    pub pipeline: NativeHandle,
    pub layout: NativeHandle,
    /// One layout per descriptor set index, dense from set 0.
    pub set_layouts: Vec<NativeHandle>,
}

/// One image layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: NativeHandle,
    pub format: TextureFormat,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
}

/// Resource written into a descriptor binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    UniformBuffer { buffer: NativeHandle, range: u64 },
    StorageBuffer { buffer: NativeHandle, range: u64 },
    SampledImage { view: NativeHandle, sampler: NativeHandle },
}

/// A single descriptor update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub set: NativeHandle,
    pub binding: u32,
    pub array_element: u32,
    pub resource: DescriptorResource,
}

/// A recorded GPU command.
#[derive(Debug, Clone, PartialEq)]
pub enum GpuCommand {
    PipelineBarrier(Vec<ImageBarrier>),
    CopyBuffer {
        src: NativeHandle,
        dst: NativeHandle,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToImage {
        buffer: NativeHandle,
        image: NativeHandle,
        width: u32,
        height: u32,
    },
    BeginRenderPass {
        render_pass: NativeHandle,
        framebuffer: NativeHandle,
        width: u32,
        height: u32,
        clear_values: Vec<ClearValue>,
    },
    EndRenderPass,
    BindPipeline(NativeHandle),
    BindDescriptorSets {
        layout: NativeHandle,
        first_set: u32,
        sets: Vec<NativeHandle>,
    },
    BindVertexBuffer {
        buffer: NativeHandle,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: NativeHandle,
        offset: u64,
        format: IndexFormat,
    },
    PushConstants {
        layout: NativeHandle,
        offset: u32,
        data: Vec<u8>,
    },
    SetViewport {
        width: u32,
        height: u32,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
}

/// A queue submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitInfo {
    pub command_buffers: Vec<NativeHandle>,
    pub wait_semaphores: Vec<NativeHandle>,
    pub signal_semaphores: Vec<NativeHandle>,
    pub fence: Option<NativeHandle>,
}

/// Result of asking the swapchain for its next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    OutOfDate,
    Timeout,
}

/// Result of presenting an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// Device interface used by the rendering core.
///
/// Implementations are internally synchronized: every method takes `&self`
/// and may be called from the render thread, the resource loader thread, or
/// the dirty collector's reclaimer.
pub trait GpuBackend: Send + Sync {
    fn name(&self) -> &'static str;

    // === Memory ===

    fn create_buffer(&self, desc: &BufferDescriptor) -> GraphicsResult<RawBuffer>;

    /// Copy `data` into a host-visible buffer at `offset`.
    fn write_buffer(&self, buffer: NativeHandle, offset: u64, data: &[u8]) -> GraphicsResult<()>;

    fn create_image(&self, desc: &TextureDescriptor) -> GraphicsResult<NativeHandle>;

    fn create_image_view(
        &self,
        image: NativeHandle,
        desc: &TextureDescriptor,
    ) -> GraphicsResult<NativeHandle>;

    fn create_sampler(&self, desc: &SamplerDescriptor) -> GraphicsResult<NativeHandle>;

    // === Render passes and pipelines ===

    fn create_render_pass(&self, layout: &RenderPassLayout) -> GraphicsResult<NativeHandle>;

    /// Shared render pass compatible with the swapchain images.
    fn swapchain_render_pass(&self) -> NativeHandle;

    fn create_framebuffer(
        &self,
        render_pass: NativeHandle,
        attachments: &[NativeHandle],
        width: u32,
        height: u32,
    ) -> GraphicsResult<NativeHandle>;

    /// Framebuffer for swapchain image `image_index`, owned by the backend.
    fn swapchain_framebuffer(&self, image_index: u32) -> NativeHandle;

    fn create_pipeline(
        &self,
        desc: &PipelineDescriptor,
        render_pass: NativeHandle,
    ) -> GraphicsResult<RawPipeline>;

    fn allocate_descriptor_set(&self, set_layout: NativeHandle) -> GraphicsResult<NativeHandle>;

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);

    /// Standalone combined-image-sampler set, for overlay UIs that draw a
    /// render target as an image.
    fn create_sampled_image_descriptor(
        &self,
        view: NativeHandle,
        sampler: NativeHandle,
    ) -> GraphicsResult<NativeHandle>;

    /// Destroy a native object. Callers route this through the dirty
    /// collector unless the device is known to be idle.
    fn destroy(&self, kind: ObjectKind, handle: NativeHandle);

    // === Command recording ===

    fn create_command_pool(&self, transient: bool) -> GraphicsResult<NativeHandle>;

    fn reset_command_pool(&self, pool: NativeHandle) -> GraphicsResult<()>;

    fn allocate_command_buffer(&self, pool: NativeHandle) -> GraphicsResult<NativeHandle>;

    fn begin_command_buffer(&self, cmd: NativeHandle, one_time: bool) -> GraphicsResult<()>;

    fn end_command_buffer(&self, cmd: NativeHandle) -> GraphicsResult<()>;

    fn record(&self, cmd: NativeHandle, command: &GpuCommand);

    // === Synchronization ===

    fn create_fence(&self, signaled: bool) -> GraphicsResult<NativeHandle>;

    /// Wait until `fence` is signaled. Returns `Ok(false)` on timeout.
    fn wait_fence(&self, fence: NativeHandle, timeout: Duration) -> GraphicsResult<bool>;

    fn reset_fence(&self, fence: NativeHandle) -> GraphicsResult<()>;

    fn create_semaphore(&self) -> GraphicsResult<NativeHandle>;

    fn submit(&self, info: &SubmitInfo) -> GraphicsResult<()>;

    fn wait_idle(&self) -> GraphicsResult<()>;

    // === Swapchain ===

    fn acquire_next_image(
        &self,
        signal: NativeHandle,
        timeout: Duration,
    ) -> GraphicsResult<AcquireOutcome>;

    fn present(&self, image_index: u32, wait: NativeHandle) -> GraphicsResult<PresentOutcome>;

    fn recreate_swapchain(&self, width: u32, height: u32) -> GraphicsResult<()>;

    fn swapchain_extent(&self) -> (u32, u32);

    fn swapchain_format(&self) -> TextureFormat;

    fn swapchain_image_count(&self) -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_teardown_rank_orders_memory_first() {
        let mut kinds = ObjectKind::ALL.to_vec();
        kinds.sort_by_key(|k| k.teardown_rank());
        let buffer = kinds.iter().position(|k| *k == ObjectKind::Buffer);
        let pipeline = kinds.iter().position(|k| *k == ObjectKind::Pipeline);
        let pool = kinds.iter().position(|k| *k == ObjectKind::CommandPool);
        assert!(buffer < pipeline);
        assert!(pipeline < pool);
    }
}
