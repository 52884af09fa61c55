//! The render device: backend plus every shared lifecycle service.

use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, Mutex};

use crate::backend::{
    GpuBackend, NativeHandle, ObjectKind, SamplerDescriptor, TextureDescriptor, TextureUsage,
};
use crate::commands::InstantCommands;
use crate::deferred::DirtyCollector;
use crate::error::{GraphicsError, GraphicsResult};
use crate::frame::FrameCounter;
use crate::handle::HandleManager;
use crate::pass::{RenderPass, RenderPassDesc};
use crate::resources::{BufferImage, ResourceAllocator, TextureData, TextureHandle};
use crate::RendererConfig;

/// A texture whose image was replaced while its handle stayed live.
///
/// Anything that captured the old view or sampler has to rebind before
/// `retired` is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureSwap {
    pub texture: TextureHandle,
    pub retired: NativeHandle,
}

/// Owns the backend together with the frame counter, dirty collector,
/// allocator, instant command manager and global texture table.
///
/// Shared objects are reference counted so the loader thread can hold onto
/// them; the device itself lives on the render thread.
pub struct RenderDevice {
    backend: Arc<dyn GpuBackend>,
    frames: Arc<FrameCounter>,
    collector: Arc<DirtyCollector>,
    instant: Arc<InstantCommands>,
    allocator: ResourceAllocator,
    textures: Arc<HandleManager<BufferImage>>,
    swaps: Arc<Mutex<Vec<TextureSwap>>>,
    fallback_texture: TextureHandle,
}

impl RenderDevice {
    pub fn new(backend: Arc<dyn GpuBackend>, config: &RendererConfig) -> GraphicsResult<Self> {
        let frames = Arc::new(FrameCounter::new(backend.swapchain_image_count().max(1)));
        let collector = Arc::new(DirtyCollector::new(
            Arc::clone(&backend),
            Arc::clone(&frames),
            config.dirty_collector,
        ));
        let instant = Arc::new(InstantCommands::new(
            Arc::clone(&backend),
            Arc::clone(&collector),
            config.fence_timeout,
        )?);
        let allocator = ResourceAllocator::new(
            Arc::clone(&backend),
            Arc::clone(&frames),
            Arc::clone(&collector),
            Arc::clone(&instant),
        );

        let mut device = Self {
            backend,
            frames,
            collector,
            instant,
            allocator,
            textures: Arc::new(HandleManager::new(config.texture_capacity.max(1))),
            swaps: Arc::new(Mutex::new(Vec::new())),
            fallback_texture: TextureHandle::invalid(),
        };
        device.fallback_texture = device.create_texture_with_data(&TextureData::fallback())?;

        log::info!(
            "Render device ready on {} ({} frames in flight, {} texture slots)",
            device.backend.name(),
            device.frames.slot_count(),
            device.textures.capacity()
        );
        Ok(device)
    }

    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    pub fn frames(&self) -> &Arc<FrameCounter> {
        &self.frames
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.frames.slot_count()
    }

    pub fn collector(&self) -> &Arc<DirtyCollector> {
        &self.collector
    }

    pub fn instant(&self) -> &Arc<InstantCommands> {
        &self.instant
    }

    pub fn allocator(&self) -> &ResourceAllocator {
        &self.allocator
    }

    pub fn textures(&self) -> &Arc<HandleManager<BufferImage>> {
        &self.textures
    }

    /// Swaps made off the render thread are queued here.
    pub(crate) fn texture_swaps(&self) -> &Arc<Mutex<Vec<TextureSwap>>> {
        &self.swaps
    }

    /// Swaps since the last call, oldest first.
    pub fn take_texture_swaps(&self) -> Vec<TextureSwap> {
        std::mem::take(&mut *self.swaps.lock())
    }

    /// 1x1 grey texture bound wherever a texture is missing.
    pub fn fallback_texture(&self) -> TextureHandle {
        self.fallback_texture
    }

    pub fn texture(&self, handle: TextureHandle) -> MappedRwLockReadGuard<'_, BufferImage> {
        self.textures.access(handle)
    }

    /// The texture behind `handle`, or the fallback when it is stale.
    pub fn texture_or_fallback(&self, handle: TextureHandle) -> BufferImage {
        self.textures
            .get(handle)
            .or_else(|| self.textures.get(self.fallback_texture))
            .unwrap_or_else(|| BufferImage {
                image: Default::default(),
                view: Default::default(),
                sampler: Default::default(),
                descriptor: TextureDescriptor::default(),
            })
    }

    /// Create a texture with a linear sampler and register it.
    pub fn create_texture(&self, desc: &TextureDescriptor) -> GraphicsResult<TextureHandle> {
        let image = self.allocator.create_image(desc, &SamplerDescriptor::default())?;
        self.register_texture(image)
    }

    /// Create a shader-readable texture filled with `data`.
    pub fn create_texture_with_data(&self, data: &TextureData) -> GraphicsResult<TextureHandle> {
        let desc = TextureDescriptor::new(
            data.width,
            data.height,
            data.format,
            TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
        )
        .with_label(data.name.clone());
        let image = self.allocator.create_image(&desc, &SamplerDescriptor::default())?;
        if let Err(e) = self.allocator.upload_image(&image, &data.data) {
            self.allocator.retire_image(image);
            return Err(e);
        }
        self.register_texture(image)
    }

    /// Add an already created image to the texture table.
    pub fn register_texture(&self, image: BufferImage) -> GraphicsResult<TextureHandle> {
        let handle = self.textures.add(image.clone());
        if !handle.is_set() {
            log::error!("Texture table is full ({} slots)", self.textures.capacity());
            self.allocator.retire_image(image);
            return Err(GraphicsError::TextureTableFull);
        }
        Ok(handle)
    }

    /// Remove a texture from the table and retire its GPU objects.
    pub fn release_texture(&self, handle: &mut TextureHandle) {
        if let Some(image) = self.textures.remove(handle) {
            self.allocator.retire_image(image);
        }
    }

    pub fn create_render_pass(&self, desc: RenderPassDesc) -> GraphicsResult<RenderPass> {
        RenderPass::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.collector),
            desc,
            self.frames.slot_count(),
        )
    }

    pub fn retire(&self, kind: ObjectKind, handle: NativeHandle) {
        self.collector.enqueue(kind, handle);
    }

    pub fn wait_idle(&self) -> GraphicsResult<()> {
        self.backend.wait_idle()
    }

    /// Retire every registered texture, including the fallback.
    pub fn release_textures(&mut self) {
        for image in self.textures.drain() {
            self.allocator.retire_image(image);
        }
        self.fallback_texture = TextureHandle::invalid();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyBackend, TextureFormat};
    use crate::deferred::{DirtyCollectorConfig, ReclaimMode};

    fn device(capacity: u32) -> (Arc<DummyBackend>, RenderDevice) {
        let backend = Arc::new(DummyBackend::new(3));
        let config = RendererConfig::default()
            .with_texture_capacity(capacity)
            .with_dirty_collector(DirtyCollectorConfig {
                mode: ReclaimMode::Inline,
                ..Default::default()
            });
        let device = RenderDevice::new(backend.clone(), &config).unwrap();
        (backend, device)
    }

    #[test]
    fn test_fallback_texture_is_grey() {
        let (backend, device) = device(8);
        let fallback = device.texture(device.fallback_texture());
        assert_eq!(fallback.extent(), (1, 1));
        assert!(backend.is_live(fallback.image));
        assert_eq!(device.frames_in_flight(), 3);
    }

    #[test]
    fn test_full_table_is_an_error() {
        let (_backend, device) = device(2);
        let desc =
            TextureDescriptor::new(4, 4, TextureFormat::Rgba8Unorm, TextureUsage::TEXTURE_BINDING);
        device.create_texture(&desc).unwrap();
        assert_eq!(device.create_texture(&desc), Err(GraphicsError::TextureTableFull));
        // the image that did not fit is retired, not leaked
        assert_eq!(device.collector().pending_of(ObjectKind::Image), 1);
    }

    #[test]
    fn test_release_texture_invalidates_handle() {
        let (_backend, device) = device(8);
        let desc =
            TextureDescriptor::new(4, 4, TextureFormat::Rgba8Unorm, TextureUsage::TEXTURE_BINDING);
        let mut handle = device.create_texture(&desc).unwrap();
        let kept = handle;
        device.release_texture(&mut handle);
        assert!(!handle.is_set());
        assert!(!device.textures().is_valid(kept));
        assert_eq!(device.texture_or_fallback(kept).extent(), (1, 1));
    }
}
