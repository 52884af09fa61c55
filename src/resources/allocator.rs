//! Device resource allocator.
//!
//! Turns buffer and image specifications into native objects and owns the
//! upload paths. Host-visible memory is written directly; device-local memory
//! is filled through a staging buffer copied with an instant command buffer,
//! and the staging buffer is retired to the dirty collector afterwards rather
//! than freed on the spot.

use std::sync::Arc;

use bytemuck::Pod;

use super::{BufferImage, BufferSet, BufferView};
use crate::backend::{
    BufferDescriptor, BufferUsage, GpuBackend, ImageBarrier, ImageLayout, MemoryPlacement,
    NativeHandle, ObjectKind, SamplerDescriptor, TextureDescriptor, TextureUsage,
};
use crate::commands::InstantCommands;
use crate::deferred::DirtyCollector;
use crate::error::{GraphicsError, GraphicsResult};
use crate::frame::FrameCounter;

/// Creates, fills and retires GPU buffers and images.
///
/// Cheap to clone; clones share the backend, frame counter and collector.
#[derive(Clone)]
pub struct ResourceAllocator {
    backend: Arc<dyn GpuBackend>,
    frames: Arc<FrameCounter>,
    collector: Arc<DirtyCollector>,
    instant: Arc<InstantCommands>,
}

impl ResourceAllocator {
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        frames: Arc<FrameCounter>,
        collector: Arc<DirtyCollector>,
        instant: Arc<InstantCommands>,
    ) -> Self {
        Self {
            backend,
            frames,
            collector,
            instant,
        }
    }

    /// Same allocator, recording uploads through another instant manager.
    ///
    /// The resource loader thread uses this so its uploads never queue
    /// behind the render thread's instant work.
    pub fn with_instant_commands(&self, instant: Arc<InstantCommands>) -> Self {
        Self {
            instant,
            ..self.clone()
        }
    }

    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    pub fn collector(&self) -> &Arc<DirtyCollector> {
        &self.collector
    }

    pub fn instant(&self) -> &Arc<InstantCommands> {
        &self.instant
    }

    pub fn frame_index(&self) -> u32 {
        self.frames.current_index()
    }

    // === Buffers ===

    pub fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        placement: MemoryPlacement,
    ) -> GraphicsResult<BufferView> {
        // Anything not written through a mapping is filled by transfer copies.
        let usage = if placement == MemoryPlacement::HostVisible {
            usage
        } else {
            usage | BufferUsage::COPY_DST
        };
        let raw = self.backend.create_buffer(&BufferDescriptor {
            label: None,
            size: size.max(1),
            usage,
            placement,
        })?;
        Ok(BufferView {
            handle: raw.handle,
            size: raw.size,
            usage,
            placement,
            host_visible: raw.host_visible,
            frame_index: self.frames.current_index(),
        })
    }

    /// Create a buffer sized for `data` and upload it.
    pub fn create_buffer_with_data<T: Pod>(
        &self,
        data: &[T],
        usage: BufferUsage,
        placement: MemoryPlacement,
    ) -> GraphicsResult<BufferView> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mut view = self.create_buffer(bytes.len() as u64, usage, placement)?;
        self.upload(&mut view, bytes)?;
        Ok(view)
    }

    /// Upload `bytes` into `view`.
    ///
    /// A size change retires the old buffer and replaces `view` with a new
    /// one of the right size; there is no in-place resize.
    pub fn upload(&self, view: &mut BufferView, bytes: &[u8]) -> GraphicsResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let size = bytes.len() as u64;
        if view.size != size {
            log::trace!(
                "ResourceAllocator: recreating buffer {:?} ({} -> {} bytes)",
                view.handle,
                view.size,
                size
            );
            let replacement = self.create_buffer(size, view.usage, view.placement)?;
            let old = std::mem::replace(view, replacement);
            self.retire_buffer(old);
        }

        if view.host_visible {
            return self.backend.write_buffer(view.handle, 0, bytes);
        }

        let staging =
            self.create_buffer(size, BufferUsage::COPY_SRC, MemoryPlacement::HostVisible)?;
        let result = self
            .backend
            .write_buffer(staging.handle, 0, bytes)
            .and_then(|_| {
                self.instant
                    .run(|cmd| cmd.copy_buffer(staging.handle, view.handle, size))
            });
        self.retire_buffer(staging);
        result
    }

    /// Upload a typed slice; the byte size is `len * size_of::<T>()`.
    pub fn upload_slice<T: Pod>(&self, view: &mut BufferView, data: &[T]) -> GraphicsResult<()> {
        self.upload(view, bytemuck::cast_slice(data))
    }

    /// One host-visible buffer of `size` bytes per frame in flight.
    pub fn create_buffer_set(&self, size: u64, usage: BufferUsage) -> GraphicsResult<BufferSet> {
        let buffers = (0..self.frames.slot_count())
            .map(|_| self.create_buffer(size, usage, MemoryPlacement::HostVisible))
            .collect::<GraphicsResult<Vec<_>>>()?;
        Ok(BufferSet::new(buffers))
    }

    // === Images ===

    pub fn create_sampler(&self, desc: &SamplerDescriptor) -> GraphicsResult<NativeHandle> {
        self.backend.create_sampler(desc)
    }

    /// Create an image together with its view and sampler.
    pub fn create_image(
        &self,
        desc: &TextureDescriptor,
        sampler: &SamplerDescriptor,
    ) -> GraphicsResult<BufferImage> {
        let image = self.backend.create_image(desc)?;
        let view = match self.backend.create_image_view(image, desc) {
            Ok(view) => view,
            Err(e) => {
                self.collector.enqueue(ObjectKind::Image, image);
                return Err(e);
            }
        };
        let sampler = match self.backend.create_sampler(sampler) {
            Ok(sampler) => sampler,
            Err(e) => {
                self.collector.enqueue(ObjectKind::ImageView, view);
                self.collector.enqueue(ObjectKind::Image, image);
                return Err(e);
            }
        };
        log::trace!(
            "ResourceAllocator: created image {:?} {}x{} {:?}",
            desc.label,
            desc.width,
            desc.height,
            desc.format
        );
        Ok(BufferImage {
            image,
            view,
            sampler,
            descriptor: desc.clone(),
        })
    }

    /// Copy tightly packed `pixels` into `image` and leave it shader-readable.
    pub fn upload_image(&self, image: &BufferImage, pixels: &[u8]) -> GraphicsResult<()> {
        let expected = image.descriptor.byte_size();
        if pixels.len() as u64 != expected {
            return Err(GraphicsError::BufferTooSmall {
                capacity: expected,
                requested: pixels.len() as u64,
            });
        }
        if !image.descriptor.usage.contains(TextureUsage::COPY_DST) {
            return Err(GraphicsError::ResourceCreationFailed {
                kind: ObjectKind::Image,
                reason: "image was not created with COPY_DST usage".to_string(),
            });
        }

        let staging =
            self.create_buffer(expected, BufferUsage::COPY_SRC, MemoryPlacement::HostVisible)?;
        let barrier = |old_layout, new_layout| ImageBarrier {
            image: image.image,
            format: image.format(),
            old_layout,
            new_layout,
        };
        let result = self
            .backend
            .write_buffer(staging.handle, 0, pixels)
            .and_then(|_| {
                self.instant.run(|cmd| {
                    cmd.pipeline_barrier(vec![barrier(
                        ImageLayout::Undefined,
                        ImageLayout::TransferDst,
                    )]);
                    cmd.copy_buffer_to_image(
                        staging.handle,
                        image.image,
                        image.width(),
                        image.height(),
                    );
                    cmd.pipeline_barrier(vec![barrier(
                        ImageLayout::TransferDst,
                        ImageLayout::ShaderReadOnly,
                    )]);
                })
            });
        self.retire_buffer(staging);
        result
    }

    // === Retirement ===

    pub fn retire(&self, kind: ObjectKind, handle: NativeHandle) {
        self.collector.enqueue(kind, handle);
    }

    pub fn retire_buffer(&self, view: BufferView) {
        self.collector.enqueue(ObjectKind::Buffer, view.handle);
    }

    pub fn retire_buffer_set(&self, set: BufferSet) {
        for view in set.into_buffers() {
            self.retire_buffer(view);
        }
    }

    pub fn retire_image(&self, image: BufferImage) {
        self.collector.enqueue(ObjectKind::Sampler, image.sampler);
        self.collector.enqueue(ObjectKind::ImageView, image.view);
        self.collector.enqueue(ObjectKind::Image, image.image);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyBackend, GpuCommand, TextureFormat};
    use crate::deferred::{DirtyCollectorConfig, ReclaimMode};
    use std::time::Duration;

    fn allocator() -> (Arc<DummyBackend>, Arc<FrameCounter>, ResourceAllocator) {
        let backend = Arc::new(DummyBackend::new(3));
        let frames = Arc::new(FrameCounter::new(3));
        let collector = Arc::new(DirtyCollector::new(
            backend.clone(),
            frames.clone(),
            DirtyCollectorConfig {
                mode: ReclaimMode::Inline,
                ..Default::default()
            },
        ));
        let instant = Arc::new(
            InstantCommands::new(backend.clone(), collector.clone(), Duration::from_millis(10))
                .unwrap(),
        );
        let allocator = ResourceAllocator::new(backend.clone(), frames.clone(), collector, instant);
        (backend, frames, allocator)
    }

    #[test]
    fn test_host_visible_upload_writes_directly() {
        let (backend, _frames, allocator) = allocator();
        let data = [1.0f32, 2.0, 3.0];
        let view = allocator
            .create_buffer_with_data(&data, BufferUsage::UNIFORM, MemoryPlacement::HostVisible)
            .unwrap();
        assert_eq!(view.size, 12);
        assert_eq!(
            backend.buffer_contents(view.handle).unwrap(),
            bytemuck::cast_slice::<f32, u8>(&data)
        );
        assert!(backend.submissions().is_empty());
    }

    #[test]
    fn test_device_local_upload_goes_through_staging() {
        let (backend, frames, allocator) = allocator();
        backend.set_device_local_only(true);
        let indices = [0u32, 1, 2, 2, 1, 3];
        let view = allocator
            .create_buffer_with_data(&indices, BufferUsage::INDEX, MemoryPlacement::Auto)
            .unwrap();
        assert!(!view.host_visible);
        assert_eq!(view.size, 24);
        assert_eq!(
            backend.buffer_contents(view.handle).unwrap(),
            bytemuck::cast_slice::<u32, u8>(&indices)
        );

        let submissions = backend.submissions();
        assert_eq!(submissions.len(), 1);
        let commands = backend.commands(submissions[0].command_buffers[0]);
        let staging = match commands[0] {
            GpuCommand::CopyBuffer { src, size, .. } => {
                assert_eq!(size, 24);
                src
            }
            ref other => panic!("expected a copy, got {other:?}"),
        };

        // the staging buffer waits for a full frame cycle
        assert!(backend.is_live(staging));
        assert_eq!(allocator.collector().pending_of(ObjectKind::Buffer), 1);
        for _ in 0..3 {
            frames.advance();
        }
        allocator.collector().collect();
        assert!(!backend.is_live(staging));
        assert!(backend.is_live(view.handle));
    }

    #[test]
    fn test_size_change_recreates_buffer() {
        let (backend, _frames, allocator) = allocator();
        let mut view = allocator
            .create_buffer_with_data(&[1u16, 2], BufferUsage::VERTEX, MemoryPlacement::HostVisible)
            .unwrap();
        let old = view.handle;

        allocator.upload_slice(&mut view, &[1u16, 2]).unwrap();
        assert_eq!(view.handle, old);

        allocator.upload_slice(&mut view, &[1u16, 2, 3]).unwrap();
        assert_ne!(view.handle, old);
        assert_eq!(view.size, 6);
        assert!(backend.is_live(old));
        assert_eq!(allocator.collector().pending_of(ObjectKind::Buffer), 1);
    }

    #[test]
    fn test_image_bundle_and_upload() {
        let (backend, _frames, allocator) = allocator();
        let desc = TextureDescriptor::new(
            2,
            2,
            TextureFormat::Rgba8Unorm,
            TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
        );
        let image = allocator
            .create_image(&desc, &SamplerDescriptor::default())
            .unwrap();
        assert!(backend.is_live(image.view));
        assert!(backend.is_live(image.sampler));

        assert!(allocator.upload_image(&image, &[0; 15]).is_err());
        allocator.upload_image(&image, &[255; 16]).unwrap();

        let submissions = backend.submissions();
        let commands = backend.commands(submissions[0].command_buffers[0]);
        assert_eq!(commands.len(), 3);
        assert!(matches!(
            &commands[2],
            GpuCommand::PipelineBarrier(b) if b[0].new_layout == ImageLayout::ShaderReadOnly
        ));

        allocator.retire_image(image);
        assert_eq!(allocator.collector().pending_count(), 4);
    }

    #[test]
    fn test_buffer_set_per_frame() {
        let (backend, _frames, allocator) = allocator();
        let set = allocator.create_buffer_set(16, BufferUsage::UNIFORM).unwrap();
        assert_eq!(set.len(), 3);
        set.write(backend.as_ref(), 1, &[7; 16]).unwrap();
        assert_eq!(backend.buffer_contents(set.get(1).handle).unwrap(), vec![7; 16]);
        assert_eq!(backend.buffer_contents(set.get(0).handle).unwrap(), vec![0; 16]);
        assert!(set.write(backend.as_ref(), 0, &[0; 17]).is_err());
    }
}
