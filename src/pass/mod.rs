//! Render passes: a native render pass, a baked pipeline, and the
//! per-frame descriptor sets feeding it.
//!
//! A [`RenderPass`] is created once, bound to its inputs by name through
//! [`RenderPass::set_input`], and pointed at its render targets with
//! [`RenderPass::update_render_targets`]. Every native object it owns is
//! retired to the dirty collector on release.

mod attachment;
mod pipeline;

pub use attachment::{Attachment, PassTarget};
pub use pipeline::Pipeline;

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::backend::{
    DescriptorResource, DescriptorType, DescriptorWrite, GpuBackend, NativeHandle, ObjectKind,
    PipelineDescriptor, ShaderBinding,
};
use crate::commands::CommandBuffer;
use crate::deferred::DirtyCollector;
use crate::error::{GraphError, GraphicsResult};
use crate::gfx_validate;
use crate::handle::HandleManager;
use crate::resources::{BufferImage, BufferSet, TextureHandle};

/// Everything needed to create a [`RenderPass`].
#[derive(Debug, Clone)]
pub struct RenderPassDesc {
    pub label: String,
    pub pipeline: PipelineDescriptor,
    pub target: PassTarget,
}

/// A resource bound to a named shader binding.
#[derive(Debug, Clone, Copy)]
pub enum InputBinding<'a> {
    /// One copy per frame in flight, bound as a uniform buffer.
    UniformBufferSet(&'a BufferSet),
    /// One copy per frame in flight, bound as a storage buffer.
    StorageBufferSet(&'a BufferSet),
    Texture(&'a BufferImage),
    /// Texture array filling a bindless binding from element zero.
    Bindless(&'a [BufferImage]),
}

impl InputBinding<'_> {
    fn descriptor_type(&self) -> DescriptorType {
        match self {
            Self::UniformBufferSet(_) => DescriptorType::UniformBuffer,
            Self::StorageBufferSet(_) => DescriptorType::StorageBuffer,
            Self::Texture(_) | Self::Bindless(_) => DescriptorType::CombinedImageSampler,
        }
    }

    fn resources(&self, frame_index: u32) -> Vec<DescriptorResource> {
        match self {
            Self::UniformBufferSet(set) => {
                let buffer = set.get(frame_index);
                vec![DescriptorResource::UniformBuffer {
                    buffer: buffer.handle,
                    range: buffer.size,
                }]
            }
            Self::StorageBufferSet(set) => {
                let buffer = set.get(frame_index);
                vec![DescriptorResource::StorageBuffer {
                    buffer: buffer.handle,
                    range: buffer.size,
                }]
            }
            Self::Texture(image) => vec![DescriptorResource::SampledImage {
                view: image.view,
                sampler: image.sampler,
            }],
            Self::Bindless(images) => images
                .iter()
                .map(|image| DescriptorResource::SampledImage {
                    view: image.view,
                    sampler: image.sampler,
                })
                .collect(),
        }
    }
}

/// A native render pass with its pipeline, inputs and framebuffer.
pub struct RenderPass {
    name: String,
    backend: Arc<dyn GpuBackend>,
    collector: Arc<DirtyCollector>,
    attachment: Attachment,
    pipeline: Pipeline,
    /// Binding names that have been given a resource.
    inputs: BTreeSet<String>,
    render_targets: Vec<TextureHandle>,
    framebuffer: NativeHandle,
    extent: (u32, u32),
    /// `[frame_index][set]`
    descriptor_sets: Vec<Vec<NativeHandle>>,
}

impl RenderPass {
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        collector: Arc<DirtyCollector>,
        desc: RenderPassDesc,
        frames_in_flight: u32,
    ) -> GraphicsResult<Self> {
        let attachment = Attachment::new(backend.as_ref(), &desc.target)?;
        let pipeline = match Pipeline::bake(backend.as_ref(), desc.pipeline, attachment.raw()) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                attachment.release(&collector);
                return Err(e);
            }
        };

        let mut pass = Self {
            name: desc.label,
            backend,
            collector,
            attachment,
            pipeline,
            inputs: BTreeSet::new(),
            render_targets: Vec::new(),
            framebuffer: NativeHandle::NULL,
            extent: (0, 0),
            descriptor_sets: Vec::with_capacity(frames_in_flight as usize),
        };

        let set_layouts = pass.pipeline.set_layouts().to_vec();
        for _ in 0..frames_in_flight {
            let mut sets = Vec::with_capacity(set_layouts.len());
            for layout in &set_layouts {
                match pass.backend.allocate_descriptor_set(*layout) {
                    Ok(set) => sets.push(set),
                    Err(e) => {
                        pass.descriptor_sets.push(sets);
                        pass.release();
                        return Err(e);
                    }
                }
            }
            pass.descriptor_sets.push(sets);
        }

        log::debug!(
            "Created render pass '{}' ({} frames, {} sets each)",
            pass.name,
            frames_in_flight,
            set_layouts.len()
        );
        Ok(pass)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn attachment(&self) -> &Attachment {
        &self.attachment
    }

    pub fn render_targets(&self) -> &[TextureHandle] {
        &self.render_targets
    }

    pub fn framebuffer(&self) -> NativeHandle {
        self.framebuffer
    }

    pub fn extent(&self) -> (u32, u32) {
        self.extent
    }

    pub fn has_binding(&self, name: &str) -> bool {
        self.pipeline.binding(name).is_some()
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.inputs.contains(name)
    }

    pub fn descriptor_sets(&self, frame_index: u32) -> &[NativeHandle] {
        &self.descriptor_sets[frame_index as usize % self.descriptor_sets.len().max(1)]
    }

    /// Names of shader bindings that were never given a resource.
    ///
    /// Missing inputs are reported, not fatal: the pass still renders with
    /// whatever the descriptor slot happens to contain.
    pub fn verify(&self) -> Vec<String> {
        let missing: Vec<String> = self
            .pipeline
            .bindings()
            .iter()
            .filter(|b| !self.inputs.contains(&b.name))
            .map(|b| b.name.clone())
            .collect();
        for name in &missing {
            log::warn!("Render pass '{}': input '{}' is not bound", self.name, name);
        }
        missing
    }

    /// Bind `input` to the shader binding called `key` for every frame in
    /// flight.
    ///
    /// Returns `false` and changes nothing when the pipeline has no such
    /// binding or the resource does not match its descriptor type.
    pub fn set_input(&mut self, key: &str, input: InputBinding<'_>) -> bool {
        let binding: ShaderBinding = match self.pipeline.binding(key) {
            Some(binding) => binding.clone(),
            None => {
                log::error!(
                    "Render pass '{}': pipeline '{}' has no input named '{}'",
                    self.name,
                    self.pipeline.label(),
                    key
                );
                return false;
            }
        };
        if binding.ty != input.descriptor_type() {
            log::error!(
                "Render pass '{}': input '{}' expects {:?}, got {:?}",
                self.name,
                key,
                binding.ty,
                input.descriptor_type()
            );
            return false;
        }

        let mut writes = Vec::new();
        for (frame_index, sets) in self.descriptor_sets.iter().enumerate() {
            let Some(set) = sets.get(binding.set as usize) else {
                continue;
            };
            let resources = input.resources(frame_index as u32);
            if resources.len() > binding.count as usize {
                log::warn!(
                    "Render pass '{}': input '{}' holds {} elements, truncating to {}",
                    self.name,
                    key,
                    resources.len(),
                    binding.count
                );
            }
            writes.extend(
                resources
                    .into_iter()
                    .take(binding.count as usize)
                    .enumerate()
                    .map(|(element, resource)| DescriptorWrite {
                        set: *set,
                        binding: binding.binding,
                        array_element: element as u32,
                        resource,
                    }),
            );
        }
        self.backend.update_descriptor_sets(&writes);
        self.inputs.insert(key.to_string());
        true
    }

    /// Point the pass at new render targets and rebuild its framebuffer.
    ///
    /// All targets must share one extent. Swapchain passes render into the
    /// backend's framebuffers and only record the handles.
    pub fn update_render_targets(
        &mut self,
        targets: Vec<TextureHandle>,
        textures: &HandleManager<BufferImage>,
    ) -> GraphicsResult<()> {
        if self.attachment.is_swapchain() {
            self.render_targets = targets;
            self.extent = self.backend.swapchain_extent();
            return Ok(());
        }
        if targets.is_empty() {
            return Err(GraphError::NoRenderTargets(self.name.clone()).into());
        }

        let mut views = Vec::with_capacity(targets.len());
        let mut extent = None;
        for handle in &targets {
            let image = textures.access(*handle);
            match extent {
                None => extent = Some(image.extent()),
                Some(expected) if expected != image.extent() => {
                    return Err(GraphError::ExtentMismatch {
                        pass: self.name.clone(),
                        expected,
                        found: image.extent(),
                    }
                    .into());
                }
                Some(_) => {}
            }
            views.push(image.view);
        }
        let (width, height) = extent.unwrap_or_default();

        let framebuffer =
            self.backend
                .create_framebuffer(self.attachment.raw(), &views, width, height)?;
        let old = std::mem::replace(&mut self.framebuffer, framebuffer);
        self.collector.enqueue(ObjectKind::Framebuffer, old);
        self.render_targets = targets;
        self.extent = (width, height);
        Ok(())
    }

    /// Begin the render pass, bind the pipeline and this frame's sets.
    pub fn begin(&self, cmd: &CommandBuffer, frame_index: u32, image_index: u32) {
        let (framebuffer, extent) = if self.attachment.is_swapchain() {
            (
                self.backend.swapchain_framebuffer(image_index),
                self.backend.swapchain_extent(),
            )
        } else {
            (self.framebuffer, self.extent)
        };
        gfx_validate!(
            !framebuffer.is_null(),
            "Render pass '{}' has no framebuffer",
            self.name
        );

        cmd.begin_render_pass(
            self.attachment.raw(),
            framebuffer,
            extent,
            self.attachment.clear_values(),
        );
        cmd.bind_pipeline(self.pipeline.raw());
        let sets = self.descriptor_sets(frame_index);
        if !sets.is_empty() {
            cmd.bind_descriptor_sets(self.pipeline.layout(), 0, sets);
        }
    }

    pub fn end(&self, cmd: &CommandBuffer) {
        cmd.end_render_pass();
    }

    /// Retire every native object owned by the pass.
    pub fn release(&mut self) {
        for sets in self.descriptor_sets.drain(..) {
            for set in sets {
                self.collector.enqueue(ObjectKind::DescriptorSet, set);
            }
        }
        let framebuffer = std::mem::replace(&mut self.framebuffer, NativeHandle::NULL);
        self.collector.enqueue(ObjectKind::Framebuffer, framebuffer);
        self.pipeline.release(&self.collector);
        self.attachment.release(&self.collector);
        self.render_targets.clear();
        self.inputs.clear();
    }
}

impl std::fmt::Debug for RenderPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPass")
            .field("name", &self.name)
            .field("pipeline", &self.pipeline.label())
            .field("inputs", &self.inputs)
            .field("render_targets", &self.render_targets.len())
            .field("extent", &self.extent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        ClearValue, DummyBackend, GpuCommand, LoadOp, RenderPassLayout, SamplerDescriptor,
        ShaderSource, StoreOp, TextureDescriptor, TextureFormat, TextureUsage,
    };
    use crate::commands::InstantCommands;
    use crate::deferred::{DirtyCollectorConfig, ReclaimMode};
    use crate::frame::FrameCounter;
    use crate::resources::ResourceAllocator;
    use std::time::Duration;

    struct Fixture {
        backend: Arc<DummyBackend>,
        collector: Arc<DirtyCollector>,
        allocator: ResourceAllocator,
        textures: HandleManager<BufferImage>,
    }

    fn fixture() -> Fixture {
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
        let allocator = ResourceAllocator::new(backend.clone(), frames, collector.clone(), instant);
        Fixture {
            backend,
            collector,
            allocator,
            textures: HandleManager::new(16),
        }
    }

    fn offscreen_desc() -> RenderPassDesc {
        RenderPassDesc {
            label: "forward".to_string(),
            pipeline: PipelineDescriptor::new("forward", ShaderSource::new(vec![0x0723_0203]))
                .with_binding(ShaderBinding::new("camera", 0, 0, DescriptorType::UniformBuffer))
                .with_binding(ShaderBinding::new(
                    "albedo",
                    1,
                    0,
                    DescriptorType::CombinedImageSampler,
                )),
            target: PassTarget::Offscreen(RenderPassLayout {
                colors: vec![PassTarget::attachment(
                    TextureFormat::Rgba8Unorm,
                    LoadOp::Clear(ClearValue::BLACK),
                    StoreOp::Store,
                )],
                depth: None,
            }),
        }
    }

    fn texture(f: &Fixture, width: u32, height: u32) -> TextureHandle {
        let desc = TextureDescriptor::new(
            width,
            height,
            TextureFormat::Rgba8Unorm,
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        );
        let image = f
            .allocator
            .create_image(&desc, &SamplerDescriptor::default())
            .unwrap();
        f.textures.add(image)
    }

    fn new_pass(f: &Fixture) -> RenderPass {
        RenderPass::new(f.backend.clone(), f.collector.clone(), offscreen_desc(), 3).unwrap()
    }

    #[test]
    fn test_verify_reports_unbound_inputs() {
        let f = fixture();
        let mut pass = new_pass(&f);
        assert_eq!(pass.verify(), vec!["camera".to_string(), "albedo".to_string()]);

        let camera = f
            .allocator
            .create_buffer_set(64, crate::backend::BufferUsage::UNIFORM)
            .unwrap();
        assert!(pass.set_input("camera", InputBinding::UniformBufferSet(&camera)));
        assert_eq!(pass.verify(), vec!["albedo".to_string()]);
    }

    #[test]
    fn test_set_input_writes_every_frame() {
        let f = fixture();
        let mut pass = new_pass(&f);
        let camera = f
            .allocator
            .create_buffer_set(64, crate::backend::BufferUsage::UNIFORM)
            .unwrap();
        pass.set_input("camera", InputBinding::UniformBufferSet(&camera));

        let writes = f.backend.descriptor_writes();
        assert_eq!(writes.len(), 3);
        for (frame, write) in writes.iter().enumerate() {
            assert_eq!(write.set, pass.descriptor_sets(frame as u32)[0]);
            assert_eq!(
                write.resource,
                DescriptorResource::UniformBuffer {
                    buffer: camera.get(frame as u32).handle,
                    range: 64
                }
            );
        }
    }

    #[test]
    fn test_unknown_or_mismatched_input_is_ignored() {
        let f = fixture();
        let mut pass = new_pass(&f);
        let camera = f
            .allocator
            .create_buffer_set(64, crate::backend::BufferUsage::UNIFORM)
            .unwrap();
        assert!(!pass.set_input("missing", InputBinding::UniformBufferSet(&camera)));
        assert!(!pass.set_input("albedo", InputBinding::UniformBufferSet(&camera)));
        assert!(f.backend.descriptor_writes().is_empty());
        assert!(!pass.is_bound("albedo"));
    }

    #[test]
    fn test_render_targets_build_framebuffer() {
        let f = fixture();
        let mut pass = new_pass(&f);
        let color = texture(&f, 800, 600);
        pass.update_render_targets(vec![color], &f.textures).unwrap();
        let first = pass.framebuffer();
        assert!(f.backend.is_live(first));
        assert_eq!(pass.extent(), (800, 600));

        pass.update_render_targets(vec![color], &f.textures).unwrap();
        assert_ne!(pass.framebuffer(), first);
        assert_eq!(f.collector.pending_of(ObjectKind::Framebuffer), 1);
    }

    #[test]
    fn test_mismatched_targets_are_rejected() {
        let f = fixture();
        let mut pass = new_pass(&f);
        let a = texture(&f, 800, 600);
        let b = texture(&f, 400, 300);
        let err = pass.update_render_targets(vec![a, b], &f.textures).unwrap_err();
        assert_eq!(
            err,
            GraphError::ExtentMismatch {
                pass: "forward".to_string(),
                expected: (800, 600),
                found: (400, 300),
            }
            .into()
        );
    }

    #[test]
    fn test_begin_records_pass_and_bindings() {
        let f = fixture();
        let mut pass = new_pass(&f);
        let color = texture(&f, 64, 64);
        pass.update_render_targets(vec![color], &f.textures).unwrap();

        let mut cmd = CommandBuffer::new(
            f.backend.clone(),
            f.backend
                .allocate_command_buffer(f.backend.create_command_pool(false).unwrap())
                .unwrap(),
        );
        cmd.begin(true).unwrap();
        pass.begin(&cmd, 1, 0);
        pass.end(&cmd);

        let commands = f.backend.commands(cmd.raw());
        assert!(matches!(
            &commands[0],
            GpuCommand::BeginRenderPass { framebuffer, width: 64, .. }
                if *framebuffer == pass.framebuffer()
        ));
        assert_eq!(commands[2], GpuCommand::BindPipeline(pass.pipeline().raw()));
        assert!(matches!(
            &commands[3],
            GpuCommand::BindDescriptorSets { sets, .. }
                if sets.as_slice() == pass.descriptor_sets(1)
        ));
        assert_eq!(commands.last(), Some(&GpuCommand::EndRenderPass));
    }

    #[test]
    fn test_release_retires_everything() {
        let f = fixture();
        let mut pass = new_pass(&f);
        let color = texture(&f, 64, 64);
        pass.update_render_targets(vec![color], &f.textures).unwrap();
        pass.release();

        // 6 descriptor sets, framebuffer, pipeline, layout, 2 set layouts, render pass
        assert_eq!(f.collector.pending_count(), 12);
        assert_eq!(f.collector.pending_of(ObjectKind::DescriptorSet), 6);
    }

    #[test]
    fn test_swapchain_pass_uses_backend_framebuffers() {
        let f = fixture();
        let desc = RenderPassDesc {
            label: "composite".to_string(),
            pipeline: PipelineDescriptor::new("composite", ShaderSource::new(vec![0x0723_0203])),
            target: PassTarget::Swapchain {
                clear: ClearValue::BLACK,
            },
        };
        let mut pass = RenderPass::new(f.backend.clone(), f.collector.clone(), desc, 3).unwrap();
        pass.update_render_targets(Vec::new(), &f.textures).unwrap();
        assert_eq!(pass.extent(), (800, 600));
        assert!(pass.framebuffer().is_null());
        assert!(pass.attachment().is_swapchain());
        pass.release();
        // swapchain render pass belongs to the backend
        assert_eq!(f.collector.pending_of(ObjectKind::RenderPass), 0);
    }
}
