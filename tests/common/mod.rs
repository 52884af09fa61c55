//! Shared helpers for the integration tests
//!
//! Everything runs on the recording [`DummyBackend`], so the tests inspect
//! exactly what the graph and frame layers asked the GPU to do.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use redlilium_render::backend::{
    DescriptorResource, DescriptorType, DummyBackend, GpuCommand, ImageBarrier, NativeHandle,
    PipelineDescriptor, ShaderBinding, ShaderSource, TextureFormat,
};
use redlilium_render::commands::{CommandBuffer, FrameManager, FrameStatus};
use redlilium_render::graph::{CompileContext, GraphPass, PassBuilder, RenderContext, TextureSpec};
use redlilium_render::pipeline::DefaultShaders;
use redlilium_render::scene::{Camera, FrameInputs, SceneGeometry, SceneRawData};
use redlilium_render::{
    DirtyCollectorConfig, GraphicsResult, ReclaimMode, RenderDevice, RendererConfig,
};

pub const WIDTH: u32 = 320;
pub const HEIGHT: u32 = 240;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Renderer configuration with inline reclamation and a short fence timeout.
pub fn config() -> RendererConfig {
    RendererConfig::default()
        .with_fence_timeout(Duration::from_millis(5))
        .with_dirty_collector(DirtyCollectorConfig {
            mode: ReclaimMode::Inline,
            ..Default::default()
        })
}

/// A SPIR-V module holding only the magic number.
pub fn shader() -> ShaderSource {
    ShaderSource::new(vec![0x0723_0203])
}

pub fn default_shaders() -> DefaultShaders {
    DefaultShaders {
        depth_vertex: shader(),
        forward_vertex: shader(),
        forward_fragment: shader(),
        composite_vertex: shader(),
        composite_fragment: shader(),
    }
}

pub fn color_spec() -> TextureSpec {
    TextureSpec::color(WIDTH, HEIGHT, TextureFormat::Rgba8Unorm)
}

/// Test context wrapping a dummy backend and a device on top of it
pub struct TestContext {
    pub backend: Arc<DummyBackend>,
    pub device: RenderDevice,
    pub frames: FrameManager,
    pub scene: SceneRawData,
    pub camera: Camera,
    pub geometry: SceneGeometry,
}

impl TestContext {
    pub fn new() -> Self {
        init_logging();
        let backend = Arc::new(DummyBackend::new(3));
        let config = config();
        let device = RenderDevice::new(backend.clone(), &config).expect("device");
        let frames = FrameManager::new(
            backend.clone(),
            device.frames().clone(),
            device.collector().clone(),
            config.fence_timeout,
        )
        .expect("frame manager");
        Self {
            backend,
            device,
            frames,
            scene: SceneRawData::new(),
            camera: Camera::default(),
            geometry: SceneGeometry::new(),
        }
    }

    /// Acquire a frame, let `record` fill its command buffer, then present.
    /// Returns everything recorded.
    pub fn frame(
        &mut self,
        record: impl FnOnce(&RenderDevice, &CommandBuffer, u32, u32, FrameInputs<'_>),
    ) -> Vec<GpuCommand> {
        let FrameStatus::Ready {
            frame_index,
            image_index,
        } = self.frames.new_frame().expect("new frame")
        else {
            panic!("frame not ready");
        };
        let inputs = FrameInputs {
            scene: &self.scene,
            camera: &self.camera,
            geometry: &self.geometry,
        };
        let cmd = self.frames.begin_command_buffer().expect("command buffer");
        record(&self.device, cmd, frame_index, image_index, inputs);
        let commands = self.backend.commands(cmd.raw());
        self.frames.present().expect("present");
        commands
    }
}

/// Every barrier recorded, in order.
pub fn barriers(commands: &[GpuCommand]) -> Vec<ImageBarrier> {
    commands
        .iter()
        .filter_map(|c| match c {
            GpuCommand::PipelineBarrier(barriers) => Some(barriers.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}

/// Image views written into descriptor sets, oldest first.
pub fn sampled_views(backend: &DummyBackend) -> Vec<NativeHandle> {
    backend
        .descriptor_writes()
        .into_iter()
        .filter_map(|w| match w.resource {
            DescriptorResource::SampledImage { view, .. } => Some(view),
            _ => None,
        })
        .collect()
}

pub fn count_render_passes(commands: &[GpuCommand]) -> usize {
    commands
        .iter()
        .filter(|c| matches!(c, GpuCommand::BeginRenderPass { .. }))
        .count()
}

/// A pass assembled from declarations; draws one fullscreen triangle.
pub struct TestPass {
    name: String,
    outputs: Vec<(String, TextureSpec)>,
    attachments: Vec<String>,
    sampled: Vec<String>,
    swapchain: bool,
}

impl TestPass {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            outputs: Vec::new(),
            attachments: Vec::new(),
            sampled: Vec::new(),
            swapchain: false,
        }
    }

    pub fn writes(mut self, name: &str, spec: TextureSpec) -> Self {
        self.outputs.push((name.to_string(), spec));
        self
    }

    pub fn continues(mut self, name: &str) -> Self {
        self.attachments.push(name.to_string());
        self
    }

    pub fn samples(mut self, name: &str) -> Self {
        self.sampled.push(name.to_string());
        self
    }

    pub fn presents(mut self) -> Self {
        self.swapchain = true;
        self
    }
}

impl GraphPass for TestPass {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&mut self, builder: &mut PassBuilder) {
        for (name, spec) in &self.outputs {
            builder.output(name, *spec);
        }
        for name in &self.attachments {
            builder.input_attachment(name);
        }
        for name in &self.sampled {
            builder.input_texture(name);
        }
        if self.swapchain {
            builder.present_to_swapchain();
        }
    }

    fn compile(&mut self, ctx: &mut CompileContext) -> GraphicsResult<()> {
        let mut descriptor =
            PipelineDescriptor::new(&self.name, shader()).with_fragment(shader());
        for (binding, name) in self.sampled.iter().enumerate() {
            descriptor = descriptor.with_binding(ShaderBinding::new(
                name,
                0,
                binding as u32,
                DescriptorType::CombinedImageSampler,
            ));
        }
        ctx.bake(descriptor)?;
        Ok(())
    }

    fn render(&mut self, ctx: &mut RenderContext) {
        ctx.cmd.draw(3, 1);
    }
}
