//! Application-level rendering context

use std::sync::Arc;

use crate::backend::{BufferUsage, GpuBackend, NativeHandle, ObjectKind, TextureDescriptor};
use crate::commands::{CommandBuffer, FrameManager, FrameStatus, PresentStatus};
use crate::device::RenderDevice;
use crate::error::{GraphicsError, GraphicsResult};
use crate::graph::RenderGraph;
use crate::loader::ResourceLoader;
use crate::pass::{RenderPass, RenderPassDesc};
use crate::pipeline::{build_default_graph, DefaultShaders, CAMERA_RESOURCE};
use crate::resources::{BufferSet, TextureHandle};
use crate::scene::{Camera, CameraUniform, FrameInputs, SceneGeometry, SceneRawData};
use crate::RendererConfig;

/// What happened to a call of [`Renderer::render_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// The previous use of this frame slot had not finished; nothing was
    /// recorded.
    Skipped,
    /// The swapchain was recreated and the graph resized to match.
    Resized { width: u32, height: u32 },
}

/// Sampled-image descriptor over the output texture, for a UI overlay
#[derive(Debug, Clone, Copy)]
struct OutputDescriptor {
    view: NativeHandle,
    set: NativeHandle,
}

/// Owns the device, frame pacing, the render graph and the loader
pub struct Renderer {
    config: RendererConfig,
    loader: Option<ResourceLoader>,
    frames: Option<FrameManager>,
    graph: RenderGraph,
    geometry: SceneGeometry,
    camera: Option<Arc<BufferSet>>,
    ui_output: Option<OutputDescriptor>,
    extent: (u32, u32),
    shut_down: bool,
    device: RenderDevice,
}

impl Renderer {
    pub fn new(backend: Arc<dyn GpuBackend>, config: RendererConfig) -> GraphicsResult<Self> {
        let device = RenderDevice::new(backend, &config)?;
        let frames = FrameManager::new(
            Arc::clone(device.backend()),
            Arc::clone(device.frames()),
            Arc::clone(device.collector()),
            config.fence_timeout,
        )?;
        let loader = ResourceLoader::new(&device, config.fence_timeout)?;

        let camera = Arc::new(device.allocator().create_buffer_set(
            std::mem::size_of::<CameraUniform>() as u64,
            BufferUsage::UNIFORM,
        )?);
        let mut graph = RenderGraph::new();
        graph.import_buffer_set(CAMERA_RESOURCE, Arc::clone(&camera));

        let extent = device.backend().swapchain_extent();
        log::info!(
            "Renderer: {} backend, {}x{}, {} frames in flight",
            device.backend().name(),
            extent.0,
            extent.1,
            device.frames_in_flight()
        );

        Ok(Self {
            config,
            loader: Some(loader),
            frames: Some(frames),
            graph,
            geometry: SceneGeometry::new(),
            camera: Some(camera),
            ui_output: None,
            extent,
            shut_down: false,
            device,
        })
    }

    /// Create a renderer presenting to `window` through Vulkan.
    #[cfg(feature = "vulkan-backend")]
    pub fn from_window<W>(window: &W, config: RendererConfig) -> GraphicsResult<Self>
    where
        W: raw_window_handle::HasDisplayHandle + raw_window_handle::HasWindowHandle,
    {
        let backend = crate::backend::vulkan::VulkanBackend::new(window, &config)?;
        Self::new(Arc::new(backend), config)
    }

    /// Add the depth prepass, forward and composite passes at the current
    /// swapchain size.
    pub fn build_default_pipeline(&mut self, shaders: DefaultShaders) -> GraphicsResult<()> {
        build_default_graph(&mut self.graph, shaders, self.extent.0, self.extent.1)
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn device(&self) -> &RenderDevice {
        &self.device
    }

    pub fn graph(&self) -> &RenderGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut RenderGraph {
        &mut self.graph
    }

    pub fn loader(&self) -> Option<&ResourceLoader> {
        self.loader.as_ref()
    }

    pub fn geometry(&self) -> &SceneGeometry {
        &self.geometry
    }

    pub fn extent(&self) -> (u32, u32) {
        self.extent
    }

    pub fn frame_index(&self) -> u32 {
        self.device.frames().current_index()
    }

    pub fn create_render_pass(&self, desc: RenderPassDesc) -> GraphicsResult<RenderPass> {
        self.device.create_render_pass(desc)
    }

    pub fn create_texture(&self, desc: &TextureDescriptor) -> GraphicsResult<TextureHandle> {
        self.device.create_texture(desc)
    }

    /// Record the render graph for `scene` into `cmd`, compiling it first if
    /// it changed.
    pub fn draw_scene(
        &mut self,
        cmd: &CommandBuffer,
        camera: &Camera,
        scene: &SceneRawData,
    ) -> GraphicsResult<()> {
        let frame_index = self.device.frames().current_index();
        let image_index = self
            .frames
            .as_ref()
            .and_then(FrameManager::current_image)
            .unwrap_or(0);
        record_scene(
            &self.device,
            &mut self.graph,
            &mut self.geometry,
            cmd,
            frame_index,
            image_index,
            camera,
            scene,
        )
    }

    /// Acquire, record, submit and present one frame.
    pub fn render_frame(
        &mut self,
        camera: &Camera,
        scene: &SceneRawData,
    ) -> GraphicsResult<FrameOutcome> {
        let Some(frames) = self.frames.as_mut() else {
            return Err(GraphicsError::DeviceLost);
        };

        let (frame_index, image_index) = match frames.new_frame()? {
            FrameStatus::Ready {
                frame_index,
                image_index,
            } => (frame_index, image_index),
            FrameStatus::Skipped => return Ok(FrameOutcome::Skipped),
            FrameStatus::Resized { width, height } => {
                self.resize_graph(width, height)?;
                return Ok(FrameOutcome::Resized { width, height });
            }
        };

        let recorded = match frames.begin_command_buffer() {
            Ok(cmd) => record_scene(
                &self.device,
                &mut self.graph,
                &mut self.geometry,
                cmd,
                frame_index,
                image_index,
                camera,
                scene,
            ),
            Err(e) => Err(e),
        };
        // passes are recorded whole, so whatever made it into the buffer is
        // balanced and the frame can still be closed
        let presented = frames.present();
        if let Err(e) = recorded {
            log::error!("Renderer: failed to record frame: {}", e);
            return Err(e);
        }

        match presented? {
            PresentStatus::Presented => Ok(FrameOutcome::Presented),
            PresentStatus::Resized { width, height } => {
                self.resize_graph(width, height)?;
                Ok(FrameOutcome::Resized { width, height })
            }
        }
    }

    /// Texture behind the configured output resource.
    pub fn frame_output_texture(&self) -> Option<TextureHandle> {
        self.graph.texture(&self.config.output_resource)
    }

    /// Combined image sampler set over the output texture, ready for an
    /// overlay UI to draw.
    ///
    /// The set is cached and rebuilt once the texture's view changes; the
    /// previous set goes to the collector. `None` until the graph has
    /// created the output.
    pub fn imgui_frame_output(&mut self) -> GraphicsResult<Option<NativeHandle>> {
        let Some(texture) = self.frame_output_texture() else {
            return Ok(None);
        };
        let Some((view, sampler)) = self
            .device
            .textures()
            .try_access(texture)
            .map(|image| (image.view, image.sampler))
        else {
            return Ok(None);
        };
        if let Some(cached) = self.ui_output.filter(|cached| cached.view == view) {
            return Ok(Some(cached.set));
        }

        let set = self
            .device
            .backend()
            .create_sampled_image_descriptor(view, sampler)?;
        if let Some(old) = self.ui_output.replace(OutputDescriptor { view, set }) {
            self.device.retire(ObjectKind::DescriptorSet, old.set);
        }
        log::debug!("Renderer: output descriptor rebuilt for view {:?}", view);
        Ok(Some(set))
    }

    /// Follow a window resize. Graph textures are recreated now; the
    /// swapchain on the next frame.
    pub fn resize(&mut self, width: u32, height: u32) -> GraphicsResult<()> {
        if width == 0 || height == 0 {
            log::debug!("Renderer: ignoring resize to {}x{}", width, height);
            return Ok(());
        }
        self.device.wait_idle()?;
        self.resize_graph(width, height)?;
        if let Some(frames) = &self.frames {
            frames.request_resize(width, height);
        }
        Ok(())
    }

    fn resize_graph(&mut self, width: u32, height: u32) -> GraphicsResult<()> {
        self.extent = (width, height);
        self.graph.resize(&self.device, width, height)?;
        if self.ui_output.is_some() {
            self.imgui_frame_output()?;
        }
        Ok(())
    }

    /// Release everything in dependency order. Idempotent; also run on drop.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        log::info!("Renderer: shutting down");

        if let Some(loader) = self.loader.take() {
            loader.stop();
        }
        if let Err(e) = self.device.wait_idle() {
            log::error!("Renderer: wait_idle failed during shutdown: {}", e);
        }

        if let Some(output) = self.ui_output.take() {
            self.device.retire(ObjectKind::DescriptorSet, output.set);
        }
        self.graph.release(&self.device);
        self.geometry.release(self.device.allocator());
        if let Some(camera) = self.camera.take() {
            for view in camera.iter() {
                self.device.allocator().retire_buffer(view.clone());
            }
        }
        self.frames = None;
        self.device.release_textures();

        let collector = self.device.collector();
        collector.shutdown();
        let flushed = collector.flush_all();
        log::debug!("Renderer: flushed {} objects", flushed);
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[allow(clippy::too_many_arguments)]
fn record_scene(
    device: &RenderDevice,
    graph: &mut RenderGraph,
    geometry: &mut SceneGeometry,
    cmd: &CommandBuffer,
    frame_index: u32,
    image_index: u32,
    camera: &Camera,
    scene: &SceneRawData,
) -> GraphicsResult<()> {
    geometry.sync(device.allocator(), scene)?;
    if graph.is_dirty() {
        graph.compile(device)?;
    }
    graph.execute(
        device,
        cmd,
        frame_index,
        image_index,
        FrameInputs {
            scene,
            camera,
            geometry,
        },
    )
}
