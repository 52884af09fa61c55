//! Render graph pass definitions

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use super::resource::{
    InputUsage, PassInput, RenderGraphResource, ResourceInfo, ResourceKind, TextureSpec,
};
use crate::backend::PipelineDescriptor;
use crate::commands::CommandBuffer;
use crate::device::RenderDevice;
use crate::error::{GraphError, GraphicsResult};
use crate::pass::{PassTarget, RenderPass, RenderPassDesc};
use crate::resources::{BufferSet, TextureHandle};
use crate::scene::FrameInputs;

/// A resource as resolved for one pass at compile time
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedInput {
    Texture(TextureHandle),
    Buffers(Arc<BufferSet>),
}

/// Trait implemented by every pass added to a [`RenderGraph`](super::RenderGraph)
pub trait GraphPass {
    /// Unique name of the pass
    fn name(&self) -> &str;

    /// Declare the pass's inputs and outputs. Called once, from `add_pass`.
    fn setup(&mut self, builder: &mut PassBuilder);

    /// Bake the pass's pipeline and bind anything the graph does not know
    /// about. Called on every graph compile; the render pass only needs to be
    /// baked the first time.
    fn compile(&mut self, ctx: &mut CompileContext) -> GraphicsResult<()>;

    /// CPU work before recording, such as writing this frame's uniforms.
    fn execute(&mut self, _ctx: &mut ExecuteContext) -> GraphicsResult<()> {
        Ok(())
    }

    /// Record draw commands. The render pass is already begun.
    fn render(&mut self, ctx: &mut RenderContext);

    /// Retire GPU objects owned by the pass itself.
    fn release(&mut self, _device: &RenderDevice) {}
}

/// Declares a pass's resources during [`GraphPass::setup`]
pub struct PassBuilder<'a> {
    pass: &'a str,
    resources: &'a mut HashMap<String, RenderGraphResource>,
    inputs: Vec<PassInput>,
    outputs: Vec<String>,
    swapchain: bool,
}

impl<'a> PassBuilder<'a> {
    pub(crate) fn new(
        pass: &'a str,
        resources: &'a mut HashMap<String, RenderGraphResource>,
    ) -> Self {
        Self {
            pass,
            resources,
            inputs: Vec::new(),
            outputs: Vec::new(),
            swapchain: false,
        }
    }

    pub(crate) fn finish(self) -> (Vec<PassInput>, Vec<String>, bool) {
        (self.inputs, self.outputs, self.swapchain)
    }

    /// Render into a texture the graph creates from `spec`.
    pub fn output(&mut self, name: &str, spec: TextureSpec) -> &mut Self {
        let resource = RenderGraphResource {
            name: name.to_string(),
            kind: ResourceKind::Attachment,
            producer: Some(self.pass.to_string()),
            info: ResourceInfo::Lazy {
                spec,
                texture: TextureHandle::invalid(),
            },
        };
        if declare(self.resources, resource) {
            self.outputs.push(name.to_string());
        }
        self
    }

    /// Render into a texture owned by the caller.
    pub fn output_external(&mut self, name: &str, texture: TextureHandle) -> &mut Self {
        let resource = RenderGraphResource {
            name: name.to_string(),
            kind: ResourceKind::Attachment,
            producer: Some(self.pass.to_string()),
            info: ResourceInfo::External(texture),
        };
        if declare(self.resources, resource) {
            self.outputs.push(name.to_string());
        }
        self
    }

    /// Keep rendering into an attachment another pass produced.
    pub fn input_attachment(&mut self, name: &str) -> &mut Self {
        self.input(name, InputUsage::Attachment)
    }

    /// Sample a texture in this pass's shaders.
    pub fn input_texture(&mut self, name: &str) -> &mut Self {
        self.input(name, InputUsage::Sampled)
    }

    /// Bind a per-frame buffer set.
    pub fn input_buffer_set(&mut self, name: &str) -> &mut Self {
        self.input(name, InputUsage::BufferSet)
    }

    /// Render into the acquired swapchain image instead of graph textures.
    pub fn present_to_swapchain(&mut self) -> &mut Self {
        self.swapchain = true;
        self
    }

    /// Make an existing texture available to every pass by name.
    pub fn import_texture(&mut self, name: &str, texture: TextureHandle) -> &mut Self {
        declare(self.resources, imported_texture(name, texture));
        self
    }

    /// Make a buffer set available to every pass by name.
    pub fn import_buffer_set(&mut self, name: &str, set: Arc<BufferSet>) -> &mut Self {
        declare(self.resources, imported_buffer_set(name, set));
        self
    }

    fn input(&mut self, name: &str, usage: InputUsage) -> &mut Self {
        self.inputs.push(PassInput {
            resource: name.to_string(),
            usage,
        });
        self
    }
}

pub(crate) fn imported_texture(name: &str, texture: TextureHandle) -> RenderGraphResource {
    RenderGraphResource {
        name: name.to_string(),
        kind: ResourceKind::Texture,
        producer: None,
        info: ResourceInfo::External(texture),
    }
}

pub(crate) fn imported_buffer_set(name: &str, set: Arc<BufferSet>) -> RenderGraphResource {
    RenderGraphResource {
        name: name.to_string(),
        kind: ResourceKind::BufferSet,
        producer: None,
        info: ResourceInfo::Buffers(set),
    }
}

/// Register `resource`, upgrading a placeholder of the same name.
///
/// A name already declared keeps its original kind and producer.
pub(crate) fn declare(
    resources: &mut HashMap<String, RenderGraphResource>,
    resource: RenderGraphResource,
) -> bool {
    match resources.get(&resource.name) {
        Some(existing) if !existing.is_placeholder() => {
            log::error!(
                "Render graph resource '{}' is already declared as {:?} (producer {:?})",
                resource.name,
                existing.kind,
                existing.producer
            );
            false
        }
        _ => {
            resources.insert(resource.name.clone(), resource);
            true
        }
    }
}

/// Passed to [`GraphPass::compile`]
pub struct CompileContext<'a> {
    pub(crate) device: &'a RenderDevice,
    pub(crate) name: &'a str,
    pub(crate) target: &'a PassTarget,
    pub(crate) pass: &'a mut Option<RenderPass>,
    pub(crate) resolved: &'a BTreeMap<String, ResolvedInput>,
}

impl CompileContext<'_> {
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn device(&self) -> &RenderDevice {
        self.device
    }

    pub fn target(&self) -> &PassTarget {
        self.target
    }

    pub fn is_baked(&self) -> bool {
        self.pass.is_some()
    }

    /// Create the pass's render pass and pipeline unless that already
    /// happened on an earlier compile.
    pub fn bake(&mut self, pipeline: PipelineDescriptor) -> GraphicsResult<&mut RenderPass> {
        if self.pass.is_none() {
            let pass = self.device.create_render_pass(RenderPassDesc {
                label: self.name.to_string(),
                pipeline,
                target: self.target.clone(),
            })?;
            *self.pass = Some(pass);
        }
        let name = self.name;
        self.pass
            .as_mut()
            .ok_or_else(|| GraphError::NotBaked(name.to_string()).into())
    }

    pub fn pass_mut(&mut self) -> Option<&mut RenderPass> {
        self.pass.as_mut()
    }

    pub fn input(&self, name: &str) -> Option<&ResolvedInput> {
        self.resolved.get(name)
    }
}

/// Passed to [`GraphPass::execute`]
pub struct ExecuteContext<'a> {
    pub device: &'a RenderDevice,
    pub pass: &'a mut RenderPass,
    pub frame_index: u32,
    pub inputs: FrameInputs<'a>,
    pub(crate) resolved: &'a BTreeMap<String, ResolvedInput>,
}

impl ExecuteContext<'_> {
    /// What the graph resolved `name` to on the last compile.
    pub fn input(&self, name: &str) -> Option<&ResolvedInput> {
        self.resolved.get(name)
    }

    /// Write `bytes` into this frame's copy of the buffer set bound as `name`.
    pub fn write_buffer_set(&self, name: &str, bytes: &[u8]) -> GraphicsResult<bool> {
        match self.resolved.get(name) {
            Some(ResolvedInput::Buffers(set)) => {
                set.write(self.device.backend().as_ref(), self.frame_index, bytes)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Passed to [`GraphPass::render`]
pub struct RenderContext<'a> {
    pub device: &'a RenderDevice,
    pub cmd: &'a CommandBuffer,
    pub pass: &'a RenderPass,
    pub frame_index: u32,
    pub inputs: FrameInputs<'a>,
}

/// A pass registered in the graph
pub(crate) struct RenderGraphNode {
    pub name: String,
    pub inputs: Vec<PassInput>,
    pub outputs: Vec<String>,
    pub swapchain: bool,
    pub enabled: bool,
    /// Passes consuming an attachment this pass produces.
    pub dependents: BTreeSet<String>,
    pub resolved: BTreeMap<String, ResolvedInput>,
    /// Colors first, then depth; the order of the framebuffer attachments.
    pub render_targets: Vec<TextureHandle>,
    pub pass: Option<RenderPass>,
    pub callback: Box<dyn GraphPass>,
}
