//! Render graph
//!
//! Passes declare named inputs and outputs through a [`PassBuilder`]. On
//! compile the graph derives producer/consumer edges from attachments,
//! orders the passes, creates the textures they render into and builds their
//! framebuffers. Every frame it walks the passes in that order, inserting the
//! layout transitions each one needs before recording it.
//!
//! ```text
//! add_pass ──► setup ──► Declared ──compile──► Compiled ──execute──► (per frame)
//!                           ▲                      │
//!                           └──── mark_dirty ──────┘   resize keeps Compiled
//! ```

mod barrier;
mod node;
mod resource;
mod sort;

pub use barrier::{BarrierBatch, FrameLayoutState};
pub use node::{
    CompileContext, ExecuteContext, GraphPass, PassBuilder, RenderContext, ResolvedInput,
};
pub use resource::{
    InputUsage, PassInput, RenderGraphResource, ResourceInfo, ResourceKind, TextureSpec,
};
pub use sort::topological_order;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use node::RenderGraphNode;

use crate::backend::{
    ClearValue, DescriptorType, ImageLayout, LoadOp, NativeHandle, RenderPassLayout,
    SamplerDescriptor, StoreOp, TextureFormat,
};
use crate::commands::CommandBuffer;
use crate::device::RenderDevice;
use crate::error::{GraphError, GraphicsResult};
use crate::gfx_validate;
use crate::pass::{InputBinding, PassTarget, RenderPass};
use crate::resources::{BufferSet, TextureHandle};
use crate::scene::FrameInputs;

/// The main render graph structure
#[derive(Default)]
pub struct RenderGraph {
    nodes: Vec<RenderGraphNode>,
    resources: HashMap<String, RenderGraphResource>,
    /// Node indices in execution order; valid while not dirty.
    sorted: Vec<usize>,
    dirty: bool,
    compiled: bool,
    layouts: FrameLayoutState,
}

impl RenderGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pass and run its setup.
    pub fn add_pass<P: GraphPass + 'static>(&mut self, pass: P) -> GraphicsResult<()> {
        self.add_boxed_pass(Box::new(pass))
    }

    pub fn add_boxed_pass(&mut self, mut callback: Box<dyn GraphPass>) -> GraphicsResult<()> {
        let name = callback.name().to_string();
        if self.nodes.iter().any(|n| n.name == name) {
            return Err(GraphError::DuplicatePass(name).into());
        }

        let (inputs, outputs, swapchain) = {
            let mut builder = PassBuilder::new(&name, &mut self.resources);
            callback.setup(&mut builder);
            builder.finish()
        };
        log::debug!(
            "Render graph: added pass '{}' ({} inputs, {} outputs{})",
            name,
            inputs.len(),
            outputs.len(),
            if swapchain { ", swapchain" } else { "" }
        );

        self.nodes.push(RenderGraphNode {
            name,
            inputs,
            outputs,
            swapchain,
            enabled: true,
            dependents: BTreeSet::new(),
            resolved: BTreeMap::new(),
            render_targets: Vec::new(),
            pass: None,
            callback,
        });
        self.dirty = true;
        Ok(())
    }

    /// Make an existing texture available to every pass by name.
    pub fn import_texture(&mut self, name: &str, texture: TextureHandle) -> bool {
        let declared = node::declare(&mut self.resources, node::imported_texture(name, texture));
        self.dirty |= declared;
        declared
    }

    /// Make a buffer set available to every pass by name.
    pub fn import_buffer_set(&mut self, name: &str, set: Arc<BufferSet>) -> bool {
        let declared =
            node::declare(&mut self.resources, node::imported_buffer_set(name, set));
        self.dirty |= declared;
        declared
    }

    /// Force a full compile before the next execute.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty || !self.compiled
    }

    pub fn pass_count(&self) -> usize {
        self.nodes.len()
    }

    /// Disabled passes stay in the order but are skipped by execute.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.nodes.iter_mut().find(|n| n.name == name) {
            Some(node) => {
                node.enabled = enabled;
                true
            }
            None => {
                log::warn!("Render graph: no pass named '{}'", name);
                false
            }
        }
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n.name == name && n.enabled)
    }

    /// Pass names in execution order, as of the last compile.
    pub fn sorted_passes(&self) -> Vec<&str> {
        self.sorted
            .iter()
            .map(|&i| self.nodes[i].name.as_str())
            .collect()
    }

    /// Passes consuming an attachment `name` produces.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .map(|n| n.dependents.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Look a resource up by name, creating an empty placeholder for
    /// unknown names.
    pub fn resource(&mut self, name: &str) -> &RenderGraphResource {
        self.resources.entry(name.to_string()).or_insert_with(|| {
            log::warn!("Render graph: unknown resource '{}', adding a placeholder", name);
            RenderGraphResource::placeholder(name)
        })
    }

    pub fn find_resource(&self, name: &str) -> Option<&RenderGraphResource> {
        self.resources.get(name)
    }

    /// Texture currently backing `name`.
    pub fn texture(&self, name: &str) -> Option<TextureHandle> {
        self.resources.get(name).and_then(RenderGraphResource::texture)
    }

    /// What `input` of `pass` was bound to on the last compile.
    pub fn resolved_input(&self, pass: &str, input: &str) -> Option<ResolvedInput> {
        self.nodes
            .iter()
            .find(|n| n.name == pass)
            .and_then(|n| n.resolved.get(input).cloned())
    }

    pub fn pass(&self, name: &str) -> Option<&RenderPass> {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .and_then(|n| n.pass.as_ref())
    }

    /// Derive edges, order the passes, materialize resources and build
    /// framebuffers.
    pub fn compile(&mut self, device: &RenderDevice) -> GraphicsResult<()> {
        let Self {
            nodes,
            resources,
            sorted,
            ..
        } = self;

        let index: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.as_str(), i))
            .collect();
        let mut edges: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); nodes.len()];
        for (consumer, node) in nodes.iter().enumerate() {
            for input in &node.inputs {
                let Some(resource) = resources.get(&input.resource) else {
                    continue;
                };
                if resource.kind != ResourceKind::Attachment {
                    continue;
                }
                let producer = resource
                    .producer
                    .as_deref()
                    .and_then(|p| index.get(p).copied());
                if let Some(producer) = producer {
                    if producer != consumer {
                        edges[producer].insert(consumer);
                    }
                }
            }
        }

        let names: Vec<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
        let adjacency: Vec<Vec<usize>> =
            edges.iter().map(|e| e.iter().copied().collect()).collect();
        let order = match topological_order(&names, &adjacency) {
            Ok(order) => order,
            Err(e) => {
                log::error!("Render graph: {}", e);
                return Err(e.into());
            }
        };
        let dependents: Vec<BTreeSet<String>> = edges
            .iter()
            .map(|e| e.iter().map(|&i| nodes[i].name.clone()).collect())
            .collect();
        for (node, deps) in nodes.iter_mut().zip(dependents) {
            node.dependents = deps;
        }

        // sampled inputs add no edges, so every output exists before any
        // pass resolves its inputs
        for &idx in &order {
            for output in &nodes[idx].outputs {
                if let Some(ResourceInfo::Lazy { spec, texture }) =
                    resources.get_mut(output).map(|r| &mut r.info)
                {
                    ensure_texture(device, output, spec, texture)?;
                }
            }
        }
        for &idx in &order {
            let node = &mut nodes[idx];
            materialize(device, node, resources)?;
        }
        for &idx in &order {
            let node = &mut nodes[idx];
            if let Some(pass) = node.pass.as_mut() {
                pass.update_render_targets(node.render_targets.clone(), device.textures())?;
                pass.verify();
            }
        }

        *sorted = order;
        self.dirty = false;
        self.compiled = true;
        log::debug!("Render graph compiled: {}", self.sorted_passes().join(" -> "));
        Ok(())
    }

    /// Record every enabled pass into `cmd`.
    pub fn execute(
        &mut self,
        device: &RenderDevice,
        cmd: &CommandBuffer,
        frame_index: u32,
        image_index: u32,
        inputs: FrameInputs<'_>,
    ) -> GraphicsResult<()> {
        gfx_validate!(!self.is_dirty(), "Render graph executed before compile");
        self.rebind_swapped(device);

        let Self {
            nodes,
            resources,
            sorted,
            layouts,
            ..
        } = self;

        for &idx in sorted.iter() {
            let node = &mut nodes[idx];
            if !node.enabled {
                log::trace!("Render graph: skipping disabled pass '{}'", node.name);
                continue;
            }

            let mut batch = BarrierBatch::new();
            for input in &node.inputs {
                let as_attachment = match input.usage {
                    InputUsage::BufferSet => continue,
                    InputUsage::Sampled => false,
                    InputUsage::Attachment => true,
                };
                let Some(resource) = resources.get(&input.resource) else {
                    continue;
                };
                let Some((image, format)) = image_of(device, resource) else {
                    continue;
                };
                let new_layout = if as_attachment {
                    ImageLayout::attachment_for(format)
                } else {
                    ImageLayout::ShaderReadOnly
                };
                batch.transition(
                    layouts,
                    image,
                    format,
                    inferred_layout(resource, format),
                    new_layout,
                );
            }
            if !node.swapchain {
                for output in &node.outputs {
                    let Some(resource) = resources.get(output) else {
                        continue;
                    };
                    let Some((image, format)) = image_of(device, resource) else {
                        continue;
                    };
                    // contents of an untracked output are about to be overwritten
                    batch.transition(
                        layouts,
                        image,
                        format,
                        ImageLayout::Undefined,
                        ImageLayout::attachment_for(format),
                    );
                }
            }
            batch.submit(cmd);

            let pass = match node.pass.as_mut() {
                Some(pass) => pass,
                None => {
                    gfx_validate!(false, "Render pass '{}' was never baked", node.name);
                    continue;
                }
            };
            node.callback.execute(&mut ExecuteContext {
                device,
                pass: &mut *pass,
                frame_index,
                inputs,
                resolved: &node.resolved,
            })?;

            pass.begin(cmd, frame_index, image_index);
            node.callback.render(&mut RenderContext {
                device,
                cmd,
                pass,
                frame_index,
                inputs,
            });
            pass.end(cmd);
        }
        Ok(())
    }

    /// Rebind passes sampling a texture whose image was swapped since the
    /// last frame, and stop tracking the retired images.
    fn rebind_swapped(&mut self, device: &RenderDevice) {
        let swaps = device.take_texture_swaps();
        if swaps.is_empty() {
            return;
        }
        for swap in &swaps {
            self.layouts.forget(swap.retired);
        }
        for node in &mut self.nodes {
            let affected = node.resolved.values().any(|input| match input {
                ResolvedInput::Texture(handle) => swaps.iter().any(|s| s.texture == *handle),
                ResolvedInput::Buffers(_) => false,
            });
            if let (true, Some(pass)) = (affected, node.pass.as_mut()) {
                log::debug!("Render graph: rebinding '{}' after a texture swap", node.name);
                bind_inputs(device, pass, &node.resolved);
            }
        }
    }

    /// Recreate every graph-owned output at `width` x `height`.
    ///
    /// Texture handles stay valid: the table entry is swapped in place and
    /// the old image retired. Pass order is not recomputed.
    pub fn resize(
        &mut self,
        device: &RenderDevice,
        width: u32,
        height: u32,
    ) -> GraphicsResult<()> {
        if width == 0 || height == 0 {
            log::debug!("Render graph: ignoring resize to {}x{}", width, height);
            return Ok(());
        }
        let compiled = self.compiled;

        let Self {
            nodes,
            resources,
            sorted,
            layouts,
            ..
        } = self;

        if !compiled {
            for resource in resources.values_mut() {
                if let ResourceInfo::Lazy { spec, .. } = &mut resource.info {
                    spec.width = width;
                    spec.height = height;
                }
            }
            return Ok(());
        }

        for &idx in sorted.iter() {
            let node = &nodes[idx];
            for output in &node.outputs {
                let Some(resource) = resources.get_mut(output) else {
                    continue;
                };
                let ResourceInfo::Lazy { spec, texture } = &mut resource.info else {
                    continue;
                };
                if spec.extent() == (width, height) && device.textures().is_valid(*texture) {
                    continue;
                }
                spec.width = width;
                spec.height = height;

                let image = device
                    .allocator()
                    .create_image(&spec.descriptor(output), &SamplerDescriptor::default())?;
                match device.textures().update(*texture, image) {
                    Ok(old) => {
                        layouts.forget(old.image);
                        device.allocator().retire_image(old);
                    }
                    Err(image) => *texture = device.register_texture(image)?,
                }
                log::debug!("Render graph: resized '{}' to {}x{}", output, width, height);
            }
        }

        // inputs may sample outputs of passes ordered after them
        for &idx in sorted.iter() {
            let node = &mut nodes[idx];
            if let Some(pass) = node.pass.as_mut() {
                bind_inputs(device, pass, &node.resolved);
                pass.update_render_targets(node.render_targets.clone(), device.textures())?;
            }
        }
        Ok(())
    }

    /// Retire every pass and every texture the graph created.
    pub fn release(&mut self, device: &RenderDevice) {
        for node in &mut self.nodes {
            node.callback.release(device);
            if let Some(mut pass) = node.pass.take() {
                pass.release();
            }
            node.resolved.clear();
            node.render_targets.clear();
        }
        for resource in self.resources.values_mut() {
            if let ResourceInfo::Lazy { texture, .. } = &mut resource.info {
                device.release_texture(texture);
            }
        }
        self.layouts.reset();
        self.sorted.clear();
        self.compiled = false;
        log::debug!("Render graph released ({} passes)", self.nodes.len());
    }
}

/// Resolve a node's resources, bake its pass and bind its inputs.
fn materialize(
    device: &RenderDevice,
    node: &mut RenderGraphNode,
    resources: &mut HashMap<String, RenderGraphResource>,
) -> GraphicsResult<()> {
    let mut layout = RenderPassLayout::default();
    let mut colors = Vec::new();
    let mut depth = None;
    node.resolved.clear();

    for output in &node.outputs {
        let resource = resources
            .entry(output.clone())
            .or_insert_with(|| RenderGraphResource::placeholder(output));
        let (handle, load, store) = match &mut resource.info {
            ResourceInfo::Lazy { spec, texture } => {
                ensure_texture(device, output, spec, texture)?;
                (*texture, spec.load, spec.store)
            }
            ResourceInfo::External(texture) => {
                let format = device.texture_or_fallback(*texture).format();
                (*texture, LoadOp::Clear(default_clear(format)), StoreOp::Store)
            }
            _ => {
                return Err(GraphError::UnresolvedResource {
                    pass: node.name.clone(),
                    resource: output.clone(),
                }
                .into());
            }
        };
        if node.swapchain {
            log::warn!(
                "Render graph: swapchain pass '{}' ignores output '{}'",
                node.name,
                output
            );
            continue;
        }
        let format = device.texture_or_fallback(handle).format();
        push_target(&node.name, &mut layout, &mut colors, &mut depth, handle, format, load, store);
    }

    for input in &node.inputs {
        let resource = resources.entry(input.resource.clone()).or_insert_with(|| {
            log::warn!(
                "Render graph: pass '{}' reads unknown resource '{}', adding a placeholder",
                node.name,
                input.resource
            );
            RenderGraphResource::placeholder(&input.resource)
        });
        match input.usage {
            InputUsage::Attachment => {
                let Some(handle) = resource.texture() else {
                    return Err(GraphError::UnresolvedResource {
                        pass: node.name.clone(),
                        resource: input.resource.clone(),
                    }
                    .into());
                };
                if !node.swapchain {
                    let format = device.texture_or_fallback(handle).format();
                    push_target(
                        &node.name,
                        &mut layout,
                        &mut colors,
                        &mut depth,
                        handle,
                        format,
                        LoadOp::Load,
                        StoreOp::Store,
                    );
                }
                node.resolved
                    .insert(input.resource.clone(), ResolvedInput::Texture(handle));
            }
            InputUsage::Sampled => {
                let handle = resource.texture().unwrap_or_else(|| {
                    log::warn!(
                        "Render graph: '{}' has no texture yet, pass '{}' samples the fallback",
                        input.resource,
                        node.name
                    );
                    device.fallback_texture()
                });
                node.resolved
                    .insert(input.resource.clone(), ResolvedInput::Texture(handle));
            }
            InputUsage::BufferSet => match resource.buffers() {
                Some(set) => {
                    node.resolved.insert(
                        input.resource.clone(),
                        ResolvedInput::Buffers(Arc::clone(set)),
                    );
                }
                None => log::warn!(
                    "Render graph: '{}' is not a buffer set, pass '{}' leaves it unbound",
                    input.resource,
                    node.name
                ),
            },
        }
    }

    let target = if node.swapchain {
        PassTarget::Swapchain {
            clear: ClearValue::BLACK,
        }
    } else {
        if colors.is_empty() && depth.is_none() {
            return Err(GraphError::NoRenderTargets(node.name.clone()).into());
        }
        PassTarget::Offscreen(layout)
    };
    node.render_targets = colors.into_iter().chain(depth).collect();

    let mut ctx = CompileContext {
        device,
        name: &node.name,
        target: &target,
        pass: &mut node.pass,
        resolved: &node.resolved,
    };
    node.callback.compile(&mut ctx)?;

    let Some(pass) = node.pass.as_mut() else {
        return Err(GraphError::NotBaked(node.name.clone()).into());
    };
    bind_inputs(device, pass, &node.resolved);
    Ok(())
}

/// Create the texture behind a graph output unless a matching one exists.
fn ensure_texture(
    device: &RenderDevice,
    name: &str,
    spec: &TextureSpec,
    texture: &mut TextureHandle,
) -> GraphicsResult<()> {
    let reusable = device
        .textures()
        .try_access(*texture)
        .map_or(false, |image| image.extent() == spec.extent());
    if !reusable {
        device.release_texture(texture);
        *texture = device.create_texture(&spec.descriptor(name))?;
        log::debug!(
            "Render graph: created '{}' {}x{} {:?}",
            name,
            spec.width,
            spec.height,
            spec.format
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn push_target(
    pass: &str,
    layout: &mut RenderPassLayout,
    colors: &mut Vec<TextureHandle>,
    depth: &mut Option<TextureHandle>,
    handle: TextureHandle,
    format: TextureFormat,
    load: LoadOp,
    store: StoreOp,
) {
    let attachment = PassTarget::attachment(format, load, store);
    if format.is_depth() {
        if depth.is_some() {
            log::error!("Render graph: pass '{}' has more than one depth target", pass);
            return;
        }
        layout.depth = Some(attachment);
        *depth = Some(handle);
    } else {
        layout.colors.push(attachment);
        colors.push(handle);
    }
}

/// Bind every resolved input the pass's pipeline declares a binding for.
fn bind_inputs(
    device: &RenderDevice,
    pass: &mut RenderPass,
    resolved: &BTreeMap<String, ResolvedInput>,
) {
    for (name, input) in resolved {
        let Some(ty) = pass.pipeline().binding(name).map(|b| b.ty) else {
            continue;
        };
        match input {
            ResolvedInput::Texture(handle) => {
                let image = device.texture_or_fallback(*handle);
                pass.set_input(name, InputBinding::Texture(&image));
            }
            ResolvedInput::Buffers(set) => {
                let binding = if ty == DescriptorType::StorageBuffer {
                    InputBinding::StorageBufferSet(set)
                } else {
                    InputBinding::UniformBufferSet(set)
                };
                pass.set_input(name, binding);
            }
        }
    }
}

fn default_clear(format: TextureFormat) -> ClearValue {
    if format.is_depth() {
        ClearValue::DEPTH_ONE
    } else {
        ClearValue::BLACK
    }
}

fn image_of(
    device: &RenderDevice,
    resource: &RenderGraphResource,
) -> Option<(NativeHandle, TextureFormat)> {
    let handle = resource.texture()?;
    let image = device.textures().try_access(handle)?;
    Some((image.image, image.format()))
}

/// Layout assumed for an input the tracker has not seen yet.
///
/// Attachments with a producer were last rendered into; imported textures
/// were left shader-readable by their upload.
fn inferred_layout(resource: &RenderGraphResource, format: TextureFormat) -> ImageLayout {
    if resource.producer.is_some() {
        ImageLayout::attachment_for(format)
    } else if resource.kind == ResourceKind::Texture && resource.is_external() {
        ImageLayout::ShaderReadOnly
    } else {
        ImageLayout::Undefined
    }
}
