//! Forward shading pass

use bytemuck::{Pod, Zeroable};

use crate::backend::{
    BufferUsage, CompareFunction, CullMode, DescriptorType, PipelineDescriptor, ShaderBinding,
    ShaderSource, TextureFormat, Vertex,
};
use crate::device::RenderDevice;
use crate::error::GraphicsResult;
use crate::graph::{
    CompileContext, ExecuteContext, GraphPass, PassBuilder, RenderContext, TextureSpec,
};
use crate::pass::InputBinding;
use crate::resources::BufferSet;
use crate::scene::{DrawConstants, GpuLightData, GpuMaterialData, MAX_LIGHTS, MAX_MATERIALS};

use super::{CAMERA_RESOURCE, COLOR_RESOURCE, DEPTH_RESOURCE};

const LIGHTS_BINDING: &str = "lights";
const MATERIALS_BINDING: &str = "materials";

/// Leads the light storage buffer, followed by `count` [`GpuLightData`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct LightsHeader {
    count: u32,
    _padding: [u32; 3],
}

/// Forward pass
///
/// Shades the scene into [`COLOR_RESOURCE`], depth-testing against the
/// prepass output without writing it. Light and material tables live in
/// storage buffer sets owned by the pass and are refreshed every frame
/// along with the camera.
pub struct ForwardPass {
    vertex: ShaderSource,
    fragment: ShaderSource,
    width: u32,
    height: u32,
    lights: Option<BufferSet>,
    materials: Option<BufferSet>,
}

impl ForwardPass {
    pub const NAME: &'static str = "forward";

    pub fn new(vertex: ShaderSource, fragment: ShaderSource, width: u32, height: u32) -> Self {
        Self {
            vertex,
            fragment,
            width,
            height,
            lights: None,
            materials: None,
        }
    }

    fn pipeline(&self) -> PipelineDescriptor {
        PipelineDescriptor::new(Self::NAME, self.vertex.clone())
            .with_fragment(self.fragment.clone())
            .with_vertex_layout(Vertex::layout())
            .with_binding(ShaderBinding::new(
                CAMERA_RESOURCE,
                0,
                0,
                DescriptorType::UniformBuffer,
            ))
            .with_binding(ShaderBinding::new(
                LIGHTS_BINDING,
                0,
                1,
                DescriptorType::StorageBuffer,
            ))
            .with_binding(ShaderBinding::new(
                MATERIALS_BINDING,
                0,
                2,
                DescriptorType::StorageBuffer,
            ))
            .with_push_constants(std::mem::size_of::<DrawConstants>() as u32)
            .with_depth(CompareFunction::LessEqual, false)
            .with_cull_mode(CullMode::Back)
    }

    fn lights_size() -> u64 {
        (std::mem::size_of::<LightsHeader>() + MAX_LIGHTS * std::mem::size_of::<GpuLightData>())
            as u64
    }

    fn materials_size() -> u64 {
        (MAX_MATERIALS * std::mem::size_of::<GpuMaterialData>()) as u64
    }
}

impl GraphPass for ForwardPass {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn setup(&mut self, builder: &mut PassBuilder) {
        builder
            .input_attachment(DEPTH_RESOURCE)
            .output(
                COLOR_RESOURCE,
                TextureSpec::color(self.width, self.height, TextureFormat::Rgba16Float),
            )
            .input_buffer_set(CAMERA_RESOURCE);
    }

    fn compile(&mut self, ctx: &mut CompileContext) -> GraphicsResult<()> {
        let allocator = ctx.device().allocator();
        if self.lights.is_none() {
            self.lights =
                Some(allocator.create_buffer_set(Self::lights_size(), BufferUsage::STORAGE)?);
        }
        if self.materials.is_none() {
            self.materials =
                Some(allocator.create_buffer_set(Self::materials_size(), BufferUsage::STORAGE)?);
        }

        let descriptor = self.pipeline();
        let pass = ctx.bake(descriptor)?;
        if let Some(lights) = &self.lights {
            pass.set_input(LIGHTS_BINDING, InputBinding::StorageBufferSet(lights));
        }
        if let Some(materials) = &self.materials {
            pass.set_input(MATERIALS_BINDING, InputBinding::StorageBufferSet(materials));
        }
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecuteContext) -> GraphicsResult<()> {
        let camera = ctx.inputs.camera.uniform();
        if !ctx.write_buffer_set(CAMERA_RESOURCE, bytemuck::bytes_of(&camera))? {
            log::trace!("ForwardPass: no camera buffer set bound");
        }

        let backend = ctx.device.backend().as_ref();
        if let Some(lights) = &self.lights {
            let data = ctx.inputs.scene.gpu_lights();
            let header = LightsHeader {
                count: data.len() as u32,
                _padding: [0; 3],
            };
            let mut bytes = bytemuck::bytes_of(&header).to_vec();
            bytes.extend_from_slice(bytemuck::cast_slice(&data));
            lights.write(backend, ctx.frame_index, &bytes)?;
        }
        if let Some(materials) = &self.materials {
            let data = ctx.inputs.scene.gpu_materials();
            if !data.is_empty() {
                materials.write(backend, ctx.frame_index, bytemuck::cast_slice(&data))?;
            }
        }
        Ok(())
    }

    fn render(&mut self, ctx: &mut RenderContext) {
        let scene = ctx.inputs.scene;
        if !ctx.inputs.geometry.bind(ctx.cmd) {
            return;
        }
        let layout = ctx.pass.pipeline().layout();
        for draw in &scene.draws {
            let constants = scene.draw_constants(draw);
            ctx.cmd.push_constants(layout, bytemuck::bytes_of(&constants));
            ctx.cmd
                .draw_indexed(draw.index_count, draw.first_index, draw.vertex_offset, 0);
        }
    }

    fn release(&mut self, device: &RenderDevice) {
        if let Some(set) = self.lights.take() {
            device.allocator().retire_buffer_set(set);
        }
        if let Some(set) = self.materials.take() {
            device.allocator().retire_buffer_set(set);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_light_buffer_layout() {
        assert_eq!(std::mem::size_of::<LightsHeader>(), 16);
        assert_eq!(
            ForwardPass::lights_size(),
            16 + (MAX_LIGHTS * std::mem::size_of::<GpuLightData>()) as u64
        );
    }
}
