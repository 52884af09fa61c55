//! Depth pre-pass for forward rendering

use crate::backend::{
    CompareFunction, CullMode, DescriptorType, PipelineDescriptor, ShaderBinding, ShaderSource,
    TextureFormat, Vertex,
};
use crate::error::GraphicsResult;
use crate::graph::{CompileContext, GraphPass, PassBuilder, RenderContext, TextureSpec};
use crate::scene::DrawConstants;

use super::{CAMERA_RESOURCE, DEPTH_RESOURCE};

/// Depth pre-pass
///
/// Renders every draw of the scene into [`DEPTH_RESOURCE`] with a vertex-only
/// pipeline, so the forward pass only shades visible fragments.
pub struct DepthPrepass {
    vertex: ShaderSource,
    width: u32,
    height: u32,
}

impl DepthPrepass {
    pub const NAME: &'static str = "depth_prepass";

    pub fn new(vertex: ShaderSource, width: u32, height: u32) -> Self {
        Self {
            vertex,
            width,
            height,
        }
    }

    fn pipeline(&self) -> PipelineDescriptor {
        PipelineDescriptor::new(Self::NAME, self.vertex.clone())
            .with_vertex_layout(Vertex::layout())
            .with_binding(ShaderBinding::new(
                CAMERA_RESOURCE,
                0,
                0,
                DescriptorType::UniformBuffer,
            ))
            .with_push_constants(std::mem::size_of::<DrawConstants>() as u32)
            .with_depth(CompareFunction::Less, true)
            .with_cull_mode(CullMode::Back)
    }
}

impl GraphPass for DepthPrepass {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn setup(&mut self, builder: &mut PassBuilder) {
        builder
            .output(
                DEPTH_RESOURCE,
                TextureSpec::depth(self.width, self.height, TextureFormat::Depth32Float),
            )
            .input_buffer_set(CAMERA_RESOURCE);
    }

    fn compile(&mut self, ctx: &mut CompileContext) -> GraphicsResult<()> {
        ctx.bake(self.pipeline())?;
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
}
