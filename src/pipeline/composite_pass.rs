//! Final composite into the swapchain

use crate::backend::{
    CullMode, DescriptorType, PipelineDescriptor, ShaderBinding, ShaderSource,
};
use crate::error::GraphicsResult;
use crate::graph::{CompileContext, GraphPass, PassBuilder, RenderContext};

use super::COLOR_RESOURCE;

/// Samples [`COLOR_RESOURCE`] with a fullscreen triangle and writes the
/// acquired swapchain image.
pub struct CompositePass {
    vertex: ShaderSource,
    fragment: ShaderSource,
}

impl CompositePass {
    pub const NAME: &'static str = "composite";

    pub fn new(vertex: ShaderSource, fragment: ShaderSource) -> Self {
        Self { vertex, fragment }
    }
}

impl GraphPass for CompositePass {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn setup(&mut self, builder: &mut PassBuilder) {
        builder.input_texture(COLOR_RESOURCE).present_to_swapchain();
    }

    fn compile(&mut self, ctx: &mut CompileContext) -> GraphicsResult<()> {
        let descriptor = PipelineDescriptor::new(Self::NAME, self.vertex.clone())
            .with_fragment(self.fragment.clone())
            .with_binding(ShaderBinding::new(
                COLOR_RESOURCE,
                0,
                0,
                DescriptorType::CombinedImageSampler,
            ))
            .with_cull_mode(CullMode::None);
        ctx.bake(descriptor)?;
        Ok(())
    }

    fn render(&mut self, ctx: &mut RenderContext) {
        ctx.cmd.draw(3, 1);
    }
}
