//! Built-in forward rendering pipeline
//!
//! 1. Depth prepass - lays down scene depth
//! 2. Forward pass - shades the scene against the prepass depth
//! 3. Composite - copies the shaded color into the swapchain image
//!
//! Shaders are compiled by the caller and handed over as SPIR-V.

pub mod composite_pass;
pub mod depth_prepass;
pub mod forward_pass;

pub use composite_pass::CompositePass;
pub use depth_prepass::DepthPrepass;
pub use forward_pass::ForwardPass;

use crate::backend::ShaderSource;
use crate::error::GraphicsResult;
use crate::graph::RenderGraph;

/// Buffer set holding the [`CameraUniform`](crate::scene::CameraUniform),
/// imported into the graph by the renderer.
pub const CAMERA_RESOURCE: &str = "camera";
/// Scene depth written by the prepass.
pub const DEPTH_RESOURCE: &str = "depth";
/// HDR scene color written by the forward pass.
pub const COLOR_RESOURCE: &str = "color";

/// SPIR-V for every stage of the built-in passes.
#[derive(Debug, Clone)]
pub struct DefaultShaders {
    pub depth_vertex: ShaderSource,
    pub forward_vertex: ShaderSource,
    pub forward_fragment: ShaderSource,
    pub composite_vertex: ShaderSource,
    pub composite_fragment: ShaderSource,
}

/// Add the depth prepass, forward and composite passes to `graph`.
pub fn build_default_graph(
    graph: &mut RenderGraph,
    shaders: DefaultShaders,
    width: u32,
    height: u32,
) -> GraphicsResult<()> {
    graph.add_pass(DepthPrepass::new(shaders.depth_vertex, width, height))?;
    graph.add_pass(ForwardPass::new(
        shaders.forward_vertex,
        shaders.forward_fragment,
        width,
        height,
    ))?;
    graph.add_pass(CompositePass::new(
        shaders.composite_vertex,
        shaders.composite_fragment,
    ))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

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
}
