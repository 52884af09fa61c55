//! Native render pass objects.

use crate::backend::{
    AttachmentDescription, ClearValue, GpuBackend, ImageLayout, LoadOp, NativeHandle,
    ObjectKind, RenderPassLayout, StoreOp, TextureFormat,
};
use crate::deferred::DirtyCollector;
use crate::error::GraphicsResult;

/// Where a pass renders.
#[derive(Debug, Clone, PartialEq)]
pub enum PassTarget {
    /// Into graph-owned textures described by `layout`.
    Offscreen(RenderPassLayout),
    /// Into the acquired swapchain image.
    Swapchain { clear: ClearValue },
}

impl PassTarget {
    /// Attachment description for a render target written by a pass.
    ///
    /// The graph transitions every attachment before the pass begins and
    /// leaves it in the attachment-optimal layout, so both ends of the render
    /// pass use that layout.
    pub fn attachment(
        format: TextureFormat,
        load: LoadOp,
        store: StoreOp,
    ) -> AttachmentDescription {
        let layout = ImageLayout::attachment_for(format);
        AttachmentDescription {
            format,
            load,
            store,
            initial_layout: layout,
            final_layout: layout,
        }
    }
}

/// The render-pass-compatible object a [`RenderPass`](super::RenderPass)
/// begins.
#[derive(Debug)]
pub enum Attachment {
    Offscreen {
        render_pass: NativeHandle,
        layout: RenderPassLayout,
    },
    /// Shared with every other swapchain-backed pass; owned by the backend.
    Swapchain {
        render_pass: NativeHandle,
        clear: ClearValue,
    },
}

impl Attachment {
    pub fn new(backend: &dyn GpuBackend, target: &PassTarget) -> GraphicsResult<Self> {
        match target {
            PassTarget::Offscreen(layout) => Ok(Self::Offscreen {
                render_pass: backend.create_render_pass(layout)?,
                layout: layout.clone(),
            }),
            PassTarget::Swapchain { clear } => Ok(Self::Swapchain {
                render_pass: backend.swapchain_render_pass(),
                clear: *clear,
            }),
        }
    }

    pub fn raw(&self) -> NativeHandle {
        match self {
            Self::Offscreen { render_pass, .. } | Self::Swapchain { render_pass, .. } => {
                *render_pass
            }
        }
    }

    pub fn is_swapchain(&self) -> bool {
        matches!(self, Self::Swapchain { .. })
    }

    pub fn layout(&self) -> Option<&RenderPassLayout> {
        match self {
            Self::Offscreen { layout, .. } => Some(layout),
            Self::Swapchain { .. } => None,
        }
    }

    pub fn clear_values(&self) -> Vec<ClearValue> {
        match self {
            Self::Offscreen { layout, .. } => layout.clear_values(),
            Self::Swapchain { clear, .. } => vec![*clear],
        }
    }

    pub fn release(&self, collector: &DirtyCollector) {
        if let Self::Offscreen { render_pass, .. } = self {
            collector.enqueue(ObjectKind::RenderPass, *render_pass);
        }
    }
}
