//! Render graph resource definitions

use std::sync::Arc;

use crate::backend::{
    ClearValue, LoadOp, StoreOp, TextureDescriptor, TextureFormat, TextureUsage,
};
use crate::resources::{BufferSet, TextureHandle};

/// What kind of data a named graph resource carries.
///
/// Fixed at declaration. Only attachments written by a pass create
/// producer/consumer edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Attachment,
    Texture,
    BufferSet,
}

/// Description of a texture the graph creates on demand
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureSpec {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
    pub load: LoadOp,
    pub store: StoreOp,
}

impl TextureSpec {
    /// Cleared to black, stored, and sampleable by later passes.
    pub fn color(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            format,
            usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::ATTACHMENT_SAMPLED,
            load: LoadOp::Clear(ClearValue::BLACK),
            store: StoreOp::Store,
        }
    }

    /// Cleared to the far plane and stored.
    pub fn depth(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            format,
            usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::ATTACHMENT_SAMPLED,
            load: LoadOp::Clear(ClearValue::DEPTH_ONE),
            store: StoreOp::Store,
        }
    }

    pub fn with_load(mut self, load: LoadOp) -> Self {
        self.load = load;
        self
    }

    pub fn with_store(mut self, store: StoreOp) -> Self {
        self.store = store;
        self
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn descriptor(&self, label: &str) -> TextureDescriptor {
        TextureDescriptor::new(self.width, self.height, self.format, self.usage).with_label(label)
    }
}

/// Backing data of a graph resource
#[derive(Debug, Clone)]
pub enum ResourceInfo {
    /// Placeholder created by a lookup before any declaration.
    Empty,
    /// Created by the graph at compile time; `texture` is invalid until then.
    Lazy {
        spec: TextureSpec,
        texture: TextureHandle,
    },
    /// Owned by someone else.
    External(TextureHandle),
    Buffers(Arc<BufferSet>),
}

/// A named logical resource of the graph
#[derive(Debug, Clone)]
pub struct RenderGraphResource {
    pub name: String,
    pub kind: ResourceKind,
    /// Pass writing this resource; only set for attachments.
    pub producer: Option<String>,
    pub info: ResourceInfo,
}

impl RenderGraphResource {
    pub(crate) fn placeholder(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ResourceKind::Texture,
            producer: None,
            info: ResourceInfo::Empty,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.info, ResourceInfo::Empty)
    }

    pub fn is_external(&self) -> bool {
        matches!(self.info, ResourceInfo::External(_) | ResourceInfo::Buffers(_))
    }

    /// The texture currently backing the resource, if any.
    pub fn texture(&self) -> Option<TextureHandle> {
        match &self.info {
            ResourceInfo::Lazy { texture, .. } if texture.is_set() => Some(*texture),
            ResourceInfo::External(texture) => Some(*texture),
            _ => None,
        }
    }

    pub fn spec(&self) -> Option<&TextureSpec> {
        match &self.info {
            ResourceInfo::Lazy { spec, .. } => Some(spec),
            _ => None,
        }
    }

    pub fn buffers(&self) -> Option<&Arc<BufferSet>> {
        match &self.info {
            ResourceInfo::Buffers(set) => Some(set),
            _ => None,
        }
    }
}

/// How a pass consumes one of its inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputUsage {
    /// Rendered into again with load semantics.
    Attachment,
    /// Sampled in shaders.
    Sampled,
    /// Bound as a per-frame uniform or storage buffer.
    BufferSet,
}

/// A declared pass input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassInput {
    pub resource: String,
    pub usage: InputUsage,
}
