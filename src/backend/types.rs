//! Plain-data descriptions shared by every backend

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgba16Float,
    Rgba32Float,
    Depth32Float,
    Depth24PlusStencil8,
    R32Float,
    Rg32Float,
}

impl TextureFormat {
    pub fn is_depth(&self) -> bool {
        matches!(
            self,
            TextureFormat::Depth32Float | TextureFormat::Depth24PlusStencil8
        )
    }

    pub fn has_stencil(&self) -> bool {
        matches!(self, TextureFormat::Depth24PlusStencil8)
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Bgra8UnormSrgb
            | TextureFormat::Depth32Float
            | TextureFormat::Depth24PlusStencil8
            | TextureFormat::R32Float => 4,
            TextureFormat::Rgba16Float | TextureFormat::Rg32Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }
}

/// Texture usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureUsage(u32);

impl TextureUsage {
    pub const COPY_SRC: Self = Self(1 << 0);
    pub const COPY_DST: Self = Self(1 << 1);
    pub const TEXTURE_BINDING: Self = Self(1 << 2);
    pub const STORAGE_BINDING: Self = Self(1 << 3);
    pub const RENDER_ATTACHMENT: Self = Self(1 << 4);

    /// Render target that later passes sample from.
    pub const ATTACHMENT_SAMPLED: Self = Self((1 << 4) | (1 << 2));

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for TextureUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Buffer usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferUsage(u32);

impl BufferUsage {
    pub const COPY_SRC: Self = Self(1 << 0);
    pub const COPY_DST: Self = Self(1 << 1);
    pub const INDEX: Self = Self(1 << 2);
    pub const VERTEX: Self = Self(1 << 3);
    pub const UNIFORM: Self = Self(1 << 4);
    pub const STORAGE: Self = Self(1 << 5);
    pub const INDIRECT: Self = Self(1 << 6);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for BufferUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Where a buffer's memory should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryPlacement {
    /// Device-local when the backend can, host-visible otherwise.
    #[default]
    Auto,
    /// Persistently mapped, CPU writable.
    HostVisible,
    /// Only reachable through transfer commands.
    DeviceLocal,
}

/// Texture descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct TextureDescriptor {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl TextureDescriptor {
    pub fn new(width: u32, height: u32, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            label: None,
            width,
            height,
            format,
            usage,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Bytes needed for a tightly packed upload of the whole image.
    pub fn byte_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.format.bytes_per_pixel() as u64
    }
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
        }
    }
}

/// Buffer descriptor
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsage,
    pub placement: MemoryPlacement,
}

/// Vertex attribute format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32,
}

impl VertexFormat {
    pub fn size(&self) -> u64 {
        match self {
            VertexFormat::Float32 | VertexFormat::Uint32 => 4,
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }
}

/// Vertex attribute description
#[derive(Debug, Clone)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u64,
}

/// Vertex buffer layout
#[derive(Debug, Clone)]
pub struct VertexBufferLayout {
    pub array_stride: u64,
    pub attributes: Vec<VertexAttribute>,
}

/// Standard vertex with position, normal, UV, and tangent
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
    pub tangent: Vec4,
}

impl Vertex {
    pub fn new(position: Vec3, normal: Vec3, uv: Vec2) -> Self {
        Self {
            position,
            normal,
            uv,
            tangent: Vec4::new(1.0, 0.0, 0.0, 1.0),
        }
    }

    pub fn layout() -> VertexBufferLayout {
        VertexBufferLayout {
            array_stride: std::mem::size_of::<Self>() as u64,
            attributes: vec![
                VertexAttribute {
                    location: 0,
                    format: VertexFormat::Float32x3,
                    offset: 0,
                },
                VertexAttribute {
                    location: 1,
                    format: VertexFormat::Float32x3,
                    offset: 12,
                },
                VertexAttribute {
                    location: 2,
                    format: VertexFormat::Float32x2,
                    offset: 24,
                },
                VertexAttribute {
                    location: 3,
                    format: VertexFormat::Float32x4,
                    offset: 32,
                },
            ],
        }
    }
}

/// Index element width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

/// Primitive topology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveTopology {
    LineList,
    TriangleList,
    TriangleStrip,
}

/// Front face winding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontFace {
    Ccw,
    Cw,
}

/// Cull mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullMode {
    None,
    Front,
    Back,
}

/// Compare function for depth tests and shadow samplers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

/// Blend factor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SrcAlpha,
    OneMinusSrcAlpha,
}

/// Blend state applied to every color target of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendState {
    pub src_color: BlendFactor,
    pub dst_color: BlendFactor,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
}

impl BlendState {
    pub fn alpha_blending() -> Self {
        Self {
            src_color: BlendFactor::SrcAlpha,
            dst_color: BlendFactor::OneMinusSrcAlpha,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::OneMinusSrcAlpha,
        }
    }
}

/// Shader stage visibility flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderStages(u32);

impl ShaderStages {
    pub const VERTEX: Self = Self(1 << 0);
    pub const FRAGMENT: Self = Self(1 << 1);
    pub const COMPUTE: Self = Self(1 << 2);
    pub const VERTEX_FRAGMENT: Self = Self((1 << 0) | (1 << 1));

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for ShaderStages {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Filter mode for samplers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Nearest,
    Linear,
}

/// Address mode for samplers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    ClampToEdge,
    Repeat,
    MirrorRepeat,
}

/// Sampler descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerDescriptor {
    pub label: Option<String>,
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub mipmap_filter: FilterMode,
    pub address_mode: AddressMode,
    pub compare: Option<CompareFunction>,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            mipmap_filter: FilterMode::Linear,
            address_mode: AddressMode::ClampToEdge,
            compare: None,
        }
    }
}

/// What happens to an attachment when its render pass begins
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOp {
    Load,
    Clear(ClearValue),
    DontCare,
}

/// What happens to an attachment when its render pass ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Store,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    pub const BLACK: Self = Self::Color([0.0, 0.0, 0.0, 1.0]);
    pub const DEPTH_ONE: Self = Self::DepthStencil {
        depth: 1.0,
        stencil: 0,
    };
}

/// Image layout states a texture moves through during a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageLayout {
    #[default]
    Undefined,
    ColorAttachment,
    DepthStencilAttachment,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    PresentSrc,
    General,
}

impl ImageLayout {
    /// Attachment-optimal layout for a texture of `format`.
    pub fn attachment_for(format: TextureFormat) -> Self {
        if format.is_depth() {
            Self::DepthStencilAttachment
        } else {
            Self::ColorAttachment
        }
    }
}

/// Descriptor kinds a shader binding can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    UniformBuffer,
    StorageBuffer,
    CombinedImageSampler,
}

/// One descriptor binding declared by a shader.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderBinding {
    pub name: String,
    pub set: u32,
    pub binding: u32,
    pub ty: DescriptorType,
    /// Array length, greater than one for bindless texture tables.
    pub count: u32,
    pub stages: ShaderStages,
}

impl ShaderBinding {
    pub fn new(name: impl Into<String>, set: u32, binding: u32, ty: DescriptorType) -> Self {
        Self {
            name: name.into(),
            set,
            binding,
            ty,
            count: 1,
            stages: ShaderStages::VERTEX_FRAGMENT,
        }
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }
}

/// Compiled SPIR-V for one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderSource {
    pub spirv: Vec<u32>,
    pub entry_point: String,
}

impl ShaderSource {
    pub fn new(spirv: Vec<u32>) -> Self {
        Self {
            spirv,
            entry_point: "main".to_string(),
        }
    }
}

/// Format and load/store behaviour of one attachment of a render pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttachmentDescription {
    pub format: TextureFormat,
    pub load: LoadOp,
    pub store: StoreOp,
    pub initial_layout: ImageLayout,
    pub final_layout: ImageLayout,
}

/// Attachments of a native render pass
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderPassLayout {
    pub colors: Vec<AttachmentDescription>,
    pub depth: Option<AttachmentDescription>,
}

impl RenderPassLayout {
    pub fn attachment_count(&self) -> usize {
        self.colors.len() + usize::from(self.depth.is_some())
    }

    pub fn clear_values(&self) -> Vec<ClearValue> {
        self.colors
            .iter()
            .map(|c| match c.load {
                LoadOp::Clear(value) => value,
                _ => ClearValue::BLACK,
            })
            .chain(self.depth.iter().map(|d| match d.load {
                LoadOp::Clear(value) => value,
                _ => ClearValue::DEPTH_ONE,
            }))
            .collect()
    }
}

/// Everything needed to bake a graphics pipeline.
#[derive(Debug, Clone)]
pub struct PipelineDescriptor {
    pub label: String,
    pub vertex: ShaderSource,
    pub fragment: Option<ShaderSource>,
    pub vertex_layout: Option<VertexBufferLayout>,
    pub bindings: Vec<ShaderBinding>,
    pub push_constant_size: u32,
    pub topology: PrimitiveTopology,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub depth_test: Option<CompareFunction>,
    pub depth_write: bool,
    pub blend: Option<BlendState>,
}

impl PipelineDescriptor {
    pub fn new(label: impl Into<String>, vertex: ShaderSource) -> Self {
        Self {
            label: label.into(),
            vertex,
            fragment: None,
            vertex_layout: None,
            bindings: Vec::new(),
            push_constant_size: 0,
            topology: PrimitiveTopology::TriangleList,
            cull_mode: CullMode::Back,
            front_face: FrontFace::Ccw,
            depth_test: None,
            depth_write: false,
            blend: None,
        }
    }

    pub fn with_fragment(mut self, fragment: ShaderSource) -> Self {
        self.fragment = Some(fragment);
        self
    }

    pub fn with_vertex_layout(mut self, layout: VertexBufferLayout) -> Self {
        self.vertex_layout = Some(layout);
        self
    }

    pub fn with_binding(mut self, binding: ShaderBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn with_push_constants(mut self, size: u32) -> Self {
        self.push_constant_size = size;
        self
    }

    pub fn with_depth(mut self, compare: CompareFunction, write: bool) -> Self {
        self.depth_test = Some(compare);
        self.depth_write = write;
        self
    }

    pub fn with_cull_mode(mut self, cull_mode: CullMode) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn with_blend(mut self, blend: BlendState) -> Self {
        self.blend = Some(blend);
        self
    }

    /// Highest descriptor set index referenced plus one.
    pub fn set_count(&self) -> u32 {
        self.bindings.iter().map(|b| b.set + 1).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attachment_layout_follows_format() {
        assert_eq!(
            ImageLayout::attachment_for(TextureFormat::Depth32Float),
            ImageLayout::DepthStencilAttachment
        );
        assert_eq!(
            ImageLayout::attachment_for(TextureFormat::Rgba16Float),
            ImageLayout::ColorAttachment
        );
    }

    #[test]
    fn test_set_count() {
        let desc = PipelineDescriptor::new("forward", ShaderSource::new(vec![0x0723_0203]))
            .with_binding(ShaderBinding::new("camera", 0, 0, DescriptorType::UniformBuffer))
            .with_binding(ShaderBinding::new(
                "textures",
                2,
                0,
                DescriptorType::CombinedImageSampler,
            ));
        assert_eq!(desc.set_count(), 3);
    }

    #[test]
    fn test_texture_byte_size() {
        let desc = TextureDescriptor::new(
            4,
            2,
            TextureFormat::Rgba16Float,
            TextureUsage::TEXTURE_BINDING,
        );
        assert_eq!(desc.byte_size(), 64);
        assert_eq!(std::mem::size_of::<Vertex>(), 48);
    }
}
