//! GPU copies of the scene's vertex and index data.

use crate::backend::{BufferUsage, IndexFormat, MemoryPlacement};
use crate::commands::CommandBuffer;
use crate::error::GraphicsResult;
use crate::resources::{BufferView, ResourceAllocator};

use super::SceneRawData;

/// Vertex and index buffers mirroring a [`SceneRawData`].
///
/// Rebuilt only when the scene's geometry revision changes; buffers whose
/// size changes are replaced and the old ones retired by the allocator.
#[derive(Debug, Default)]
pub struct SceneGeometry {
    vertex_buffer: Option<BufferView>,
    index_buffer: Option<BufferView>,
    revision: Option<u64>,
    index_count: u32,
}

impl SceneGeometry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revision(&self) -> Option<u64> {
        self.revision
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn vertex_buffer(&self) -> Option<&BufferView> {
        self.vertex_buffer.as_ref()
    }

    pub fn index_buffer(&self) -> Option<&BufferView> {
        self.index_buffer.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.index_count == 0
    }

    /// Upload the scene's geometry if it changed since the last sync.
    ///
    /// Returns whether anything was uploaded.
    pub fn sync(
        &mut self,
        allocator: &ResourceAllocator,
        scene: &SceneRawData,
    ) -> GraphicsResult<bool> {
        if self.revision == Some(scene.geometry_revision) {
            return Ok(false);
        }
        log::debug!(
            "SceneGeometry: uploading revision {} ({} vertices, {} indices)",
            scene.geometry_revision,
            scene.vertices.len(),
            scene.indices.len()
        );

        if scene.vertices.is_empty() || scene.indices.is_empty() {
            self.release(allocator);
        } else {
            Self::upload(allocator, &mut self.vertex_buffer, &scene.vertices, BufferUsage::VERTEX)?;
            Self::upload(allocator, &mut self.index_buffer, &scene.indices, BufferUsage::INDEX)?;
            self.index_count = scene.indices.len() as u32;
        }
        self.revision = Some(scene.geometry_revision);
        Ok(true)
    }

    fn upload<T: bytemuck::Pod>(
        allocator: &ResourceAllocator,
        slot: &mut Option<BufferView>,
        data: &[T],
        usage: BufferUsage,
    ) -> GraphicsResult<()> {
        match slot {
            Some(view) => allocator.upload_slice(view, data),
            None => {
                *slot =
                    Some(allocator.create_buffer_with_data(data, usage, MemoryPlacement::Auto)?);
                Ok(())
            }
        }
    }

    /// Bind both buffers; returns `false` when there is nothing to draw.
    pub fn bind(&self, cmd: &CommandBuffer) -> bool {
        match (&self.vertex_buffer, &self.index_buffer) {
            (Some(vertices), Some(indices)) if self.index_count > 0 => {
                cmd.bind_vertex_buffer(vertices.handle, 0);
                cmd.bind_index_buffer(indices.handle, 0, IndexFormat::Uint32);
                true
            }
            _ => false,
        }
    }

    pub fn release(&mut self, allocator: &ResourceAllocator) {
        if let Some(view) = self.vertex_buffer.take() {
            allocator.retire_buffer(view);
        }
        if let Some(view) = self.index_buffer.take() {
            allocator.retire_buffer(view);
        }
        self.index_count = 0;
        self.revision = None;
    }
}
