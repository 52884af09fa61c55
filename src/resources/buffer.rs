//! Buffer views and per-frame buffer sets.

use crate::backend::{BufferUsage, GpuBackend, MemoryPlacement, NativeHandle};
use crate::error::{GraphicsError, GraphicsResult};

/// A native buffer as handed out by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferView {
    pub handle: NativeHandle,
    pub size: u64,
    pub usage: BufferUsage,
    pub placement: MemoryPlacement,
    pub host_visible: bool,
    /// Frame-in-flight index current when the buffer was created.
    pub frame_index: u32,
}

impl BufferView {
    pub fn is_null(&self) -> bool {
        self.handle.is_null()
    }
}

/// One host-visible buffer per frame in flight.
///
/// Per-frame data (camera, transforms, lights) is written into the copy
/// owned by the frame being recorded, so the GPU never reads a buffer the
/// CPU is overwriting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSet {
    buffers: Vec<BufferView>,
}

impl BufferSet {
    pub(crate) fn new(buffers: Vec<BufferView>) -> Self {
        Self { buffers }
    }

    pub fn get(&self, frame_index: u32) -> &BufferView {
        &self.buffers[frame_index as usize % self.buffers.len()]
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferView> {
        self.buffers.iter()
    }

    /// Size in bytes of each copy.
    pub fn size(&self) -> u64 {
        self.buffers.first().map_or(0, |b| b.size)
    }

    pub fn usage(&self) -> Option<BufferUsage> {
        self.buffers.first().map(|b| b.usage)
    }

    /// Write `bytes` into the copy for `frame_index`.
    pub fn write(
        &self,
        backend: &dyn GpuBackend,
        frame_index: u32,
        bytes: &[u8],
    ) -> GraphicsResult<()> {
        let target = self.get(frame_index);
        if bytes.len() as u64 > target.size {
            return Err(GraphicsError::BufferTooSmall {
                capacity: target.size,
                requested: bytes.len() as u64,
            });
        }
        backend.write_buffer(target.handle, 0, bytes)
    }

    pub(crate) fn into_buffers(self) -> Vec<BufferView> {
        self.buffers
    }
}
