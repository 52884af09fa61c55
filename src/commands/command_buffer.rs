//! Command buffer wrapper enforcing the recording state machine.

use std::sync::Arc;

use crate::backend::{
    ClearValue, GpuBackend, GpuCommand, ImageBarrier, IndexFormat, NativeHandle,
};
use crate::error::{GraphicsError, GraphicsResult};
use crate::gfx_validate;

/// Lifecycle state of a [`CommandBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Idle,
    Recording,
    Executable,
    Pending,
    Invalid,
}

/// A native command buffer plus its state.
///
/// `Idle -> begin -> Recording -> end -> Executable -> submit -> Pending`,
/// and back to `Idle` through [`reset_state`](Self::reset_state) once the
/// owning fence has signaled. Recording outside `Recording` is a programmer
/// error and aborts.
pub struct CommandBuffer {
    backend: Arc<dyn GpuBackend>,
    raw: NativeHandle,
    state: CommandBufferState,
}

impl CommandBuffer {
    pub(crate) fn new(backend: Arc<dyn GpuBackend>, raw: NativeHandle) -> Self {
        Self {
            backend,
            raw,
            state: CommandBufferState::Idle,
        }
    }

    pub fn raw(&self) -> NativeHandle {
        self.raw
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == CommandBufferState::Recording
    }

    fn transition(
        &mut self,
        from: CommandBufferState,
        to: CommandBufferState,
        name: &'static str,
    ) -> GraphicsResult<()> {
        if self.state != from {
            return Err(GraphicsError::InvalidCommandBufferState {
                from: self.state,
                to: name,
            });
        }
        self.state = to;
        Ok(())
    }

    pub fn begin(&mut self, one_time: bool) -> GraphicsResult<()> {
        self.transition(
            CommandBufferState::Idle,
            CommandBufferState::Recording,
            "begin",
        )?;
        if let Err(e) = self.backend.begin_command_buffer(self.raw, one_time) {
            self.state = CommandBufferState::Invalid;
            return Err(e);
        }
        Ok(())
    }

    pub fn end(&mut self) -> GraphicsResult<()> {
        self.transition(
            CommandBufferState::Recording,
            CommandBufferState::Executable,
            "end",
        )?;
        if let Err(e) = self.backend.end_command_buffer(self.raw) {
            self.state = CommandBufferState::Invalid;
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn mark_submitted(&mut self) -> GraphicsResult<()> {
        self.transition(
            CommandBufferState::Executable,
            CommandBufferState::Pending,
            "submit",
        )
    }

    /// Return to `Idle`. Only call once the GPU is done with this buffer.
    pub(crate) fn reset_state(&mut self) {
        self.state = CommandBufferState::Idle;
    }

    pub(crate) fn invalidate(&mut self) {
        self.state = CommandBufferState::Invalid;
    }

    pub fn record(&self, command: GpuCommand) {
        gfx_validate!(
            self.state == CommandBufferState::Recording,
            "recording {:?} into command buffer {:?} in state {:?}",
            command,
            self.raw,
            self.state
        );
        self.backend.record(self.raw, &command);
    }

    pub fn pipeline_barrier(&self, barriers: Vec<ImageBarrier>) {
        if !barriers.is_empty() {
            self.record(GpuCommand::PipelineBarrier(barriers));
        }
    }

    pub fn copy_buffer(&self, src: NativeHandle, dst: NativeHandle, size: u64) {
        self.record(GpuCommand::CopyBuffer {
            src,
            dst,
            src_offset: 0,
            dst_offset: 0,
            size,
        });
    }

    pub fn copy_buffer_to_image(
        &self,
        buffer: NativeHandle,
        image: NativeHandle,
        width: u32,
        height: u32,
    ) {
        self.record(GpuCommand::CopyBufferToImage {
            buffer,
            image,
            width,
            height,
        });
    }

    pub fn begin_render_pass(
        &self,
        render_pass: NativeHandle,
        framebuffer: NativeHandle,
        extent: (u32, u32),
        clear_values: Vec<ClearValue>,
    ) {
        self.record(GpuCommand::BeginRenderPass {
            render_pass,
            framebuffer,
            width: extent.0,
            height: extent.1,
            clear_values,
        });
        self.record(GpuCommand::SetViewport {
            width: extent.0,
            height: extent.1,
        });
    }

    pub fn end_render_pass(&self) {
        self.record(GpuCommand::EndRenderPass);
    }

    pub fn bind_pipeline(&self, pipeline: NativeHandle) {
        self.record(GpuCommand::BindPipeline(pipeline));
    }

    pub fn bind_descriptor_sets(
        &self,
        layout: NativeHandle,
        first_set: u32,
        sets: &[NativeHandle],
    ) {
        self.record(GpuCommand::BindDescriptorSets {
            layout,
            first_set,
            sets: sets.to_vec(),
        });
    }

    pub fn bind_vertex_buffer(&self, buffer: NativeHandle, offset: u64) {
        self.record(GpuCommand::BindVertexBuffer { buffer, offset });
    }

    pub fn bind_index_buffer(&self, buffer: NativeHandle, offset: u64, format: IndexFormat) {
        self.record(GpuCommand::BindIndexBuffer {
            buffer,
            offset,
            format,
        });
    }

    pub fn push_constants(&self, layout: NativeHandle, data: &[u8]) {
        self.record(GpuCommand::PushConstants {
            layout,
            offset: 0,
            data: data.to_vec(),
        });
    }

    pub fn draw(&self, vertex_count: u32, instance_count: u32) {
        self.record(GpuCommand::Draw {
            vertex_count,
            instance_count,
            first_vertex: 0,
            first_instance: 0,
        });
    }

    pub fn draw_indexed(
        &self,
        index_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.record(GpuCommand::DrawIndexed {
            index_count,
            instance_count: 1,
            first_index,
            vertex_offset,
            first_instance,
        });
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("raw", &self.raw)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;

    fn command_buffer() -> (Arc<DummyBackend>, CommandBuffer) {
        let backend = Arc::new(DummyBackend::default());
        let pool = backend.create_command_pool(false).unwrap();
        let raw = backend.allocate_command_buffer(pool).unwrap();
        (backend.clone(), CommandBuffer::new(backend, raw))
    }

    #[test]
    fn test_state_machine() {
        let (backend, mut cmd) = command_buffer();
        assert_eq!(cmd.state(), CommandBufferState::Idle);
        assert!(cmd.end().is_err());

        cmd.begin(true).unwrap();
        cmd.draw(3, 1);
        assert!(cmd.begin(true).is_err());
        cmd.end().unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Executable);
        cmd.mark_submitted().unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Pending);
        assert!(cmd.mark_submitted().is_err());
        cmd.reset_state();
        assert_eq!(cmd.state(), CommandBufferState::Idle);

        assert_eq!(
            backend.commands(cmd.raw()),
            vec![GpuCommand::Draw {
                vertex_count: 3,
                instance_count: 1,
                first_vertex: 0,
                first_instance: 0
            }]
        );
    }

    #[test]
    #[should_panic(expected = "in state Executable")]
    fn test_record_after_end_panics() {
        let (_backend, mut cmd) = command_buffer();
        cmd.begin(true).unwrap();
        cmd.end().unwrap();
        cmd.draw(3, 1);
    }

    #[test]
    fn test_empty_barrier_batch_is_skipped() {
        let (backend, mut cmd) = command_buffer();
        cmd.begin(true).unwrap();
        cmd.pipeline_barrier(Vec::new());
        assert!(backend.commands(cmd.raw()).is_empty());
    }
}
