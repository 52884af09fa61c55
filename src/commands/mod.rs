//! Command buffer lifetimes: per-frame buffers paced against the swapchain,
//! and instant buffers for synchronous one-shot work.

mod command_buffer;
mod frame_manager;
mod instant;

pub use command_buffer::{CommandBuffer, CommandBufferState};
pub use frame_manager::{FrameManager, FrameStatus, PresentStatus};
pub use instant::{InstantCommandBuffer, InstantCommands};
