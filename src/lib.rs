//! RedLilium Render - a render graph driven GPU renderer on top of Vulkan
//!
//! The crate owns the lifecycle of every GPU object it creates:
//! - Passes declare named inputs and outputs; the render graph orders them,
//!   materializes their textures and inserts layout transitions
//! - Textures and other shared objects live in generation-checked handle
//!   tables
//! - Nothing is destroyed while a frame in flight may still use it; retired
//!   objects wait in the dirty collector until the frame ring has moved on
//! - Frame pacing keeps one command pool, fence and semaphore pair per
//!   swapchain image
//!
//! Two backends implement [`backend::GpuBackend`]:
//! - **Vulkan**: via ash and gpu-allocator (feature `vulkan-backend`)
//! - **Dummy**: records everything it is asked to do; used by the tests

pub mod macros;

pub mod backend;
pub mod commands;
pub mod deferred;
pub mod device;
pub mod error;
pub mod frame;
pub mod graph;
pub mod handle;
pub mod loader;
pub mod pass;
pub mod pipeline;
pub mod renderer;
pub mod resources;
pub mod scene;

use std::time::Duration;

pub use deferred::{DirtyCollectorConfig, ReclaimMode};
pub use device::{RenderDevice, TextureSwap};
pub use error::{GraphError, GraphicsError, GraphicsResult, LoadError};
pub use handle::{Handle, HandleManager};
pub use loader::{LoadRequest, LoadTicket, ResourceLoader};
pub use renderer::{FrameOutcome, Renderer};

/// Configuration for creating a [`Renderer`]
#[derive(Debug, Clone, PartialEq)]
pub struct RendererConfig {
    /// Application name reported to the driver
    pub app_name: String,
    /// Initial surface width
    pub width: u32,
    /// Initial surface height
    pub height: u32,
    /// FIFO presentation when set, mailbox otherwise
    pub vsync: bool,
    /// Enable the Khronos validation layer and debug messenger
    pub validation: bool,
    /// Requested swapchain image count; also the number of frames in flight
    pub frames_in_flight: u32,
    /// How long to wait on a frame fence before skipping the frame
    pub fence_timeout: Duration,
    /// Capacity of the global texture table
    pub texture_capacity: u32,
    pub dirty_collector: DirtyCollectorConfig,
    /// Graph resource handed to the UI overlay
    pub output_resource: String,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            app_name: "RedLilium".to_string(),
            width: 1280,
            height: 720,
            vsync: true,
            validation: cfg!(debug_assertions),
            frames_in_flight: 3,
            fence_timeout: Duration::from_secs(1),
            texture_capacity: 4096,
            dirty_collector: DirtyCollectorConfig::default(),
            output_resource: "color".to_string(),
        }
    }
}

impl RendererConfig {
    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    pub fn with_extent(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_frames_in_flight(mut self, frames: u32) -> Self {
        self.frames_in_flight = frames.max(1);
        self
    }

    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    pub fn with_texture_capacity(mut self, capacity: u32) -> Self {
        self.texture_capacity = capacity;
        self
    }

    pub fn with_dirty_collector(mut self, config: DirtyCollectorConfig) -> Self {
        self.dirty_collector = config;
        self
    }

    pub fn with_output_resource(mut self, name: impl Into<String>) -> Self {
        self.output_resource = name.into();
        self
    }
}
