//! Error types for the rendering core.
//!
//! Programmer errors (stale handles, mismatched render targets) go through
//! [`gfx_validate!`](crate::gfx_validate) instead; these enums cover the
//! failures a caller can react to.

use thiserror::Error;

use crate::backend::ObjectKind;

/// Errors raised by the device, allocator and frame pacing layers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphicsError {
    #[error("Failed to initialize device: {0}")]
    InitializationFailed(String),
    #[error("Failed to create {kind:?}: {reason}")]
    ResourceCreationFailed { kind: ObjectKind, reason: String },
    #[error("Failed to create swapchain: {0}")]
    SwapchainCreationFailed(String),
    #[error("Failed to submit command buffers: {0}")]
    SubmitFailed(String),
    #[error("Invalid command buffer transition: {from:?} -> {to}")]
    InvalidCommandBufferState {
        from: crate::commands::CommandBufferState,
        to: &'static str,
    },
    #[error("Buffer of {capacity} bytes cannot hold {requested} bytes")]
    BufferTooSmall { capacity: u64, requested: u64 },
    #[error("Buffer is not host visible")]
    NotHostVisible,
    #[error("Texture table is full")]
    TextureTableFull,
    #[error("Out of GPU memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
    #[error("Render graph error: {0}")]
    Graph(#[from] GraphError),
}

/// Errors raised while compiling a render graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Cycle detected between passes: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("Pass '{pass}' has render targets of different sizes: {expected:?} vs {found:?}")]
    ExtentMismatch {
        pass: String,
        expected: (u32, u32),
        found: (u32, u32),
    },
    #[error("Pass '{pass}' references resource '{resource}' with no backing data")]
    UnresolvedResource { pass: String, resource: String },
    #[error("Pass '{0}' is already registered")]
    DuplicatePass(String),
    #[error("Pass '{0}' has no render targets")]
    NoRenderTargets(String),
    #[error("Pass '{0}' did not create its render pass during compile")]
    NotBaked(String),
}

/// Errors delivered by the background resource loader.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("Failed to read '{path}': {reason}")]
    Io { path: String, reason: String },
    #[error("Failed to decode '{path}': {reason}")]
    Decode { path: String, reason: String },
    #[error("Pixel data has {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("Upload failed: {0}")]
    Upload(String),
    #[error("Loader was shut down before the request completed")]
    Cancelled,
}

pub type GraphicsResult<T> = Result<T, GraphicsError>;
