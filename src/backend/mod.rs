//! Backend abstraction layer
//!
//! [`GpuBackend`] is implemented by the Vulkan backend and by
//! [`DummyBackend`], which records everything it is asked to do so the
//! scheduling layers can be tested without a GPU.

pub mod dummy;
pub mod traits;
pub mod types;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

pub use dummy::DummyBackend;
pub use traits::*;
pub use types::*;
