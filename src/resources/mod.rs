//! GPU resource creation and upload
//!
//! Buffers, per-frame buffer sets and image bundles, all created through the
//! [`ResourceAllocator`] and retired through the dirty collector.

mod allocator;
mod buffer;
mod texture;

pub use allocator::*;
pub use buffer::*;
pub use texture::*;
