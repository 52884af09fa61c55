//! Image layout tracking and barrier batching for graph execution.
//!
//! Each pass collects the transitions its resources need into one
//! [`BarrierBatch`], recorded as a single pipeline barrier before the pass
//! begins.

use std::collections::HashMap;

use crate::backend::{ImageBarrier, ImageLayout, NativeHandle, TextureFormat};
use crate::commands::CommandBuffer;

/// Layouts images were left in by the passes recorded so far.
///
/// Kept across frames, since frames execute on the queue in submission
/// order. An image the tracker has not seen (new, or recreated on resize)
/// has no layout and the caller falls back to inference.
#[derive(Debug, Default)]
pub struct FrameLayoutState {
    layouts: HashMap<NativeHandle, ImageLayout>,
}

impl FrameLayoutState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_layout(&self, image: NativeHandle) -> Option<ImageLayout> {
        self.layouts.get(&image).copied()
    }

    pub fn set_layout(&mut self, image: NativeHandle, layout: ImageLayout) {
        self.layouts.insert(image, layout);
    }

    /// Drop a retired image.
    pub fn forget(&mut self, image: NativeHandle) {
        self.layouts.remove(&image);
    }

    pub fn reset(&mut self) {
        self.layouts.clear();
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }
}

/// Image barriers recorded together.
///
/// One barrier per image; a later transition for the same image replaces the
/// earlier one. Barriers where `old_layout == new_layout` are skipped.
#[derive(Debug, Default)]
pub struct BarrierBatch {
    barriers: Vec<ImageBarrier>,
}

impl BarrierBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_image_barrier(
        &mut self,
        image: NativeHandle,
        format: TextureFormat,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    ) {
        if old_layout == new_layout {
            return;
        }
        let barrier = ImageBarrier {
            image,
            format,
            old_layout,
            new_layout,
        };
        match self.barriers.iter_mut().find(|b| b.image == image) {
            Some(existing) => *existing = barrier,
            None => self.barriers.push(barrier),
        }
    }

    /// Transition `image` to `new_layout` from wherever `state` last saw it,
    /// or from `inferred` when it has not been seen yet.
    pub fn transition(
        &mut self,
        state: &mut FrameLayoutState,
        image: NativeHandle,
        format: TextureFormat,
        inferred: ImageLayout,
        new_layout: ImageLayout,
    ) {
        let old_layout = state.get_layout(image).unwrap_or(inferred);
        self.add_image_barrier(image, format, old_layout, new_layout);
        state.set_layout(image, new_layout);
    }

    pub fn is_empty(&self) -> bool {
        self.barriers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.barriers.len()
    }

    pub fn barriers(&self) -> &[ImageBarrier] {
        &self.barriers
    }

    /// Record all barriers as one command. Does nothing if the batch is empty.
    pub fn submit(self, cmd: &CommandBuffer) {
        if !self.barriers.is_empty() {
            cmd.pipeline_barrier(self.barriers);
        }
    }
}
