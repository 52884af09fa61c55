//! Frame numbering shared by the frame pacer and the dirty collector.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic frame number plus its position in the swapchain ring.
///
/// The frame number only ever increases; the ring index is derived from it so
/// both views stay consistent across threads.
#[derive(Debug)]
pub struct FrameCounter {
    frame_number: AtomicU64,
    slot_count: u32,
}

impl FrameCounter {
    pub fn new(slot_count: u32) -> Self {
        assert!(slot_count > 0, "frame counter needs at least one slot");
        Self {
            frame_number: AtomicU64::new(0),
            slot_count,
        }
    }

    #[inline]
    pub fn frame_number(&self) -> u64 {
        self.frame_number.load(Ordering::Acquire)
    }

    /// Index of the current frame-in-flight slot.
    #[inline]
    pub fn current_index(&self) -> u32 {
        (self.frame_number() % self.slot_count as u64) as u32
    }

    /// Index the next frame will use.
    #[inline]
    pub fn next_index(&self) -> u32 {
        ((self.frame_number() + 1) % self.slot_count as u64) as u32
    }

    #[inline]
    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    /// Move to the next frame, returning the new frame number.
    pub fn advance(&self) -> u64 {
        self.frame_number.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn frame_name(&self) -> String {
        format!("[F{}#{}]", self.frame_number(), self.current_index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_index_wraps() {
        let counter = FrameCounter::new(3);
        let indices: Vec<u32> = (0..7)
            .map(|_| {
                let index = counter.current_index();
                counter.advance();
                index
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(counter.frame_number(), 7);
        assert_eq!(counter.next_index(), 2);
    }
}
