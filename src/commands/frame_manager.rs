//! Per-frame command buffers and swapchain pacing.
//!
//! Each frame-in-flight slot owns a command pool, the command buffers handed
//! out from it, a fence signaled when the slot's submission completes, and
//! the acquire/render-finished semaphore pair used for presentation.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::CommandBuffer;
use crate::backend::{
    AcquireOutcome, GpuBackend, NativeHandle, ObjectKind, PresentOutcome, SubmitInfo,
};
use crate::deferred::DirtyCollector;
use crate::error::GraphicsResult;
use crate::frame::FrameCounter;
use crate::gfx_validate;

/// Outcome of [`FrameManager::new_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Recording may start.
    Ready { frame_index: u32, image_index: u32 },
    /// The slot's previous submission did not finish in time; try again.
    Skipped,
    /// The swapchain was recreated; size dependent resources must follow.
    Resized { width: u32, height: u32 },
}

/// Outcome of [`FrameManager::present`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    Resized { width: u32, height: u32 },
}

struct FrameSlot {
    pool: NativeHandle,
    command_buffers: Vec<CommandBuffer>,
    in_use: usize,
    fence: NativeHandle,
    image_available: NativeHandle,
    render_finished: NativeHandle,
}

impl FrameSlot {
    fn new(backend: &dyn GpuBackend) -> GraphicsResult<Self> {
        Ok(Self {
            pool: backend.create_command_pool(false)?,
            command_buffers: Vec::new(),
            in_use: 0,
            fence: backend.create_fence(true)?,
            image_available: backend.create_semaphore()?,
            render_finished: backend.create_semaphore()?,
        })
    }
}

/// Frame pacing for a swapchain with `image_count` images in flight.
pub struct FrameManager {
    backend: Arc<dyn GpuBackend>,
    frames: Arc<FrameCounter>,
    collector: Arc<DirtyCollector>,
    slots: Vec<FrameSlot>,
    current_image: Option<u32>,
    recreate_after_present: bool,
    fence_timeout: Duration,
    resize_requests: Mutex<VecDeque<(u32, u32)>>,
}

impl FrameManager {
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        frames: Arc<FrameCounter>,
        collector: Arc<DirtyCollector>,
        fence_timeout: Duration,
    ) -> GraphicsResult<Self> {
        let slots = (0..frames.slot_count())
            .map(|_| FrameSlot::new(backend.as_ref()))
            .collect::<GraphicsResult<Vec<_>>>()?;
        log::debug!(
            "FrameManager: {} frames in flight, fence timeout {:?}",
            slots.len(),
            fence_timeout
        );
        Ok(Self {
            backend,
            frames,
            collector,
            slots,
            current_image: None,
            recreate_after_present: false,
            fence_timeout,
            resize_requests: Mutex::new(VecDeque::new()),
        })
    }

    pub fn frame_index(&self) -> u32 {
        self.frames.current_index()
    }

    pub fn frame_counter(&self) -> &Arc<FrameCounter> {
        &self.frames
    }

    /// Swapchain image acquired for the frame being recorded.
    pub fn current_image(&self) -> Option<u32> {
        self.current_image
    }

    /// Queue a resize from the windowing layer. Drained by the next
    /// [`new_frame`](Self::new_frame).
    pub fn request_resize(&self, width: u32, height: u32) {
        self.resize_requests.lock().push_back((width, height));
    }

    fn take_resize_request(&self) -> Option<(u32, u32)> {
        // Only the most recent size matters.
        self.resize_requests.lock().drain(..).last()
    }

    fn recreate_swapchain(&mut self, extent: Option<(u32, u32)>) -> GraphicsResult<(u32, u32)> {
        let (width, height) = extent.unwrap_or_else(|| self.backend.swapchain_extent());
        log::debug!("FrameManager: recreating swapchain at {}x{}", width, height);
        self.backend.wait_idle()?;
        self.backend.recreate_swapchain(width, height)?;
        self.recreate_after_present = false;
        Ok(self.backend.swapchain_extent())
    }

    /// Wait for the next slot, acquire a swapchain image and reset the slot.
    pub fn new_frame(&mut self) -> GraphicsResult<FrameStatus> {
        gfx_validate!(
            self.current_image.is_none(),
            "new_frame called while frame {} is still open",
            self.frames.frame_number()
        );

        if let Some(extent) = self.take_resize_request() {
            let (width, height) = self.recreate_swapchain(Some(extent))?;
            return Ok(FrameStatus::Resized { width, height });
        }

        let frame_index = self.frames.current_index();
        let (fence, image_available) = {
            let slot = &self.slots[frame_index as usize];
            (slot.fence, slot.image_available)
        };

        if !self.backend.wait_fence(fence, self.fence_timeout)? {
            log::warn!(
                "FrameManager: fence for slot {} not signaled after {:?}, skipping frame {}",
                frame_index,
                self.fence_timeout,
                self.frames.frame_number()
            );
            return Ok(FrameStatus::Skipped);
        }

        let image_index = match self
            .backend
            .acquire_next_image(image_available, self.fence_timeout)?
        {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    self.recreate_after_present = true;
                }
                image_index
            }
            AcquireOutcome::OutOfDate => {
                let (width, height) = self.recreate_swapchain(None)?;
                return Ok(FrameStatus::Resized { width, height });
            }
            AcquireOutcome::Timeout => {
                log::warn!("FrameManager: swapchain acquire timed out");
                return Ok(FrameStatus::Skipped);
            }
        };

        // The fence is only reset once an image is ours, so a failed acquire
        // never leaves the slot waiting on a submission that will not happen.
        self.backend.reset_fence(fence)?;
        let slot = &mut self.slots[frame_index as usize];
        self.backend.reset_command_pool(slot.pool)?;
        for cmd in &mut slot.command_buffers {
            cmd.reset_state();
        }
        slot.in_use = 0;
        self.current_image = Some(image_index);

        log::trace!(
            "FrameManager: frame {} slot {} image {}",
            self.frames.frame_number(),
            frame_index,
            image_index
        );
        Ok(FrameStatus::Ready {
            frame_index,
            image_index,
        })
    }

    /// Hand out a command buffer in the `Recording` state for this frame.
    pub fn begin_command_buffer(&mut self) -> GraphicsResult<&CommandBuffer> {
        gfx_validate!(
            self.current_image.is_some(),
            "begin_command_buffer called outside new_frame/present"
        );
        let slot = &mut self.slots[self.frames.current_index() as usize];
        if slot.in_use == slot.command_buffers.len() {
            let raw = self.backend.allocate_command_buffer(slot.pool)?;
            slot.command_buffers
                .push(CommandBuffer::new(Arc::clone(&self.backend), raw));
        }
        let index = slot.in_use;
        slot.in_use += 1;
        let cmd = &mut slot.command_buffers[index];
        cmd.begin(true)?;
        Ok(&*cmd)
    }

    /// End every command buffer of this frame, submit them as one batch and
    /// present.
    pub fn present(&mut self) -> GraphicsResult<PresentStatus> {
        let image_index = match self.current_image.take() {
            Some(image_index) => image_index,
            None => {
                gfx_validate!(false, "present called without a successful new_frame");
                return Ok(PresentStatus::Presented);
            }
        };
        let frame_index = self.frames.current_index() as usize;
        if let Err(e) = self.submit_slot(frame_index) {
            log::error!(
                "FrameManager: frame {} was not submitted: {}",
                self.frames.frame_number(),
                e
            );
            self.restore_slot(frame_index)?;
            return Err(e);
        }

        let slot = &self.slots[frame_index];
        let outcome = self.backend.present(image_index, slot.render_finished)?;
        self.frames.advance();
        self.collector.notify_frame_presented();

        let needs_recreate = self.recreate_after_present
            || matches!(
                outcome,
                PresentOutcome::Suboptimal | PresentOutcome::OutOfDate
            );
        if needs_recreate {
            let (width, height) = self.recreate_swapchain(None)?;
            return Ok(PresentStatus::Resized { width, height });
        }
        Ok(PresentStatus::Presented)
    }

    fn submit_slot(&mut self, frame_index: usize) -> GraphicsResult<()> {
        let slot = &mut self.slots[frame_index];
        let mut batch = Vec::with_capacity(slot.in_use);
        for cmd in &mut slot.command_buffers[..slot.in_use] {
            if cmd.is_recording() {
                cmd.end()?;
            }
            cmd.mark_submitted()?;
            batch.push(cmd.raw());
        }
        self.backend.submit(&SubmitInfo {
            command_buffers: batch,
            wait_semaphores: vec![slot.image_available],
            signal_semaphores: vec![slot.render_finished],
            fence: Some(slot.fence),
        })
    }

    /// Make a slot usable again after its frame never reached the queue.
    ///
    /// The fence was reset and will never signal, and the acquire semaphore
    /// holds a signal nobody waits on. Both are replaced; the old ones go to
    /// the collector.
    fn restore_slot(&mut self, frame_index: usize) -> GraphicsResult<()> {
        let fence = self.backend.create_fence(true)?;
        let image_available = self.backend.create_semaphore()?;
        let slot = &mut self.slots[frame_index];
        for cmd in &mut slot.command_buffers[..slot.in_use] {
            cmd.invalidate();
        }
        let old_fence = std::mem::replace(&mut slot.fence, fence);
        let old_semaphore = std::mem::replace(&mut slot.image_available, image_available);
        self.collector.enqueue(ObjectKind::Fence, old_fence);
        self.collector.enqueue(ObjectKind::Semaphore, old_semaphore);
        Ok(())
    }
}

impl Drop for FrameManager {
    fn drop(&mut self) {
        if let Err(e) = self.backend.wait_idle() {
            log::error!("FrameManager: wait_idle failed during teardown: {}", e);
        }
        for slot in self.slots.drain(..) {
            self.collector.enqueue(ObjectKind::CommandPool, slot.pool);
            self.collector.enqueue(ObjectKind::Fence, slot.fence);
            self.collector.enqueue(ObjectKind::Semaphore, slot.image_available);
            self.collector.enqueue(ObjectKind::Semaphore, slot.render_finished);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;
    use crate::commands::CommandBufferState;
    use crate::deferred::{DirtyCollectorConfig, ReclaimMode};

    fn manager() -> (Arc<DummyBackend>, FrameManager) {
        let backend = Arc::new(DummyBackend::new(3));
        let frames = Arc::new(FrameCounter::new(3));
        let collector = Arc::new(DirtyCollector::new(
            backend.clone(),
            frames.clone(),
            DirtyCollectorConfig {
                mode: ReclaimMode::Inline,
                ..Default::default()
            },
        ));
        let manager =
            FrameManager::new(backend.clone(), frames, collector, Duration::from_millis(5))
                .unwrap();
        (backend, manager)
    }

    #[test]
    fn test_frame_cycle_submits_one_batch() {
        let (backend, mut manager) = manager();
        assert!(matches!(
            manager.new_frame().unwrap(),
            FrameStatus::Ready {
                frame_index: 0,
                image_index: 0
            }
        ));
        let first = manager.begin_command_buffer().unwrap().raw();
        let second = manager.begin_command_buffer().unwrap().raw();
        assert_ne!(first, second);
        assert_eq!(manager.present().unwrap(), PresentStatus::Presented);

        let submissions = backend.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].command_buffers, vec![first, second]);
        assert_eq!(submissions[0].wait_semaphores.len(), 1);
        assert_eq!(submissions[0].signal_semaphores.len(), 1);
        assert_eq!(manager.frame_index(), 1);
        assert_eq!(backend.presented_images(), vec![0]);
    }

    #[test]
    fn test_command_buffers_are_reused_per_slot() {
        let (_backend, mut manager) = manager();
        let mut handles = Vec::new();
        for _ in 0..4 {
            manager.new_frame().unwrap();
            handles.push(manager.begin_command_buffer().unwrap().raw());
            manager.present().unwrap();
        }
        assert_eq!(handles[0], handles[3]);
        assert_ne!(handles[0], handles[1]);

        manager.new_frame().unwrap();
        let cmd = manager.begin_command_buffer().unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Recording);
    }

    #[test]
    fn test_fence_timeout_skips_frame() {
        let (backend, mut manager) = manager();
        backend.set_fences_hang(true);
        assert_eq!(manager.new_frame().unwrap(), FrameStatus::Skipped);
        assert!(manager.current_image().is_none());
        backend.set_fences_hang(false);
        assert!(matches!(
            manager.new_frame().unwrap(),
            FrameStatus::Ready { .. }
        ));
    }

    #[test]
    fn test_failed_submit_restores_slot() {
        let (backend, mut manager) = manager();
        manager.new_frame().unwrap();
        manager.begin_command_buffer().unwrap().draw(3, 1);
        backend.set_submits_fail(true);
        assert!(manager.present().is_err());
        assert!(manager.current_image().is_none());
        assert_eq!(manager.frame_index(), 0);
        assert_eq!(manager.collector.pending_of(ObjectKind::Fence), 1);
        assert_eq!(manager.collector.pending_of(ObjectKind::Semaphore), 1);

        backend.set_submits_fail(false);
        assert!(matches!(
            manager.new_frame().unwrap(),
            FrameStatus::Ready { frame_index: 0, .. }
        ));
        let cmd = manager.begin_command_buffer().unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Recording);
        assert_eq!(manager.present().unwrap(), PresentStatus::Presented);
        assert_eq!(manager.frame_index(), 1);
        assert_eq!(backend.submissions().len(), 1);
    }

    #[test]
    fn test_out_of_date_acquire_recreates_swapchain() {
        let (backend, mut manager) = manager();
        backend.push_acquire_outcome(AcquireOutcome::OutOfDate);
        assert_eq!(
            manager.new_frame().unwrap(),
            FrameStatus::Resized {
                width: 800,
                height: 600
            }
        );
        assert_eq!(backend.swapchain_recreations(), 1);
    }

    #[test]
    fn test_suboptimal_present_recreates_swapchain() {
        let (backend, mut manager) = manager();
        backend.push_present_outcome(PresentOutcome::Suboptimal);
        manager.new_frame().unwrap();
        assert!(matches!(
            manager.present().unwrap(),
            PresentStatus::Resized { .. }
        ));
        assert_eq!(backend.swapchain_recreations(), 1);
    }

    #[test]
    fn test_resize_request_is_drained() {
        let (backend, mut manager) = manager();
        manager.request_resize(640, 480);
        manager.request_resize(1024, 768);
        assert_eq!(
            manager.new_frame().unwrap(),
            FrameStatus::Resized {
                width: 1024,
                height: 768
            }
        );
        assert_eq!(backend.swapchain_extent(), (1024, 768));
        assert!(matches!(
            manager.new_frame().unwrap(),
            FrameStatus::Ready { .. }
        ));
    }
}
