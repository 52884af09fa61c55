//! One-shot synchronous command buffers for uploads and layout transitions.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::{CommandBuffer, CommandBufferState};
use crate::backend::{GpuBackend, NativeHandle, ObjectKind, SubmitInfo};
use crate::deferred::DirtyCollector;
use crate::error::{GraphicsError, GraphicsResult};

/// Number of fence timeouts tolerated before an instant submit is abandoned.
const MAX_FENCE_RETRIES: u32 = 8;

/// Serialized one-shot command buffer manager.
///
/// At most one instant operation is in flight per manager. [`begin`](Self::begin)
/// blocks until the previous one has completed; [`InstantCommandBuffer::submit`]
/// waits for the GPU before returning.
pub struct InstantCommands {
    backend: Arc<dyn GpuBackend>,
    collector: Arc<DirtyCollector>,
    pool: NativeHandle,
    fence: NativeHandle,
    command_buffer: Mutex<CommandBuffer>,
    busy: Mutex<bool>,
    idle: Condvar,
    timeout: Duration,
}

impl InstantCommands {
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        collector: Arc<DirtyCollector>,
        timeout: Duration,
    ) -> GraphicsResult<Self> {
        let pool = backend.create_command_pool(true)?;
        let raw = backend.allocate_command_buffer(pool)?;
        let fence = backend.create_fence(true)?;
        Ok(Self {
            command_buffer: Mutex::new(CommandBuffer::new(Arc::clone(&backend), raw)),
            backend,
            collector,
            pool,
            fence,
            busy: Mutex::new(false),
            idle: Condvar::new(),
            timeout,
        })
    }

    /// Start recording, blocking while another instant operation is in flight.
    pub fn begin(&self) -> GraphicsResult<InstantCommandBuffer<'_>> {
        {
            let mut busy = self.busy.lock();
            while *busy {
                self.idle.wait(&mut busy);
            }
            *busy = true;
        }

        // the guard frees the slot again if anything below fails
        let mut guard = InstantCommandBuffer {
            owner: self,
            command_buffer: self.command_buffer.lock(),
        };
        if guard.command_buffer.state() == CommandBufferState::Invalid {
            self.recover()?;
            guard.command_buffer.reset_state();
        }
        self.backend.reset_command_pool(self.pool)?;
        guard.command_buffer.begin(true)?;
        Ok(guard)
    }

    /// Wait out a submission abandoned after a fence timeout.
    ///
    /// Resetting the pool returns its buffer to the initial state, but only
    /// once the GPU no longer executes it.
    fn recover(&self) -> GraphicsResult<()> {
        if !self.backend.wait_fence(self.fence, self.timeout)? {
            return Err(GraphicsError::SubmitFailed(
                "previous instant command buffer is still running".to_string(),
            ));
        }
        log::debug!("Instant command buffer recovered after a fence timeout");
        Ok(())
    }

    /// Record with `f`, submit and wait.
    pub fn run<R>(&self, f: impl FnOnce(&CommandBuffer) -> R) -> GraphicsResult<R> {
        let cmd = self.begin()?;
        let result = f(&cmd);
        cmd.submit()?;
        Ok(result)
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.lock()
    }

    fn release(&self) {
        *self.busy.lock() = false;
        self.idle.notify_one();
    }
}

impl Drop for InstantCommands {
    fn drop(&mut self) {
        self.collector.enqueue(ObjectKind::Fence, self.fence);
        self.collector.enqueue(ObjectKind::CommandPool, self.pool);
    }
}

/// An instant command buffer in the `Recording` state.
///
/// Dropping it without calling [`submit`](Self::submit) discards the
/// recording and frees the slot for the next caller.
pub struct InstantCommandBuffer<'a> {
    owner: &'a InstantCommands,
    command_buffer: MutexGuard<'a, CommandBuffer>,
}

impl InstantCommandBuffer<'_> {
    /// End, submit and wait for completion.
    pub fn submit(mut self) -> GraphicsResult<()> {
        let owner = self.owner;
        self.command_buffer.end()?;
        owner.backend.reset_fence(owner.fence)?;
        owner.backend.submit(&SubmitInfo {
            command_buffers: vec![self.command_buffer.raw()],
            fence: Some(owner.fence),
            ..Default::default()
        })?;
        self.command_buffer.mark_submitted()?;

        for attempt in 1..=MAX_FENCE_RETRIES {
            if owner.backend.wait_fence(owner.fence, owner.timeout)? {
                return Ok(());
            }
            log::warn!(
                "Instant command buffer still running after {:?} (attempt {}/{})",
                owner.timeout * attempt,
                attempt,
                MAX_FENCE_RETRIES
            );
        }
        self.command_buffer.invalidate();
        Err(GraphicsError::SubmitFailed(
            "instant command buffer never completed".to_string(),
        ))
    }
}

impl Deref for InstantCommandBuffer<'_> {
    type Target = CommandBuffer;

    fn deref(&self) -> &CommandBuffer {
        &self.command_buffer
    }
}

impl Drop for InstantCommandBuffer<'_> {
    fn drop(&mut self) {
        // An invalid buffer may still be executing; `begin` recovers it.
        if self.command_buffer.state() != CommandBufferState::Invalid {
            self.command_buffer.reset_state();
        }
        self.owner.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyBackend, GpuCommand};
    use crate::deferred::{DirtyCollectorConfig, ReclaimMode};
    use crate::frame::FrameCounter;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn instant() -> (Arc<DummyBackend>, Arc<InstantCommands>) {
        let backend = Arc::new(DummyBackend::default());
        let collector = Arc::new(DirtyCollector::new(
            backend.clone(),
            Arc::new(FrameCounter::new(3)),
            DirtyCollectorConfig {
                mode: ReclaimMode::Inline,
                ..Default::default()
            },
        ));
        let instant =
            InstantCommands::new(backend.clone(), collector, Duration::from_millis(10)).unwrap();
        (backend, Arc::new(instant))
    }

    #[test]
    fn test_run_submits_and_waits() {
        let (backend, instant) = instant();
        instant.run(|cmd| cmd.draw(3, 1)).unwrap();
        assert!(!instant.is_busy());

        let submissions = backend.submissions();
        assert_eq!(submissions.len(), 1);
        assert!(submissions[0].fence.is_some());
        let commands = backend.commands(submissions[0].command_buffers[0]);
        assert!(matches!(commands[0], GpuCommand::Draw { .. }));
    }

    #[test]
    fn test_dropped_buffer_releases_slot() {
        let (backend, instant) = instant();
        {
            let cmd = instant.begin().unwrap();
            cmd.draw(1, 1);
            assert!(instant.is_busy());
        }
        assert!(!instant.is_busy());
        assert!(backend.submissions().is_empty());
        instant.run(|_| ()).unwrap();
    }

    #[test]
    fn test_hung_fence_is_reported() {
        let (backend, instant) = instant();
        backend.set_fences_hang(true);
        let result = instant.run(|_| ());
        assert!(matches!(result, Err(GraphicsError::SubmitFailed(_))));
        assert!(!instant.is_busy());
    }

    #[test]
    fn test_recovers_once_fence_signals() {
        let (backend, instant) = instant();
        backend.set_fences_hang(true);
        assert!(instant.run(|cmd| cmd.draw(3, 1)).is_err());
        // still running: refuse to touch the buffer
        assert!(matches!(
            instant.run(|_| ()),
            Err(GraphicsError::SubmitFailed(_))
        ));
        assert!(!instant.is_busy());

        backend.set_fences_hang(false);
        instant.run(|cmd| cmd.draw(1, 1)).unwrap();
        instant.run(|cmd| cmd.draw(2, 1)).unwrap();
        assert_eq!(backend.submissions().len(), 3);
    }

    #[test]
    fn test_operations_never_overlap() {
        let (_backend, instant) = instant();
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let instant = Arc::clone(&instant);
                let active = Arc::clone(&active);
                let max_active = Arc::clone(&max_active);
                std::thread::spawn(move || {
                    for _ in 0..16 {
                        instant
                            .run(|_| {
                                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                                max_active.fetch_max(now, Ordering::SeqCst);
                                std::thread::yield_now();
                                active.fetch_sub(1, Ordering::SeqCst);
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }
}
