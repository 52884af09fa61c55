//! Deferred destruction of GPU objects.
//!
//! Command buffers recorded up to `swapchain_image_count` frames ago may still
//! be executing when the CPU decides an object is no longer needed, so nothing
//! is destroyed on the spot. Retired objects are recorded together with the
//! frame they were retired in and destroyed once the frame ring has cycled
//! past that frame.
//!
//! ```text
//! enqueue(kind, handle) ──► per-kind HandleManager<DirtyRecord>
//!                                     │
//! present() ──► notify_frame_presented()   idle frames > threshold
//!                                     │
//!                     reclaimer thread (or inline) ──► collect()
//!                                     │
//!        frame_number >= retired_at + image_count ──► backend.destroy()
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::backend::{GpuBackend, NativeHandle, ObjectKind};
use crate::frame::FrameCounter;
use crate::handle::HandleManager;

/// Where reclamation scans run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReclaimMode {
    /// A dedicated thread woken through a condition variable.
    #[default]
    Background,
    /// On whichever thread reports presented frames.
    Inline,
}

/// Tuning for [`DirtyCollector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyCollectorConfig {
    /// Pending records per object kind before spilling into the overflow list.
    pub capacity_per_kind: u32,
    /// Scans run after `image_count * idle_frame_multiplier` presented frames.
    pub idle_frame_multiplier: u32,
    pub mode: ReclaimMode,
}

impl Default for DirtyCollectorConfig {
    fn default() -> Self {
        Self {
            capacity_per_kind: 1024,
            idle_frame_multiplier: 3,
            mode: ReclaimMode::Background,
        }
    }
}

/// An object waiting to be destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRecord {
    /// Ring index current when the object was retired.
    pub frame_index: u32,
    /// Monotonic frame number current when the object was retired.
    pub frame_number: u64,
    pub handle: NativeHandle,
    pub kind: ObjectKind,
}

struct CollectorState {
    backend: Arc<dyn GpuBackend>,
    frames: Arc<FrameCounter>,
    pools: Vec<HandleManager<DirtyRecord>>,
    overflow: Mutex<Vec<DirtyRecord>>,
    idle_frames: AtomicU32,
    threshold: u32,
    destroy_lock: Mutex<()>,
    wake: Mutex<bool>,
    wake_signal: Condvar,
    running: AtomicBool,
}

impl CollectorState {
    fn pool(&self, kind: ObjectKind) -> &HandleManager<DirtyRecord> {
        &self.pools[kind as usize]
    }

    fn collect(&self) -> usize {
        let _guard = self.destroy_lock.lock();
        let current = self.frames.frame_number();
        let cycle = self.frames.slot_count() as u64;
        let is_safe = |record: &DirtyRecord| current >= record.frame_number + cycle;

        let mut ready = Vec::new();
        for pool in &self.pools {
            ready.extend(pool.extract_if(is_safe));
        }
        {
            let mut overflow = self.overflow.lock();
            let mut i = 0;
            while i < overflow.len() {
                if is_safe(&overflow[i]) {
                    ready.push(overflow.swap_remove(i));
                } else {
                    i += 1;
                }
            }
        }
        self.idle_frames.store(0, Ordering::Release);

        if !ready.is_empty() {
            log::debug!(
                "DirtyCollector: destroying {} objects at frame {}",
                ready.len(),
                current
            );
        }
        self.destroy_all(ready)
    }

    fn destroy_all(&self, mut records: Vec<DirtyRecord>) -> usize {
        records.sort_by_key(|r| r.kind.teardown_rank());
        for record in &records {
            log::trace!(
                "DirtyCollector: destroying {:?} {:?} retired at frame {}",
                record.kind,
                record.handle,
                record.frame_number
            );
            self.backend.destroy(record.kind, record.handle);
        }
        records.len()
    }
}

/// Frame-keyed deferred destruction queue.
///
/// Producers on any thread call [`enqueue`](Self::enqueue) and never block on
/// the GPU. Destruction happens in [`collect`](Self::collect) passes, which
/// are serialized against each other.
pub struct DirtyCollector {
    state: Arc<CollectorState>,
    mode: ReclaimMode,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DirtyCollector {
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        frames: Arc<FrameCounter>,
        config: DirtyCollectorConfig,
    ) -> Self {
        let threshold = frames.slot_count() * config.idle_frame_multiplier.max(1);
        let state = Arc::new(CollectorState {
            backend,
            frames,
            pools: ObjectKind::ALL
                .iter()
                .map(|_| HandleManager::new(config.capacity_per_kind))
                .collect(),
            overflow: Mutex::new(Vec::new()),
            idle_frames: AtomicU32::new(0),
            threshold,
            destroy_lock: Mutex::new(()),
            wake: Mutex::new(false),
            wake_signal: Condvar::new(),
            running: AtomicBool::new(true),
        });

        let worker = match config.mode {
            ReclaimMode::Background => {
                let state = Arc::clone(&state);
                let spawned = std::thread::Builder::new()
                    .name("dirty-collector".into())
                    .spawn(move || reclaim_loop(state));
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        log::warn!(
                            "DirtyCollector: failed to spawn reclaimer ({}), collecting inline",
                            e
                        );
                        None
                    }
                }
            }
            ReclaimMode::Inline => None,
        };
        let mode = if worker.is_some() {
            ReclaimMode::Background
        } else {
            ReclaimMode::Inline
        };

        log::debug!(
            "DirtyCollector: {:?} reclamation, scan every {} idle frames",
            mode,
            threshold
        );

        Self {
            state,
            mode,
            worker: Mutex::new(worker),
        }
    }

    pub fn mode(&self) -> ReclaimMode {
        self.mode
    }

    /// Number of idle frames after which a scan is triggered.
    pub fn threshold(&self) -> u32 {
        self.state.threshold
    }

    /// Queue `handle` for destruction once no in-flight frame can use it.
    pub fn enqueue(&self, kind: ObjectKind, handle: NativeHandle) {
        if handle.is_null() {
            return;
        }
        let record = DirtyRecord {
            frame_index: self.state.frames.current_index(),
            frame_number: self.state.frames.frame_number(),
            handle,
            kind,
        };
        if !self.state.pool(kind).add(record).is_set() {
            log::warn!(
                "DirtyCollector: {:?} pool is full, spilling {:?} into overflow",
                kind,
                handle
            );
            self.state.overflow.lock().push(record);
        }
    }

    /// Destroy every record whose frame has cycled out. Returns the count.
    pub fn collect(&self) -> usize {
        self.state.collect()
    }

    /// Count a presented frame and trigger a scan once enough have passed.
    pub fn notify_frame_presented(&self) {
        let idle = self.state.idle_frames.fetch_add(1, Ordering::AcqRel) + 1;
        if idle <= self.state.threshold {
            return;
        }
        match self.mode {
            ReclaimMode::Background => {
                *self.state.wake.lock() = true;
                self.state.wake_signal.notify_one();
            }
            ReclaimMode::Inline => {
                self.state.collect();
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state.pools.iter().map(|p| p.len()).sum::<usize>() + self.state.overflow.lock().len()
    }

    pub fn pending_of(&self, kind: ObjectKind) -> usize {
        self.state.pool(kind).len()
            + self
                .state
                .overflow
                .lock()
                .iter()
                .filter(|r| r.kind == kind)
                .count()
    }

    /// Destroy everything now, regardless of frame.
    ///
    /// Waits for the device to go idle first. Only valid at teardown or when
    /// the caller knows no work is in flight.
    pub fn flush_all(&self) -> usize {
        if let Err(e) = self.state.backend.wait_idle() {
            log::error!("DirtyCollector: wait_idle failed before flush: {}", e);
        }
        let _guard = self.state.destroy_lock.lock();
        let mut records = Vec::new();
        for pool in &self.state.pools {
            records.extend(pool.drain());
        }
        records.append(&mut self.state.overflow.lock());
        let count = self.state.destroy_all(records);
        if count > 0 {
            log::debug!("DirtyCollector: flushed {} objects", count);
        }
        count
    }

    /// Stop the reclaimer thread. Pending records stay queued.
    pub fn shutdown(&self) {
        self.state.running.store(false, Ordering::Release);
        *self.state.wake.lock() = true;
        self.state.wake_signal.notify_all();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::error!("DirtyCollector: reclaimer thread panicked");
            }
        }
    }
}

impl Drop for DirtyCollector {
    fn drop(&mut self) {
        self.shutdown();
        if self.pending_count() > 0 {
            self.flush_all();
        }
    }
}

fn reclaim_loop(state: Arc<CollectorState>) {
    log::trace!("DirtyCollector: reclaimer started");
    loop {
        {
            let mut pending = state.wake.lock();
            while !*pending {
                state.wake_signal.wait(&mut pending);
            }
            *pending = false;
        }
        if !state.running.load(Ordering::Acquire) {
            break;
        }
        state.collect();
    }
    log::trace!("DirtyCollector: reclaimer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferDescriptor, BufferUsage, DummyBackend, MemoryPlacement};
    use std::time::{Duration, Instant};

    fn setup(mode: ReclaimMode) -> (Arc<DummyBackend>, Arc<FrameCounter>, DirtyCollector) {
        let backend = Arc::new(DummyBackend::new(3));
        let frames = Arc::new(FrameCounter::new(3));
        let collector = DirtyCollector::new(
            backend.clone(),
            frames.clone(),
            DirtyCollectorConfig {
                capacity_per_kind: 4,
                idle_frame_multiplier: 3,
                mode,
            },
        );
        (backend, frames, collector)
    }

    fn buffer(backend: &DummyBackend) -> NativeHandle {
        backend
            .create_buffer(&BufferDescriptor {
                label: None,
                size: 16,
                usage: BufferUsage::UNIFORM,
                placement: MemoryPlacement::HostVisible,
            })
            .unwrap()
            .handle
    }

    #[test]
    fn test_destroyed_only_after_full_cycle() {
        let (backend, frames, collector) = setup(ReclaimMode::Inline);
        let handle = buffer(&backend);
        collector.enqueue(ObjectKind::Buffer, handle);

        for expected_index in [1, 2] {
            frames.advance();
            assert_eq!(frames.current_index(), expected_index);
            assert_eq!(collector.collect(), 0);
            assert!(backend.is_live(handle));
        }

        frames.advance();
        assert_eq!(frames.current_index(), 0);
        assert_eq!(collector.collect(), 1);
        assert_eq!(collector.collect(), 0);
        assert_eq!(backend.destroy_count(handle), 1);
        assert_eq!(collector.pending_count(), 0);
    }

    #[test]
    fn test_overflow_is_still_reclaimed() {
        let (backend, frames, collector) = setup(ReclaimMode::Inline);
        let handles: Vec<_> = (0..6).map(|_| buffer(&backend)).collect();
        for h in &handles {
            collector.enqueue(ObjectKind::Buffer, *h);
        }
        assert_eq!(collector.pending_of(ObjectKind::Buffer), 6);

        for _ in 0..3 {
            frames.advance();
        }
        assert_eq!(collector.collect(), 6);
        assert_eq!(backend.double_destroys(), 0);
    }

    #[test]
    fn test_inline_threshold_triggers_scan() {
        let (backend, frames, collector) = setup(ReclaimMode::Inline);
        let handle = buffer(&backend);
        collector.enqueue(ObjectKind::Buffer, handle);

        // threshold is 3 * 3 = 9 idle frames
        for _ in 0..9 {
            frames.advance();
            collector.notify_frame_presented();
        }
        assert!(backend.is_live(handle));

        frames.advance();
        collector.notify_frame_presented();
        assert!(!backend.is_live(handle));
    }

    #[test]
    fn test_background_reclaimer_wakes() {
        let (backend, frames, collector) = setup(ReclaimMode::Background);
        assert_eq!(collector.mode(), ReclaimMode::Background);
        let handle = buffer(&backend);
        collector.enqueue(ObjectKind::Buffer, handle);

        for _ in 0..=collector.threshold() {
            frames.advance();
            collector.notify_frame_presented();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while backend.is_live(handle) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!backend.is_live(handle));
        collector.shutdown();
    }

    #[test]
    fn test_flush_all_orders_by_rank() {
        let (backend, _frames, collector) = setup(ReclaimMode::Inline);
        let fence = backend.create_fence(true).unwrap();
        let buffer = buffer(&backend);
        collector.enqueue(ObjectKind::Fence, fence);
        collector.enqueue(ObjectKind::Buffer, buffer);

        assert_eq!(collector.flush_all(), 2);
        assert_eq!(
            backend.destroyed(),
            vec![(ObjectKind::Buffer, buffer), (ObjectKind::Fence, fence)]
        );
        assert!(backend.wait_idle_calls() >= 1);
    }
}
