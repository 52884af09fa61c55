//! Dummy GPU backend for testing and development.
//!
//! No GPU work happens here. Every object gets a unique handle, every call is
//! recorded, and submissions complete immediately: fences are signaled and
//! recorded buffer copies are applied to the in-memory buffer contents. Tests
//! inspect the recorded state to check what the scheduling layers did.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::traits::*;
use super::types::*;
use crate::error::{GraphicsError, GraphicsResult};

#[derive(Debug)]
struct DummyBuffer {
    host_visible: bool,
    data: Vec<u8>,
}

#[derive(Debug)]
struct DummyState {
    live: HashMap<NativeHandle, ObjectKind>,
    destroyed: Vec<(ObjectKind, NativeHandle)>,
    double_destroys: usize,
    buffers: HashMap<NativeHandle, DummyBuffer>,
    images: HashMap<NativeHandle, TextureDescriptor>,
    commands: HashMap<NativeHandle, Vec<GpuCommand>>,
    pool_buffers: HashMap<NativeHandle, Vec<NativeHandle>>,
    fences: HashMap<NativeHandle, bool>,
    submissions: Vec<SubmitInfo>,
    descriptor_writes: Vec<DescriptorWrite>,
    acquire_script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,
    presented: Vec<u32>,
    extent: (u32, u32),
    next_image: u32,
    swapchain_recreations: u32,
    hang_fences: bool,
    fail_submits: bool,
    device_local_only: bool,
    wait_idle_calls: u32,
}

/// Recording GPU backend.
#[derive(Debug)]
pub struct DummyBackend {
    next_handle: AtomicU64,
    image_count: u32,
    swapchain_render_pass: NativeHandle,
    swapchain_framebuffers: Vec<NativeHandle>,
    state: Mutex<DummyState>,
}

impl DummyBackend {
    /// Create a dummy backend with an 800x600, `image_count`-image swapchain.
    pub fn new(image_count: u32) -> Self {
        let next_handle = AtomicU64::new(1);
        let alloc = || NativeHandle(next_handle.fetch_add(1, Ordering::Relaxed));
        let swapchain_render_pass = alloc();
        let swapchain_framebuffers = (0..image_count).map(|_| alloc()).collect();

        Self {
            next_handle,
            image_count,
            swapchain_render_pass,
            swapchain_framebuffers,
            state: Mutex::new(DummyState {
                live: HashMap::new(),
                destroyed: Vec::new(),
                double_destroys: 0,
                buffers: HashMap::new(),
                images: HashMap::new(),
                commands: HashMap::new(),
                pool_buffers: HashMap::new(),
                fences: HashMap::new(),
                submissions: Vec::new(),
                descriptor_writes: Vec::new(),
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                presented: Vec::new(),
                extent: (800, 600),
                next_image: 0,
                swapchain_recreations: 0,
                hang_fences: false,
                fail_submits: false,
                device_local_only: false,
                wait_idle_calls: 0,
            }),
        }
    }

    fn alloc(&self, kind: ObjectKind) -> NativeHandle {
        let handle = NativeHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.state.lock().live.insert(handle, kind);
        handle
    }

    // === Scripting ===

    /// Make `MemoryPlacement::Auto` buffers device-local, forcing staged uploads.
    pub fn set_device_local_only(&self, enabled: bool) {
        self.state.lock().device_local_only = enabled;
    }

    /// Make every fence wait time out.
    pub fn set_fences_hang(&self, hang: bool) {
        self.state.lock().hang_fences = hang;
    }

    /// Make every submission fail without reaching the queue.
    pub fn set_submits_fail(&self, fail: bool) {
        self.state.lock().fail_submits = fail;
    }

    pub fn push_acquire_outcome(&self, outcome: AcquireOutcome) {
        self.state.lock().acquire_script.push_back(outcome);
    }

    pub fn push_present_outcome(&self, outcome: PresentOutcome) {
        self.state.lock().present_script.push_back(outcome);
    }

    // === Inspection ===

    pub fn is_live(&self, handle: NativeHandle) -> bool {
        self.state.lock().live.contains_key(&handle)
    }

    pub fn live_count(&self, kind: ObjectKind) -> usize {
        self.state.lock().live.values().filter(|k| **k == kind).count()
    }

    pub fn destroyed(&self) -> Vec<(ObjectKind, NativeHandle)> {
        self.state.lock().destroyed.clone()
    }

    pub fn destroy_count(&self, handle: NativeHandle) -> usize {
        self.state
            .lock()
            .destroyed
            .iter()
            .filter(|(_, h)| *h == handle)
            .count()
    }

    pub fn double_destroys(&self) -> usize {
        self.state.lock().double_destroys
    }

    pub fn buffer_contents(&self, buffer: NativeHandle) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer).map(|b| b.data.clone())
    }

    pub fn image_descriptor(&self, image: NativeHandle) -> Option<TextureDescriptor> {
        self.state.lock().images.get(&image).cloned()
    }

    pub fn commands(&self, cmd: NativeHandle) -> Vec<GpuCommand> {
        self.state
            .lock()
            .commands
            .get(&cmd)
            .cloned()
            .unwrap_or_default()
    }

    pub fn submissions(&self) -> Vec<SubmitInfo> {
        self.state.lock().submissions.clone()
    }

    pub fn descriptor_writes(&self) -> Vec<DescriptorWrite> {
        self.state.lock().descriptor_writes.clone()
    }

    pub fn presented_images(&self) -> Vec<u32> {
        self.state.lock().presented.clone()
    }

    pub fn swapchain_recreations(&self) -> u32 {
        self.state.lock().swapchain_recreations
    }

    pub fn wait_idle_calls(&self) -> u32 {
        self.state.lock().wait_idle_calls
    }

    pub fn is_swapchain_framebuffer(&self, handle: NativeHandle) -> bool {
        self.swapchain_framebuffers.contains(&handle)
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new(3)
    }
}

impl GpuBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> GraphicsResult<RawBuffer> {
        let handle = self.alloc(ObjectKind::Buffer);
        let mut state = self.state.lock();
        let host_visible = match desc.placement {
            MemoryPlacement::HostVisible => true,
            MemoryPlacement::DeviceLocal => false,
            MemoryPlacement::Auto => !state.device_local_only,
        };
        log::trace!(
            "DummyBackend: creating buffer {:?} {:?} (size: {}, host visible: {})",
            desc.label,
            handle,
            desc.size,
            host_visible
        );
        state.buffers.insert(
            handle,
            DummyBuffer {
                host_visible,
                data: vec![0; desc.size as usize],
            },
        );
        Ok(RawBuffer {
            handle,
            size: desc.size,
            host_visible,
        })
    }

    fn write_buffer(&self, buffer: NativeHandle, offset: u64, data: &[u8]) -> GraphicsResult<()> {
        let mut state = self.state.lock();
        let target = state.buffers.get_mut(&buffer).ok_or_else(|| {
            GraphicsError::ResourceCreationFailed {
                kind: ObjectKind::Buffer,
                reason: format!("unknown buffer {buffer:?}"),
            }
        })?;
        if !target.host_visible {
            return Err(GraphicsError::NotHostVisible);
        }
        let end = offset as usize + data.len();
        if end > target.data.len() {
            return Err(GraphicsError::BufferTooSmall {
                capacity: target.data.len() as u64,
                requested: end as u64,
            });
        }
        target.data[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn create_image(&self, desc: &TextureDescriptor) -> GraphicsResult<NativeHandle> {
        let handle = self.alloc(ObjectKind::Image);
        log::trace!(
            "DummyBackend: creating image {:?} {:?} ({}x{} {:?})",
            desc.label,
            handle,
            desc.width,
            desc.height,
            desc.format
        );
        self.state.lock().images.insert(handle, desc.clone());
        Ok(handle)
    }

    fn create_image_view(
        &self,
        _image: NativeHandle,
        _desc: &TextureDescriptor,
    ) -> GraphicsResult<NativeHandle> {
        Ok(self.alloc(ObjectKind::ImageView))
    }

    fn create_sampler(&self, _desc: &SamplerDescriptor) -> GraphicsResult<NativeHandle> {
        Ok(self.alloc(ObjectKind::Sampler))
    }

    fn create_render_pass(&self, layout: &RenderPassLayout) -> GraphicsResult<NativeHandle> {
        log::trace!(
            "DummyBackend: creating render pass with {} attachments",
            layout.attachment_count()
        );
        Ok(self.alloc(ObjectKind::RenderPass))
    }

    fn swapchain_render_pass(&self) -> NativeHandle {
        self.swapchain_render_pass
    }

    fn create_framebuffer(
        &self,
        _render_pass: NativeHandle,
        attachments: &[NativeHandle],
        width: u32,
        height: u32,
    ) -> GraphicsResult<NativeHandle> {
        log::trace!(
            "DummyBackend: creating framebuffer {}x{} with {} attachments",
            width,
            height,
            attachments.len()
        );
        Ok(self.alloc(ObjectKind::Framebuffer))
    }

    fn swapchain_framebuffer(&self, image_index: u32) -> NativeHandle {
        self.swapchain_framebuffers
            .get(image_index as usize)
            .copied()
            .unwrap_or(NativeHandle::NULL)
    }

    fn create_pipeline(
        &self,
        desc: &PipelineDescriptor,
        _render_pass: NativeHandle,
    ) -> GraphicsResult<RawPipeline> {
        log::trace!("DummyBackend: creating pipeline {}", desc.label);
        let set_layouts = (0..desc.set_count())
            .map(|_| self.alloc(ObjectKind::DescriptorSetLayout))
            .collect();
        Ok(RawPipeline {
            pipeline: self.alloc(ObjectKind::Pipeline),
            layout: self.alloc(ObjectKind::PipelineLayout),
            set_layouts,
        })
    }

    fn allocate_descriptor_set(&self, _set_layout: NativeHandle) -> GraphicsResult<NativeHandle> {
        Ok(self.alloc(ObjectKind::DescriptorSet))
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        self.state.lock().descriptor_writes.extend_from_slice(writes);
    }

    fn create_sampled_image_descriptor(
        &self,
        view: NativeHandle,
        sampler: NativeHandle,
    ) -> GraphicsResult<NativeHandle> {
        let set = self.alloc(ObjectKind::DescriptorSet);
        self.update_descriptor_sets(&[DescriptorWrite {
            set,
            binding: 0,
            array_element: 0,
            resource: DescriptorResource::SampledImage { view, sampler },
        }]);
        Ok(set)
    }

    fn destroy(&self, kind: ObjectKind, handle: NativeHandle) {
        let mut state = self.state.lock();
        match state.live.remove(&handle) {
            Some(live_kind) => {
                debug_assert_eq!(live_kind, kind, "destroy kind mismatch for {handle:?}");
                log::trace!("DummyBackend: destroying {:?} {:?}", kind, handle);
            }
            None => {
                log::error!("DummyBackend: {:?} {:?} destroyed twice", kind, handle);
                state.double_destroys += 1;
            }
        }
        state.buffers.remove(&handle);
        state.images.remove(&handle);
        if let Some(buffers) = state.pool_buffers.remove(&handle) {
            for cmd in buffers {
                state.commands.remove(&cmd);
            }
        }
        state.destroyed.push((kind, handle));
    }

    fn create_command_pool(&self, _transient: bool) -> GraphicsResult<NativeHandle> {
        let pool = self.alloc(ObjectKind::CommandPool);
        self.state.lock().pool_buffers.insert(pool, Vec::new());
        Ok(pool)
    }

    fn reset_command_pool(&self, pool: NativeHandle) -> GraphicsResult<()> {
        log::trace!("DummyBackend: resetting command pool {:?}", pool);
        Ok(())
    }

    fn allocate_command_buffer(&self, pool: NativeHandle) -> GraphicsResult<NativeHandle> {
        let cmd = NativeHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let mut state = self.state.lock();
        state.pool_buffers.entry(pool).or_default().push(cmd);
        state.commands.insert(cmd, Vec::new());
        Ok(cmd)
    }

    fn begin_command_buffer(&self, cmd: NativeHandle, _one_time: bool) -> GraphicsResult<()> {
        self.state.lock().commands.insert(cmd, Vec::new());
        Ok(())
    }

    fn end_command_buffer(&self, _cmd: NativeHandle) -> GraphicsResult<()> {
        Ok(())
    }

    fn record(&self, cmd: NativeHandle, command: &GpuCommand) {
        self.state
            .lock()
            .commands
            .entry(cmd)
            .or_default()
            .push(command.clone());
    }

    fn create_fence(&self, signaled: bool) -> GraphicsResult<NativeHandle> {
        let fence = self.alloc(ObjectKind::Fence);
        self.state.lock().fences.insert(fence, signaled);
        Ok(fence)
    }

    fn wait_fence(&self, fence: NativeHandle, _timeout: Duration) -> GraphicsResult<bool> {
        let state = self.state.lock();
        if state.hang_fences {
            return Ok(false);
        }
        Ok(state.fences.get(&fence).copied().unwrap_or(false))
    }

    fn reset_fence(&self, fence: NativeHandle) -> GraphicsResult<()> {
        self.state.lock().fences.insert(fence, false);
        Ok(())
    }

    fn create_semaphore(&self) -> GraphicsResult<NativeHandle> {
        Ok(self.alloc(ObjectKind::Semaphore))
    }

    fn submit(&self, info: &SubmitInfo) -> GraphicsResult<()> {
        let mut state = self.state.lock();
        if state.fail_submits {
            return Err(GraphicsError::SubmitFailed("queue submission rejected".to_string()));
        }

        // Submissions complete immediately; apply their buffer copies.
        let copies: Vec<(NativeHandle, NativeHandle, u64, u64, u64)> = info
            .command_buffers
            .iter()
            .filter_map(|cmd| state.commands.get(cmd))
            .flatten()
            .filter_map(|command| match command {
                GpuCommand::CopyBuffer {
                    src,
                    dst,
                    src_offset,
                    dst_offset,
                    size,
                } => Some((*src, *dst, *src_offset, *dst_offset, *size)),
                _ => None,
            })
            .collect();
        for (src, dst, src_offset, dst_offset, size) in copies {
            let bytes = state
                .buffers
                .get(&src)
                .map(|b| b.data[src_offset as usize..(src_offset + size) as usize].to_vec());
            if let (Some(bytes), Some(target)) = (bytes, state.buffers.get_mut(&dst)) {
                target.data[dst_offset as usize..(dst_offset + size) as usize]
                    .copy_from_slice(&bytes);
            }
        }

        if let Some(fence) = info.fence {
            state.fences.insert(fence, true);
        }
        state.submissions.push(info.clone());
        Ok(())
    }

    fn wait_idle(&self) -> GraphicsResult<()> {
        self.state.lock().wait_idle_calls += 1;
        Ok(())
    }

    fn acquire_next_image(
        &self,
        _signal: NativeHandle,
        _timeout: Duration,
    ) -> GraphicsResult<AcquireOutcome> {
        let mut state = self.state.lock();
        if let Some(outcome) = state.acquire_script.pop_front() {
            return Ok(outcome);
        }
        let image_index = state.next_image;
        state.next_image = (state.next_image + 1) % self.image_count;
        Ok(AcquireOutcome::Acquired {
            image_index,
            suboptimal: false,
        })
    }

    fn present(&self, image_index: u32, _wait: NativeHandle) -> GraphicsResult<PresentOutcome> {
        let mut state = self.state.lock();
        state.presented.push(image_index);
        Ok(state
            .present_script
            .pop_front()
            .unwrap_or(PresentOutcome::Presented))
    }

    fn recreate_swapchain(&self, width: u32, height: u32) -> GraphicsResult<()> {
        let mut state = self.state.lock();
        log::debug!("DummyBackend: recreating swapchain at {}x{}", width, height);
        state.extent = (width, height);
        state.next_image = 0;
        state.swapchain_recreations += 1;
        Ok(())
    }

    fn swapchain_extent(&self) -> (u32, u32) {
        self.state.lock().extent
    }

    fn swapchain_format(&self) -> TextureFormat {
        TextureFormat::Bgra8UnormSrgb
    }

    fn swapchain_image_count(&self) -> u32 {
        self.image_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_applies_copies_and_signals() {
        let backend = DummyBackend::new(2);
        let desc = BufferDescriptor {
            label: None,
            size: 4,
            usage: BufferUsage::COPY_SRC,
            placement: MemoryPlacement::HostVisible,
        };
        let src = backend.create_buffer(&desc).unwrap();
        let dst = backend
            .create_buffer(&BufferDescriptor {
                placement: MemoryPlacement::DeviceLocal,
                ..desc
            })
            .unwrap();
        backend.write_buffer(src.handle, 0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(
            backend.write_buffer(dst.handle, 0, &[0]),
            Err(GraphicsError::NotHostVisible)
        );

        let pool = backend.create_command_pool(true).unwrap();
        let cmd = backend.allocate_command_buffer(pool).unwrap();
        backend.record(
            cmd,
            &GpuCommand::CopyBuffer {
                src: src.handle,
                dst: dst.handle,
                src_offset: 0,
                dst_offset: 0,
                size: 4,
            },
        );
        let fence = backend.create_fence(false).unwrap();
        backend
            .submit(&SubmitInfo {
                command_buffers: vec![cmd],
                fence: Some(fence),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(backend.buffer_contents(dst.handle), Some(vec![1, 2, 3, 4]));
        assert!(backend
            .wait_fence(fence, Duration::from_millis(1))
            .unwrap());
    }

    #[test]
    fn test_double_destroy_is_counted() {
        let backend = DummyBackend::default();
        let sampler = backend.create_sampler(&SamplerDescriptor::default()).unwrap();
        backend.destroy(ObjectKind::Sampler, sampler);
        backend.destroy(ObjectKind::Sampler, sampler);
        assert_eq!(backend.double_destroys(), 1);
        assert_eq!(backend.destroy_count(sampler), 2);
    }
}
