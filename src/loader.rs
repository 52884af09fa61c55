//! Background texture loading.
//!
//! A [`ResourceLoader`] owns one worker thread with its own instant command
//! manager, so decoding and uploads never stall the render thread's one-shot
//! work. Requests are served in submission order; every request hands back a
//! [`LoadTicket`] the caller polls or blocks on.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::backend::{SamplerDescriptor, TextureDescriptor, TextureFormat, TextureUsage};
use crate::commands::InstantCommands;
use crate::device::{RenderDevice, TextureSwap};
use crate::error::{GraphicsError, GraphicsResult, LoadError};
use crate::handle::HandleManager;
use crate::resources::{BufferImage, ResourceAllocator, TextureData, TextureHandle};

/// Work accepted by the loader
#[derive(Debug, Clone)]
pub enum LoadRequest {
    /// Decode an image file and upload it as a new texture.
    File { path: PathBuf },
    /// Upload tightly packed RGBA8 pixels as a new texture.
    Upload {
        pixels: Vec<u8>,
        width: u32,
        height: u32,
    },
    /// Replace the contents of an existing texture. Pixels must match its
    /// size and format. A stale handle makes this a no-op.
    Update {
        handle: TextureHandle,
        pixels: Vec<u8>,
    },
}

pub type LoadResult = Result<TextureHandle, LoadError>;

type ErrorCallback = Box<dyn Fn(&LoadError) + Send + Sync>;

/// Pending result of a [`LoadRequest`]
pub struct LoadTicket {
    receiver: mpsc::Receiver<LoadResult>,
    result: Option<LoadResult>,
}

impl LoadTicket {
    /// The result, once the worker has produced it.
    pub fn try_get(&mut self) -> Option<&LoadResult> {
        if self.result.is_none() {
            self.result = match self.receiver.try_recv() {
                Ok(result) => Some(result),
                Err(mpsc::TryRecvError::Empty) => None,
                Err(mpsc::TryRecvError::Disconnected) => Some(Err(LoadError::Cancelled)),
            };
        }
        self.result.as_ref()
    }

    pub fn is_ready(&mut self) -> bool {
        self.try_get().is_some()
    }

    /// Block until the worker answers.
    pub fn wait(mut self) -> LoadResult {
        if let Some(result) = self.result.take() {
            return result;
        }
        self.receiver.recv().unwrap_or(Err(LoadError::Cancelled))
    }
}

struct Job {
    request: LoadRequest,
    reply: mpsc::Sender<LoadResult>,
}

struct LoaderShared {
    queue: Mutex<VecDeque<Job>>,
    wake: Condvar,
    cancelled: AtomicBool,
    on_error: Mutex<Option<ErrorCallback>>,
}

/// Everything the worker thread needs to create and swap textures
struct LoaderContext {
    allocator: ResourceAllocator,
    textures: Arc<HandleManager<BufferImage>>,
    swaps: Arc<Mutex<Vec<TextureSwap>>>,
}

/// Worker thread turning [`LoadRequest`]s into textures
pub struct ResourceLoader {
    shared: Arc<LoaderShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceLoader {
    pub fn new(device: &RenderDevice, fence_timeout: Duration) -> GraphicsResult<Self> {
        let instant = Arc::new(InstantCommands::new(
            Arc::clone(device.backend()),
            Arc::clone(device.collector()),
            fence_timeout,
        )?);
        let context = LoaderContext {
            allocator: device.allocator().with_instant_commands(instant),
            textures: Arc::clone(device.textures()),
            swaps: Arc::clone(device.texture_swaps()),
        };
        let shared = Arc::new(LoaderShared {
            queue: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            cancelled: AtomicBool::new(false),
            on_error: Mutex::new(None),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("resource-loader".into())
                .spawn(move || worker_loop(shared, context))
                .map_err(|e| {
                    GraphicsError::InitializationFailed(format!(
                        "failed to spawn resource loader: {}",
                        e
                    ))
                })?
        };
        log::debug!("ResourceLoader: worker started");

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Called with every failed request, on the worker thread.
    pub fn set_error_callback(&self, callback: impl Fn(&LoadError) + Send + Sync + 'static) {
        *self.shared.on_error.lock() = Some(Box::new(callback));
    }

    pub fn request(&self, request: LoadRequest) -> LoadTicket {
        let (reply, receiver) = mpsc::channel();
        let ticket = LoadTicket {
            receiver,
            result: None,
        };
        let mut queue = self.shared.queue.lock();
        if self.shared.cancelled.load(Ordering::Acquire) {
            log::warn!("ResourceLoader: request after shutdown dropped");
            return ticket;
        }
        queue.push_back(Job { request, reply });
        self.shared.wake.notify_one();
        ticket
    }

    pub fn load_file(&self, path: impl Into<PathBuf>) -> LoadTicket {
        self.request(LoadRequest::File { path: path.into() })
    }

    pub fn upload(&self, pixels: Vec<u8>, width: u32, height: u32) -> LoadTicket {
        self.request(LoadRequest::Upload {
            pixels,
            width,
            height,
        })
    }

    pub fn update(&self, handle: TextureHandle, pixels: Vec<u8>) -> LoadTicket {
        self.request(LoadRequest::Update { handle, pixels })
    }

    /// Requests not yet picked up by the worker.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Stop the worker. The request being served finishes; queued ones are
    /// dropped and their tickets resolve to [`LoadError::Cancelled`].
    pub fn stop(&self) {
        {
            let _queue = self.shared.queue.lock();
            self.shared.cancelled.store(true, Ordering::Release);
            self.shared.wake.notify_all();
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::error!("ResourceLoader: worker thread panicked");
            }
            let dropped = self.shared.queue.lock().drain(..).count();
            log::debug!("ResourceLoader: stopped, {} requests dropped", dropped);
        }
    }
}

impl Drop for ResourceLoader {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: Arc<LoaderShared>, context: LoaderContext) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.cancelled.load(Ordering::Acquire) {
                    return;
                }
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                shared.wake.wait(&mut queue);
            }
        };

        let result = context.process(job.request);
        if let Err(e) = &result {
            log::warn!("ResourceLoader: {}", e);
            if let Some(callback) = shared.on_error.lock().as_ref() {
                callback(e);
            }
        }
        // the ticket may already be gone
        let _ = job.reply.send(result);
    }
}

impl LoaderContext {
    fn process(&self, request: LoadRequest) -> LoadResult {
        match request {
            LoadRequest::File { path } => {
                let data = TextureData::from_file(&path)?;
                log::debug!(
                    "ResourceLoader: decoded '{}' ({}x{})",
                    path.display(),
                    data.width,
                    data.height
                );
                self.register(self.create_image(&data)?)
            }
            LoadRequest::Upload {
                pixels,
                width,
                height,
            } => {
                let data = TextureData::from_pixels(
                    width,
                    height,
                    TextureFormat::Rgba8UnormSrgb,
                    pixels,
                    "upload",
                )?;
                self.register(self.create_image(&data)?)
            }
            LoadRequest::Update { handle, pixels } => {
                let Some(current) = self.textures.get(handle) else {
                    log::debug!("ResourceLoader: update of a released texture ignored");
                    return Ok(handle);
                };
                let data = TextureData::from_pixels(
                    current.width(),
                    current.height(),
                    current.format(),
                    pixels,
                    current.descriptor.label.as_deref().unwrap_or("update"),
                )?;
                let image = self.create_image(&data)?;
                match self.textures.update(handle, image) {
                    Ok(old) => {
                        // passes sampling the old view rebind before it is destroyed
                        self.swaps.lock().push(TextureSwap {
                            texture: handle,
                            retired: old.image,
                        });
                        self.allocator.retire_image(old);
                    }
                    // released while we were uploading
                    Err(image) => {
                        log::debug!("ResourceLoader: texture released during update");
                        self.allocator.retire_image(image);
                    }
                }
                Ok(handle)
            }
        }
    }

    fn create_image(&self, data: &TextureData) -> Result<BufferImage, LoadError> {
        let desc = TextureDescriptor::new(
            data.width,
            data.height,
            data.format,
            TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
        )
        .with_label(data.name.clone());
        let image = self
            .allocator
            .create_image(&desc, &SamplerDescriptor::default())
            .map_err(|e| LoadError::Upload(e.to_string()))?;
        if let Err(e) = self.allocator.upload_image(&image, &data.data) {
            self.allocator.retire_image(image);
            return Err(LoadError::Upload(e.to_string()));
        }
        Ok(image)
    }

    fn register(&self, image: BufferImage) -> LoadResult {
        let handle = self.textures.add(image.clone());
        if !handle.is_set() {
            self.allocator.retire_image(image);
            return Err(LoadError::Upload("texture table is full".to_string()));
        }
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::backend::{DummyBackend, ObjectKind};
    use crate::deferred::{DirtyCollectorConfig, ReclaimMode};
    use crate::RendererConfig;

    fn device() -> (Arc<DummyBackend>, RenderDevice) {
        let backend = Arc::new(DummyBackend::new(3));
        let config = RendererConfig::default().with_dirty_collector(DirtyCollectorConfig {
            mode: ReclaimMode::Inline,
            ..Default::default()
        });
        let device = RenderDevice::new(backend.clone(), &config).unwrap();
        (backend, device)
    }

    fn loader(device: &RenderDevice) -> ResourceLoader {
        ResourceLoader::new(device, Duration::from_millis(50)).unwrap()
    }

    #[test]
    fn test_upload_creates_texture() {
        let (backend, device) = device();
        let loader = loader(&device);

        let handle = loader.upload(vec![255; 2 * 2 * 4], 2, 2).wait().unwrap();
        let image = device.texture(handle);
        assert_eq!(image.extent(), (2, 2));
        assert!(backend.is_live(image.image));
    }

    #[test]
    fn test_failures_reach_callback() {
        let (_backend, device) = device();
        let loader = loader(&device);
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failures);
        loader.set_error_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let result = loader.upload(vec![0; 3], 2, 2).wait();
        assert_eq!(
            result,
            Err(LoadError::SizeMismatch {
                expected: 16,
                actual: 3
            })
        );
        let missing = loader.load_file("/definitely/not/here.png").wait();
        assert!(matches!(missing, Err(LoadError::Io { .. })));
        assert_eq!(failures.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_update_swaps_image_in_place() {
        let (_backend, device) = device();
        let loader = loader(&device);
        let handle = loader.upload(vec![0; 16], 2, 2).wait().unwrap();
        let before = device.texture(handle).image;
        let retired = device.collector().pending_of(ObjectKind::Image);

        assert_eq!(loader.update(handle, vec![7; 16]).wait(), Ok(handle));
        assert_ne!(device.texture(handle).image, before);
        assert_eq!(device.collector().pending_of(ObjectKind::Image), retired + 1);
        assert_eq!(
            device.take_texture_swaps(),
            vec![TextureSwap {
                texture: handle,
                retired: before
            }]
        );
        assert!(device.take_texture_swaps().is_empty());
    }

    #[test]
    fn test_stale_update_is_noop() {
        let (_backend, device) = device();
        let loader = loader(&device);
        let mut handle = loader.upload(vec![0; 16], 2, 2).wait().unwrap();
        let stale = handle;
        device.release_texture(&mut handle);
        let textures = device.textures().len();

        assert_eq!(loader.update(stale, vec![1; 16]).wait(), Ok(stale));
        assert_eq!(device.textures().len(), textures);
        assert!(device.take_texture_swaps().is_empty());
        assert!(!device.textures().is_valid(stale));
    }

    #[test]
    fn test_requests_after_stop_are_cancelled() {
        let (_backend, device) = device();
        let loader = loader(&device);
        loader.stop();
        assert!(!loader.is_running());

        let mut ticket = loader.upload(vec![0; 16], 2, 2);
        assert_eq!(ticket.try_get(), Some(&Err(LoadError::Cancelled)));
        assert_eq!(ticket.wait(), Err(LoadError::Cancelled));
    }
}
