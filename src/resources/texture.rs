//! Textures: the GPU-side image bundle and CPU-side pixel data.

use std::path::Path;

use image::{DynamicImage, GenericImageView};

use crate::backend::{NativeHandle, TextureDescriptor, TextureFormat};
use crate::error::LoadError;
use crate::handle::Handle;

/// Image, view and sampler created together.
///
/// The allocator never hands out an image without a view.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferImage {
    pub image: NativeHandle,
    pub view: NativeHandle,
    pub sampler: NativeHandle,
    pub descriptor: TextureDescriptor,
}

impl BufferImage {
    pub fn width(&self) -> u32 {
        self.descriptor.width
    }

    pub fn height(&self) -> u32 {
        self.descriptor.height
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.descriptor.width, self.descriptor.height)
    }

    pub fn format(&self) -> TextureFormat {
        self.descriptor.format
    }
}

/// Entry in the device's global texture table.
pub type TextureHandle = Handle<BufferImage>;

/// Decoded texture data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub data: Vec<u8>,
    pub name: String,
}

impl TextureData {
    /// Load texture from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        let bytes = std::fs::read(path).map_err(|e| LoadError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_bytes(&bytes, &name)
    }

    /// Decode texture from encoded bytes (PNG, JPEG, ...)
    pub fn from_bytes(bytes: &[u8], name: &str) -> Result<Self, LoadError> {
        let img = image::load_from_memory(bytes).map_err(|e| LoadError::Decode {
            path: name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::from_image(img, name))
    }

    fn from_image(img: DynamicImage, name: &str) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            format: TextureFormat::Rgba8UnormSrgb,
            data: img.to_rgba8().into_raw(),
            name: name.to_string(),
        }
    }

    /// Raw pixels, checked against the expected size.
    pub fn from_pixels(
        width: u32,
        height: u32,
        format: TextureFormat,
        data: Vec<u8>,
        name: &str,
    ) -> Result<Self, LoadError> {
        let expected = width as usize * height as usize * format.bytes_per_pixel() as usize;
        if data.len() != expected {
            return Err(LoadError::SizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            format,
            data,
            name: name.to_string(),
        })
    }

    /// Create a solid color texture
    pub fn solid_color(color: [u8; 4], name: &str) -> Self {
        Self {
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8UnormSrgb,
            data: color.to_vec(),
            name: name.to_string(),
        }
    }

    /// The grey texture shown in place of missing or broken textures.
    pub fn fallback() -> Self {
        Self::solid_color([128, 128, 128, 255], "fallback")
    }
}
