//! Vulkan physical and logical device management.

use std::ffi::CStr;

use ash::vk;

use crate::error::GraphicsError;

/// The chosen GPU and its graphics-and-present queue family.
pub struct SelectedDevice {
    pub physical_device: vk::PhysicalDevice,
    pub queue_family: u32,
    pub name: String,
}

/// Select the best physical device able to draw to `surface`.
///
/// Prefers discrete GPUs over integrated GPUs.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface_fn: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<SelectedDevice, GraphicsError> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        GraphicsError::InitializationFailed(format!(
            "Failed to enumerate physical devices: {:?}",
            e
        ))
    })?;

    if devices.is_empty() {
        return Err(GraphicsError::InitializationFailed(
            "No Vulkan-capable GPU found".to_string(),
        ));
    }

    let mut best: Option<(u32, SelectedDevice)> = None;
    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let features = unsafe { instance.get_physical_device_features(device) };
        // SAFETY: device_name is a null-terminated string filled in by the driver
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        if features.sampler_anisotropy == vk::FALSE {
            log::debug!("Skipping GPU {name}: no sampler anisotropy");
            continue;
        }
        let Some(queue_family) = find_queue_family(instance, surface_fn, device, surface) else {
            log::debug!("Skipping GPU {name}: no queue family can present");
            continue;
        };

        let mut score = match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 1,
        };
        score += properties.limits.max_image_dimension2_d / 1024;

        log::info!(
            "Found GPU: {} (type: {:?}, score: {})",
            name,
            properties.device_type,
            score
        );

        if best.as_ref().map_or(true, |(best_score, _)| score > *best_score) {
            best = Some((
                score,
                SelectedDevice {
                    physical_device: device,
                    queue_family,
                    name,
                },
            ));
        }
    }

    best.map(|(_, selected)| selected)
        .ok_or_else(|| GraphicsError::InitializationFailed("No suitable GPU found".to_string()))
}

/// A queue family supporting both graphics and presentation to `surface`.
fn find_queue_family(
    instance: &ash::Instance,
    surface_fn: &ash::khr::surface::Instance,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> Option<u32> {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    families.iter().enumerate().find_map(|(index, family)| {
        let index = index as u32;
        let graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let present = unsafe {
            surface_fn.get_physical_device_surface_support(physical_device, index, surface)
        }
        .unwrap_or(false);
        (graphics && present).then_some(index)
    })
}

/// Create a logical device with the swapchain extension enabled.
pub fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
) -> Result<ash::Device, GraphicsError> {
    let queue_priorities = [1.0f32];
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(&queue_priorities)];

    #[allow(unused_mut)]
    let mut device_extensions = vec![ash::khr::swapchain::NAME.as_ptr()];
    #[cfg(target_os = "macos")]
    device_extensions.push(ash::khr::portability_subset::NAME.as_ptr());

    let features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&device_extensions)
        .enabled_features(&features);

    unsafe { instance.create_device(physical_device, &create_info, None) }.map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create logical device: {:?}", e))
    })
}
