//! Adapter (physical device) selection.
//!
//! Adapters are examined in enumeration order. Software-emulated adapters
//! (CPU-type devices such as llvmpipe) are skipped, and the first adapter
//! that meets the minimum capability level is selected. The capability
//! check itself is a pure function over [`AdapterProfile`]s so the
//! exhaustion path can be exercised without a Vulkan instance.

use std::ffi::CStr;

use ash::vk;
use tracing::{debug, info, warn};

use crate::error::RhiError;

/// Minimum Vulkan version an adapter must support.
///
/// 1.3 gives us dynamic rendering and timeline semaphores as core features.
pub const MIN_API_VERSION: u32 = vk::API_VERSION_1_3;

/// Queue family indices for the operations this harness performs.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueueFamilyIndices {
    /// Index of the queue family that supports graphics operations.
    pub graphics_family: Option<u32>,
    /// Index of the queue family that supports presentation to a surface.
    pub present_family: Option<u32>,
}

impl QueueFamilyIndices {
    /// Checks if the required queue families are available.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.graphics_family.is_some() && self.present_family.is_some()
    }

    /// Returns the unique queue family indices.
    ///
    /// Graphics and present often share a family; device creation must not
    /// request the same family twice.
    pub fn unique_families(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(2);

        if let Some(graphics) = self.graphics_family {
            families.push(graphics);
        }
        if let Some(present) = self.present_family {
            if !families.contains(&present) {
                families.push(present);
            }
        }

        families
    }
}

/// Capability summary of one enumerated adapter.
///
/// Built from `vkGetPhysicalDeviceProperties` and the queue family scan;
/// everything [`pick_adapter`] needs to accept or reject the adapter.
#[derive(Clone, Debug)]
pub struct AdapterProfile {
    /// Adapter name as reported by the driver.
    pub name: String,
    /// True for software-emulated adapters (CPU device type).
    pub is_software: bool,
    /// Highest Vulkan version the adapter supports.
    pub api_version: u32,
    /// Whether a graphics-capable queue family exists.
    pub has_graphics_queue: bool,
    /// Whether a queue family can present to the target surface.
    pub has_present_queue: bool,
}

impl AdapterProfile {
    fn meets_minimum(&self) -> bool {
        self.api_version >= MIN_API_VERSION && self.has_graphics_queue && self.has_present_queue
    }
}

/// The selected adapter, ready for logical device creation.
pub struct AdapterInfo {
    /// Vulkan physical device handle.
    pub device: vk::PhysicalDevice,
    /// Device properties (name, limits, API version).
    pub properties: vk::PhysicalDeviceProperties,
    /// Queue family indices for graphics and present.
    pub queue_families: QueueFamilyIndices,
}

impl AdapterInfo {
    /// Returns the adapter name as a string.
    pub fn name(&self) -> &str {
        unsafe {
            CStr::from_ptr(self.properties.device_name.as_ptr())
                .to_str()
                .unwrap_or("Unknown Adapter")
        }
    }

    /// Returns the Vulkan API version supported by the adapter.
    pub fn api_version(&self) -> (u32, u32, u32) {
        let version = self.properties.api_version;
        (
            vk::api_version_major(version),
            vk::api_version_minor(version),
            vk::api_version_patch(version),
        )
    }
}

impl std::fmt::Debug for AdapterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (major, minor, patch) = self.api_version();
        f.debug_struct("AdapterInfo")
            .field("name", &self.name())
            .field("api_version", &format!("{}.{}.{}", major, minor, patch))
            .field("queue_families", &self.queue_families)
            .finish()
    }
}

/// Picks the first capable adapter from enumeration-ordered profiles.
///
/// Software adapters are skipped. The first remaining adapter meeting
/// [`MIN_API_VERSION`] with graphics and present queues wins; no scoring,
/// no reordering.
///
/// # Errors
///
/// Returns [`RhiError::NoCapableDevice`] if the list is exhausted without
/// a match. No device is created in that case.
pub fn pick_adapter(profiles: &[AdapterProfile]) -> Result<usize, RhiError> {
    for (index, profile) in profiles.iter().enumerate() {
        if profile.is_software {
            debug!("Adapter '{}' skipped: software-emulated", profile.name);
            continue;
        }

        if !profile.meets_minimum() {
            debug!(
                "Adapter '{}' skipped: api {}.{}, graphics={}, present={}",
                profile.name,
                vk::api_version_major(profile.api_version),
                vk::api_version_minor(profile.api_version),
                profile.has_graphics_queue,
                profile.has_present_queue
            );
            continue;
        }

        return Ok(index);
    }

    warn!("Adapter enumeration exhausted without a capable hardware adapter");
    Err(RhiError::NoCapableDevice)
}

/// Enumerates adapters and selects the first capable one.
///
/// # Arguments
///
/// * `instance` - The Vulkan instance
/// * `surface` - The window surface, for present support checks
/// * `surface_loader` - The surface extension loader
///
/// # Errors
///
/// Returns [`RhiError::NoCapableDevice`] if no hardware adapter meets the
/// minimum capability level.
pub fn select_adapter(
    instance: &ash::Instance,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> Result<AdapterInfo, RhiError> {
    let devices = unsafe { instance.enumerate_physical_devices()? };

    if devices.is_empty() {
        warn!("No Vulkan-capable adapters found");
        return Err(RhiError::NoCapableDevice);
    }

    info!("Found {} adapter(s)", devices.len());

    let mut profiles = Vec::with_capacity(devices.len());
    let mut families = Vec::with_capacity(devices.len());

    for &device in &devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let queue_families = find_queue_families(instance, device, surface, surface_loader);

        let name = unsafe {
            CStr::from_ptr(properties.device_name.as_ptr())
                .to_str()
                .unwrap_or("Unknown Adapter")
                .to_owned()
        };

        profiles.push(AdapterProfile {
            name,
            is_software: properties.device_type == vk::PhysicalDeviceType::CPU,
            api_version: properties.api_version,
            has_graphics_queue: queue_families.graphics_family.is_some(),
            has_present_queue: queue_families.present_family.is_some(),
        });
        families.push(queue_families);
    }

    let index = pick_adapter(&profiles)?;

    let selected = AdapterInfo {
        device: devices[index],
        properties: unsafe { instance.get_physical_device_properties(devices[index]) },
        queue_families: families[index],
    };

    let (major, minor, patch) = selected.api_version();
    info!(
        "Selected adapter: '{}' (Vulkan {}.{}.{})",
        selected.name(),
        major,
        minor,
        patch
    );

    Ok(selected)
}

/// Finds graphics and present queue family indices for an adapter.
fn find_queue_families(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> QueueFamilyIndices {
    let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

    let mut indices = QueueFamilyIndices::default();

    for (i, family) in queue_families.iter().enumerate() {
        let i = i as u32;

        if family.queue_count == 0 {
            continue;
        }

        if indices.graphics_family.is_none()
            && family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
        {
            indices.graphics_family = Some(i);
        }

        if indices.present_family.is_none() {
            let present_support = unsafe {
                surface_loader
                    .get_physical_device_surface_support(device, i, surface)
                    .unwrap_or(false)
            };

            if present_support {
                indices.present_family = Some(i);
            }
        }
    }

    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hardware(name: &str) -> AdapterProfile {
        AdapterProfile {
            name: name.to_owned(),
            is_software: false,
            api_version: MIN_API_VERSION,
            has_graphics_queue: true,
            has_present_queue: true,
        }
    }

    fn software(name: &str) -> AdapterProfile {
        AdapterProfile {
            is_software: true,
            ..hardware(name)
        }
    }

    #[test]
    fn test_pick_first_capable_adapter() {
        let profiles = [hardware("gpu0"), hardware("gpu1")];
        assert_eq!(pick_adapter(&profiles).unwrap(), 0);
    }

    #[test]
    fn test_software_adapters_are_skipped() {
        let profiles = [software("llvmpipe"), hardware("gpu1")];
        assert_eq!(pick_adapter(&profiles).unwrap(), 1);
    }

    #[test]
    fn test_all_software_fails_without_device_creation() {
        let profiles = [software("llvmpipe"), software("swiftshader")];
        assert!(matches!(
            pick_adapter(&profiles),
            Err(RhiError::NoCapableDevice)
        ));
    }

    #[test]
    fn test_empty_enumeration_fails() {
        assert!(matches!(pick_adapter(&[]), Err(RhiError::NoCapableDevice)));
    }

    #[test]
    fn test_old_api_version_is_rejected() {
        let old = AdapterProfile {
            api_version: vk::API_VERSION_1_1,
            ..hardware("legacy")
        };
        assert!(matches!(
            pick_adapter(&[old]),
            Err(RhiError::NoCapableDevice)
        ));
    }

    #[test]
    fn test_missing_present_queue_is_rejected() {
        let headless = AdapterProfile {
            has_present_queue: false,
            ..hardware("compute-only")
        };
        let profiles = [headless, hardware("gpu1")];
        assert_eq!(pick_adapter(&profiles).unwrap(), 1);
    }

    #[test]
    fn test_unique_families_deduplicates() {
        let indices = QueueFamilyIndices {
            graphics_family: Some(0),
            present_family: Some(0),
        };
        assert_eq!(indices.unique_families(), vec![0]);

        let split = QueueFamilyIndices {
            graphics_family: Some(0),
            present_family: Some(1),
        };
        assert_eq!(split.unique_families(), vec![0, 1]);
    }

    #[test]
    fn test_is_complete() {
        assert!(!QueueFamilyIndices::default().is_complete());
        assert!(
            QueueFamilyIndices {
                graphics_family: Some(0),
                present_family: Some(0),
            }
            .is_complete()
        );
    }
}
