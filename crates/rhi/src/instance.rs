//! Vulkan instance management.
//!
//! Owns the VkInstance and, in debug builds, the Khronos validation layer
//! with a debug-utils messenger that forwards messages into `tracing`.

use std::borrow::Cow;
use std::ffi::CStr;

use ash::{Entry, vk};
use tracing::{error, info, warn};

use crate::error::RhiError;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance extensions needed to create a surface on this platform.
#[cfg(target_os = "windows")]
const SURFACE_EXTENSIONS: &[&CStr] = &[ash::khr::surface::NAME, ash::khr::win32_surface::NAME];
#[cfg(target_os = "linux")]
const SURFACE_EXTENSIONS: &[&CStr] = &[
    ash::khr::surface::NAME,
    ash::khr::xlib_surface::NAME,
    ash::khr::wayland_surface::NAME,
];
#[cfg(target_os = "macos")]
const SURFACE_EXTENSIONS: &[&CStr] = &[ash::khr::surface::NAME, ash::ext::metal_surface::NAME];

/// Vulkan instance wrapper with optional validation support.
pub struct Instance {
    entry: Entry,
    instance: ash::Instance,
    debug: Option<DebugMessenger>,
}

struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl Instance {
    /// Creates a Vulkan 1.3 instance.
    ///
    /// When `enable_validation` is set and the Khronos validation layer is
    /// installed, the layer is enabled and its output lands in the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the Vulkan library cannot be loaded or instance
    /// creation fails.
    pub fn new(enable_validation: bool) -> Result<Self, RhiError> {
        let entry = unsafe { Entry::load()? };

        let validation = enable_validation && validation_layer_present(&entry)?;
        if enable_validation && !validation {
            warn!("Validation layer requested but not installed");
        }

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"vkexp")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extensions: Vec<*const i8> =
            SURFACE_EXTENSIONS.iter().map(|ext| ext.as_ptr()).collect();
        let mut layers = Vec::new();
        if validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
            layers.push(VALIDATION_LAYER.as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        let instance = unsafe { entry.create_instance(&create_info, None)? };
        info!(
            "Vulkan instance created (API 1.3, validation {})",
            if validation { "on" } else { "off" }
        );

        let debug = if validation {
            Some(create_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        Ok(Self {
            entry,
            instance,
            debug,
        })
    }

    /// Returns the Vulkan instance handle.
    #[inline]
    pub fn handle(&self) -> &ash::Instance {
        &self.instance
    }

    /// Returns the Vulkan entry point loader.
    #[inline]
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Returns whether the validation layer is active.
    #[inline]
    pub fn has_validation(&self) -> bool {
        self.debug.is_some()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some(debug) = &self.debug {
                debug
                    .loader
                    .destroy_debug_utils_messenger(debug.messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        info!("Vulkan instance destroyed");
    }
}

fn validation_layer_present(entry: &Entry) -> Result<bool, RhiError> {
    let layers = unsafe { entry.enumerate_instance_layer_properties()? };
    Ok(layers.iter().any(|layer| {
        let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
        name == VALIDATION_LAYER
    }))
}

fn create_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
) -> Result<DebugMessenger, RhiError> {
    let loader = ash::ext::debug_utils::Instance::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None)? };

    Ok(DebugMessenger { loader, messenger })
}

/// Routes validation layer output into `tracing`.
///
/// # Safety
///
/// Called by the Vulkan driver under the debug-utils callback contract.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }

    let data = unsafe { &*p_callback_data };
    let message = if data.p_message.is_null() {
        Cow::Borrowed("(no message)")
    } else {
        unsafe { CStr::from_ptr(data.p_message).to_string_lossy() }
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("[vulkan] {}", message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("[vulkan] {}", message);
    } else {
        info!("[vulkan] {}", message);
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_extensions_include_base_surface() {
        assert!(SURFACE_EXTENSIONS.contains(&ash::khr::surface::NAME));
        assert!(SURFACE_EXTENSIONS.len() >= 2);
    }
}
