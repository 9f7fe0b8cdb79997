//! Swapchain management.
//!
//! The [`Swapchain`] is a fixed ring of backbuffer images bound to a window
//! surface. The buffer count is chosen at construction and never changes;
//! there is no recreation path. A failed acquire or present indicates
//! device loss or GPU removal and is surfaced as a fatal error.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::error::RhiError;
use crate::instance::Instance;

/// Vulkan swapchain wrapper owning the backbuffer ring.
///
/// # Thread Safety
///
/// Not thread-safe; the single render thread owns it.
pub struct Swapchain {
    /// Reference to the logical device
    device: Arc<Device>,
    /// Swapchain extension loader
    swapchain_loader: ash::khr::swapchain::Device,
    /// Swapchain handle
    swapchain: vk::SwapchainKHR,
    /// Backbuffer images (owned by the swapchain)
    images: Vec<vk::Image>,
    /// Image views for the backbuffer images
    image_views: Vec<vk::ImageView>,
    /// Backbuffer pixel format
    format: vk::Format,
    /// Swapchain extent (resolution)
    extent: vk::Extent2D,
}

impl Swapchain {
    /// Creates a swapchain with a fixed ring of `buffer_count` backbuffers.
    ///
    /// The requested count is clamped to the surface's limits; the resulting
    /// count is fixed for the lifetime of the object. Presentation uses FIFO
    /// (vsync), which every Vulkan implementation provides.
    ///
    /// # Arguments
    ///
    /// * `instance` - The Vulkan instance
    /// * `device` - The logical device
    /// * `surface` - The window surface
    /// * `width` / `height` - Desired backbuffer size
    /// * `buffer_count` - Requested ring size
    ///
    /// # Errors
    ///
    /// Returns an error if surface queries or swapchain creation fail, or if
    /// the surface offers no usable format.
    pub fn new(
        instance: &Instance,
        device: Arc<Device>,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
        buffer_count: u32,
    ) -> Result<Self, RhiError> {
        let swapchain_loader = ash::khr::swapchain::Device::new(instance.handle(), device.handle());
        let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());

        let capabilities = unsafe {
            surface_loader
                .get_physical_device_surface_capabilities(device.physical_device(), surface)?
        };
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(device.physical_device(), surface)?
        };

        if formats.is_empty() {
            return Err(RhiError::Swapchain(
                "surface reports no pixel formats".to_string(),
            ));
        }

        let surface_format = choose_surface_format(&formats);
        let extent = choose_extent(&capabilities, width, height);
        let image_count = clamp_image_count(&capabilities, buffer_count);

        if image_count != buffer_count {
            warn!(
                "Requested {} backbuffers, surface allows {} (min {}, max {})",
                buffer_count,
                image_count,
                capabilities.min_image_count,
                capabilities.max_image_count
            );
        }

        info!(
            "Creating swapchain: {}x{}, format {:?}, FIFO, {} backbuffers",
            extent.width, extent.height, surface_format.format, image_count
        );

        let queue_families = device.queue_families();
        let graphics_family = queue_families.graphics_family.unwrap_or(0);
        let present_family = queue_families.present_family.unwrap_or(0);
        let queue_family_indices = [graphics_family, present_family];

        let (sharing_mode, queue_family_indices_slice) = if graphics_family != present_family {
            debug!(
                "Using CONCURRENT sharing between graphics ({}) and present ({}) families",
                graphics_family, present_family
            );
            (vk::SharingMode::CONCURRENT, queue_family_indices.as_slice())
        } else {
            (vk::SharingMode::EXCLUSIVE, &[][..])
        };

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(queue_family_indices_slice)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None)? };

        let images = unsafe { swapchain_loader.get_swapchain_images(swapchain)? };
        info!("Swapchain created with {} images", images.len());

        let image_views = create_image_views(&device, &images, surface_format.format)?;

        Ok(Self {
            device,
            swapchain_loader,
            swapchain,
            images,
            image_views,
            format: surface_format.format,
            extent,
        })
    }

    /// Acquires the index of the backbuffer the presentation engine hands
    /// out next.
    ///
    /// `semaphore` is signaled when the image is actually ready to be
    /// rendered to.
    ///
    /// # Errors
    ///
    /// Any acquisition failure, including an out-of-date swapchain, is fatal
    /// for this fixed-size harness.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<u32, RhiError> {
        let (index, suboptimal) = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )?
        };

        if suboptimal {
            debug!("Swapchain suboptimal during acquire");
        }

        Ok(index)
    }

    /// Queues the given backbuffer for presentation.
    ///
    /// Waits on `wait_semaphore` (rendering complete) before the
    /// presentation engine reads the image.
    ///
    /// # Errors
    ///
    /// Presentation failure is fatal; there is no retry policy since a
    /// failed present indicates device loss or GPU removal. A suboptimal
    /// present still presented and counts as success.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<(), RhiError> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [wait_semaphore];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let suboptimal = unsafe {
            self.swapchain_loader
                .queue_present(queue, &present_info)?
        };

        if suboptimal {
            debug!("Swapchain suboptimal during present");
        }

        Ok(())
    }

    /// Returns the swapchain handle.
    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Returns the backbuffer pixel format.
    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Returns the swapchain extent (resolution).
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Returns the number of backbuffers in the ring.
    #[inline]
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Returns the backbuffer image at the given index.
    pub fn image(&self, index: usize) -> Option<vk::Image> {
        self.images.get(index).copied()
    }

    /// Returns the image view at the given index.
    pub fn image_view(&self, index: usize) -> Option<vk::ImageView> {
        self.image_views.get(index).copied()
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        for &image_view in &self.image_views {
            unsafe {
                self.device.handle().destroy_image_view(image_view, None);
            }
        }

        unsafe {
            self.swapchain_loader
                .destroy_swapchain(self.swapchain, None);
        }

        info!(
            "Swapchain destroyed (was {}x{}, {} images)",
            self.extent.width,
            self.extent.height,
            self.images.len()
        );
    }
}

/// Chooses the backbuffer format.
///
/// Prefers `R8G8B8A8_UNORM`, then `B8G8R8A8_UNORM`, then the first format
/// the surface offers.
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    for wanted in [vk::Format::R8G8B8A8_UNORM, vk::Format::B8G8R8A8_UNORM] {
        if let Some(&format) = formats.iter().find(|f| f.format == wanted) {
            debug!("Selected surface format {:?}", wanted);
            return format;
        }
    }

    warn!(
        "Preferred formats unavailable, using first offered: {:?}",
        formats[0].format
    );
    formats[0]
}

/// Chooses the swapchain extent (resolution).
///
/// If the surface pins the extent, that wins; otherwise the requested size
/// is clamped to the surface's limits.
fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// Clamps the requested ring size to the surface's limits.
///
/// `max_image_count == 0` means no maximum.
fn clamp_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
    let mut count = requested.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count = count.min(capabilities.max_image_count);
    }
    count
}

/// Creates image views for the backbuffer images.
fn create_image_views(
    device: &Device,
    images: &[vk::Image],
    format: vk::Format,
) -> Result<Vec<vk::ImageView>, RhiError> {
    let mut image_views = Vec::with_capacity(images.len());

    for (i, &image) in images.iter().enumerate() {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );

        let image_view = unsafe {
            device
                .handle()
                .create_image_view(&create_info, None)
                .map_err(|e| {
                    RhiError::Swapchain(format!("Failed to create image view {}: {:?}", i, e))
                })?
        };

        image_views.push(image_view);
    }

    debug!("Created {} image views", image_views.len());
    Ok(image_views)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_choose_surface_format_prefers_rgba_unorm() {
        let formats = vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];

        let selected = choose_surface_format(&formats);
        assert_eq!(selected.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn test_choose_surface_format_falls_back_to_bgra() {
        let formats = vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];

        let selected = choose_surface_format(&formats);
        assert_eq!(selected.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn test_choose_surface_format_last_resort_is_first() {
        let formats = vec![vk::SurfaceFormatKHR {
            format: vk::Format::A2B10G10R10_UNORM_PACK32,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];

        let selected = choose_surface_format(&formats);
        assert_eq!(selected.format, vk::Format::A2B10G10R10_UNORM_PACK32);
    }

    #[test]
    fn test_choose_extent_uses_current_when_pinned() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        };

        let extent = choose_extent(&capabilities, 800, 600);
        assert_eq!(extent.width, 1920);
        assert_eq!(extent.height, 1080);
    }

    #[test]
    fn test_choose_extent_clamps_to_limits() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 100,
                height: 100,
            },
            max_image_extent: vk::Extent2D {
                width: 2000,
                height: 2000,
            },
            ..Default::default()
        };

        let extent = choose_extent(&capabilities, 3000, 50);
        assert_eq!(extent.width, 2000);
        assert_eq!(extent.height, 100);
    }

    #[test]
    fn test_clamp_image_count() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 4,
            ..Default::default()
        };
        assert_eq!(clamp_image_count(&capabilities, 3), 3);
        assert_eq!(clamp_image_count(&capabilities, 1), 2);
        assert_eq!(clamp_image_count(&capabilities, 8), 4);

        let unbounded = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(clamp_image_count(&unbounded, 3), 3);
    }
}
