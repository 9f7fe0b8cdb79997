//! Synchronization primitives.
//!
//! Two kinds of object cover everything the harness needs:
//!
//! - [`Semaphore`] - binary, GPU-to-GPU ordering at the swapchain boundary
//!   (image acquisition before rendering, rendering before presentation).
//! - [`TimelineSemaphore`] - GPU-to-CPU signal carrying a monotonically
//!   increasing counter. Each ring slot owns one; the submission loop
//!   signals it with an incremented target value and the frame synchronizer
//!   waits on that value before the slot is reused.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Binary Vulkan semaphore wrapper.
///
/// Created unsignaled. Used for acquire/present ordering; the presentation
/// engine only accepts binary semaphores.
pub struct Semaphore {
    /// Reference to the logical device.
    device: Arc<Device>,
    /// Vulkan semaphore handle.
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Creates a new binary semaphore in the unsignaled state.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::default();

        let semaphore = unsafe { device.handle().create_semaphore(&create_info, None)? };

        debug!("Created binary semaphore");

        Ok(Self { device, semaphore })
    }

    /// Returns the Vulkan semaphore handle.
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_semaphore(self.semaphore, None);
        }
        debug!("Destroyed binary semaphore");
    }
}

/// Timeline semaphore wrapper.
///
/// A timeline semaphore carries a 64-bit counter that only moves forward.
/// Queue submissions signal it to a target value when the GPU finishes;
/// the host reads the current value or blocks until a value is reached.
/// This is the completion fence of the frame ring.
pub struct TimelineSemaphore {
    /// Reference to the logical device.
    device: Arc<Device>,
    /// Vulkan semaphore handle (TIMELINE type).
    semaphore: vk::Semaphore,
}

impl TimelineSemaphore {
    /// Creates a new timeline semaphore with the given initial counter value.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn new(device: Arc<Device>, initial_value: u64) -> RhiResult<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);

        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);

        let semaphore = unsafe { device.handle().create_semaphore(&create_info, None)? };

        debug!("Created timeline semaphore (initial value {})", initial_value);

        Ok(Self { device, semaphore })
    }

    /// Returns the Vulkan semaphore handle.
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Reads the counter value the GPU has signaled so far.
    ///
    /// Non-blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails (e.g. device loss).
    pub fn completed_value(&self) -> RhiResult<u64> {
        let value = unsafe { self.device.handle().get_semaphore_counter_value(self.semaphore)? };
        Ok(value)
    }

    /// Blocks until the counter reaches `value` or the timeout expires.
    ///
    /// # Errors
    ///
    /// Returns `RhiError::Vulkan(vk::Result::TIMEOUT)` on expiry, or another
    /// error if the wait fails.
    pub fn wait_value(&self, value: u64, timeout: Duration) -> RhiResult<()> {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);

        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);

        unsafe {
            self.device
                .handle()
                .wait_semaphores(&wait_info, timeout_ns)
                .map_err(RhiError::from)?;
        }
        Ok(())
    }
}

impl Drop for TimelineSemaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_semaphore(self.semaphore, None);
        }
        debug!("Destroyed timeline semaphore");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semaphore_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Semaphore>();
    }

    #[test]
    fn test_timeline_semaphore_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TimelineSemaphore>();
    }
}
