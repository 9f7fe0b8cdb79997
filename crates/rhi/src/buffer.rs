//! GPU buffer management.
//!
//! The harness owns exactly one GPU buffer: the triangle's vertex buffer.
//! It lives in host-visible memory and is filled through the mapped
//! pointer, so no staging copy or transfer submission is needed.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// GPU buffer wrapper with managed memory.
pub struct Buffer {
    /// Reference to the logical device.
    device: Arc<Device>,
    /// Vulkan buffer handle.
    buffer: vk::Buffer,
    /// GPU memory allocation. Taken in Drop so it can be returned to the
    /// allocator before the buffer handle is destroyed.
    allocation: Option<Allocation>,
    /// Buffer size in bytes.
    size: vk::DeviceSize,
}

impl Buffer {
    /// Creates a host-visible vertex buffer initialized with `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is empty, or if buffer creation, memory
    /// allocation, or the initial write fails.
    pub fn vertex_with_data(device: Arc<Device>, data: &[u8]) -> RhiResult<Self> {
        if data.is_empty() {
            return Err(RhiError::InvalidHandle(
                "vertex buffer needs at least one byte of data".to_string(),
            ));
        }

        let size = data.len() as vk::DeviceSize;

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::VERTEX_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.handle().create_buffer(&buffer_info, None)? };

        let requirements = unsafe { device.handle().get_buffer_memory_requirements(buffer) };

        let allocation = {
            let mut allocator = device
                .allocator()
                .lock()
                .map_err(|_| RhiError::InvalidHandle("allocator mutex poisoned".to_string()))?;
            allocator.allocate(&AllocationCreateDesc {
                name: "vertex",
                requirements,
                location: MemoryLocation::CpuToGpu,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })?
        };

        unsafe {
            device
                .handle()
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?;
        }

        let this = Self {
            device,
            buffer,
            allocation: Some(allocation),
            size,
        };
        this.write_data(0, data)?;

        debug!("Created vertex buffer: {} bytes", size);

        Ok(this)
    }

    /// Writes data to the buffer at the specified offset through the
    /// mapped pointer.
    ///
    /// # Errors
    ///
    /// Returns an error if the write would exceed the buffer size or the
    /// memory is not mapped.
    pub fn write_data(&self, offset: vk::DeviceSize, data: &[u8]) -> RhiResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        let end = offset + data.len() as vk::DeviceSize;
        if end > self.size {
            return Err(RhiError::InvalidHandle(format!(
                "Write exceeds buffer size: offset {} + data {} > buffer {}",
                offset,
                data.len(),
                self.size
            )));
        }

        let allocation = self.allocation.as_ref().ok_or_else(|| {
            RhiError::InvalidHandle("Buffer allocation is not available".to_string())
        })?;

        let mapped_ptr = allocation
            .mapped_ptr()
            .ok_or_else(|| RhiError::InvalidHandle("Buffer memory is not mapped".to_string()))?;

        unsafe {
            let dst = mapped_ptr.as_ptr().add(offset as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst as *mut u8, data.len());
        }

        Ok(())
    }

    /// Returns the Vulkan buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Returns the buffer size in bytes.
    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // Free the allocation first, then destroy the buffer
        if let Some(allocation) = self.allocation.take() {
            if let Ok(mut allocator) = self.device.allocator().lock() {
                if let Err(e) = allocator.free(allocation) {
                    tracing::error!("Failed to free buffer allocation: {:?}", e);
                }
            }
        }

        unsafe {
            self.device.handle().destroy_buffer(self.buffer, None);
        }

        debug!("Destroyed vertex buffer");
    }
}
