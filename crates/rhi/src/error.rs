//! RHI-specific error types.

use thiserror::Error;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] ash::vk::Result),

    /// Failed to load the Vulkan library
    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    Allocator(#[from] gpu_allocator::AllocationError),

    /// Adapter enumeration exhausted without a hardware adapter at the
    /// minimum capability level
    #[error("no capable graphics adapter found")]
    NoCapableDevice,

    /// Shader loading or module creation error
    #[error("Shader error: {0}")]
    Shader(String),

    /// Surface creation error
    #[error("Surface error: {0}")]
    Surface(String),

    /// Swapchain error
    #[error("Swapchain error: {0}")]
    Swapchain(String),

    /// Pipeline creation error
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// Invalid argument or handle
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;
