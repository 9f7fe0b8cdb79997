//! Vulkan abstraction layer for the vkexp harness.
//!
//! This crate provides a safe abstraction over Vulkan using the `ash` crate.
//! It covers exactly what the harness needs:
//! - Instance creation with optional validation
//! - Adapter (physical device) selection
//! - Logical device and queues
//! - A fixed-ring swapchain
//! - Command pool and buffer recording
//! - Binary and timeline semaphores
//! - A single graphics pipeline, its shaders, and the triangle vertex buffer

mod error;

pub mod adapter;
pub mod buffer;
pub mod command;
pub mod device;
pub mod instance;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod vertex;

pub use error::{RhiError, RhiResult};

// Re-export ash types that users might need
pub use ash::vk;
