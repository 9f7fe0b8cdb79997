//! Platform layer for the vkexp harness.
//!
//! Window management via winit and Vulkan surface creation.

mod window;

pub use window::{Surface, Window};

// Re-export winit types that users might need
pub use winit::event::WindowEvent;
pub use winit::event_loop::EventLoop;
