//! Frame-pipelining core.
//!
//! This crate owns the per-frame lifecycle of the harness:
//! - [`slot_ring`] - the fixed ring of per-frame slots
//! - [`frame_sync`] - per-slot completion tracking against monotonically
//!   increasing fence counters
//! - [`frame_loop`] - the strictly ordered record / submit / signal /
//!   present sequence
//! - [`renderer`] - the concrete Vulkan renderer tying it all together

pub mod error;
pub mod frame_loop;
pub mod frame_sync;
pub mod renderer;
pub mod slot_ring;

pub use error::{DeviceLostError, FrameError, InitError};
pub use frame_loop::{FrameBackend, FramePipeline};
pub use frame_sync::{CompletionSignal, FrameSynchronizer, SlotState};
pub use renderer::Renderer;
pub use slot_ring::SlotRing;

/// Backbuffer ring size the harness requests.
///
/// Triple buffering: the CPU can record one frame while the GPU works on
/// another and a third is queued for presentation.
pub const FRAME_COUNT: usize = 3;

/// How long a fence wait may block before the device is declared lost.
pub const FENCE_WAIT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
