//! Error taxonomy for the frame-pipelining core.
//!
//! Three failure classes, all fatal:
//! - [`InitError`] aborts startup
//! - [`FrameError`] terminates the render loop
//! - [`DeviceLostError`] means the GPU is gone or a fence wait expired;
//!   recovery would require full teardown and device recreation, which this
//!   harness does not attempt.

use thiserror::Error;

use vkexp_rhi::RhiError;

/// Device/adapter/surface creation failure. Aborts startup.
#[derive(Error, Debug)]
pub enum InitError {
    /// Window surface creation failed
    #[error("surface creation failed: {0}")]
    Surface(String),

    /// Adapter selection, device, swapchain, or pipeline setup failed
    #[error(transparent)]
    Rhi(#[from] RhiError),
}

/// Recording/submission/present failure mid-loop. Terminates the render
/// loop; nothing is retried.
#[derive(Error, Debug)]
pub enum FrameError {
    /// Command recording failed (allocator reset, barrier, or close)
    #[error("command recording failed: {0}")]
    Record(RhiError),

    /// Queue submission failed
    #[error("queue submission failed: {0}")]
    Submit(RhiError),

    /// Presentation failed
    #[error("presentation failed: {0}")]
    Present(RhiError),

    /// The GPU was removed or a fence wait expired
    #[error(transparent)]
    DeviceLost(#[from] DeviceLostError),
}

/// The GPU was removed or a synchronization wait timed out.
///
/// Requires full teardown and device recreation; this core only reports it.
#[derive(Error, Debug)]
#[error("device lost: {reason}")]
pub struct DeviceLostError {
    /// What went wrong.
    pub reason: String,
}

impl DeviceLostError {
    /// Creates a device-lost error with the given reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_lost_propagates_into_frame_error() {
        let err: FrameError = DeviceLostError::new("fence wait timed out").into();
        assert!(matches!(err, FrameError::DeviceLost(_)));
        assert!(err.to_string().contains("fence wait timed out"));
    }
}
