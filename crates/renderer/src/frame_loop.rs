//! The submission/present loop.
//!
//! [`FramePipeline`] owns the strict per-frame ordering:
//!
//! 1. The presentation surface names the slot it will use next.
//! 2. The frame synchronizer blocks until that slot's previous submission
//!    is confirmed complete.
//! 3. The backend records and closes the slot's command list.
//! 4. The backend submits it, returning the new fence target.
//! 5. The synchronizer records the target; the slot is in flight.
//! 6. The backend presents.
//!
//! Any failure short-circuits the frame and surfaces as a [`FrameError`];
//! GPU errors are not locally recoverable, so nothing is retried. The
//! backend is a trait so the ordering is testable without a device.

use tracing::error;

use crate::error::{DeviceLostError, FrameError};
use crate::frame_sync::{CompletionSignal, FrameSynchronizer};

/// Driver-facing operations of one frame, invoked in submission order.
pub trait FrameBackend {
    /// Returns the index of the ring slot the presentation engine is about
    /// to use. The rotation order belongs to the presentation engine, not
    /// to this loop.
    fn acquire_slot(&mut self) -> Result<usize, FrameError>;

    /// Resets the slot's command allocator, records the frame (state
    /// transitions bracketing clear and draw), and closes the command list.
    ///
    /// Precondition: the slot is idle; the pipeline waits on the frame
    /// synchronizer before calling this.
    fn record(&mut self, slot: usize) -> Result<(), FrameError>;

    /// Submits the closed command list to the execution queue and returns
    /// the counter value the slot's completion signal will reach when the
    /// GPU finishes it.
    fn submit(&mut self, slot: usize) -> Result<u64, FrameError>;

    /// Queues the slot's backbuffer for presentation.
    fn present(&mut self, slot: usize) -> Result<(), FrameError>;
}

/// Orders recording, submission, fence signaling, and presentation for a
/// multi-buffered swap chain.
pub struct FramePipeline<B, S>
where
    B: FrameBackend,
    S: CompletionSignal,
{
    backend: B,
    sync: FrameSynchronizer<S>,
}

impl<B, S> FramePipeline<B, S>
where
    B: FrameBackend,
    S: CompletionSignal,
{
    /// Creates a pipeline from a backend and its frame synchronizer.
    pub fn new(backend: B, sync: FrameSynchronizer<S>) -> Self {
        Self { backend, sync }
    }

    /// Renders one frame.
    ///
    /// # Errors
    ///
    /// Any recording, submission, synchronization, or presentation failure
    /// aborts the frame; the error is fatal to the render loop.
    pub fn render_frame(&mut self) -> Result<(), FrameError> {
        let slot = self.backend.acquire_slot()?;

        // The slot's allocator and backbuffer may still be referenced by
        // the GPU; recording must not start until that is ruled out.
        self.sync.wait_for_slot(slot)?;

        self.backend.record(slot)?;

        let target = self.backend.submit(slot)?;
        self.sync.mark_submitted(slot, target);

        self.backend.present(slot)?;

        Ok(())
    }

    /// Blocks until no slot has work in flight.
    ///
    /// Must complete before any slot resources are released; the caller's
    /// teardown runs after this returns.
    ///
    /// # Errors
    ///
    /// Returns a [`DeviceLostError`] if a wait fails or expires.
    pub fn shutdown(&mut self) -> Result<(), DeviceLostError> {
        self.sync.wait_idle()
    }

    /// Returns a reference to the backend.
    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns a mutable reference to the backend.
    #[inline]
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Returns a reference to the frame synchronizer.
    #[inline]
    pub fn synchronizer(&self) -> &FrameSynchronizer<S> {
        &self.sync
    }
}

impl<B, S> Drop for FramePipeline<B, S>
where
    B: FrameBackend,
    S: CompletionSignal,
{
    fn drop(&mut self) {
        // Backstop for callers that skipped shutdown(): slot resources are
        // about to be released, so every slot must be confirmed idle.
        if let Err(e) = self.sync.wait_idle() {
            error!("Frame pipeline dropped with work in flight: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_sync::test_support::TestSignal;
    use crate::frame_sync::SlotState;
    use std::time::Duration;

    /// Scripted backend: rotates slots like a presentation engine and
    /// counts calls; individual steps can be made to fail.
    struct ScriptedBackend {
        slot_count: usize,
        next_slot: usize,
        signals: Vec<TestSignal>,
        counters: Vec<u64>,
        /// Completes each submission's signal immediately, standing in for
        /// a GPU that keeps up with the CPU.
        auto_complete: bool,
        fail_record: bool,
        fail_present: bool,
        recorded_slots: Vec<usize>,
        submit_count: usize,
        present_count: usize,
    }

    impl ScriptedBackend {
        fn new(signals: Vec<TestSignal>, auto_complete: bool) -> Self {
            Self {
                slot_count: signals.len(),
                next_slot: 0,
                counters: vec![0; signals.len()],
                signals,
                auto_complete,
                fail_record: false,
                fail_present: false,
                recorded_slots: Vec::new(),
                submit_count: 0,
                present_count: 0,
            }
        }
    }

    impl FrameBackend for ScriptedBackend {
        fn acquire_slot(&mut self) -> Result<usize, FrameError> {
            let slot = self.next_slot;
            self.next_slot = (self.next_slot + 1) % self.slot_count;
            Ok(slot)
        }

        fn record(&mut self, slot: usize) -> Result<(), FrameError> {
            if self.fail_record {
                return Err(FrameError::Record(vkexp_rhi::RhiError::InvalidHandle(
                    "forced close failure".to_string(),
                )));
            }
            self.recorded_slots.push(slot);
            Ok(())
        }

        fn submit(&mut self, slot: usize) -> Result<u64, FrameError> {
            self.submit_count += 1;
            self.counters[slot] += 1;
            let target = self.counters[slot];
            if self.auto_complete {
                self.signals[slot].complete(target);
            }
            Ok(target)
        }

        fn present(&mut self, slot: usize) -> Result<(), FrameError> {
            let _ = slot;
            if self.fail_present {
                return Err(FrameError::Present(vkexp_rhi::RhiError::InvalidHandle(
                    "forced present failure".to_string(),
                )));
            }
            self.present_count += 1;
            Ok(())
        }
    }

    fn pipeline(
        n: usize,
        auto_complete: bool,
        timeout: Duration,
    ) -> FramePipeline<ScriptedBackend, TestSignal> {
        let signals: Vec<TestSignal> = (0..n).map(|_| TestSignal::new()).collect();
        let backend = ScriptedBackend::new(signals.clone(), auto_complete);
        let sync = FrameSynchronizer::new(signals, timeout);
        FramePipeline::new(backend, sync)
    }

    #[test]
    fn test_slots_alternate_in_ring_order() {
        let mut pipeline = pipeline(3, true, Duration::from_millis(100));

        for _ in 0..6 {
            pipeline.render_frame().unwrap();
        }

        assert_eq!(pipeline.backend().recorded_slots, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_record_failure_short_circuits_before_submission() {
        let mut pipeline = pipeline(3, true, Duration::from_millis(100));
        pipeline.backend_mut().fail_record = true;

        let err = pipeline.render_frame().unwrap_err();
        assert!(matches!(err, FrameError::Record(_)));
        assert_eq!(pipeline.backend().submit_count, 0);
        assert_eq!(pipeline.backend().present_count, 0);
    }

    #[test]
    fn test_present_failure_after_fence_signal() {
        let mut pipeline = pipeline(2, true, Duration::from_millis(100));
        pipeline.backend_mut().fail_present = true;

        let err = pipeline.render_frame().unwrap_err();
        assert!(matches!(err, FrameError::Present(_)));
        // The submission happened; the slot must be tracked as in flight...
        assert_eq!(pipeline.backend().submit_count, 1);
        // ...and shutdown still succeeds because the work completes.
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn test_slow_gpu_blocks_slot_reuse() {
        // Two slots, GPU never completes anything: the third frame wants
        // slot 0 back and must fail with a device-lost timeout rather than
        // reuse an in-flight slot.
        let mut pipeline = pipeline(2, false, Duration::from_millis(20));

        pipeline.render_frame().unwrap();
        pipeline.render_frame().unwrap();

        let err = pipeline.render_frame().unwrap_err();
        assert!(matches!(err, FrameError::DeviceLost(_)));
        // Recording never ran for the blocked frame
        assert_eq!(pipeline.backend().recorded_slots, vec![0, 1]);

        // Drain so drop does not wait out the timeout per slot
        for (slot, signal) in pipeline.backend().signals.iter().enumerate() {
            signal.complete(pipeline.backend().counters[slot]);
        }
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn test_targets_returned_by_submit_reach_synchronizer() {
        let mut pipeline = pipeline(2, true, Duration::from_millis(100));

        for _ in 0..4 {
            pipeline.render_frame().unwrap();
        }

        // Each slot was submitted twice; its target mirrors the counter
        assert_eq!(pipeline.synchronizer().target(0), 2);
        assert_eq!(pipeline.synchronizer().target(1), 2);
    }

    #[test]
    fn test_shutdown_waits_every_slot_before_release() {
        let mut pipeline = pipeline(3, false, Duration::from_millis(200));

        pipeline.render_frame().unwrap();
        pipeline.render_frame().unwrap();

        // Completions arrive while shutdown is blocking
        let s0 = pipeline.backend().signals[0].clone();
        let s1 = pipeline.backend().signals[1].clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            s0.complete(1);
            s1.complete(1);
        });

        pipeline.shutdown().unwrap();
        for slot in 0..3 {
            assert_eq!(pipeline.synchronizer().state(slot), SlotState::Idle);
        }

        handle.join().unwrap();
    }

    #[test]
    fn test_shutdown_reports_stuck_gpu() {
        let mut pipeline = pipeline(2, false, Duration::from_millis(20));

        pipeline.render_frame().unwrap();
        assert!(pipeline.shutdown().is_err());

        // Unstick so drop's backstop wait does not re-time-out
        pipeline.backend().signals[0].complete(1);
    }
}
