//! Per-slot GPU/CPU synchronization.
//!
//! Every ring slot owns a completion signal (a timeline semaphore on real
//! hardware) and a target counter. The submission loop bumps the target
//! after each submit; before a slot's command allocator or backbuffer may
//! be touched again, [`FrameSynchronizer::wait_for_slot`] blocks until the
//! GPU has signaled that target.
//!
//! The synchronizer is generic over [`CompletionSignal`] so the state
//! machine can be exercised with a simulated signal.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use vkexp_rhi::sync::TimelineSemaphore;
use vkexp_rhi::{RhiError, vk};

use crate::error::DeviceLostError;
use crate::slot_ring::SlotRing;

/// Why a signal operation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    /// The wait expired before the counter reached the requested value.
    Timeout,
    /// The device rejected the operation (lost, removed, out of memory).
    Device(String),
}

/// A GPU completion signal carrying a monotonically increasing counter.
pub trait CompletionSignal {
    /// The counter value the device has signaled so far.
    fn completed_value(&self) -> Result<u64, SignalError>;

    /// Block until the counter reaches `value` or the timeout expires.
    fn wait_value(&self, value: u64, timeout: Duration) -> Result<(), SignalError>;
}

impl CompletionSignal for TimelineSemaphore {
    fn completed_value(&self) -> Result<u64, SignalError> {
        TimelineSemaphore::completed_value(self)
            .map_err(|e| SignalError::Device(e.to_string()))
    }

    fn wait_value(&self, value: u64, timeout: Duration) -> Result<(), SignalError> {
        match TimelineSemaphore::wait_value(self, value, timeout) {
            Ok(()) => Ok(()),
            Err(RhiError::Vulkan(vk::Result::TIMEOUT)) => Err(SignalError::Timeout),
            Err(e) => Err(SignalError::Device(e.to_string())),
        }
    }
}

impl<S: CompletionSignal> CompletionSignal for Arc<S> {
    fn completed_value(&self) -> Result<u64, SignalError> {
        (**self).completed_value()
    }

    fn wait_value(&self, value: u64, timeout: Duration) -> Result<(), SignalError> {
        (**self).wait_value(value, timeout)
    }
}

/// Lifecycle state of one ring slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Safe to reuse: no submission references the slot's resources.
    Idle,
    /// A submission using this slot has not yet been confirmed complete.
    /// The slot's command allocator and backbuffer must not be mutated.
    InFlight,
}

/// One slot's synchronization bookkeeping.
struct SyncSlot<S> {
    /// The slot's completion signal.
    signal: S,
    /// Counter value the GPU will reach when the slot's most recent
    /// submission finishes. Only ever increases.
    target: u64,
    /// Current lifecycle state.
    state: SlotState,
}

/// Tracks completion state for every slot in the frame ring.
///
/// # Thread Safety
///
/// Single producer: one thread records, submits, and waits.
pub struct FrameSynchronizer<S: CompletionSignal> {
    slots: SlotRing<SyncSlot<S>>,
    timeout: Duration,
}

impl<S: CompletionSignal> FrameSynchronizer<S> {
    /// Creates a synchronizer with one signal per ring slot.
    ///
    /// All slots start `Idle` with a target of 0, matching signals whose
    /// counters start at 0.
    pub fn new(signals: Vec<S>, timeout: Duration) -> Self {
        debug_assert!(signals.len() >= 2, "frame pipelining needs at least 2 slots");

        let slots = signals
            .into_iter()
            .map(|signal| SyncSlot {
                signal,
                target: 0,
                state: SlotState::Idle,
            })
            .collect();

        Self {
            slots: SlotRing::new(slots),
            timeout,
        }
    }

    /// Returns the number of slots.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Returns the state of `slot`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range.
    pub fn state(&self, slot: usize) -> SlotState {
        self.slot(slot).state
    }

    /// Returns the completion target of `slot`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range.
    pub fn target(&self, slot: usize) -> u64 {
        self.slot(slot).target
    }

    /// Blocks until the GPU has finished the most recent submission that
    /// used `slot`, then marks the slot `Idle`.
    ///
    /// Returns immediately if nothing is in flight or the signal has
    /// already reached the slot's target.
    ///
    /// # Errors
    ///
    /// A wait that expires, and any device-side failure, is reported as
    /// [`DeviceLostError`]; the slot stays `InFlight` since its resources
    /// were never confirmed safe.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range.
    pub fn wait_for_slot(&mut self, slot: usize) -> Result<(), DeviceLostError> {
        let timeout = self.timeout;
        let entry = self.slot_mut(slot);

        if entry.state == SlotState::Idle {
            return Ok(());
        }

        let completed = entry
            .signal
            .completed_value()
            .map_err(|e| device_lost(slot, e))?;

        if completed < entry.target {
            trace!(
                "Slot {} busy (completed {} < target {}), blocking",
                slot, completed, entry.target
            );
            entry
                .signal
                .wait_value(entry.target, timeout)
                .map_err(|e| device_lost(slot, e))?;
        }

        entry.state = SlotState::Idle;
        Ok(())
    }

    /// Records that a submission using `slot` was made and will signal
    /// `new_target` on completion. The slot becomes `InFlight`.
    ///
    /// Call immediately after a successful submit. Targets only increase.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range.
    pub fn mark_submitted(&mut self, slot: usize, new_target: u64) {
        let entry = self.slot_mut(slot);
        debug_assert!(
            new_target > entry.target,
            "fence targets must be monotonically increasing"
        );
        entry.target = new_target;
        entry.state = SlotState::InFlight;
    }

    /// Drives every slot to `Idle`, blocking as needed.
    ///
    /// Must run to completion before any slot's resources are released;
    /// after it returns no in-flight GPU work references ring memory.
    ///
    /// # Errors
    ///
    /// Returns the first wait failure as a [`DeviceLostError`].
    pub fn wait_idle(&mut self) -> Result<(), DeviceLostError> {
        debug!("Waiting for all {} slots to go idle", self.slots.len());
        for slot in 0..self.slots.len() {
            self.wait_for_slot(slot)?;
        }
        Ok(())
    }

    fn slot(&self, slot: usize) -> &SyncSlot<S> {
        self.slots
            .get(slot)
            .unwrap_or_else(|| panic!("slot index {} out of range", slot))
    }

    fn slot_mut(&mut self, slot: usize) -> &mut SyncSlot<S> {
        self.slots
            .get_mut(slot)
            .unwrap_or_else(|| panic!("slot index {} out of range", slot))
    }
}

fn device_lost(slot: usize, err: SignalError) -> DeviceLostError {
    match err {
        SignalError::Timeout => DeviceLostError::new(format!(
            "fence wait for slot {} timed out; assuming the device is hung or removed",
            slot
        )),
        SignalError::Device(reason) => {
            DeviceLostError::new(format!("fence query for slot {} failed: {}", slot, reason))
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::{Condvar, Mutex};

    /// Host-controlled completion signal for exercising the synchronizer
    /// without a GPU.
    #[derive(Clone)]
    pub struct TestSignal {
        inner: Arc<(Mutex<u64>, Condvar)>,
    }

    impl TestSignal {
        pub fn new() -> Self {
            Self {
                inner: Arc::new((Mutex::new(0), Condvar::new())),
            }
        }

        /// Simulates the GPU signaling completion of `value`.
        pub fn complete(&self, value: u64) {
            let (lock, cvar) = &*self.inner;
            let mut current = lock.lock().unwrap();
            if value > *current {
                *current = value;
            }
            cvar.notify_all();
        }
    }

    impl CompletionSignal for TestSignal {
        fn completed_value(&self) -> Result<u64, SignalError> {
            Ok(*self.inner.0.lock().unwrap())
        }

        fn wait_value(&self, value: u64, timeout: Duration) -> Result<(), SignalError> {
            let (lock, cvar) = &*self.inner;
            let guard = lock.lock().unwrap();
            let (_guard, result) = cvar
                .wait_timeout_while(guard, timeout, |current| *current < value)
                .unwrap();
            if result.timed_out() {
                Err(SignalError::Timeout)
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::TestSignal;
    use super::*;
    use std::time::Instant;

    fn synchronizer(n: usize) -> (FrameSynchronizer<TestSignal>, Vec<TestSignal>) {
        let signals: Vec<TestSignal> = (0..n).map(|_| TestSignal::new()).collect();
        let sync = FrameSynchronizer::new(signals.clone(), Duration::from_millis(100));
        (sync, signals)
    }

    #[test]
    fn test_fresh_slots_are_idle_and_never_block() {
        let (mut sync, _signals) = synchronizer(3);
        for slot in 0..3 {
            assert_eq!(sync.state(slot), SlotState::Idle);
            sync.wait_for_slot(slot).unwrap();
        }
    }

    #[test]
    fn test_mark_submitted_moves_slot_in_flight() {
        let (mut sync, _signals) = synchronizer(2);
        sync.mark_submitted(0, 1);
        assert_eq!(sync.state(0), SlotState::InFlight);
        assert_eq!(sync.target(0), 1);
        assert_eq!(sync.state(1), SlotState::Idle);
    }

    #[test]
    fn test_completed_target_returns_without_blocking() {
        let (mut sync, signals) = synchronizer(2);
        sync.mark_submitted(0, 1);
        signals[0].complete(1);

        let start = Instant::now();
        sync.wait_for_slot(0).unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(sync.state(0), SlotState::Idle);
    }

    #[test]
    fn test_wait_blocks_until_external_complete_signal() {
        // waitForSlot, markSubmitted(v), waitForSlot must block until the
        // completion signal for v is delivered, then return.
        let (mut sync, signals) = synchronizer(2);

        sync.wait_for_slot(0).unwrap();
        sync.mark_submitted(0, 1);

        let signal = signals[0].clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(40));
            signal.complete(1);
        });

        let start = Instant::now();
        sync.wait_for_slot(0).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(sync.state(0), SlotState::Idle);

        handle.join().unwrap();
    }

    #[test]
    fn test_timeout_maps_to_device_lost() {
        let signals: Vec<TestSignal> = (0..2).map(|_| TestSignal::new()).collect();
        let mut sync = FrameSynchronizer::new(signals, Duration::from_millis(20));

        sync.mark_submitted(0, 1);
        let err = sync.wait_for_slot(0).unwrap_err();
        assert!(err.reason.contains("timed out"));
        // Never confirmed complete, so the slot must not be handed out
        assert_eq!(sync.state(0), SlotState::InFlight);
    }

    #[test]
    fn test_slots_are_independent() {
        let (mut sync, signals) = synchronizer(3);

        sync.mark_submitted(1, 1);

        // Other slots stay reusable while slot 1 is in flight
        sync.wait_for_slot(0).unwrap();
        sync.wait_for_slot(2).unwrap();
        assert_eq!(sync.state(1), SlotState::InFlight);

        signals[1].complete(1);
        sync.wait_for_slot(1).unwrap();
        assert_eq!(sync.state(1), SlotState::Idle);
    }

    #[test]
    fn test_no_reuse_before_completion_confirmed() {
        // A slot whose submission was never confirmed complete is never
        // reported Idle, for any ring size >= 2.
        for n in [2usize, 3, 4] {
            let signals: Vec<TestSignal> = (0..n).map(|_| TestSignal::new()).collect();
            let mut sync = FrameSynchronizer::new(signals, Duration::from_millis(10));

            for slot in 0..n {
                sync.mark_submitted(slot, 1);
            }
            for slot in 0..n {
                assert!(sync.wait_for_slot(slot).is_err());
                assert_eq!(sync.state(slot), SlotState::InFlight);
            }
        }
    }

    #[test]
    fn test_targets_increase_across_reuse() {
        let (mut sync, signals) = synchronizer(2);

        sync.mark_submitted(0, 1);
        signals[0].complete(1);
        sync.wait_for_slot(0).unwrap();

        sync.mark_submitted(0, 2);
        assert_eq!(sync.target(0), 2);
        // The old completion value no longer satisfies the new target
        let err = sync.wait_for_slot(0);
        assert!(err.is_err());

        signals[0].complete(2);
        sync.wait_for_slot(0).unwrap();
    }

    #[test]
    fn test_wait_idle_drives_every_slot_idle() {
        let (mut sync, signals) = synchronizer(3);

        sync.mark_submitted(0, 1);
        sync.mark_submitted(2, 1);
        signals[0].complete(1);
        signals[2].complete(1);

        sync.wait_idle().unwrap();
        for slot in 0..3 {
            assert_eq!(sync.state(slot), SlotState::Idle);
        }
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_out_of_range_slot_panics() {
        let (mut sync, _signals) = synchronizer(2);
        let _ = sync.wait_for_slot(5);
    }
}
