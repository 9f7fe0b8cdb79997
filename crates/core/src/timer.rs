//! Frame timing.

use std::time::{Duration, Instant};

/// Measures per-frame delta time for the render loop.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    last_tick: Instant,
}

impl Timer {
    /// Create a new timer, starting from now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
        }
    }

    /// Seconds since the timer was created.
    pub fn elapsed_secs(&self) -> f32 {
        self.start.elapsed().as_secs_f32()
    }

    /// Time since the previous call to `tick()`.
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let delta = now - self.last_tick;
        self.last_tick = now;
        delta
    }

    /// Delta time in seconds since the last tick.
    pub fn delta_secs(&mut self) -> f32 {
        self.tick().as_secs_f32()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_is_monotonic() {
        let timer = Timer::new();
        let a = timer.elapsed_secs();
        let b = timer.elapsed_secs();
        assert!(b >= a);
    }

    #[test]
    fn test_tick_resets_delta() {
        let mut timer = Timer::new();
        std::thread::sleep(Duration::from_millis(5));
        let first = timer.tick();
        let second = timer.tick();
        assert!(first >= Duration::from_millis(5));
        assert!(second < first);
    }
}
