//! Frame clock feeding the frames-in-flight throttle.

use std::time::{Duration, Instant};

/// Measures the time between consecutive frames.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    last_tick: Instant,
}

impl Timer {
    /// Create a new timer, starting from now.
    pub fn new() -> Self {
        Self {
            last_tick: Instant::now(),
        }
    }

    /// Get the time elapsed since the last call to `tick()`.
    /// The frame loop uses this as its frame time.
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let delta = now - self.last_tick;
        self.last_tick = now;
        delta
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
    fn test_tick_measures_since_creation() {
        let mut timer = Timer::new();
        std::thread::sleep(Duration::from_millis(2));
        assert!(timer.tick() >= Duration::from_millis(2));
    }

    #[test]
    fn test_tick_restarts_interval() {
        let mut timer = Timer::new();
        std::thread::sleep(Duration::from_millis(20));
        let first = timer.tick();
        assert!(timer.tick() < first);
    }
}
