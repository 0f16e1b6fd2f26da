use alloc_counter::no_alloc;
use std::time::Instant;

/// A monotonic stopwatch.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    epoch: Instant,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    /// Start a stopwatch whose epoch is now.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn new() -> Timer {
        Timer {
            epoch: Instant::now(),
        }
    }

    /// Move the epoch to now.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn reset(&mut self) {
        self.epoch = Instant::now();
    }

    /// Nanoseconds since the last reset (or since creation).
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn elapsed(&self) -> u64 {
        self.epoch.elapsed().as_nanos().try_into().unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn elapsed_tracks_sleep() {
        let timer = Timer::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(timer.elapsed() >= 20_000_000);
    }

    #[test]
    fn reset_moves_epoch_forward() {
        let mut timer = Timer::new();
        std::thread::sleep(Duration::from_millis(20));
        let before = timer.elapsed();
        timer.reset();
        assert!(timer.elapsed() < before);
    }
}
