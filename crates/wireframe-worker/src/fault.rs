use std::time::{Duration, Instant};

/// How many consecutive forks within [`CRASH_LOOP_WINDOW`] count as a
/// crash loop (spec.md §4.4 design note: "a fault-detection counter that
/// aborts the master").
const CRASH_LOOP_SAMPLES: usize = 8;
const CRASH_LOOP_WINDOW: Duration = Duration::from_secs(1);

/// Sliding window of the most recent fork timestamps for one worker
/// group, used to tell an unlucky burst of legitimate respawns apart from
/// a worker that dies immediately after every fork.
#[derive(Debug, Default)]
pub struct ForkWindow {
    timestamps: Vec<Instant>,
}

impl ForkWindow {
    pub fn new() -> Self {
        Self {
            timestamps: Vec::with_capacity(CRASH_LOOP_SAMPLES),
        }
    }

    pub fn record(&mut self, at: Instant) {
        self.timestamps.push(at);
        if self.timestamps.len() > CRASH_LOOP_SAMPLES {
            self.timestamps.remove(0);
        }
    }

    /// True once the last [`CRASH_LOOP_SAMPLES`] forks all landed within
    /// [`CRASH_LOOP_WINDOW`] of each other.
    pub fn is_crash_looping(&self) -> bool {
        if self.timestamps.len() < CRASH_LOOP_SAMPLES {
            return false;
        }
        let oldest = self.timestamps[0];
        let newest = self.timestamps[self.timestamps.len() - 1];
        newest.saturating_duration_since(oldest) < CRASH_LOOP_WINDOW
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_is_not_crash_looping() {
        assert!(!ForkWindow::new().is_crash_looping());
    }

    #[test]
    fn eight_rapid_forks_trip_the_detector() {
        let mut w = ForkWindow::new();
        let base = Instant::now();
        for i in 0..8 {
            w.record(base + Duration::from_millis(i * 10));
        }
        assert!(w.is_crash_looping());
    }

    #[test]
    fn forks_spread_over_time_do_not_trip_it() {
        let mut w = ForkWindow::new();
        let base = Instant::now();
        for i in 0..8 {
            w.record(base + Duration::from_millis(i * 500));
        }
        assert!(!w.is_crash_looping());
    }
}
