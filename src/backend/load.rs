//! Busy-time accounting for a single backend.
//!
//! The capacity factor is (sum of request processing durations completing
//! within the trailing window) / (window length). 1.0 means the backend was
//! busy for the whole window; overlapping requests can push it past 1.0.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub struct LoadTracker {
    window: Duration,
    /// (completion time, busy duration), oldest first.
    samples: Mutex<VecDeque<(Instant, Duration)>>,
}

impl LoadTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Record one completed request.
    pub fn record(&self, busy: Duration) {
        let now = Instant::now();
        let mut samples = self.samples.lock();
        Self::prune(&mut samples, self.window, now);
        samples.push_back((now, busy));
    }

    /// Busy-time fraction over the trailing window.
    pub fn capacity_factor(&self) -> f64 {
        let now = Instant::now();
        let mut samples = self.samples.lock();
        Self::prune(&mut samples, self.window, now);
        let busy: Duration = samples.iter().map(|(_, d)| *d).sum();
        busy.as_secs_f64() / self.window.as_secs_f64()
    }

    fn prune(samples: &mut VecDeque<(Instant, Duration)>, window: Duration, now: Instant) {
        // Early in process life `now - window` can underflow; nothing can be
        // stale then anyway.
        let cutoff = match now.checked_sub(window) {
            Some(cutoff) => cutoff,
            None => return,
        };
        while samples.front().is_some_and(|(at, _)| *at < cutoff) {
            samples.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_tracker_reports_zero() {
        let tracker = LoadTracker::new(Duration::from_secs(1));
        assert_eq!(tracker.capacity_factor(), 0.0);
    }

    #[test]
    fn busy_fraction_sums_recent_requests() {
        let tracker = LoadTracker::new(Duration::from_secs(1));
        tracker.record(Duration::from_millis(250));
        tracker.record(Duration::from_millis(250));
        let cf = tracker.capacity_factor();
        assert!((cf - 0.5).abs() < 0.05, "cf was {}", cf);
    }

    #[test]
    fn overlapping_work_can_exceed_one() {
        let tracker = LoadTracker::new(Duration::from_secs(1));
        for _ in 0..3 {
            tracker.record(Duration::from_millis(500));
        }
        assert!(tracker.capacity_factor() > 1.0);
    }

    #[test]
    fn samples_age_out_of_the_window() {
        let tracker = LoadTracker::new(Duration::from_millis(10));
        tracker.record(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(tracker.capacity_factor(), 0.0);
    }
}
