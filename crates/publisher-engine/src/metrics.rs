//! Encoded frame rate metering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::trace;

/// Reporting window of the fps meter.
pub const FPS_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Counts encoded access units and reports a rate once per window.
///
/// Frames are recorded from the drain worker; `poll` is called from the
/// control thread.
pub struct FpsMeter {
    frame_count: AtomicU64,
    last_frame_count: AtomicU64,
    last_report_time: RwLock<Instant>,
    interval: Duration,
}

impl FpsMeter {
    pub fn new(interval: Duration) -> Self {
        Self {
            frame_count: AtomicU64::new(0),
            last_frame_count: AtomicU64::new(0),
            last_report_time: RwLock::new(Instant::now()),
            interval,
        }
    }

    /// Record one encoded frame.
    pub fn record_frame(&self) {
        self.frame_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames recorded since creation.
    pub fn total_frames(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }

    /// Start a new window at `now`, discarding the current one.
    pub fn restart(&self, now: Instant) {
        *self.last_report_time.write() = now;
        self.last_frame_count
            .store(self.frame_count.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    /// Frames per second over the window ending at `now`, once the window
    /// has elapsed. Starts the next window when it reports.
    pub fn poll(&self, now: Instant) -> Option<u32> {
        let elapsed = now.saturating_duration_since(*self.last_report_time.read());
        if elapsed < self.interval || elapsed.is_zero() {
            return None;
        }

        let current = self.frame_count.load(Ordering::Relaxed);
        let frames = current.saturating_sub(self.last_frame_count.load(Ordering::Relaxed));
        let fps = (frames as f64 / elapsed.as_secs_f64()).round() as u32;

        *self.last_report_time.write() = now;
        self.last_frame_count.store(current, Ordering::Relaxed);
        trace!(frames, fps, "Fps window closed");
        Some(fps)
    }
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new(FPS_REPORT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_report_before_window_elapses() {
        let meter = FpsMeter::default();
        let start = Instant::now();
        meter.restart(start);
        meter.record_frame();

        assert_eq!(meter.poll(start + Duration::from_millis(500)), None);
    }

    #[test]
    fn test_reports_rate_and_starts_next_window() {
        let meter = FpsMeter::default();
        let start = Instant::now();
        meter.restart(start);
        for _ in 0..30 {
            meter.record_frame();
        }

        assert_eq!(meter.poll(start + Duration::from_secs(1)), Some(30));

        for _ in 0..48 {
            meter.record_frame();
        }
        assert_eq!(meter.poll(start + Duration::from_secs(3)), Some(24));
        assert_eq!(meter.total_frames(), 78);
    }

    #[test]
    fn test_idle_window_reports_zero() {
        let meter = FpsMeter::default();
        let start = Instant::now();
        meter.restart(start);

        assert_eq!(meter.poll(start + Duration::from_secs(1)), Some(0));
    }
}
