//! Capture frame admission at a capped rate.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug)]
struct LimiterState {
    fps: u32,
    origin: Instant,
    interval: Duration,
    next_due: Duration,
}

impl LimiterState {
    fn new(fps: u32, now: Instant) -> Self {
        let fps = fps.max(1);
        let interval = Duration::from_secs(1) / fps;
        Self {
            fps,
            origin: now,
            interval,
            next_due: interval,
        }
    }
}

/// Admits capture frames at no more than a target rate.
///
/// The capture pipeline asks [`FpsLimiter::admit`] before rendering a frame
/// into the encoder's input surface. After a rate change, a frame is
/// admitted each time the elapsed time passes the next multiple of the
/// frame interval.
#[derive(Debug)]
pub struct FpsLimiter {
    state: Mutex<LimiterState>,
}

impl FpsLimiter {
    pub fn new(fps: u32, now: Instant) -> Self {
        Self {
            state: Mutex::new(LimiterState::new(fps, now)),
        }
    }

    /// Restart admission at `fps` frames per second from `now`.
    pub fn set_fps(&self, fps: u32, now: Instant) {
        *self.state.lock() = LimiterState::new(fps, now);
    }

    pub fn fps(&self) -> u32 {
        self.state.lock().fps
    }

    /// Whether a frame captured at `now` should be encoded.
    pub fn admit(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        let elapsed = now.saturating_duration_since(state.origin);
        if elapsed > state.next_due {
            let interval = state.interval;
            state.next_due += interval;
            true
        } else {
            false
        }
    }
}
