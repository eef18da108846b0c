//! Adaptive bitrate policy.

use tracing::debug;

use publisher_ipc::{BandwidthSignal, BitrateBounds};

/// Reacts to bandwidth signals by stepping the target bitrate up or
/// halving it, always within `[floor, ceiling]`.
///
/// There is no hysteresis: alternating signals alternate the bitrate.
#[derive(Debug, Clone)]
pub struct AdaptiveBitrateController {
    bounds: BitrateBounds,
    current: u32,
}

impl AdaptiveBitrateController {
    pub fn new(bounds: BitrateBounds, initial: u32) -> Self {
        Self {
            current: clamp(&bounds, initial),
            bounds,
        }
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn bounds(&self) -> &BitrateBounds {
        &self.bounds
    }

    /// Apply a bandwidth signal. Returns the new bitrate if it changed.
    pub fn on_signal(&mut self, signal: BandwidthSignal) -> Option<u32> {
        let next = match signal {
            BandwidthSignal::Sufficient => self
                .current
                .saturating_add(self.bounds.step)
                .min(self.bounds.ceiling),
            BandwidthSignal::Insufficient => (self.current / 2).max(self.bounds.floor),
        };
        self.update(next, "bandwidth signal")
    }

    /// Explicit request, clamped to the bounds. Returns the new bitrate if
    /// it changed.
    pub fn set(&mut self, requested: u32) -> Option<u32> {
        let next = clamp(&self.bounds, requested);
        self.update(next, "explicit request")
    }

    fn update(&mut self, next: u32, cause: &'static str) -> Option<u32> {
        if next == self.current {
            return None;
        }
        debug!(from = self.current, to = next, cause, "Target bitrate changed");
        self.current = next;
        Some(next)
    }
}

fn clamp(bounds: &BitrateBounds, value: u32) -> u32 {
    value.clamp(bounds.floor, bounds.ceiling)
}
