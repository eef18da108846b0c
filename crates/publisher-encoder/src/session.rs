//! Per-session encoder state shared with the drain worker.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

use publisher_ipc::VideoSettings;

/// State of one running encoder instance.
///
/// Configuration is written only by the controller on the control thread.
/// The drain worker reads the running flag and the time origin, and claims
/// the parameter-set flag.
#[derive(Debug)]
pub struct EncoderSession {
    settings: VideoSettings,
    bitrate: AtomicU32,
    running: AtomicBool,
    parameter_sets_sent: AtomicBool,
    origin: RwLock<Instant>,
}

impl EncoderSession {
    pub fn new(settings: VideoSettings) -> Self {
        Self {
            bitrate: AtomicU32::new(settings.bitrate),
            settings,
            running: AtomicBool::new(false),
            parameter_sets_sent: AtomicBool::new(false),
            origin: RwLock::new(Instant::now()),
        }
    }

    pub fn settings(&self) -> &VideoSettings {
        &self.settings
    }

    /// Current target bitrate in bits per second.
    pub fn bitrate(&self) -> u32 {
        self.bitrate.load(Ordering::Relaxed)
    }

    pub(crate) fn set_bitrate(&self, bitrate: u32) {
        self.bitrate.store(bitrate, Ordering::Relaxed);
    }

    /// Capture the presentation-time origin and mark the session running.
    pub(crate) fn begin(&self, now: Instant) {
        *self.origin.write() = now;
        self.parameter_sets_sent.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
    }

    pub(crate) fn end(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.parameter_sets_sent.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn parameter_sets_sent(&self) -> bool {
        self.parameter_sets_sent.load(Ordering::SeqCst)
    }

    /// Atomically take the right to deliver parameter sets.
    ///
    /// Returns true for exactly one caller per session.
    pub fn claim_parameter_sets(&self) -> bool {
        self.parameter_sets_sent
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Microseconds elapsed since the session origin.
    pub fn elapsed_us(&self, now: Instant) -> i64 {
        let origin = *self.origin.read();
        i64::try_from(now.saturating_duration_since(origin).as_micros()).unwrap_or(i64::MAX)
    }
}
