//! Fan-out of encoder output to the stream and record sinks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use publisher_encoder::{
    AccessUnit, AudioUnit, EncoderOutput, EncoderOutputHandler, FormatMetadata, ParameterSets,
};

use crate::metrics::FpsMeter;
use crate::sink::{MediaSink, RecordSink};

/// One of the two consumers of encoded output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Stream,
    Record,
}

impl Route {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Record => "record",
        }
    }
}

/// Consumer of encoded audio. Called from the audio source's thread.
pub trait AudioOutputHandler: Send + Sync {
    fn handle_audio(&self, unit: AudioUnit);
}

const ROUTES: [Route; 2] = [Route::Stream, Route::Record];

#[derive(Clone, Copy)]
enum Delivery<'a> {
    Format(&'a FormatMetadata),
    ParameterSets(&'a ParameterSets),
    Video(&'a AccessUnit),
    Audio(&'a AudioUnit),
}

impl Delivery<'_> {
    fn to<S: MediaSink + ?Sized>(self, sink: &S) {
        match self {
            Self::Format(format) => sink.on_format(format),
            Self::ParameterSets(sets) => sink.on_parameter_sets(sets),
            Self::Video(unit) => sink.on_video(unit),
            Self::Audio(unit) => sink.on_audio(unit),
        }
    }
}

#[derive(Default)]
struct RouteFlags {
    active: AtomicBool,
    paused: AtomicBool,
}

impl RouteFlags {
    fn forwards_media(&self) -> bool {
        self.active.load(Ordering::Acquire) && !self.paused.load(Ordering::Acquire)
    }
}

/// Session-scoped one-time outputs, replayed to late sinks.
#[derive(Default)]
struct SessionCache {
    format: Option<FormatMetadata>,
    parameter_sets: Option<ParameterSets>,
}

/// Routes encoder and audio output to the active, unpaused sinks.
///
/// Format metadata and parameter sets go to every active sink, paused or
/// not, and are cached until [`OutputRouter::clear_session`] so a sink
/// activated later still receives them first.
pub struct OutputRouter {
    stream: Arc<dyn MediaSink>,
    record: Arc<dyn RecordSink>,
    stream_flags: RouteFlags,
    record_flags: RouteFlags,
    cache: Mutex<SessionCache>,
    fps: FpsMeter,
}

impl OutputRouter {
    pub fn new(stream: Arc<dyn MediaSink>, record: Arc<dyn RecordSink>) -> Self {
        Self {
            stream,
            record,
            stream_flags: RouteFlags::default(),
            record_flags: RouteFlags::default(),
            cache: Mutex::new(SessionCache::default()),
            fps: FpsMeter::default(),
        }
    }

    pub fn fps(&self) -> &FpsMeter {
        &self.fps
    }

    pub fn is_active(&self, route: Route) -> bool {
        self.flags(route).active.load(Ordering::Acquire)
    }

    pub fn is_paused(&self, route: Route) -> bool {
        self.flags(route).paused.load(Ordering::Acquire)
    }

    /// Start forwarding to `route`, replaying cached session outputs.
    pub fn activate(&self, route: Route) {
        // Hold the cache so a concurrent format change is seen exactly once.
        let cache = self.cache.lock();
        if self.flags(route).active.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(format) = &cache.format {
            debug!(route = route.name(), "Replaying format to late sink");
            self.deliver(route, Delivery::Format(format));
        }
        if let Some(sets) = &cache.parameter_sets {
            debug!(route = route.name(), "Replaying parameter sets to late sink");
            self.deliver(route, Delivery::ParameterSets(sets));
        }
    }

    /// Stop forwarding to `route`. Its pause flag is kept.
    pub fn deactivate(&self, route: Route) {
        let _cache = self.cache.lock();
        self.flags(route).active.store(false, Ordering::Release);
    }

    /// Set the pause flag. Returns the previous value.
    pub fn set_paused(&self, route: Route, paused: bool) -> bool {
        let previous = self.flags(route).paused.swap(paused, Ordering::AcqRel);
        if previous != paused {
            debug!(route = route.name(), paused, "Route pause changed");
        }
        previous
    }

    /// Forget the current encoder session's format and parameter sets.
    pub fn clear_session(&self) {
        let mut cache = self.cache.lock();
        cache.format = None;
        cache.parameter_sets = None;
        self.stream.on_session_end();
        self.record.on_session_end();
    }

    fn flags(&self, route: Route) -> &RouteFlags {
        match route {
            Route::Stream => &self.stream_flags,
            Route::Record => &self.record_flags,
        }
    }

    fn deliver(&self, route: Route, item: Delivery<'_>) {
        match route {
            Route::Stream => item.to(self.stream.as_ref()),
            Route::Record => item.to(self.record.as_ref()),
        }
    }

    /// Session outputs go to every active sink.
    fn deliver_to_active(&self, item: Delivery<'_>) {
        for route in ROUTES {
            if self.is_active(route) {
                self.deliver(route, item);
            }
        }
    }

    /// Media goes to active, unpaused sinks.
    fn deliver_media(&self, item: Delivery<'_>) {
        for route in ROUTES {
            if self.flags(route).forwards_media() {
                self.deliver(route, item);
            }
        }
    }
}

impl EncoderOutputHandler for OutputRouter {
    fn handle(&self, output: EncoderOutput) {
        match output {
            EncoderOutput::Format(format) => {
                let mut cache = self.cache.lock();
                self.deliver_to_active(Delivery::Format(&format));
                cache.format = Some(format);
            }
            EncoderOutput::ParameterSets(sets) => {
                let mut cache = self.cache.lock();
                self.deliver_to_active(Delivery::ParameterSets(&sets));
                cache.parameter_sets = Some(sets);
            }
            EncoderOutput::AccessUnit(unit) => {
                if !unit.is_config {
                    self.fps.record_frame();
                }
                self.deliver_media(Delivery::Video(&unit));
                trace!(pts_us = unit.pts_us, keyframe = unit.is_keyframe, "Routed video");
            }
        }
    }
}

impl AudioOutputHandler for OutputRouter {
    fn handle_audio(&self, unit: AudioUnit) {
        self.deliver_media(Delivery::Audio(&unit));
    }
}
