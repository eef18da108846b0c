//! In-memory transport for tests.

use std::collections::VecDeque;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use publisher_encoder::{AccessUnit, AudioUnit, ParameterSets};

use crate::error::TransportError;
use crate::{ConnectionStatus, Transport, TransportEvent, TransportResult};

#[derive(Default)]
struct Recorded {
    connects: Vec<String>,
    closes: usize,
    video: Vec<AccessUnit>,
    audio: Vec<AudioUnit>,
    parameter_sets: Vec<ParameterSets>,
    parameter_set_clears: usize,
    events: Option<Sender<TransportEvent>>,
    replies: VecDeque<ConnectionStatus>,
    fail_connects: bool,
}

/// Transport that records every call. Each `connect` consumes one
/// scripted reply, if any, and emits it immediately.
#[derive(Default)]
pub struct RecordingTransport {
    inner: Mutex<Recorded>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue status replies for the next connects, one per connect.
    pub fn reply_with(&self, replies: Vec<ConnectionStatus>) {
        self.inner.lock().replies.extend(replies);
    }

    /// Make `connect` return an error synchronously.
    pub fn fail_connects(&self, fail: bool) {
        self.inner.lock().fail_connects = fail;
    }

    /// Send an event on the current attempt's channel. Returns false if
    /// nobody is listening.
    pub fn emit(&self, event: TransportEvent) -> bool {
        let sender = self.inner.lock().events.clone();
        sender.is_some_and(|s| s.try_send(event).is_ok())
    }

    pub fn connects(&self) -> Vec<String> {
        self.inner.lock().connects.clone()
    }

    pub fn closes(&self) -> usize {
        self.inner.lock().closes
    }

    pub fn video_units(&self) -> Vec<AccessUnit> {
        self.inner.lock().video.clone()
    }

    pub fn audio_units(&self) -> Vec<AudioUnit> {
        self.inner.lock().audio.clone()
    }

    pub fn parameter_sets(&self) -> Vec<ParameterSets> {
        self.inner.lock().parameter_sets.clone()
    }

    pub fn parameter_set_clears(&self) -> usize {
        self.inner.lock().parameter_set_clears
    }
}

impl Transport for RecordingTransport {
    fn connect(&self, url: &str, events: Sender<TransportEvent>) -> TransportResult<()> {
        let mut inner = self.inner.lock();
        inner.connects.push(url.to_string());
        if inner.fail_connects {
            return Err(TransportError::Connection("scripted failure".into()));
        }
        if let Some(reply) = inner.replies.pop_front() {
            let _ = events.try_send(TransportEvent::Status(reply));
        }
        inner.events = Some(events);
        Ok(())
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closes += 1;
        inner.events = None;
    }

    fn send_video(&self, unit: &AccessUnit) {
        self.inner.lock().video.push(unit.clone());
    }

    fn send_audio(&self, unit: &AudioUnit) {
        self.inner.lock().audio.push(unit.clone());
    }

    fn set_parameter_sets(&self, sets: &ParameterSets) {
        self.inner.lock().parameter_sets.push(sets.clone());
    }

    fn clear_parameter_sets(&self) {
        self.inner.lock().parameter_set_clears += 1;
    }
}
