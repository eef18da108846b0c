//! Fake sinks and audio sources for tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use publisher_encoder::{AccessUnit, AudioUnit, FormatMetadata, ParameterSets};

use crate::error::EngineError;
use crate::orchestrator::AudioSource;
use crate::router::AudioOutputHandler;
use crate::sink::{MediaSink, RecordSink};
use crate::EngineResult;

#[derive(Default)]
struct SinkLog {
    starts: Vec<PathBuf>,
    stops: usize,
    formats: Vec<FormatMetadata>,
    parameter_sets: Vec<ParameterSets>,
    video: Vec<AccessUnit>,
    audio: Vec<AudioUnit>,
    fail_start: bool,
}

/// Sink that records everything it receives. Usable as either the
/// stream or the record sink.
#[derive(Default)]
pub struct RecordingSink {
    log: Mutex<SinkLog>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `start` fail.
    pub fn fail_start(&self, fail: bool) {
        self.log.lock().fail_start = fail;
    }

    pub fn starts(&self) -> Vec<PathBuf> {
        self.log.lock().starts.clone()
    }

    pub fn stops(&self) -> usize {
        self.log.lock().stops
    }

    pub fn formats(&self) -> Vec<FormatMetadata> {
        self.log.lock().formats.clone()
    }

    pub fn parameter_sets(&self) -> Vec<ParameterSets> {
        self.log.lock().parameter_sets.clone()
    }

    pub fn video_units(&self) -> Vec<AccessUnit> {
        self.log.lock().video.clone()
    }

    pub fn audio_units(&self) -> Vec<AudioUnit> {
        self.log.lock().audio.clone()
    }
}

impl MediaSink for RecordingSink {
    fn on_format(&self, format: &FormatMetadata) {
        self.log.lock().formats.push(format.clone());
    }

    fn on_parameter_sets(&self, sets: &ParameterSets) {
        self.log.lock().parameter_sets.push(sets.clone());
    }

    fn on_video(&self, unit: &AccessUnit) {
        self.log.lock().video.push(unit.clone());
    }

    fn on_audio(&self, unit: &AudioUnit) {
        self.log.lock().audio.push(unit.clone());
    }
}

impl RecordSink for RecordingSink {
    fn start(&self, path: &Path) -> EngineResult<()> {
        let mut log = self.log.lock();
        if log.fail_start {
            return Err(EngineError::Record(format!("cannot open {}", path.display())));
        }
        log.starts.push(path.to_path_buf());
        Ok(())
    }

    fn stop(&self) {
        self.log.lock().stops += 1;
    }
}

#[derive(Default)]
struct AudioState {
    output: Option<Arc<dyn AudioOutputHandler>>,
    starts: usize,
    stops: usize,
}

/// Audio source driven by hand with [`ScriptedAudio::push`].
#[derive(Default)]
pub struct ScriptedAudio {
    state: Mutex<AudioState>,
}

impl ScriptedAudio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `unit` as if it had just been encoded. Returns false while
    /// the source is stopped.
    pub fn push(&self, unit: AudioUnit) -> bool {
        let output = self.state.lock().output.clone();
        match output {
            Some(output) => {
                output.handle_audio(unit);
                true
            }
            None => false,
        }
    }

    pub fn starts(&self) -> usize {
        self.state.lock().starts
    }

    pub fn stops(&self) -> usize {
        self.state.lock().stops
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().output.is_some()
    }
}

impl AudioSource for ScriptedAudio {
    fn start(&self, output: Arc<dyn AudioOutputHandler>) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.starts += 1;
        state.output = Some(output);
        Ok(())
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        state.stops += 1;
        state.output = None;
    }
}
