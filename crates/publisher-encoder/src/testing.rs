//! Scriptable codec fakes for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::Sender;
use parking_lot::Mutex;

use publisher_ipc::{ColorFormat, VideoCodec};

use crate::codec::{
    BufferFlags, BufferInfo, CodecEvent, CodecFormat, CodecOutput, CodecParameters,
    CodecProvider, CodecResult, EncoderInfo, FormatMetadata, HardwareCodec, InputSurface,
};
use crate::error::CodecError;
use crate::params::ParameterSets;
use crate::{AccessUnit, EncoderOutput, EncoderOutputHandler};

#[derive(Default)]
struct MockState {
    sink: Option<Sender<CodecEvent>>,
    queue: VecDeque<CodecResult<CodecOutput>>,
    buffers: HashMap<usize, Bytes>,
    next_index: usize,
    released: Vec<usize>,
    configured: Option<CodecFormat>,
    starts: usize,
    stops: usize,
    releases: usize,
    keyframe_requests: usize,
    bitrates: Vec<u32>,
    reject_format: bool,
    reject_parameters: bool,
}

/// In-memory codec. Output is scripted with the `push_*` methods and
/// delivered through the event sink when one is registered, otherwise
/// queued for `dequeue_output`.
pub struct MockCodec {
    callbacks: bool,
    state: Mutex<MockState>,
}

impl MockCodec {
    pub fn new(callbacks: bool) -> Self {
        Self {
            callbacks,
            state: Mutex::new(MockState::default()),
        }
    }

    /// H.264 format with separate SPS/PPS records.
    pub fn avc_format() -> FormatMetadata {
        FormatMetadata {
            codec: VideoCodec::H264,
            width: 1920,
            height: 1080,
            csd0: Some(Bytes::from_static(&[0x00, 0x00, 0x00, 0x01, 0x67, 0x64, 0x00, 0x28])),
            csd1: Some(Bytes::from_static(&[0x00, 0x00, 0x00, 0x01, 0x68, 0xEE, 0x3C, 0x80])),
        }
    }

    pub fn set_reject_format(&self, reject: bool) {
        self.state.lock().reject_format = reject;
    }

    pub fn set_reject_parameters(&self, reject: bool) {
        self.state.lock().reject_parameters = reject;
    }

    /// Store bytes as an output buffer and return its index.
    pub fn store_buffer(&self, data: Bytes) -> usize {
        let mut state = self.state.lock();
        let index = state.next_index;
        state.next_index += 1;
        state.buffers.insert(index, data);
        index
    }

    pub fn push_format(&self, format: FormatMetadata) {
        self.deliver(
            CodecEvent::FormatChanged(format.clone()),
            Ok(CodecOutput::FormatChanged(format)),
        );
    }

    pub fn push_buffer(&self, data: Bytes, key_frame: bool) {
        self.push_buffer_with(data, BufferFlags { key_frame, ..Default::default() });
    }

    pub fn push_buffer_with(&self, data: Bytes, flags: BufferFlags) {
        let size = data.len();
        let index = self.store_buffer(data);
        let info = BufferInfo {
            size,
            presentation_time_us: 0,
            flags,
        };
        self.deliver(
            CodecEvent::BufferReady { index, info },
            Ok(CodecOutput::Buffer { index, info }),
        );
    }

    pub fn push_error(&self, error: CodecError) {
        self.deliver(CodecEvent::Error(error.clone()), Err(error));
    }

    fn deliver(&self, event: CodecEvent, output: CodecResult<CodecOutput>) {
        let sink = {
            let mut state = self.state.lock();
            match state.sink.clone() {
                Some(sink) => sink,
                None => {
                    state.queue.push_back(output);
                    return;
                }
            }
        };
        let _ = sink.send(event);
    }

    pub fn released_buffers(&self) -> Vec<usize> {
        self.state.lock().released.clone()
    }

    pub fn configured_format(&self) -> Option<CodecFormat> {
        self.state.lock().configured.clone()
    }

    pub fn starts(&self) -> usize {
        self.state.lock().starts
    }

    pub fn stops(&self) -> usize {
        self.state.lock().stops
    }

    pub fn releases(&self) -> usize {
        self.state.lock().releases
    }

    pub fn keyframe_requests(&self) -> usize {
        self.state.lock().keyframe_requests
    }

    pub fn bitrates(&self) -> Vec<u32> {
        self.state.lock().bitrates.clone()
    }
}

impl HardwareCodec for MockCodec {
    fn configure(&self, format: &CodecFormat) -> CodecResult<()> {
        let mut state = self.state.lock();
        if state.reject_format {
            return Err(CodecError::Rejected(format!("{}x{}", format.width, format.height)));
        }
        state.configured = Some(format.clone());
        Ok(())
    }

    fn create_input_surface(&self) -> CodecResult<InputSurface> {
        Ok(InputSurface { id: 1 })
    }

    fn supports_callbacks(&self) -> bool {
        self.callbacks
    }

    fn set_event_sink(&self, sink: Sender<CodecEvent>) -> CodecResult<()> {
        if !self.callbacks {
            return Err(CodecError::IllegalState("callbacks unsupported".into()));
        }
        self.state.lock().sink = Some(sink);
        Ok(())
    }

    fn start(&self) -> CodecResult<()> {
        self.state.lock().starts += 1;
        Ok(())
    }

    fn stop(&self) -> CodecResult<()> {
        self.state.lock().stops += 1;
        Ok(())
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.releases += 1;
        state.sink = None;
    }

    fn dequeue_output(&self, timeout: Duration) -> CodecResult<CodecOutput> {
        let next = self.state.lock().queue.pop_front();
        match next {
            Some(output) => output,
            None => {
                thread::sleep(timeout);
                Ok(CodecOutput::NotReady)
            }
        }
    }

    fn output_buffer(&self, index: usize) -> Option<Bytes> {
        self.state.lock().buffers.get(&index).cloned()
    }

    fn release_output_buffer(&self, index: usize) -> CodecResult<()> {
        let mut state = self.state.lock();
        state.buffers.remove(&index);
        state.released.push(index);
        Ok(())
    }

    fn set_parameters(&self, params: &CodecParameters) -> CodecResult<()> {
        let mut state = self.state.lock();
        if state.reject_parameters {
            return Err(CodecError::IllegalState("parameters rejected".into()));
        }
        if params.request_keyframe {
            state.keyframe_requests += 1;
        }
        if let Some(bitrate) = params.bitrate {
            state.bitrates.push(bitrate);
        }
        Ok(())
    }
}

/// Provider advertising one hardware surface encoder (`mock.hw`) and one
/// software YUV encoder (`mock.sw`) for every codec.
pub struct MockCodecProvider {
    callbacks: bool,
    reject_format: bool,
    encoders_available: bool,
    created: Mutex<Vec<Arc<MockCodec>>>,
}

impl Default for MockCodecProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCodecProvider {
    pub fn new() -> Self {
        Self {
            callbacks: false,
            reject_format: false,
            encoders_available: true,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn with_callbacks(mut self) -> Self {
        self.callbacks = true;
        self
    }

    pub fn rejecting_format(mut self) -> Self {
        self.reject_format = true;
        self
    }

    pub fn without_encoders(mut self) -> Self {
        self.encoders_available = false;
        self
    }

    /// Every codec instantiated so far, oldest first.
    pub fn created(&self) -> Vec<Arc<MockCodec>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<MockCodec>> {
        self.created.lock().last().cloned()
    }
}

impl CodecProvider for MockCodecProvider {
    fn encoders(&self, codec: VideoCodec) -> Vec<EncoderInfo> {
        if !self.encoders_available {
            return Vec::new();
        }
        vec![
            EncoderInfo {
                name: "mock.hw".into(),
                codec,
                hardware: true,
                color_formats: vec![ColorFormat::Surface, ColorFormat::Yuv420SemiPlanar],
            },
            EncoderInfo {
                name: "mock.sw".into(),
                codec,
                hardware: false,
                color_formats: vec![ColorFormat::Yuv420Planar],
            },
        ]
    }

    fn create(&self, _info: &EncoderInfo) -> CodecResult<Arc<dyn HardwareCodec>> {
        let codec = Arc::new(MockCodec::new(self.callbacks));
        codec.set_reject_format(self.reject_format);
        self.created.lock().push(Arc::clone(&codec));
        Ok(codec)
    }
}

/// Output handler that records everything it receives.
#[derive(Default)]
pub struct CollectingOutput {
    received: Mutex<Vec<EncoderOutput>>,
}

impl CollectingOutput {
    pub fn formats(&self) -> Vec<FormatMetadata> {
        self.received
            .lock()
            .iter()
            .filter_map(|o| match o {
                EncoderOutput::Format(f) => Some(f.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn parameter_sets(&self) -> Vec<ParameterSets> {
        self.received
            .lock()
            .iter()
            .filter_map(|o| match o {
                EncoderOutput::ParameterSets(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn access_units(&self) -> Vec<AccessUnit> {
        self.received
            .lock()
            .iter()
            .filter_map(|o| match o {
                EncoderOutput::AccessUnit(u) => Some(u.clone()),
                _ => None,
            })
            .collect()
    }
}

impl EncoderOutputHandler for CollectingOutput {
    fn handle(&self, output: EncoderOutput) {
        self.received.lock().push(output);
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
