//! Output drain strategies.
//!
//! Both strategies feed one [`DrainContext`], which owns the handling
//! contract for format changes, ready buffers and codec errors. The
//! strategy only decides how events reach it.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace, warn};

use publisher_ipc::{DrainMode, VideoCodec};

use crate::codec::{BufferInfo, CodecEvent, CodecOutput, FormatMetadata, HardwareCodec};
use crate::error::{CodecError, EncoderError};
use crate::params::{extract_from_config_buffer, extract_from_format};
use crate::session::EncoderSession;
use crate::{
    AccessUnit, EncoderOutput, EncoderOutputHandler, EncoderResult, CODEC_EVENT_CHANNEL_CAPACITY,
};

/// How long the callback worker waits before rechecking the running flag.
const CALLBACK_WAIT: Duration = Duration::from_millis(50);

/// Shared handling for every drain strategy.
#[derive(Clone)]
pub struct DrainContext {
    codec: Arc<dyn HardwareCodec>,
    session: Arc<EncoderSession>,
    output: Arc<dyn EncoderOutputHandler>,
}

impl DrainContext {
    pub fn new(
        codec: Arc<dyn HardwareCodec>,
        session: Arc<EncoderSession>,
        output: Arc<dyn EncoderOutputHandler>,
    ) -> Self {
        Self {
            codec,
            session,
            output,
        }
    }

    pub fn session(&self) -> &EncoderSession {
        &self.session
    }

    /// Forward the output format and, once per session, its parameter sets.
    pub fn on_format_changed(&self, format: FormatMetadata) {
        debug!(
            width = format.width,
            height = format.height,
            codec = ?format.codec,
            "Encoder output format changed"
        );

        if !self.session.parameter_sets_sent() {
            match extract_from_format(&format) {
                Some(sets) if self.session.claim_parameter_sets() => {
                    self.output.handle(EncoderOutput::Format(format));
                    self.output.handle(EncoderOutput::ParameterSets(sets));
                    return;
                }
                Some(_) => {}
                None => debug!("Format carried no usable parameter sets"),
            }
        }

        self.output.handle(EncoderOutput::Format(format));
    }

    /// Handle a ready output buffer. The buffer is always returned to the codec.
    pub fn on_buffer_ready(&self, index: usize, info: BufferInfo) {
        if self.session.is_running() {
            self.forward_buffer(index, info);
        } else {
            trace!(index, "Session stopped, dropping buffer");
        }

        if let Err(e) = self.codec.release_output_buffer(index) {
            warn!(index, error = %e, "Failed to release output buffer");
        }
    }

    fn forward_buffer(&self, index: usize, info: BufferInfo) {
        let Some(buffer) = self.codec.output_buffer(index) else {
            warn!(index, "Codec returned no data for output buffer");
            return;
        };
        let data = buffer.slice(..info.size.min(buffer.len()));

        if info.flags.codec_config
            && self.session.settings().codec == VideoCodec::H264
            && !self.session.parameter_sets_sent()
        {
            match extract_from_config_buffer(&data) {
                Some(sets) if self.session.claim_parameter_sets() => {
                    debug!(len = data.len(), "Parameter sets recovered from config buffer");
                    self.output.handle(EncoderOutput::ParameterSets(sets));
                }
                Some(_) => {}
                None => debug!(len = data.len(), "Config buffer held no parameter sets"),
            }
        }

        let unit = AccessUnit {
            data,
            pts_us: self.session.elapsed_us(Instant::now()),
            is_keyframe: info.flags.key_frame,
            is_config: info.flags.codec_config,
        };
        trace!(
            index,
            size = unit.data.len(),
            pts_us = unit.pts_us,
            keyframe = unit.is_keyframe,
            "Forwarding access unit"
        );
        self.output.handle(EncoderOutput::AccessUnit(unit));
    }

    pub fn on_codec_error(&self, error: &CodecError) {
        warn!(error = %error, "Codec error during drain");
    }
}

/// A way of pulling output out of the codec.
pub trait DrainStrategy: Send {
    fn name(&self) -> &'static str;

    /// Hook into the codec. Called once before the codec is started.
    fn attach(&mut self, codec: &dyn HardwareCodec) -> EncoderResult<()>;

    /// Start the worker. It runs until the session leaves running.
    fn spawn(self: Box<Self>, ctx: DrainContext) -> EncoderResult<DrainHandle>;
}

/// Handle to a running drain worker.
pub struct DrainHandle {
    name: &'static str,
    thread: JoinHandle<()>,
}

impl DrainHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wait for the worker to observe the stop and exit.
    pub fn join(self) {
        if self.thread.join().is_err() {
            warn!(strategy = self.name, "Drain worker panicked");
        }
    }
}

fn spawn_worker<F>(name: &'static str, body: F) -> EncoderResult<DrainHandle>
where
    F: FnOnce() + Send + 'static,
{
    let thread = thread::Builder::new()
        .name(format!("encoder-drain-{name}"))
        .spawn(body)
        .map_err(EncoderError::Worker)?;
    Ok(DrainHandle { name, thread })
}

/// The codec pushes events into a channel serviced by a dedicated worker.
#[derive(Default)]
pub struct CallbackDrain {
    events: Option<Receiver<CodecEvent>>,
}

impl CallbackDrain {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DrainStrategy for CallbackDrain {
    fn name(&self) -> &'static str {
        "callback"
    }

    fn attach(&mut self, codec: &dyn HardwareCodec) -> EncoderResult<()> {
        let (tx, rx): (Sender<CodecEvent>, Receiver<CodecEvent>) =
            crossbeam_channel::bounded(CODEC_EVENT_CHANNEL_CAPACITY);
        codec.set_event_sink(tx)?;
        self.events = Some(rx);
        Ok(())
    }

    fn spawn(self: Box<Self>, ctx: DrainContext) -> EncoderResult<DrainHandle> {
        let events = self.events.ok_or(EncoderError::InvalidState {
            operation: "spawn callback drain",
            state: "detached",
        })?;

        spawn_worker("callback", move || {
            debug!("Callback drain started");
            while ctx.session().is_running() {
                match events.recv_timeout(CALLBACK_WAIT) {
                    Ok(CodecEvent::FormatChanged(format)) => ctx.on_format_changed(format),
                    Ok(CodecEvent::BufferReady { index, info }) => ctx.on_buffer_ready(index, info),
                    Ok(CodecEvent::Error(e)) => ctx.on_codec_error(&e),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        debug!("Codec dropped its event sink");
                        break;
                    }
                }
            }
            debug!("Callback drain exiting");
        })
    }
}

/// A dedicated worker dequeues output with a bounded wait.
pub struct PollingDrain {
    timeout: Duration,
}

impl PollingDrain {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl DrainStrategy for PollingDrain {
    fn name(&self) -> &'static str {
        "polling"
    }

    fn attach(&mut self, _codec: &dyn HardwareCodec) -> EncoderResult<()> {
        Ok(())
    }

    fn spawn(self: Box<Self>, ctx: DrainContext) -> EncoderResult<DrainHandle> {
        let timeout = self.timeout;
        let codec = Arc::clone(&ctx.codec);

        spawn_worker("polling", move || {
            debug!(timeout_ms = timeout.as_millis() as u64, "Polling drain started");
            while ctx.session().is_running() {
                match codec.dequeue_output(timeout) {
                    Ok(CodecOutput::FormatChanged(format)) => ctx.on_format_changed(format),
                    Ok(CodecOutput::Buffer { index, info }) => ctx.on_buffer_ready(index, info),
                    Ok(CodecOutput::NotReady) => thread::yield_now(),
                    Err(e) => {
                        ctx.on_codec_error(&e);
                        thread::sleep(timeout);
                    }
                }
            }
            debug!("Polling drain exiting");
        })
    }
}

/// Pick the strategy for a session from the configured mode and the
/// codec's capabilities.
pub fn select_strategy(
    mode: DrainMode,
    codec: &dyn HardwareCodec,
    timeout: Duration,
) -> Box<dyn DrainStrategy> {
    let callbacks = codec.supports_callbacks();
    match mode {
        DrainMode::Auto | DrainMode::Callback if callbacks => Box::new(CallbackDrain::new()),
        DrainMode::Callback => {
            warn!("Codec has no callback support, falling back to polling");
            Box::new(PollingDrain::new(timeout))
        }
        DrainMode::Auto | DrainMode::Polling => Box::new(PollingDrain::new(timeout)),
    }
}
