//! Platform codec collaborator.
//!
//! The hardware codec is a black box: it is configured with a format,
//! started and stopped, and hands encoded buffers back either through
//! `dequeue_output` or through events pushed to a registered sink.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::Sender;
use tracing::debug;

use publisher_ipc::{ColorFormat, ForcePolicy, ProfileLevel, VideoCodec, VideoSettings};

use crate::error::CodecError;

/// Result type for codec collaborator calls.
pub type CodecResult<T> = Result<T, CodecError>;

/// An encoder implementation advertised by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderInfo {
    /// Platform name of the encoder.
    pub name: String,

    /// Codec it produces.
    pub codec: VideoCodec,

    /// Whether it is hardware accelerated.
    pub hardware: bool,

    /// Input color formats it accepts.
    pub color_formats: Vec<ColorFormat>,
}

impl EncoderInfo {
    /// Whether this encoder can take input in `color`.
    ///
    /// Surface input needs a surface-capable encoder; either YUV 4:2:0
    /// layout satisfies a YUV request.
    pub fn accepts(&self, color: ColorFormat) -> bool {
        match color {
            ColorFormat::Surface => self.color_formats.contains(&ColorFormat::Surface),
            ColorFormat::Yuv420Planar | ColorFormat::Yuv420SemiPlanar => self
                .color_formats
                .iter()
                .any(|c| matches!(c, ColorFormat::Yuv420Planar | ColorFormat::Yuv420SemiPlanar)),
        }
    }
}

/// Format handed to `HardwareCodec::configure`.
#[derive(Debug, Clone, PartialEq)]
pub struct CodecFormat {
    pub mime: &'static str,
    pub width: u32,
    pub height: u32,
    pub bitrate: u32,
    pub fps: u32,
    pub keyframe_interval_secs: u32,
    pub color_format: ColorFormat,
    pub rotation: Option<u32>,
    pub profile: Option<ProfileLevel>,
}

impl CodecFormat {
    /// Build the codec format for a set of video settings.
    pub fn from_settings(settings: &VideoSettings) -> Self {
        Self {
            mime: settings.codec.mime(),
            width: settings.width,
            height: settings.height,
            bitrate: settings.bitrate,
            fps: settings.fps,
            keyframe_interval_secs: settings.keyframe_interval_secs,
            color_format: settings.color_format,
            rotation: settings.apply_rotation.then_some(settings.rotation),
            profile: settings.profile.filter(ProfileLevel::is_set),
        }
    }
}

/// One-time output format reported by the codec.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatMetadata {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,

    /// First codec-specific data record (SPS for H.264, VPS+SPS+PPS for H.265).
    pub csd0: Option<Bytes>,

    /// Second codec-specific data record (PPS for H.264).
    pub csd1: Option<Bytes>,
}

/// Flags attached to an output buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags {
    pub key_frame: bool,
    pub codec_config: bool,
    pub end_of_stream: bool,
}

/// Metadata for a dequeued output buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferInfo {
    /// Valid bytes in the buffer.
    pub size: usize,

    /// Codec-assigned presentation time in microseconds.
    pub presentation_time_us: i64,

    pub flags: BufferFlags,
}

/// Result of a single polling dequeue.
#[derive(Debug, Clone)]
pub enum CodecOutput {
    FormatChanged(FormatMetadata),
    Buffer { index: usize, info: BufferInfo },
    NotReady,
}

/// Notification pushed by a callback-capable codec.
#[derive(Debug, Clone)]
pub enum CodecEvent {
    FormatChanged(FormatMetadata),
    BufferReady { index: usize, info: BufferInfo },
    Error(CodecError),
}

/// Live parameter update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecParameters {
    pub bitrate: Option<u32>,
    pub request_keyframe: bool,
}

impl CodecParameters {
    /// Update only the target bitrate.
    pub fn bitrate(bitrate: u32) -> Self {
        Self {
            bitrate: Some(bitrate),
            request_keyframe: false,
        }
    }

    /// Request an immediate sync frame.
    pub fn keyframe() -> Self {
        Self {
            bitrate: None,
            request_keyframe: true,
        }
    }
}

/// Opaque handle to the codec's input surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSurface {
    pub id: u64,
}

/// A platform video codec instance.
///
/// Calls come from the control thread (configure/start/stop/parameters)
/// and from the drain worker (dequeue/release), so implementations
/// synchronize internally.
pub trait HardwareCodec: Send + Sync {
    /// Configure for encoding.
    fn configure(&self, format: &CodecFormat) -> CodecResult<()>;

    /// Create the surface the capture pipeline renders into.
    fn create_input_surface(&self) -> CodecResult<InputSurface>;

    /// Whether the codec can push events instead of being polled.
    fn supports_callbacks(&self) -> bool;

    /// Register the sink for pushed events. Must precede `start`.
    fn set_event_sink(&self, sink: Sender<CodecEvent>) -> CodecResult<()>;

    /// Start encoding.
    fn start(&self) -> CodecResult<()>;

    /// Stop encoding.
    fn stop(&self) -> CodecResult<()>;

    /// Release all codec resources.
    fn release(&self);

    /// Wait up to `timeout` for output.
    fn dequeue_output(&self, timeout: Duration) -> CodecResult<CodecOutput>;

    /// Contents of a dequeued output buffer.
    fn output_buffer(&self, index: usize) -> Option<Bytes>;

    /// Return a dequeued buffer to the codec.
    fn release_output_buffer(&self, index: usize) -> CodecResult<()>;

    /// Apply a live parameter update.
    fn set_parameters(&self, params: &CodecParameters) -> CodecResult<()>;
}

/// Enumerates and instantiates platform encoders.
pub trait CodecProvider: Send + Sync {
    /// Encoders able to produce `codec`, in platform preference order.
    fn encoders(&self, codec: VideoCodec) -> Vec<EncoderInfo>;

    /// Instantiate an encoder.
    fn create(&self, info: &EncoderInfo) -> CodecResult<Arc<dyn HardwareCodec>>;
}

/// Pick the first encoder allowed by the force policy that accepts the
/// requested color format.
pub fn choose_encoder(provider: &dyn CodecProvider, settings: &VideoSettings) -> Option<EncoderInfo> {
    provider
        .encoders(settings.codec)
        .into_iter()
        .filter(|info| match settings.force {
            ForcePolicy::Hardware => info.hardware,
            ForcePolicy::Software => !info.hardware,
            ForcePolicy::FirstCompatible => true,
        })
        .find(|info| {
            debug!(encoder = %info.name, hardware = info.hardware, "Considering encoder");
            info.accepts(settings.color_format)
        })
}
