//! Hardware video encoder control and output draining.
//!
//! This crate owns one platform codec per session: it selects and
//! configures an encoder, drains encoded access units on a dedicated
//! worker (callback-driven or polling), recovers the codec parameter sets
//! and forwards everything to a single [`EncoderOutputHandler`].

mod codec;
mod controller;
mod drain;
mod error;
mod limiter;
mod params;
mod session;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use codec::{
    choose_encoder, BufferFlags, BufferInfo, CodecEvent, CodecFormat, CodecOutput,
    CodecParameters, CodecProvider, CodecResult, EncoderInfo, FormatMetadata, HardwareCodec,
    InputSurface,
};
pub use controller::{EncoderState, VideoEncoderController};
pub use drain::{select_strategy, CallbackDrain, DrainContext, DrainHandle, DrainStrategy, PollingDrain};
pub use error::{CodecError, EncoderError};
pub use limiter::FpsLimiter;
pub use params::{
    extract_from_config_buffer, extract_from_format, locate_concatenated,
    locate_in_config_buffer, ParameterSetRanges, ParameterSets, START_CODE,
};
pub use session::EncoderSession;

use bytes::Bytes;

/// Channel capacity for pushed codec events.
pub const CODEC_EVENT_CHANNEL_CAPACITY: usize = 64;

/// Result type for encoder operations.
pub type EncoderResult<T> = Result<T, EncoderError>;

/// An encoded video access unit.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    /// Encoded bytes, Annex B framed.
    pub data: Bytes,

    /// Presentation time in microseconds since the session started.
    pub pts_us: i64,

    /// Whether this is a sync frame.
    pub is_keyframe: bool,

    /// Whether the buffer carried codec configuration.
    pub is_config: bool,
}

/// An encoded audio access unit.
#[derive(Debug, Clone)]
pub struct AudioUnit {
    /// Encoded AAC bytes (raw, no ADTS header).
    pub data: Bytes,

    /// Presentation time in microseconds.
    pub pts_us: i64,

    /// Whether this is the AudioSpecificConfig record.
    pub is_config: bool,
}

/// Everything the drain loop forwards downstream.
#[derive(Debug, Clone)]
pub enum EncoderOutput {
    /// One-time output format of the session.
    Format(FormatMetadata),

    /// Recovered parameter sets, delivered at most once per session.
    ParameterSets(ParameterSets),

    /// An encoded access unit.
    AccessUnit(AccessUnit),
}

/// Consumer of encoder output. Called from the drain worker.
pub trait EncoderOutputHandler: Send + Sync {
    fn handle(&self, output: EncoderOutput);
}
