//! Typed host<->engine messages for the RTMP publisher.
//!
//! This crate defines the control-surface commands a host sends to the
//! engine, the notifications the engine reports back, and the shared
//! settings/configuration types.

mod commands;
mod config;
mod events;
mod state;
mod types;

pub use commands::PublisherCommand;
pub use config::{BitrateBounds, ConfigError, PublisherConfig, ReconnectSettings};
pub use events::PublisherEvent;
pub use state::{ActivitySnapshot, ConnectionPhase};
pub use types::{
    BandwidthSignal, ColorFormat, DrainMode, ForcePolicy, ProfileLevel, StreamStatistics,
    VideoCodec, VideoSettings,
};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for commands (host → engine).
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Channel capacity for events (engine → host).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded command channel.
pub fn command_channel() -> (Sender<PublisherCommand>, Receiver<PublisherCommand>) {
    crossbeam_channel::bounded(COMMAND_CHANNEL_CAPACITY)
}

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<PublisherEvent>, Receiver<PublisherEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
