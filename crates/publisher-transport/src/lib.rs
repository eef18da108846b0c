//! RTMP publishing transport.
//!
//! This crate provides the transport collaborator interface, an RTMP
//! implementation of it, and the connection supervisor that keeps the
//! connection alive with bounded exponential backoff.

mod connection;
mod error;
mod nal;
mod rtmp;
mod supervisor;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use connection::{
    ConnectionAction, ConnectionState, ConnectionStateMachine, LossReason, ReconnectPolicy,
};
pub use error::TransportError;
pub use nal::{
    avc_sequence_header, build_avc_decoder_config, build_flv_audio_tag, build_flv_video_tag,
    filter_parameter_sets, nals_to_avcc, parse_annex_b, strip_start_code, NalUnit, NalUnitType,
};
pub use rtmp::{split_publish_url, PublishTarget, RtmpTransport, TransportStatistics};
pub use supervisor::{ConnectionNotice, ConnectionSupervisor};

use crossbeam_channel::Sender;

use publisher_encoder::{AccessUnit, AudioUnit, ParameterSets};
use publisher_ipc::BandwidthSignal;

/// Channel capacity for outgoing packets.
pub const PACKET_CHANNEL_CAPACITY: usize = 30;

/// Channel capacity for transport events.
pub const TRANSPORT_EVENT_CHANNEL_CAPACITY: usize = 64;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Protocol-level connection status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    ConnectSuccess,
    ConnectFailed(String),
    ConnectClosed,
}

/// Notifications emitted by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Status(ConnectionStatus),

    /// The socket failed underneath an established session.
    IoError(String),

    /// Periodic bandwidth sufficiency measurement.
    Bandwidth(BandwidthSignal),
}

/// Wire transport collaborator.
///
/// `connect` returns once the attempt is underway; its outcome arrives
/// as a [`TransportEvent`] on `events`.
pub trait Transport: Send + Sync {
    fn connect(&self, url: &str, events: Sender<TransportEvent>) -> TransportResult<()>;

    /// Tear down the current connection, if any. Idempotent.
    fn close(&self);

    fn send_video(&self, unit: &AccessUnit);

    fn send_audio(&self, unit: &AudioUnit);

    fn set_parameter_sets(&self, sets: &ParameterSets);

    /// Forget the parameter sets of an ended encoder session. Cached sets
    /// otherwise survive `close` for resending after a reconnect.
    fn clear_parameter_sets(&self);
}
