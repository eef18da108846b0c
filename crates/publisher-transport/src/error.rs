//! Error types for the transport module.

use thiserror::Error;

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Invalid RTMP URL.
    #[error("Invalid RTMP URL: {0}")]
    InvalidUrl(String),

    /// Connection could not be established.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Server rejected the connect or publish request.
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// Send failed.
    #[error("Send error: {0}")]
    Send(String),

    /// Supervisor worker is gone.
    #[error("Channel disconnected")]
    ChannelDisconnected,

    /// Worker thread or runtime could not be created.
    #[error("Failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
