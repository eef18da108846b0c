//! Events sent from the engine to the host.

use serde::{Deserialize, Serialize};

use crate::state::{ActivitySnapshot, ConnectionPhase};
use crate::types::StreamStatistics;

/// Events that the engine can send to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PublisherEvent {
    /// Engine is ready for commands.
    Ready,

    /// Result of `PrepareVideo` / `ReconfigureVideo`.
    Prepared {
        /// Whether an encoder was configured.
        success: bool,
    },

    /// Activity flags changed.
    ActivityChanged(ActivitySnapshot),

    /// Connection phase changed.
    ConnectionChanged(ConnectionPhase),

    /// A lost connection is being retried.
    RtmpRetry {
        /// Retry attempt, starting at 1.
        attempt: u32,

        /// Why the previous attempt ended.
        description: String,
    },

    /// Error occurred.
    Error {
        /// Whether the error is recoverable.
        recoverable: bool,

        /// Error message.
        description: String,
    },

    /// Target bitrate changed.
    BitrateChanged {
        /// New bitrate in bits per second.
        bitrate: u32,
    },

    /// Encoded frames per second over the last second.
    Fps(u32),

    /// Statistics snapshot.
    Statistics(StreamStatistics),

    /// Engine has shut down.
    Shutdown,
}
