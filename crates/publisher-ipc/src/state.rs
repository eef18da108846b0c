//! Publisher state snapshots.

use serde::{Deserialize, Serialize};

/// Activity flags of the session orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    /// Streaming activity is active.
    pub streaming: bool,

    /// Recording activity is active.
    pub recording: bool,

    /// Access units are withheld from the stream sink.
    pub streaming_paused: bool,

    /// Access units are withheld from the record sink.
    pub recording_paused: bool,

    /// The video encoder is running.
    pub encoder_running: bool,
}

impl ActivitySnapshot {
    /// Returns true if any activity is consuming encoder output.
    pub fn is_active(&self) -> bool {
        self.streaming || self.recording
    }
}

/// Connection phase as reported to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Retrying { attempt: u32 },
    Failed,
}

impl ConnectionPhase {
    /// Returns a simple string representation of the phase.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Retrying { .. } => "Retrying",
            Self::Failed => "Failed",
        }
    }
}
