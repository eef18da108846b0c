//! Commands sent from the host to the engine.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::{BandwidthSignal, VideoSettings};

/// Commands that the host can send to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PublisherCommand {
    /// Select and configure a video encoder.
    PrepareVideo(VideoSettings),

    /// Apply settings that cannot change live (resolution, profile).
    ReconfigureVideo(VideoSettings),

    /// Start streaming to an RTMP URL whose last path segment is the stream key.
    StartStream { url: String },

    /// Stop streaming.
    StopStream,

    /// Start recording to a local file.
    StartRecord { path: PathBuf },

    /// Stop recording.
    StopRecord,

    /// Withhold access units from the stream sink.
    PauseStreaming,

    /// Resume forwarding to the stream sink.
    ResumeStreaming,

    /// Withhold access units from the record sink.
    PauseRecording,

    /// Resume forwarding to the record sink.
    ResumeRecording,

    /// Set the target video bitrate in bits per second.
    SetBitrate(u32),

    /// Cap the capture frame rate fed to the encoder, live.
    SetFpsLimit(u32),

    /// Feed an externally measured bandwidth signal.
    ReportBandwidth(BandwidthSignal),

    /// Request a statistics snapshot.
    GetStatistics,

    /// Request the current activity state.
    GetState,

    /// Shutdown the engine completely.
    Shutdown,
}

impl PublisherCommand {
    /// Command name for logging, without the payload.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PrepareVideo(_) => "prepare_video",
            Self::ReconfigureVideo(_) => "reconfigure_video",
            Self::StartStream { .. } => "start_stream",
            Self::StopStream => "stop_stream",
            Self::StartRecord { .. } => "start_record",
            Self::StopRecord => "stop_record",
            Self::PauseStreaming => "pause_streaming",
            Self::ResumeStreaming => "resume_streaming",
            Self::PauseRecording => "pause_recording",
            Self::ResumeRecording => "resume_recording",
            Self::SetBitrate(_) => "set_bitrate",
            Self::SetFpsLimit(_) => "set_fps_limit",
            Self::ReportBandwidth(_) => "report_bandwidth",
            Self::GetStatistics => "get_statistics",
            Self::GetState => "get_state",
            Self::Shutdown => "shutdown",
        }
    }
}
