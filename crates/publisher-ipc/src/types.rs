//! Common types used across IPC messages.

use serde::{Deserialize, Serialize};

/// Default target bitrate in bits per second (~3.5 Mbps).
pub const DEFAULT_VIDEO_BITRATE: u32 = 3500 * 1024;

/// H.264 High profile identifier.
const AVC_PROFILE_HIGH: i32 = 0x08;

/// H.264 level 4 identifier.
const AVC_LEVEL_4: i32 = 0x800;

/// Video codec produced by the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoCodec {
    /// H.264 / AVC. Parameter sets arrive as two separate records (SPS, PPS).
    H264,

    /// H.265 / HEVC. Parameter sets arrive concatenated (VPS, SPS, PPS).
    H265,
}

impl VideoCodec {
    /// MIME type understood by platform codec registries.
    pub fn mime(self) -> &'static str {
        match self {
            Self::H264 => "video/avc",
            Self::H265 => "video/hevc",
        }
    }
}

/// Pixel format the encoder input accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorFormat {
    /// Opaque input surface fed by the capture pipeline.
    #[default]
    Surface,

    /// Planar YUV 4:2:0.
    Yuv420Planar,

    /// Semi-planar YUV 4:2:0 (NV12/NV21).
    Yuv420SemiPlanar,
}

/// Which encoder implementations may be selected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForcePolicy {
    /// Hardware encoders only.
    Hardware,

    /// Software encoders only.
    Software,

    /// First compatible encoder, hardware or software.
    #[default]
    FirstCompatible,
}

/// How encoded output is drained from the codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrainMode {
    /// Callback-driven when the codec supports it, polling otherwise.
    #[default]
    Auto,

    /// Codec pushes notifications to a dedicated worker.
    Callback,

    /// A dedicated worker dequeues with a short bounded wait.
    Polling,
}

/// Codec profile and level pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileLevel {
    pub profile: i32,
    pub level: i32,
}

impl ProfileLevel {
    /// H.264 High profile at level 4.
    pub const fn avc_high_level4() -> Self {
        Self {
            profile: AVC_PROFILE_HIGH,
            level: AVC_LEVEL_4,
        }
    }

    /// Only positive values are written to the codec format.
    pub fn is_set(&self) -> bool {
        self.profile > 0 && self.level > 0
    }
}

/// Video settings passed to `prepareVideo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    /// Width in pixels.
    pub width: u32,

    /// Height in pixels.
    pub height: u32,

    /// Target frames per second.
    pub fps: u32,

    /// Target bitrate in bits per second.
    pub bitrate: u32,

    /// Keyframe interval in seconds.
    pub keyframe_interval_secs: u32,

    /// Device rotation in degrees (0, 90, 180, 270).
    pub rotation: u32,

    /// Write `rotation` into the codec format as metadata.
    pub apply_rotation: bool,

    /// Output codec.
    pub codec: VideoCodec,

    /// Input pixel format.
    pub color_format: ColorFormat,

    /// Encoder implementation policy.
    pub force: ForcePolicy,

    /// Optional profile/level.
    pub profile: Option<ProfileLevel>,

    /// Output drain strategy.
    pub drain_mode: DrainMode,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            bitrate: DEFAULT_VIDEO_BITRATE,
            keyframe_interval_secs: 2,
            rotation: 0,
            apply_rotation: false,
            codec: VideoCodec::H264,
            color_format: ColorFormat::Surface,
            force: ForcePolicy::FirstCompatible,
            profile: Some(ProfileLevel::avc_high_level4()),
            drain_mode: DrainMode::Auto,
        }
    }
}

/// Periodic network-sufficiency signal reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BandwidthSignal {
    Sufficient,
    Insufficient,
}

/// Snapshot returned by `getStatistics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamStatistics {
    /// Whether streaming is paused.
    pub paused: bool,

    /// Current target bitrate in bits per second.
    pub bitrate: u32,

    /// Configured width in pixels.
    pub width: u32,

    /// Configured height in pixels.
    pub height: u32,

    /// Configured frames per second.
    pub fps: u32,

    /// Orientation value derived from the configured rotation table.
    pub orientation: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_level_requires_both_positive() {
        assert!(ProfileLevel::avc_high_level4().is_set());
        assert!(!ProfileLevel { profile: 8, level: -1 }.is_set());
        assert!(!ProfileLevel { profile: 0, level: 2048 }.is_set());
    }

    #[test]
    fn test_video_settings_partial_json_uses_defaults() {
        let settings: VideoSettings =
            serde_json::from_str(r#"{"width": 1280, "height": 720, "codec": "H265"}"#).unwrap();

        assert_eq!(settings.width, 1280);
        assert_eq!(settings.height, 720);
        assert_eq!(settings.codec, VideoCodec::H265);
        assert_eq!(settings.fps, 30);
        assert_eq!(settings.bitrate, DEFAULT_VIDEO_BITRATE);
    }
}
