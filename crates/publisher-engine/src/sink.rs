//! Consumers of encoded output.

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use publisher_encoder::{AccessUnit, AudioUnit, FormatMetadata, ParameterSets};
use publisher_transport::Transport;

use crate::EngineResult;

/// Destination for one activity's encoded media.
///
/// Called from the drain worker and the audio source.
pub trait MediaSink: Send + Sync {
    /// One-time output format of the encoder session.
    fn on_format(&self, format: &FormatMetadata);

    fn on_parameter_sets(&self, sets: &ParameterSets);

    fn on_video(&self, unit: &AccessUnit);

    fn on_audio(&self, unit: &AudioUnit);

    /// The encoder session that produced the format and parameter sets ended.
    fn on_session_end(&self) {}
}

/// Local recording collaborator. Container writing lives behind it.
pub trait RecordSink: MediaSink {
    /// Open `path` for writing.
    fn start(&self, path: &Path) -> EngineResult<()>;

    /// Finish the current file. Idempotent.
    fn stop(&self);
}

/// Stream sink backed by the wire transport.
pub struct TransportSink {
    transport: Arc<dyn Transport>,
}

impl TransportSink {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl MediaSink for TransportSink {
    fn on_format(&self, format: &FormatMetadata) {
        debug!(
            codec = ?format.codec,
            width = format.width,
            height = format.height,
            "Stream format"
        );
    }

    fn on_parameter_sets(&self, sets: &ParameterSets) {
        self.transport.set_parameter_sets(sets);
    }

    fn on_video(&self, unit: &AccessUnit) {
        self.transport.send_video(unit);
    }

    fn on_audio(&self, unit: &AudioUnit) {
        self.transport.send_audio(unit);
    }

    fn on_session_end(&self) {
        self.transport.clear_parameter_sets();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use publisher_transport::testing::RecordingTransport;

    #[test]
    fn test_transport_sink_forwards_media() {
        let transport = Arc::new(RecordingTransport::new());
        let sink = TransportSink::new(transport.clone());

        sink.on_parameter_sets(&ParameterSets::from_separate(
            Bytes::from_static(&[0, 0, 0, 1, 0x67]),
            Bytes::from_static(&[0, 0, 0, 1, 0x68]),
        ));
        sink.on_video(&AccessUnit {
            data: Bytes::from_static(&[0, 0, 0, 1, 0x65]),
            pts_us: 33_000,
            is_keyframe: true,
            is_config: false,
        });
        sink.on_audio(&AudioUnit {
            data: Bytes::from_static(&[0x21]),
            pts_us: 23_000,
            is_config: false,
        });

        assert_eq!(transport.parameter_sets().len(), 1);
        assert_eq!(transport.video_units()[0].pts_us, 33_000);
        assert_eq!(transport.audio_units()[0].pts_us, 23_000);
    }

    #[test]
    fn test_session_end_clears_transport_parameter_sets() {
        let transport = Arc::new(RecordingTransport::new());
        let sink = TransportSink::new(transport.clone());

        sink.on_session_end();

        assert_eq!(transport.parameter_set_clears(), 1);
    }
}
