//! Session orchestration.
//!
//! Streaming and recording are independent activities consuming the
//! output of one shared video encoder. The encoder runs while at least
//! one of them is active and is torn down only when both are inactive.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Sender;
use tracing::{debug, info, instrument, warn};

use publisher_encoder::{CodecProvider, EncoderState, FpsLimiter, VideoEncoderController};
use publisher_ipc::{
    ActivitySnapshot, BandwidthSignal, PublisherConfig, StreamStatistics, VideoSettings,
};
use publisher_transport::{
    split_publish_url, ConnectionNotice, ConnectionState, ConnectionSupervisor, ReconnectPolicy,
    Transport,
};

use crate::bitrate::AdaptiveBitrateController;
use crate::error::EngineError;
use crate::router::{AudioOutputHandler, OutputRouter, Route};
use crate::sink::{RecordSink, TransportSink};
use crate::EngineResult;

/// Microphone capture and AAC encoding collaborator.
pub trait AudioSource: Send + Sync {
    /// Begin delivering encoded audio to `output`.
    fn start(&self, output: Arc<dyn AudioOutputHandler>) -> EngineResult<()>;

    /// Stop delivering audio. Idempotent.
    fn stop(&self);
}

/// Platform collaborators driven by the orchestrator.
pub struct Collaborators {
    pub codecs: Arc<dyn CodecProvider>,
    pub transport: Arc<dyn Transport>,
    pub recorder: Arc<dyn RecordSink>,
    pub audio: Option<Arc<dyn AudioSource>>,
}

/// Coordinates the streaming and recording activities.
///
/// Owned by the control thread; every method runs there.
pub struct SessionOrchestrator {
    config: PublisherConfig,
    encoder: VideoEncoderController,
    router: Arc<OutputRouter>,
    recorder: Arc<dyn RecordSink>,
    audio: Option<Arc<dyn AudioSource>>,
    audio_running: bool,
    connection: ConnectionSupervisor,
    bitrate: AdaptiveBitrateController,
    settings: Option<VideoSettings>,
    streaming: bool,
    recording: bool,
}

impl SessionOrchestrator {
    /// Wire the collaborators together and start the connection supervisor.
    /// Connection notices are delivered to `notices`.
    pub fn new(
        config: PublisherConfig,
        parts: Collaborators,
        notices: Sender<ConnectionNotice>,
    ) -> EngineResult<Self> {
        config.validate()?;

        let stream_sink = Arc::new(TransportSink::new(Arc::clone(&parts.transport)));
        let router = Arc::new(OutputRouter::new(stream_sink, Arc::clone(&parts.recorder)));
        let encoder = VideoEncoderController::new(
            parts.codecs,
            Arc::clone(&router) as _,
            config.dequeue_timeout(),
        );
        let connection = ConnectionSupervisor::spawn(
            parts.transport,
            ReconnectPolicy::from(&config.reconnect),
            notices,
        )?;
        let bitrate =
            AdaptiveBitrateController::new(config.bitrate, VideoSettings::default().bitrate);

        Ok(Self {
            config,
            encoder,
            router,
            recorder: parts.recorder,
            audio: parts.audio,
            audio_running: false,
            connection,
            bitrate,
            settings: None,
            streaming: false,
            recording: false,
        })
    }

    /// Select and configure the video encoder and clear both pause flags.
    ///
    /// Fails while the encoder is running; use `reconfigure_video` then.
    /// On failure no settings are kept.
    #[instrument(
        name = "prepare_video",
        skip(self, settings),
        fields(width = settings.width, height = settings.height, fps = settings.fps)
    )]
    pub fn prepare_video(&mut self, settings: VideoSettings) -> EngineResult<()> {
        let settings = self.effective_settings(settings);
        if !self.encoder.is_running() {
            self.settings = None;
            self.router.set_paused(Route::Stream, false);
            self.router.set_paused(Route::Record, false);
            self.encoder.clear_fps_limit();
        }

        self.encoder.prepare(settings.clone())?;

        self.bitrate = AdaptiveBitrateController::new(self.config.bitrate, settings.bitrate);
        self.settings = Some(settings);
        Ok(())
    }

    /// Apply settings that cannot change live. Resets a running encoder,
    /// prepares an idle one.
    #[instrument(
        name = "reconfigure_video",
        skip(self, settings),
        fields(width = settings.width, height = settings.height)
    )]
    pub fn reconfigure_video(&mut self, settings: VideoSettings) -> EngineResult<()> {
        if !self.encoder.is_running() {
            return self.prepare_video(settings);
        }

        let settings = self.effective_settings(settings);
        self.router.clear_session();

        if let Err(e) = self.encoder.reset_with(settings.clone()) {
            warn!(error = %e, "Encoder reset failed, restoring previous settings");
            self.restore_encoding();
            return Err(e.into());
        }

        self.bitrate = AdaptiveBitrateController::new(self.config.bitrate, settings.bitrate);
        self.settings = Some(settings);
        self.router.fps().restart(Instant::now());
        Ok(())
    }

    /// Start streaming to `url` and begin connecting.
    #[instrument(name = "start_stream", skip_all)]
    pub fn start_stream(&mut self, url: &str) -> EngineResult<()> {
        if self.streaming {
            debug!("Already streaming");
            return Ok(());
        }
        split_publish_url(url)?;

        self.router.activate(Route::Stream);
        self.streaming = true;

        let started = self
            .ensure_encoding()
            .and_then(|()| self.connection.connect(url).map_err(EngineError::from));
        if let Err(e) = started {
            warn!(error = %e, "Streaming failed to start");
            self.streaming = false;
            self.router.deactivate(Route::Stream);
            self.release_if_idle();
            return Err(e);
        }

        info!("Streaming started");
        Ok(())
    }

    /// Stop streaming. The encoder keeps running while recording.
    #[instrument(name = "stop_stream", skip(self))]
    pub fn stop_stream(&mut self) {
        if !self.streaming {
            debug!("Not streaming");
            return;
        }

        self.streaming = false;
        self.router.deactivate(Route::Stream);
        if let Err(e) = self.connection.close() {
            warn!(error = %e, "Failed to close connection");
        }
        self.release_if_idle();
        info!("Streaming stopped");
    }

    /// Start recording to `path`.
    #[instrument(name = "start_record", skip(self, path), fields(path = %path.display()))]
    pub fn start_record(&mut self, path: &Path) -> EngineResult<()> {
        if self.recording {
            debug!("Already recording");
            return Ok(());
        }

        self.recorder.start(path)?;
        self.router.activate(Route::Record);
        self.recording = true;

        if let Err(e) = self.ensure_encoding() {
            warn!(error = %e, "Recording failed to start");
            self.recording = false;
            self.router.deactivate(Route::Record);
            self.recorder.stop();
            self.release_if_idle();
            return Err(e);
        }

        info!("Recording started");
        Ok(())
    }

    /// Stop recording. The encoder keeps running while streaming.
    #[instrument(name = "stop_record", skip(self))]
    pub fn stop_record(&mut self) {
        if !self.recording {
            debug!("Not recording");
            return;
        }

        self.recording = false;
        self.router.deactivate(Route::Record);
        self.recorder.stop();
        self.release_if_idle();
        info!("Recording stopped");
    }

    /// Pause flags outlive the activity; a pause issued while idle applies
    /// once the activity starts.
    pub fn pause_streaming(&mut self) {
        self.router.set_paused(Route::Stream, true);
    }

    pub fn resume_streaming(&mut self) {
        self.router.set_paused(Route::Stream, false);
    }

    /// Pause recording and request a keyframe so the recording resumes on
    /// a clean access unit.
    pub fn pause_recording(&mut self) {
        self.router.set_paused(Route::Record, true);
        self.encoder.request_keyframe();
    }

    pub fn resume_recording(&mut self) {
        self.router.set_paused(Route::Record, false);
    }

    /// Explicit bitrate request, clamped. Returns the new bitrate if it
    /// changed.
    pub fn set_bitrate(&mut self, bitrate: u32) -> Option<u32> {
        let changed = self.bitrate.set(bitrate)?;
        self.encoder.set_bitrate(changed);
        Some(changed)
    }

    /// Cap the capture frame rate. Survives stop and start; a fresh
    /// `prepare_video` drops it.
    pub fn set_fps_limit(&mut self, fps: u32) -> EngineResult<()> {
        self.encoder.set_fps_limit(fps)?;
        Ok(())
    }

    /// Frame gate the capture pipeline consults before feeding a frame.
    pub fn fps_limiter(&self) -> Arc<FpsLimiter> {
        self.encoder.fps_limiter()
    }

    /// Feed a bandwidth signal to the adaptive bitrate controller.
    pub fn on_bandwidth(&mut self, signal: BandwidthSignal) -> Option<u32> {
        let changed = self.bitrate.on_signal(signal)?;
        self.encoder.set_bitrate(changed);
        Some(changed)
    }

    /// The transport connected. Restarts the encoder if an activity is
    /// waiting on it.
    pub fn on_connected(&mut self) -> EngineResult<()> {
        if !self.is_active() || self.encoder.is_running() {
            return Ok(());
        }
        info!("Connected with encoder down, restarting it");
        self.ensure_encoding()
    }

    /// The connection gave up. Streaming ends; recording is unaffected.
    pub fn on_connection_failed(&mut self) {
        if !self.streaming {
            return;
        }
        self.streaming = false;
        self.router.deactivate(Route::Stream);
        self.release_if_idle();
        info!("Streaming ended after connection failure");
    }

    pub fn is_active(&self) -> bool {
        self.streaming || self.recording
    }

    pub fn encoder_state(&self) -> EncoderState {
        self.encoder.state()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn snapshot(&self) -> ActivitySnapshot {
        ActivitySnapshot {
            streaming: self.streaming,
            recording: self.recording,
            streaming_paused: self.router.is_paused(Route::Stream),
            recording_paused: self.router.is_paused(Route::Record),
            encoder_running: self.encoder.is_running(),
        }
    }

    pub fn statistics(&self) -> StreamStatistics {
        let settings = self.settings.as_ref();
        StreamStatistics {
            paused: self.router.is_paused(Route::Stream),
            bitrate: self.bitrate.current(),
            width: settings.map_or(0, |s| s.width),
            height: settings.map_or(0, |s| s.height),
            fps: settings.map_or(0, |s| s.fps),
            orientation: settings.map_or(0, |s| self.config.orientation_for(s.rotation)),
        }
    }

    /// Encoded frame rate, once per window while the encoder runs.
    pub fn poll_fps(&self, now: Instant) -> Option<u32> {
        if !self.encoder.is_running() {
            return None;
        }
        self.router.fps().poll(now)
    }

    /// End both activities and stop the connection supervisor.
    pub fn shutdown(&mut self) {
        self.stop_stream();
        self.stop_record();
        self.release_if_idle();
        self.connection.shutdown();
    }

    /// Apply config overrides and clamp the bitrate.
    fn effective_settings(&self, mut settings: VideoSettings) -> VideoSettings {
        if let Some(mode) = self.config.drain_mode {
            settings.drain_mode = mode;
        }
        let bounds = &self.config.bitrate;
        settings.bitrate = settings.bitrate.clamp(bounds.floor, bounds.ceiling);
        settings
    }

    fn ensure_encoding(&mut self) -> EngineResult<()> {
        if self.encoder.is_running() {
            return Ok(());
        }

        if self.encoder.state() != EncoderState::Prepared {
            let mut settings = self.settings.clone().ok_or(EngineError::NotPrepared)?;
            settings.bitrate = self.bitrate.current();
            self.encoder.prepare(settings)?;
        }

        self.router.clear_session();
        self.encoder.start()?;

        let target = self.bitrate.current();
        if self.encoder.bitrate() != Some(target) {
            self.encoder.set_bitrate(target);
        }
        self.router.fps().restart(Instant::now());
        self.start_audio();
        Ok(())
    }

    /// Bring the encoder back with the last accepted settings. Ends both
    /// activities if that fails too.
    fn restore_encoding(&mut self) {
        self.router.clear_session();
        if let Err(e) = self.ensure_encoding() {
            warn!(error = %e, "Encoder restore failed, ending activities");
            self.stop_stream();
            self.stop_record();
        }
    }

    /// Tear the encoder down once neither activity needs it.
    fn release_if_idle(&mut self) {
        if self.is_active() {
            debug!(
                streaming = self.streaming,
                recording = self.recording,
                "Encoder still in use"
            );
            return;
        }
        self.stop_audio();
        self.encoder.stop();
        self.router.clear_session();
    }

    fn start_audio(&mut self) {
        let Some(audio) = &self.audio else {
            return;
        };
        if self.audio_running {
            return;
        }
        match audio.start(Arc::clone(&self.router) as _) {
            Ok(()) => self.audio_running = true,
            Err(e) => warn!(error = %e, "Audio source failed to start, continuing without audio"),
        }
    }

    fn stop_audio(&mut self) {
        if let (Some(audio), true) = (&self.audio, self.audio_running) {
            audio.stop();
        }
        self.audio_running = false;
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingSink, ScriptedAudio};
    use bytes::Bytes;
    use crossbeam_channel::Receiver;
    use publisher_encoder::testing::{wait_until, MockCodec, MockCodecProvider};
    use publisher_encoder::AudioUnit;
    use publisher_ipc::{ColorFormat, ForcePolicy, ReconnectSettings};
    use publisher_transport::testing::RecordingTransport;
    use publisher_transport::ConnectionStatus;
    use std::path::PathBuf;
    use std::time::Duration;

    const URL: &str = "rtmp://example.com/live/key";
    const KBPS: u32 = 1024;

    struct Harness {
        orchestrator: SessionOrchestrator,
        codecs: Arc<MockCodecProvider>,
        transport: Arc<RecordingTransport>,
        recorder: Arc<RecordingSink>,
        audio: Arc<ScriptedAudio>,
        notices: Receiver<ConnectionNotice>,
    }

    impl Harness {
        fn codec(&self) -> Arc<MockCodec> {
            self.codecs.last().unwrap()
        }
    }

    fn config() -> PublisherConfig {
        PublisherConfig {
            reconnect: ReconnectSettings {
                max_retries: 3,
                base_delay_ms: 1,
            },
            ..Default::default()
        }
    }

    fn harness_with(
        codecs: MockCodecProvider,
        config: PublisherConfig,
        replies: Vec<ConnectionStatus>,
    ) -> Harness {
        let codecs = Arc::new(codecs);
        let transport = Arc::new(RecordingTransport::new());
        transport.reply_with(replies);
        let recorder = Arc::new(RecordingSink::new());
        let audio = Arc::new(ScriptedAudio::new());
        let (tx, notices) = crossbeam_channel::bounded(64);

        let orchestrator = SessionOrchestrator::new(
            config,
            Collaborators {
                codecs: codecs.clone(),
                transport: transport.clone(),
                recorder: recorder.clone(),
                audio: Some(audio.clone()),
            },
            tx,
        )
        .unwrap();

        Harness {
            orchestrator,
            codecs,
            transport,
            recorder,
            audio,
            notices,
        }
    }

    fn harness() -> Harness {
        harness_with(
            MockCodecProvider::new(),
            config(),
            vec![ConnectionStatus::ConnectSuccess; 4],
        )
    }

    fn settings() -> VideoSettings {
        VideoSettings {
            width: 1280,
            height: 720,
            bitrate: 2000 * KBPS,
            ..Default::default()
        }
    }

    fn prepared() -> Harness {
        let mut h = harness();
        h.orchestrator.prepare_video(settings()).unwrap();
        h
    }

    fn next_notice(h: &Harness) -> ConnectionNotice {
        h.notices.recv_timeout(Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn test_record_and_stream_share_one_encoder() {
        let mut h = prepared();

        h.orchestrator.start_record(Path::new("/tmp/a.mp4")).unwrap();
        h.orchestrator.start_stream(URL).unwrap();

        assert_eq!(h.codecs.created().len(), 1);
        assert_eq!(h.codec().starts(), 1);

        h.orchestrator.stop_stream();
        assert!(h.orchestrator.snapshot().encoder_running);
        assert_eq!(h.codec().stops(), 0);

        h.orchestrator.stop_record();
        assert!(!h.orchestrator.snapshot().encoder_running);
        assert_eq!(h.codec().stops(), 1);
        assert_eq!(h.recorder.stops(), 1);
    }

    #[test]
    fn test_prepare_start_stop_leaves_idle_state() {
        let mut h = prepared();
        let before = h.orchestrator.snapshot();

        h.orchestrator.start_stream(URL).unwrap();
        h.orchestrator.stop_stream();

        assert_eq!(h.orchestrator.snapshot(), before);
        assert_eq!(h.orchestrator.encoder_state(), EncoderState::Stopped);
        assert_eq!(h.codec().releases(), 1);
        assert!(!h.audio.is_running());
    }

    #[test]
    fn test_stream_connects_through_supervisor() {
        let mut h = prepared();

        h.orchestrator.start_stream(URL).unwrap();
        assert_eq!(next_notice(&h), ConnectionNotice::Connecting);
        assert_eq!(next_notice(&h), ConnectionNotice::Connected);
        assert_eq!(h.transport.connects(), vec![URL.to_string()]);

        h.orchestrator.stop_stream();
        assert_eq!(next_notice(&h), ConnectionNotice::Disconnected);
        assert!(h.transport.closes() >= 1);
    }

    #[test]
    fn test_start_without_prepare_fails() {
        let mut h = harness();

        assert!(matches!(
            h.orchestrator.start_stream(URL),
            Err(EngineError::NotPrepared)
        ));
        assert!(!h.orchestrator.snapshot().streaming);
        assert!(h.transport.connects().is_empty());
    }

    #[test]
    fn test_invalid_url_is_rejected_before_encoding() {
        let mut h = prepared();

        assert!(h.orchestrator.start_stream("http://example.com/live/key").is_err());
        assert!(!h.orchestrator.snapshot().streaming);
        assert_eq!(h.codec().starts(), 0);
    }

    #[test]
    fn test_every_recording_pause_requests_keyframe() {
        let mut h = prepared();
        h.orchestrator.start_record(Path::new("/tmp/a.mp4")).unwrap();

        h.orchestrator.pause_recording();
        h.orchestrator.pause_recording();
        h.orchestrator.resume_recording();

        assert_eq!(h.codec().keyframe_requests(), 2);
    }

    #[test]
    fn test_pause_before_start_applies_to_activity() {
        let mut h = prepared();
        h.orchestrator.pause_streaming();

        h.orchestrator.start_stream(URL).unwrap();
        h.codec()
            .push_buffer(Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88]), true);

        assert!(h.orchestrator.statistics().paused);
        assert!(!wait_until(Duration::from_millis(200), || {
            !h.transport.video_units().is_empty()
        }));
    }

    #[test]
    fn test_pause_survives_restart_until_prepare() {
        let mut h = prepared();
        h.orchestrator.start_record(Path::new("/tmp/a.mp4")).unwrap();
        h.orchestrator.pause_recording();
        h.orchestrator.stop_record();

        h.orchestrator.start_record(Path::new("/tmp/b.mp4")).unwrap();
        assert!(h.orchestrator.snapshot().recording_paused);
        h.orchestrator.stop_record();

        h.orchestrator.prepare_video(settings()).unwrap();
        assert!(!h.orchestrator.snapshot().recording_paused);
    }

    #[test]
    fn test_pause_streaming_requests_no_keyframe() {
        let mut h = prepared();
        h.orchestrator.start_stream(URL).unwrap();

        h.orchestrator.pause_streaming();
        h.orchestrator.resume_streaming();

        assert_eq!(h.codec().keyframe_requests(), 0);
        assert!(!h.orchestrator.statistics().paused);
    }

    #[test]
    fn test_paused_stream_withholds_units_from_stream_only() {
        let mut h = prepared();
        h.orchestrator.start_stream(URL).unwrap();
        h.orchestrator.start_record(Path::new("/tmp/a.mp4")).unwrap();
        h.orchestrator.pause_streaming();
        assert!(h.orchestrator.statistics().paused);

        h.codec()
            .push_buffer(Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88]), true);

        assert!(wait_until(Duration::from_secs(2), || h.recorder.video_units().len() == 1));
        assert!(h.transport.video_units().is_empty());
    }

    #[test]
    fn test_late_stream_receives_parameter_sets() {
        let mut h = prepared();
        h.orchestrator.start_record(Path::new("/tmp/a.mp4")).unwrap();
        h.codec().push_format(MockCodec::avc_format());
        assert!(wait_until(Duration::from_secs(2), || h.recorder.parameter_sets().len() == 1));

        h.orchestrator.start_stream(URL).unwrap();

        assert_eq!(h.transport.parameter_sets(), h.recorder.parameter_sets());
    }

    #[test]
    fn test_bandwidth_signal_updates_encoder() {
        let mut h = prepared();
        h.orchestrator.start_stream(URL).unwrap();

        assert_eq!(
            h.orchestrator.on_bandwidth(BandwidthSignal::Insufficient),
            Some(1000 * KBPS)
        );
        assert_eq!(
            h.orchestrator.on_bandwidth(BandwidthSignal::Sufficient),
            Some(1512 * KBPS)
        );
        assert_eq!(h.codec().bitrates(), vec![1000 * KBPS, 1512 * KBPS]);
    }

    #[test]
    fn test_fps_limit_reaches_capture_gate() {
        let mut h = prepared();
        let gate = h.orchestrator.fps_limiter();
        h.orchestrator.start_stream(URL).unwrap();
        assert_eq!(gate.fps(), 30);

        h.orchestrator.set_fps_limit(20).unwrap();
        assert_eq!(gate.fps(), 20);
        assert!(h.orchestrator.set_fps_limit(0).is_err());

        h.orchestrator.stop_stream();
        h.orchestrator.prepare_video(settings()).unwrap();
        h.orchestrator.start_stream(URL).unwrap();
        assert_eq!(gate.fps(), 30);
    }

    #[test]
    fn test_idle_bitrate_change_applies_on_start() {
        let mut h = prepared();

        assert_eq!(h.orchestrator.set_bitrate(1000 * KBPS), Some(1000 * KBPS));
        assert!(h.codec().bitrates().is_empty());

        h.orchestrator.start_record(Path::new("/tmp/a.mp4")).unwrap();
        assert_eq!(h.codec().bitrates(), vec![1000 * KBPS]);
    }

    #[test]
    fn test_statistics_use_orientation_table() {
        let mut config = config();
        config.orientation_map.insert(90, 0);
        let mut h = harness_with(MockCodecProvider::new(), config, Vec::new());

        h.orchestrator
            .prepare_video(VideoSettings {
                rotation: 90,
                ..settings()
            })
            .unwrap();

        let stats = h.orchestrator.statistics();
        assert_eq!((stats.width, stats.height, stats.fps), (1280, 720, 30));
        assert_eq!(stats.bitrate, 2000 * KBPS);
        assert_eq!(stats.orientation, 0);
        assert!(!stats.paused);
    }

    #[test]
    fn test_prepare_failure_keeps_nothing() {
        let mut h = harness_with(MockCodecProvider::new().without_encoders(), config(), Vec::new());

        assert!(h.orchestrator.prepare_video(settings()).is_err());
        assert_eq!(h.orchestrator.statistics().width, 0);
        assert_eq!(h.orchestrator.encoder_state(), EncoderState::Unconfigured);
    }

    #[test]
    fn test_prepare_while_running_is_rejected() {
        let mut h = prepared();
        h.orchestrator.start_record(Path::new("/tmp/a.mp4")).unwrap();

        assert!(h.orchestrator.prepare_video(settings()).is_err());
        assert!(h.orchestrator.snapshot().encoder_running);
        assert_eq!(h.orchestrator.statistics().width, 1280);
    }

    #[test]
    fn test_reconfigure_resets_running_encoder() {
        let mut h = prepared();
        h.orchestrator.start_record(Path::new("/tmp/a.mp4")).unwrap();

        h.orchestrator
            .reconfigure_video(VideoSettings {
                width: 1920,
                height: 1080,
                ..settings()
            })
            .unwrap();

        assert_eq!(h.codecs.created().len(), 2);
        assert!(h.orchestrator.snapshot().encoder_running);
        assert_eq!(h.codec().configured_format().unwrap().width, 1920);
        assert_eq!(h.orchestrator.statistics().width, 1920);
    }

    #[test]
    fn test_failed_reconfigure_keeps_previous_session() {
        let mut h = prepared();
        h.orchestrator.start_record(Path::new("/tmp/a.mp4")).unwrap();

        let result = h.orchestrator.reconfigure_video(VideoSettings {
            width: 1920,
            height: 1080,
            force: ForcePolicy::Software,
            color_format: ColorFormat::Surface,
            ..settings()
        });

        assert!(result.is_err());
        let snapshot = h.orchestrator.snapshot();
        assert!(snapshot.recording);
        assert!(snapshot.encoder_running);
        assert_eq!(h.orchestrator.statistics().width, 1280);
        assert_eq!(h.codec().configured_format().unwrap().width, 1280);
        assert!(h.audio.is_running());
    }

    #[test]
    fn test_unrecoverable_reconfigure_ends_activities() {
        let mut h = prepared();
        h.orchestrator.start_record(Path::new("/tmp/a.mp4")).unwrap();
        h.orchestrator.start_stream(URL).unwrap();
        h.orchestrator.settings = None;

        let result = h.orchestrator.reconfigure_video(VideoSettings {
            force: ForcePolicy::Software,
            color_format: ColorFormat::Surface,
            ..settings()
        });

        assert!(result.is_err());
        let snapshot = h.orchestrator.snapshot();
        assert!(!snapshot.streaming && !snapshot.recording);
        assert!(!snapshot.encoder_running);
        assert_eq!(h.recorder.stops(), 1);
        assert!(!h.audio.is_running());
    }

    #[test]
    fn test_record_start_failure_rolls_back() {
        let mut h = prepared();
        h.recorder.fail_start(true);

        assert!(matches!(
            h.orchestrator.start_record(Path::new("/readonly/a.mp4")),
            Err(EngineError::Record(_))
        ));
        assert!(!h.orchestrator.snapshot().recording);
        assert_eq!(h.codec().starts(), 0);
    }

    #[test]
    fn test_connected_rearms_stopped_encoder() {
        let mut h = prepared();
        h.orchestrator.start_stream(URL).unwrap();
        h.orchestrator.encoder.stop();

        h.orchestrator.on_connected().unwrap();

        assert!(h.orchestrator.snapshot().encoder_running);
        assert_eq!(h.codecs.created().len(), 2);
    }

    #[test]
    fn test_connection_failure_ends_streaming_only() {
        let mut h = harness_with(
            MockCodecProvider::new(),
            config(),
            vec![ConnectionStatus::ConnectFailed("refused".into()); 5],
        );
        h.orchestrator.prepare_video(settings()).unwrap();
        h.orchestrator.start_record(Path::new("/tmp/a.mp4")).unwrap();
        h.orchestrator.start_stream(URL).unwrap();

        loop {
            if let ConnectionNotice::Failed { .. } = next_notice(&h) {
                break;
            }
        }
        h.orchestrator.on_connection_failed();

        let snapshot = h.orchestrator.snapshot();
        assert!(!snapshot.streaming);
        assert!(snapshot.recording);
        assert!(snapshot.encoder_running);
        assert!(h.orchestrator.connection_state().is_failed());
    }

    #[test]
    fn test_audio_follows_encoder_lifetime() {
        let mut h = prepared();
        h.orchestrator.start_record(Path::new("/tmp/a.mp4")).unwrap();
        assert!(h.audio.is_running());

        assert!(h.audio.push(AudioUnit {
            data: Bytes::from_static(&[0x21, 0x10]),
            pts_us: 0,
            is_config: false,
        }));
        assert_eq!(h.recorder.audio_units().len(), 1);
        assert!(h.transport.audio_units().is_empty());

        h.orchestrator.stop_record();
        assert!(!h.audio.is_running());
        assert_eq!((h.audio.starts(), h.audio.stops()), (1, 1));
    }

    #[test]
    fn test_stream_restart_drops_previous_sequence_header() {
        let mut h = prepared();
        h.orchestrator.start_stream(URL).unwrap();
        h.orchestrator.stop_stream();

        assert!(h.transport.parameter_set_clears() >= 1);
    }

    #[test]
    fn test_record_path_reaches_sink() {
        let mut h = prepared();
        h.orchestrator.start_record(Path::new("/tmp/b.mp4")).unwrap();
        h.orchestrator.start_record(Path::new("/tmp/c.mp4")).unwrap();

        assert_eq!(h.recorder.starts(), vec![PathBuf::from("/tmp/b.mp4")]);
    }
}
