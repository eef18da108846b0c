//! Video encoder lifecycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use publisher_ipc::VideoSettings;

use crate::codec::{choose_encoder, CodecFormat, CodecParameters, CodecProvider, HardwareCodec, InputSurface};
use crate::drain::{select_strategy, DrainContext, DrainHandle};
use crate::error::EncoderError;
use crate::limiter::FpsLimiter;
use crate::session::EncoderSession;
use crate::{EncoderOutputHandler, EncoderResult};

/// Lifecycle state of the controlled encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Unconfigured,
    Prepared,
    Running,
    Stopped,
}

impl EncoderState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unconfigured => "unconfigured",
            Self::Prepared => "prepared",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

/// Owns one hardware codec at a time and its drain worker.
///
/// All methods are called from the control thread.
pub struct VideoEncoderController {
    provider: Arc<dyn CodecProvider>,
    output: Arc<dyn EncoderOutputHandler>,
    dequeue_timeout: Duration,
    state: EncoderState,
    settings: Option<VideoSettings>,
    encoder_name: Option<String>,
    codec: Option<Arc<dyn HardwareCodec>>,
    surface: Option<InputSurface>,
    session: Option<Arc<EncoderSession>>,
    drain: Option<DrainHandle>,
    limiter: Arc<FpsLimiter>,
    fps_limit: Option<u32>,
}

impl VideoEncoderController {
    pub fn new(
        provider: Arc<dyn CodecProvider>,
        output: Arc<dyn EncoderOutputHandler>,
        dequeue_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            output,
            dequeue_timeout,
            state: EncoderState::Unconfigured,
            settings: None,
            encoder_name: None,
            codec: None,
            surface: None,
            session: None,
            drain: None,
            limiter: Arc::new(FpsLimiter::new(VideoSettings::default().fps, Instant::now())),
            fps_limit: None,
        }
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == EncoderState::Running
    }

    /// Settings of the last successful `prepare`.
    pub fn settings(&self) -> Option<&VideoSettings> {
        self.settings.as_ref()
    }

    pub fn encoder_name(&self) -> Option<&str> {
        self.encoder_name.as_deref()
    }

    /// Surface the capture pipeline renders into, while prepared or running.
    pub fn input_surface(&self) -> Option<&InputSurface> {
        self.surface.as_ref()
    }

    /// Frame gate for the capture pipeline. Shared for the controller's
    /// lifetime.
    pub fn fps_limiter(&self) -> Arc<FpsLimiter> {
        Arc::clone(&self.limiter)
    }

    /// Capture frame rate cap: the explicit limit, or the prepared fps.
    pub fn fps_limit(&self) -> Option<u32> {
        self.fps_limit
            .or_else(|| self.settings.as_ref().map(|s| s.fps))
    }

    /// Live target bitrate of the current session.
    pub fn bitrate(&self) -> Option<u32> {
        self.session.as_ref().map(|s| s.bitrate())
    }

    /// Select, create and configure an encoder for `settings`.
    ///
    /// On failure nothing is kept and the controller is `Unconfigured`.
    #[instrument(name = "encoder_prepare", skip(self, settings), fields(width = settings.width, height = settings.height))]
    pub fn prepare(&mut self, settings: VideoSettings) -> EncoderResult<()> {
        if self.state == EncoderState::Running {
            return Err(EncoderError::InvalidState {
                operation: "prepare",
                state: self.state.name(),
            });
        }

        self.release_codec();
        self.state = EncoderState::Unconfigured;

        let info = choose_encoder(self.provider.as_ref(), &settings).ok_or_else(|| {
            EncoderError::NoCompatibleEncoder(format!(
                "{} ({:?}, {:?})",
                settings.codec.mime(),
                settings.color_format,
                settings.force
            ))
        })?;

        let codec = self
            .provider
            .create(&info)
            .map_err(|e| EncoderError::Creation(format!("{}: {}", info.name, e)))?;

        let format = CodecFormat::from_settings(&settings);
        debug!(?format, encoder = %info.name, "Configuring encoder");

        if let Err(e) = codec.configure(&format) {
            codec.release();
            return Err(EncoderError::Configuration(e.to_string()));
        }

        let surface = match codec.create_input_surface() {
            Ok(surface) => surface,
            Err(e) => {
                codec.release();
                return Err(EncoderError::Configuration(e.to_string()));
            }
        };

        info!(
            encoder = %info.name,
            hardware = info.hardware,
            bitrate = settings.bitrate,
            fps = settings.fps,
            "Encoder prepared"
        );

        self.session = Some(Arc::new(EncoderSession::new(settings.clone())));
        self.settings = Some(settings);
        self.encoder_name = Some(info.name);
        self.codec = Some(codec);
        self.surface = Some(surface);
        self.state = EncoderState::Prepared;
        Ok(())
    }

    /// Start encoding and launch the drain worker.
    #[instrument(name = "encoder_start", skip(self))]
    pub fn start(&mut self) -> EncoderResult<()> {
        match self.state {
            EncoderState::Running => {
                debug!("Encoder already running");
                return Ok(());
            }
            EncoderState::Prepared => {}
            state => {
                return Err(EncoderError::InvalidState {
                    operation: "start",
                    state: state.name(),
                })
            }
        }

        let (Some(codec), Some(session), Some(settings)) =
            (self.codec.clone(), self.session.clone(), self.settings.as_ref())
        else {
            return Err(EncoderError::InvalidState {
                operation: "start",
                state: "incomplete",
            });
        };

        let now = Instant::now();
        session.begin(now);
        self.limiter.set_fps(self.fps_limit.unwrap_or(settings.fps), now);

        let mut strategy = select_strategy(settings.drain_mode, codec.as_ref(), self.dequeue_timeout);
        let started = strategy
            .attach(codec.as_ref())
            .and_then(|_| codec.start().map_err(EncoderError::from));
        if let Err(e) = started {
            warn!(error = %e, "Encoder failed to start");
            self.stop();
            return Err(e);
        }

        let strategy_name = strategy.name();
        let ctx = DrainContext::new(Arc::clone(&codec), session, Arc::clone(&self.output));
        match strategy.spawn(ctx) {
            Ok(handle) => self.drain = Some(handle),
            Err(e) => {
                self.state = EncoderState::Running;
                self.stop();
                return Err(e);
            }
        }

        self.state = EncoderState::Running;
        info!(strategy = strategy_name, "Encoder started");
        Ok(())
    }

    /// Stop encoding and release the codec. Safe to call in any state.
    #[instrument(name = "encoder_stop", skip(self))]
    pub fn stop(&mut self) {
        if matches!(self.state, EncoderState::Unconfigured | EncoderState::Stopped)
            && self.codec.is_none()
        {
            debug!(state = self.state.name(), "Encoder already stopped");
            return;
        }

        let was_running = self.state == EncoderState::Running;

        if let Some(session) = &self.session {
            session.end();
        }
        if let Some(drain) = self.drain.take() {
            drain.join();
        }
        if let Some(codec) = self.codec.take() {
            if was_running {
                if let Err(e) = codec.stop() {
                    warn!(error = %e, "Codec stop failed");
                }
            }
            codec.release();
        }

        self.surface = None;
        self.session = None;
        self.state = EncoderState::Stopped;
        info!("Encoder stopped");
    }

    /// Stop, prepare with the current settings, and start again.
    pub fn reset(&mut self) -> EncoderResult<()> {
        let settings = self.settings.clone().ok_or(EncoderError::InvalidState {
            operation: "reset",
            state: self.state.name(),
        })?;
        self.reset_with(settings)
    }

    /// Stop, prepare with `settings`, and start.
    #[instrument(name = "encoder_reset", skip(self, settings))]
    pub fn reset_with(&mut self, settings: VideoSettings) -> EncoderResult<()> {
        self.stop();
        self.prepare(settings)?;
        self.start()
    }

    /// Change the target bitrate. No-op unless running.
    pub fn set_bitrate(&self, bitrate: u32) {
        let (Some(codec), Some(session)) = (self.running_codec(), self.session.as_ref()) else {
            debug!(bitrate, state = self.state.name(), "Ignoring bitrate change");
            return;
        };

        match codec.set_parameters(&CodecParameters::bitrate(bitrate)) {
            Ok(()) => {
                session.set_bitrate(bitrate);
                debug!(bitrate, "Encoder bitrate updated");
            }
            Err(e) => warn!(bitrate, error = %e, "Codec rejected bitrate change"),
        }
    }

    /// Cap the capture frame rate. Kept across restarts; applied at once
    /// while running, otherwise at the next `start`.
    pub fn set_fps_limit(&mut self, fps: u32) -> EncoderResult<()> {
        if fps == 0 {
            return Err(EncoderError::InvalidFpsLimit(fps));
        }
        self.fps_limit = Some(fps);
        if self.state == EncoderState::Running {
            self.limiter.set_fps(fps, Instant::now());
        }
        debug!(fps, running = self.is_running(), "Frame rate limit set");
        Ok(())
    }

    /// Drop an explicit frame rate limit in favor of the prepared fps.
    pub fn clear_fps_limit(&mut self) {
        self.fps_limit = None;
    }

    /// Ask for an immediate sync frame. No-op unless running.
    pub fn request_keyframe(&self) {
        let Some(codec) = self.running_codec() else {
            debug!(state = self.state.name(), "Ignoring keyframe request");
            return;
        };

        if let Err(e) = codec.set_parameters(&CodecParameters::keyframe()) {
            warn!(error = %e, "Codec rejected keyframe request");
        }
    }

    fn running_codec(&self) -> Option<&Arc<dyn HardwareCodec>> {
        if self.state == EncoderState::Running {
            self.codec.as_ref()
        } else {
            None
        }
    }

    fn release_codec(&mut self) {
        if let Some(codec) = self.codec.take() {
            debug!("Releasing previously prepared codec");
            codec.release();
        }
        self.surface = None;
        self.session = None;
    }
}

impl Drop for VideoEncoderController {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_until, CollectingOutput, MockCodec, MockCodecProvider};
    use bytes::Bytes;
    use publisher_ipc::{ColorFormat, DrainMode, ForcePolicy};

    fn controller(provider: MockCodecProvider) -> (VideoEncoderController, Arc<MockCodecProvider>, Arc<CollectingOutput>) {
        let provider = Arc::new(provider);
        let output = Arc::new(CollectingOutput::default());
        let controller = VideoEncoderController::new(
            provider.clone(),
            output.clone(),
            Duration::from_millis(5),
        );
        (controller, provider, output)
    }

    fn settings() -> VideoSettings {
        VideoSettings {
            width: 1280,
            height: 720,
            drain_mode: DrainMode::Polling,
            ..Default::default()
        }
    }

    #[test]
    fn test_prepare_start_stop_cycle() {
        let (mut controller, provider, _output) = controller(MockCodecProvider::new());

        controller.prepare(settings()).unwrap();
        assert_eq!(controller.state(), EncoderState::Prepared);
        assert!(controller.input_surface().is_some());
        assert_eq!(controller.encoder_name(), Some("mock.hw"));

        controller.start().unwrap();
        assert!(controller.is_running());

        controller.stop();
        assert_eq!(controller.state(), EncoderState::Stopped);
        assert!(controller.input_surface().is_none());
        assert!(controller.bitrate().is_none());

        let codec = provider.last().unwrap();
        assert_eq!((codec.starts(), codec.stops(), codec.releases()), (1, 1, 1));
    }

    #[test]
    fn test_configured_format_reflects_settings() {
        let (mut controller, provider, _output) = controller(MockCodecProvider::new());
        controller.prepare(settings()).unwrap();

        let format = provider.last().unwrap().configured_format().unwrap();
        assert_eq!(format.mime, "video/avc");
        assert_eq!((format.width, format.height), (1280, 720));
        assert_eq!(format.keyframe_interval_secs, 2);
        assert!(format.profile.is_some());
    }

    #[test]
    fn test_prepare_without_encoder_stays_unconfigured() {
        let (mut controller, _provider, _output) = controller(MockCodecProvider::new().without_encoders());
        let err = controller.prepare(settings()).unwrap_err();

        assert!(matches!(err, EncoderError::NoCompatibleEncoder(_)));
        assert_eq!(controller.state(), EncoderState::Unconfigured);
    }

    #[test]
    fn test_rejected_format_releases_codec() {
        let (mut controller, provider, _output) = controller(MockCodecProvider::new().rejecting_format());
        let err = controller.prepare(settings()).unwrap_err();

        assert!(matches!(err, EncoderError::Configuration(_)));
        assert_eq!(controller.state(), EncoderState::Unconfigured);
        assert!(controller.input_surface().is_none());
        assert_eq!(provider.last().unwrap().releases(), 1);
    }

    #[test]
    fn test_force_software_with_surface_fails() {
        let (mut controller, _provider, _output) = controller(MockCodecProvider::new());
        let settings = VideoSettings {
            force: ForcePolicy::Software,
            color_format: ColorFormat::Surface,
            ..settings()
        };
        assert!(matches!(
            controller.prepare(settings),
            Err(EncoderError::NoCompatibleEncoder(_))
        ));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (mut controller, provider, _output) = controller(MockCodecProvider::new());
        controller.stop();
        assert_eq!(controller.state(), EncoderState::Unconfigured);

        controller.prepare(settings()).unwrap();
        controller.start().unwrap();
        controller.stop();
        controller.stop();

        assert_eq!(controller.state(), EncoderState::Stopped);
        assert_eq!(provider.last().unwrap().releases(), 1);
    }

    #[test]
    fn test_start_requires_prepare() {
        let (mut controller, _provider, _output) = controller(MockCodecProvider::new());
        assert!(matches!(
            controller.start(),
            Err(EncoderError::InvalidState { operation: "start", .. })
        ));
    }

    #[test]
    fn test_prepare_while_running_is_rejected() {
        let (mut controller, _provider, _output) = controller(MockCodecProvider::new());
        controller.prepare(settings()).unwrap();
        controller.start().unwrap();

        assert!(controller.prepare(settings()).is_err());
        assert!(controller.is_running());
    }

    #[test]
    fn test_live_updates_ignored_unless_running() {
        let (mut controller, provider, _output) = controller(MockCodecProvider::new());
        controller.prepare(settings()).unwrap();
        controller.set_bitrate(1_000_000);
        controller.request_keyframe();

        let codec = provider.last().unwrap();
        assert!(codec.bitrates().is_empty());
        assert_eq!(codec.keyframe_requests(), 0);

        controller.start().unwrap();
        controller.set_bitrate(1_000_000);
        controller.request_keyframe();
        assert_eq!(codec.bitrates(), vec![1_000_000]);
        assert_eq!(codec.keyframe_requests(), 1);
        assert_eq!(controller.bitrate(), Some(1_000_000));
    }

    #[test]
    fn test_rejected_live_update_is_tolerated() {
        let (mut controller, provider, _output) = controller(MockCodecProvider::new());
        controller.prepare(settings()).unwrap();
        controller.start().unwrap();

        let codec = provider.last().unwrap();
        codec.set_reject_parameters(true);
        controller.set_bitrate(500_000);
        controller.request_keyframe();

        assert!(controller.is_running());
        assert_eq!(controller.bitrate(), Some(settings().bitrate));
    }

    #[test]
    fn test_fps_limit_applies_live_and_across_restart() {
        let (mut controller, _provider, _output) = controller(MockCodecProvider::new());
        controller.prepare(VideoSettings::default()).unwrap();
        controller.start().unwrap();
        let limiter = controller.fps_limiter();
        assert_eq!(limiter.fps(), 30);

        controller.set_fps_limit(15).unwrap();
        assert_eq!(limiter.fps(), 15);

        controller.stop();
        controller.prepare(VideoSettings::default()).unwrap();
        controller.start().unwrap();
        assert_eq!(limiter.fps(), 15);

        controller.clear_fps_limit();
        assert_eq!(controller.fps_limit(), Some(30));
    }

    #[test]
    fn test_zero_fps_limit_is_rejected() {
        let (mut controller, _provider, _output) = controller(MockCodecProvider::new());

        assert!(matches!(
            controller.set_fps_limit(0),
            Err(EncoderError::InvalidFpsLimit(0))
        ));
        assert_eq!(controller.fps_limit(), None);
    }

    #[test]
    fn test_reset_applies_new_resolution() {
        let (mut controller, provider, _output) = controller(MockCodecProvider::new());
        controller.prepare(settings()).unwrap();
        controller.start().unwrap();

        let smaller = VideoSettings {
            width: 640,
            height: 360,
            ..settings()
        };
        controller.reset_with(smaller).unwrap();

        assert!(controller.is_running());
        let created = provider.created();
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].releases(), 1);
        assert_eq!(created[1].configured_format().unwrap().width, 640);
    }

    #[test]
    fn test_parameter_flag_cleared_across_restart() {
        let (mut controller, provider, output) = controller(MockCodecProvider::new());
        controller.prepare(settings()).unwrap();
        controller.start().unwrap();
        provider.last().unwrap().push_format(MockCodec::avc_format());
        assert!(wait_until(Duration::from_secs(2), || output.parameter_sets().len() == 1));

        controller.reset().unwrap();
        provider.last().unwrap().push_format(MockCodec::avc_format());
        assert!(wait_until(Duration::from_secs(2), || output.parameter_sets().len() == 2));
    }

    #[test]
    fn test_callback_mode_drains_pushed_buffers() {
        let (mut controller, provider, output) = controller(MockCodecProvider::new().with_callbacks());
        let settings = VideoSettings {
            drain_mode: DrainMode::Auto,
            ..settings()
        };
        controller.prepare(settings).unwrap();
        controller.start().unwrap();

        let codec = provider.last().unwrap();
        codec.push_buffer(Bytes::from_static(&[0x00, 0x00, 0x00, 0x01, 0x65]), true);
        assert!(wait_until(Duration::from_secs(2), || output.access_units().len() == 1));

        controller.stop();
        assert_eq!(codec.released_buffers().len(), 1);
    }
}
