//! Command loop.

use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, Sender};
use tracing::{debug, info, instrument, warn};

use publisher_ipc::{
    ActivitySnapshot, BandwidthSignal, ConnectionPhase, PublisherCommand, PublisherConfig,
    PublisherEvent,
};
use publisher_transport::ConnectionNotice;

use crate::error::EngineError;
use crate::orchestrator::{Collaborators, SessionOrchestrator};
use crate::EngineResult;

/// Period of housekeeping (fps reporting).
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Channel capacity for connection notices.
const NOTICE_CHANNEL_CAPACITY: usize = 64;

/// The publisher engine. Runs the session orchestrator on the calling
/// thread, fed by host commands and connection notices.
pub struct Engine {
    command_rx: Receiver<PublisherCommand>,
    event_tx: Sender<PublisherEvent>,
    notice_rx: Receiver<ConnectionNotice>,
    orchestrator: SessionOrchestrator,
    last_activity: ActivitySnapshot,
}

impl Engine {
    /// Create a new engine.
    pub fn new(
        config: PublisherConfig,
        parts: Collaborators,
        command_rx: Receiver<PublisherCommand>,
        event_tx: Sender<PublisherEvent>,
    ) -> EngineResult<Self> {
        let (notice_tx, notice_rx) = crossbeam_channel::bounded(NOTICE_CHANNEL_CAPACITY);
        let orchestrator = SessionOrchestrator::new(config, parts, notice_tx)?;

        Ok(Self {
            command_rx,
            event_tx,
            notice_rx,
            orchestrator,
            last_activity: ActivitySnapshot::default(),
        })
    }

    /// Run the engine (blocking) until `Shutdown` or until the command
    /// channel disconnects.
    #[instrument(name = "engine_run", skip(self))]
    pub fn run(&mut self) {
        info!("Engine starting");
        self.send_event(PublisherEvent::Ready);

        let commands = self.command_rx.clone();
        let ticker = crossbeam_channel::tick(TICK_INTERVAL);

        loop {
            let notices = self.notice_rx.clone();
            select! {
                recv(commands) -> msg => match msg {
                    Ok(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    Err(_) => {
                        info!("Command channel disconnected, shutting down");
                        self.orchestrator.shutdown();
                        break;
                    }
                },
                recv(notices) -> notice => match notice {
                    Ok(notice) => self.handle_notice(notice),
                    Err(_) => self.notice_rx = crossbeam_channel::never(),
                },
                recv(ticker) -> _ => self.tick(),
            }
        }

        info!("Engine stopped");
    }

    /// Handle a command. Returns false if the engine should stop.
    fn handle_command(&mut self, command: PublisherCommand) -> bool {
        debug!(command = command.name(), "Handling command");

        match command {
            PublisherCommand::PrepareVideo(settings) => {
                let result = self.orchestrator.prepare_video(settings);
                self.report_prepared(result);
            }
            PublisherCommand::ReconfigureVideo(settings) => {
                let result = self.orchestrator.reconfigure_video(settings);
                self.report_prepared(result);
            }
            PublisherCommand::StartStream { url } => {
                if let Err(e) = self.orchestrator.start_stream(&url) {
                    self.report_error(e);
                }
            }
            PublisherCommand::StopStream => self.orchestrator.stop_stream(),
            PublisherCommand::StartRecord { path } => {
                if let Err(e) = self.orchestrator.start_record(&path) {
                    self.report_error(e);
                }
            }
            PublisherCommand::StopRecord => self.orchestrator.stop_record(),
            PublisherCommand::PauseStreaming => self.orchestrator.pause_streaming(),
            PublisherCommand::ResumeStreaming => self.orchestrator.resume_streaming(),
            PublisherCommand::PauseRecording => self.orchestrator.pause_recording(),
            PublisherCommand::ResumeRecording => self.orchestrator.resume_recording(),
            PublisherCommand::SetBitrate(bitrate) => {
                if let Some(bitrate) = self.orchestrator.set_bitrate(bitrate) {
                    self.send_event(PublisherEvent::BitrateChanged { bitrate });
                }
            }
            PublisherCommand::SetFpsLimit(fps) => {
                if let Err(e) = self.orchestrator.set_fps_limit(fps) {
                    self.report_error(e);
                }
            }
            PublisherCommand::ReportBandwidth(signal) => self.apply_bandwidth(signal),
            PublisherCommand::GetStatistics => {
                let statistics = self.orchestrator.statistics();
                self.send_event(PublisherEvent::Statistics(statistics));
            }
            PublisherCommand::GetState => {
                self.last_activity = self.orchestrator.snapshot();
                self.send_event(PublisherEvent::ActivityChanged(self.last_activity));
                let phase = self.orchestrator.connection_state().phase();
                self.send_event(PublisherEvent::ConnectionChanged(phase));
            }
            PublisherCommand::Shutdown => {
                self.orchestrator.shutdown();
                self.report_activity();
                self.send_event(PublisherEvent::Shutdown);
                return false;
            }
        }

        self.report_activity();
        true
    }

    fn handle_notice(&mut self, notice: ConnectionNotice) {
        match notice {
            ConnectionNotice::Connecting => {
                self.send_event(PublisherEvent::ConnectionChanged(ConnectionPhase::Connecting));
            }
            ConnectionNotice::Connected => {
                self.send_event(PublisherEvent::ConnectionChanged(ConnectionPhase::Connected));
                if let Err(e) = self.orchestrator.on_connected() {
                    self.report_error(e);
                }
            }
            ConnectionNotice::Retrying { attempt, reason } => {
                self.send_event(PublisherEvent::ConnectionChanged(ConnectionPhase::Retrying {
                    attempt,
                }));
                self.send_event(PublisherEvent::RtmpRetry {
                    attempt,
                    description: reason,
                });
            }
            ConnectionNotice::Failed { reason } => {
                self.send_event(PublisherEvent::ConnectionChanged(ConnectionPhase::Failed));
                self.send_event(PublisherEvent::Error {
                    recoverable: false,
                    description: format!("Connection failed: {reason}"),
                });
                // A fresh connect may already have superseded the failure.
                if self.orchestrator.connection_state().is_failed() {
                    self.orchestrator.on_connection_failed();
                }
            }
            ConnectionNotice::Disconnected => {
                self.send_event(PublisherEvent::ConnectionChanged(ConnectionPhase::Disconnected));
            }
            ConnectionNotice::Bandwidth(signal) => self.apply_bandwidth(signal),
        }

        self.report_activity();
    }

    fn tick(&mut self) {
        if let Some(fps) = self.orchestrator.poll_fps(Instant::now()) {
            self.send_event(PublisherEvent::Fps(fps));
        }
    }

    fn apply_bandwidth(&mut self, signal: BandwidthSignal) {
        if let Some(bitrate) = self.orchestrator.on_bandwidth(signal) {
            self.send_event(PublisherEvent::BitrateChanged { bitrate });
        }
    }

    fn report_prepared(&self, result: EngineResult<()>) {
        match result {
            Ok(()) => self.send_event(PublisherEvent::Prepared { success: true }),
            Err(e) => {
                self.send_event(PublisherEvent::Prepared { success: false });
                self.report_error(e);
            }
        }
    }

    fn report_error(&self, error: EngineError) {
        warn!(error = %error, "Command failed");
        self.send_event(PublisherEvent::Error {
            recoverable: true,
            description: error.to_string(),
        });
    }

    fn report_activity(&mut self) {
        let snapshot = self.orchestrator.snapshot();
        if snapshot == self.last_activity {
            return;
        }
        debug!(
            streaming = snapshot.streaming,
            recording = snapshot.recording,
            encoder_running = snapshot.encoder_running,
            "Activity changed"
        );
        self.last_activity = snapshot;
        self.send_event(PublisherEvent::ActivityChanged(snapshot));
    }

    fn send_event(&self, event: PublisherEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("Failed to send event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;
    use publisher_encoder::testing::MockCodecProvider;
    use publisher_ipc::{command_channel, event_channel, ReconnectSettings, VideoSettings};
    use publisher_transport::testing::RecordingTransport;
    use publisher_transport::ConnectionStatus;
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};

    const URL: &str = "rtmp://example.com/live/key";

    struct Running {
        commands: Sender<PublisherCommand>,
        events: Receiver<PublisherEvent>,
        handle: JoinHandle<()>,
    }

    impl Running {
        fn send(&self, command: PublisherCommand) {
            self.commands.send(command).unwrap();
        }

        /// Next event matching `predicate`, skipping others.
        fn wait_for(&self, predicate: impl Fn(&PublisherEvent) -> bool) -> PublisherEvent {
            loop {
                let event = self
                    .events
                    .recv_timeout(Duration::from_secs(2))
                    .expect("timed out waiting for event");
                if predicate(&event) {
                    return event;
                }
            }
        }

        fn shutdown(self) {
            self.send(PublisherCommand::Shutdown);
            self.wait_for(|e| matches!(e, PublisherEvent::Shutdown));
            self.handle.join().unwrap();
        }
    }

    fn spawn(codecs: MockCodecProvider, replies: Vec<ConnectionStatus>) -> Running {
        let transport = Arc::new(RecordingTransport::new());
        transport.reply_with(replies);
        let config = PublisherConfig {
            reconnect: ReconnectSettings {
                max_retries: 3,
                base_delay_ms: 1,
            },
            ..Default::default()
        };
        let parts = Collaborators {
            codecs: Arc::new(codecs),
            transport,
            recorder: Arc::new(RecordingSink::new()),
            audio: None,
        };

        let (commands, command_rx) = command_channel();
        let (event_tx, events) = event_channel();
        let mut engine = Engine::new(config, parts, command_rx, event_tx).unwrap();
        let handle = thread::spawn(move || engine.run());

        let running = Running {
            commands,
            events,
            handle,
        };
        running.wait_for(|e| matches!(e, PublisherEvent::Ready));
        running
    }

    fn prepare(running: &Running) {
        running.send(PublisherCommand::PrepareVideo(VideoSettings::default()));
        let event = running.wait_for(|e| matches!(e, PublisherEvent::Prepared { .. }));
        assert!(matches!(event, PublisherEvent::Prepared { success: true }));
    }

    #[test]
    fn test_shutdown_command_stops_loop() {
        let running = spawn(MockCodecProvider::new(), Vec::new());
        running.shutdown();
    }

    #[test]
    fn test_disconnected_commands_stop_loop() {
        let running = spawn(MockCodecProvider::new(), Vec::new());
        drop(running.commands);
        running.handle.join().unwrap();
    }

    #[test]
    fn test_stream_reports_activity_and_connection() {
        let running = spawn(MockCodecProvider::new(), vec![ConnectionStatus::ConnectSuccess]);
        prepare(&running);

        running.send(PublisherCommand::StartStream { url: URL.into() });

        let activity = running.wait_for(|e| matches!(e, PublisherEvent::ActivityChanged(_)));
        let PublisherEvent::ActivityChanged(snapshot) = activity else {
            unreachable!()
        };
        assert!(snapshot.streaming && snapshot.encoder_running);
        running.wait_for(|e| {
            matches!(e, PublisherEvent::ConnectionChanged(ConnectionPhase::Connected))
        });

        running.send(PublisherCommand::GetStatistics);
        let stats = running.wait_for(|e| matches!(e, PublisherEvent::Statistics(_)));
        let PublisherEvent::Statistics(stats) = stats else {
            unreachable!()
        };
        assert_eq!((stats.width, stats.height), (1920, 1080));

        running.shutdown();
    }

    #[test]
    fn test_prepare_failure_is_reported() {
        let running = spawn(MockCodecProvider::new().without_encoders(), Vec::new());

        running.send(PublisherCommand::PrepareVideo(VideoSettings::default()));

        let prepared = running.wait_for(|e| matches!(e, PublisherEvent::Prepared { .. }));
        assert!(matches!(prepared, PublisherEvent::Prepared { success: false }));
        let error = running.wait_for(|e| matches!(e, PublisherEvent::Error { .. }));
        assert!(matches!(error, PublisherEvent::Error { recoverable: true, .. }));

        running.shutdown();
    }

    #[test]
    fn test_exhausted_retries_end_streaming() {
        let running = spawn(
            MockCodecProvider::new(),
            vec![ConnectionStatus::ConnectFailed("refused".into()); 5],
        );
        prepare(&running);

        running.send(PublisherCommand::StartStream { url: URL.into() });

        for expected in 1..=4 {
            let retry = running.wait_for(|e| matches!(e, PublisherEvent::RtmpRetry { .. }));
            assert!(matches!(retry, PublisherEvent::RtmpRetry { attempt, .. } if attempt == expected));
        }
        let error = running.wait_for(|e| matches!(e, PublisherEvent::Error { .. }));
        assert!(matches!(error, PublisherEvent::Error { recoverable: false, .. }));

        let activity = running.wait_for(|e| {
            matches!(e, PublisherEvent::ActivityChanged(s) if !s.streaming)
        });
        let PublisherEvent::ActivityChanged(snapshot) = activity else {
            unreachable!()
        };
        assert!(!snapshot.encoder_running);

        running.shutdown();
    }

    #[test]
    fn test_zero_fps_limit_is_reported() {
        let running = spawn(MockCodecProvider::new(), Vec::new());

        running.send(PublisherCommand::SetFpsLimit(0));

        let error = running.wait_for(|e| matches!(e, PublisherEvent::Error { .. }));
        assert!(matches!(error, PublisherEvent::Error { recoverable: true, .. }));

        running.shutdown();
    }

    #[test]
    fn test_bandwidth_report_changes_bitrate() {
        let running = spawn(MockCodecProvider::new(), Vec::new());
        prepare(&running);

        running.send(PublisherCommand::ReportBandwidth(BandwidthSignal::Insufficient));

        let changed = running.wait_for(|e| matches!(e, PublisherEvent::BitrateChanged { .. }));
        assert!(matches!(
            changed,
            PublisherEvent::BitrateChanged { bitrate } if bitrate == 1750 * 1024
        ));

        running.shutdown();
    }
}
