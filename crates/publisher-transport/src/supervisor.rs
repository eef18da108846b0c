//! Connection supervisor worker.
//!
//! Runs the [`ConnectionStateMachine`] on a dedicated thread, performs the
//! actions it returns against a [`Transport`], and reports notices. Backoff
//! sleeps block only this worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::RwLock;
use tracing::{debug, error, info, instrument, trace, warn};

use publisher_ipc::BandwidthSignal;

use crate::connection::{
    ConnectionAction, ConnectionState, ConnectionStateMachine, LossReason, ReconnectPolicy,
};
use crate::error::TransportError;
use crate::{
    ConnectionStatus, Transport, TransportEvent, TransportResult, TRANSPORT_EVENT_CHANNEL_CAPACITY,
};

/// Notices reported to the owner of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionNotice {
    Connecting,
    Connected,

    /// A reconnect was issued after a backoff.
    Retrying { attempt: u32, reason: String },

    /// Retry budget exhausted.
    Failed { reason: String },

    Disconnected,

    /// Bandwidth measurement from a connected transport.
    Bandwidth(BandwidthSignal),
}

enum Control {
    Connect(String),
    Close,
    Shutdown,
}

/// Handle to the connection supervisor worker.
pub struct ConnectionSupervisor {
    control: Sender<Control>,
    state: Arc<RwLock<ConnectionState>>,
    generation: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl ConnectionSupervisor {
    /// Start the worker.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        policy: ReconnectPolicy,
        notices: Sender<ConnectionNotice>,
    ) -> TransportResult<Self> {
        let (control, control_rx) = crossbeam_channel::unbounded();
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let generation = Arc::new(AtomicU64::new(0));

        let worker = Worker {
            transport,
            machine: ConnectionStateMachine::new(policy),
            state: Arc::clone(&state),
            generation: Arc::clone(&generation),
            notices,
            events: crossbeam_channel::never(),
        };

        let handle = thread::Builder::new()
            .name("connection-supervisor".into())
            .spawn(move || worker.run(control_rx))
            .map_err(TransportError::Spawn)?;

        Ok(Self {
            control,
            state,
            generation,
            worker: Some(handle),
        })
    }

    /// Start a fresh connection. Supersedes any pending retry.
    pub fn connect(&self, url: impl Into<String>) -> TransportResult<()> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.control
            .send(Control::Connect(url.into()))
            .map_err(|_| TransportError::ChannelDisconnected)
    }

    /// Close the connection. Supersedes any pending retry.
    pub fn close(&self) -> TransportResult<()> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.control
            .send(Control::Close)
            .map_err(|_| TransportError::ChannelDisconnected)
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.read().clone()
    }

    /// Stop the worker and close the transport.
    pub fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.generation.fetch_add(1, Ordering::SeqCst);
            let _ = self.control.send(Control::Shutdown);
            if worker.join().is_err() {
                warn!("Connection supervisor panicked");
            }
        }
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    transport: Arc<dyn Transport>,
    machine: ConnectionStateMachine,
    state: Arc<RwLock<ConnectionState>>,
    generation: Arc<AtomicU64>,
    notices: Sender<ConnectionNotice>,

    /// Events of the current attempt only; replaced on every connect.
    events: Receiver<TransportEvent>,
}

impl Worker {
    #[instrument(name = "connection_supervisor", skip_all)]
    fn run(mut self, control: Receiver<Control>) {
        debug!("Connection supervisor started");

        loop {
            let events = self.events.clone();
            select! {
                recv(control) -> msg => match msg {
                    Ok(Control::Connect(url)) => {
                        let action = self.machine.connect(url);
                        self.apply(action);
                    }
                    Ok(Control::Close) => {
                        let action = self.machine.close();
                        self.apply(action);
                    }
                    Ok(Control::Shutdown) | Err(_) => break,
                },
                recv(events) -> event => match event {
                    Ok(event) => self.on_transport_event(event),
                    Err(_) => {
                        trace!("Transport dropped its event sender");
                        self.events = crossbeam_channel::never();
                    }
                },
            }
        }

        self.transport.close();
        debug!("Connection supervisor exiting");
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        let action = match event {
            TransportEvent::Status(ConnectionStatus::ConnectSuccess) => {
                let was_connected = self.machine.state().is_connected();
                let action = self.machine.on_success();
                if !was_connected && self.machine.state().is_connected() {
                    info!("Connected");
                    self.publish_state();
                    self.notify(ConnectionNotice::Connected);
                }
                action
            }
            TransportEvent::Status(ConnectionStatus::ConnectFailed(description)) => {
                self.machine.on_loss(LossReason::ConnectFailed(description))
            }
            TransportEvent::Status(ConnectionStatus::ConnectClosed) => {
                self.machine.on_loss(LossReason::ConnectClosed)
            }
            TransportEvent::IoError(description) => self.machine.on_loss(LossReason::Io(description)),
            TransportEvent::Bandwidth(signal) => {
                if self.machine.state().is_connected() {
                    self.notify(ConnectionNotice::Bandwidth(signal));
                }
                ConnectionAction::None
            }
        };
        self.apply(action);
    }

    fn apply(&mut self, mut action: ConnectionAction) {
        loop {
            self.publish_state();

            action = match action {
                ConnectionAction::None => return,
                ConnectionAction::Connect { url } => {
                    let next = self.open(&url);
                    self.notify(ConnectionNotice::Connecting);
                    next
                }
                ConnectionAction::Disconnect => {
                    self.detach();
                    self.notify(ConnectionNotice::Disconnected);
                    return;
                }
                ConnectionAction::Retry {
                    url,
                    attempt,
                    delay,
                    reason,
                } => {
                    warn!(attempt, delay_ms = delay.as_millis() as u64, %reason, "Connection lost, retrying");
                    let generation = self.generation.load(Ordering::SeqCst);
                    self.detach();

                    thread::sleep(delay);

                    if self.generation.load(Ordering::SeqCst) != generation {
                        debug!(attempt, "Retry superseded by a newer request");
                        return;
                    }
                    self.notify(ConnectionNotice::Retrying {
                        attempt,
                        reason: reason.to_string(),
                    });
                    self.open(&url)
                }
                ConnectionAction::Fail { reason } => {
                    self.detach();
                    error!(%reason, retries = self.machine.retries(), "Connection failed");
                    self.notify(ConnectionNotice::Failed {
                        reason: reason.to_string(),
                    });
                    return;
                }
            };
        }
    }

    /// Issue a connect; a synchronous refusal counts as a failed attempt.
    fn open(&mut self, url: &str) -> ConnectionAction {
        let (tx, rx) = crossbeam_channel::bounded(TRANSPORT_EVENT_CHANNEL_CAPACITY);
        self.events = rx;

        match self.transport.connect(url, tx) {
            Ok(()) => ConnectionAction::None,
            Err(e) => {
                warn!(error = %e, "Transport refused connect");
                self.machine.on_loss(LossReason::ConnectFailed(e.to_string()))
            }
        }
    }

    fn detach(&mut self) {
        self.transport.close();
        self.events = crossbeam_channel::never();
    }

    fn publish_state(&self) {
        *self.state.write() = self.machine.state().clone();
    }

    fn notify(&self, notice: ConnectionNotice) {
        if let Err(e) = self.notices.try_send(notice) {
            warn!("Failed to send connection notice: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTransport;
    use std::time::Duration;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    fn supervisor(
        transport: &Arc<RecordingTransport>,
    ) -> (ConnectionSupervisor, Receiver<ConnectionNotice>) {
        let (tx, rx) = crossbeam_channel::bounded(64);
        let supervisor = ConnectionSupervisor::spawn(transport.clone(), policy(), tx).unwrap();
        (supervisor, rx)
    }

    fn next(rx: &Receiver<ConnectionNotice>) -> ConnectionNotice {
        rx.recv_timeout(Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn test_connect_success() {
        let transport = Arc::new(RecordingTransport::new());
        transport.reply_with(vec![ConnectionStatus::ConnectSuccess]);
        let (supervisor, notices) = supervisor(&transport);

        supervisor.connect("rtmp://example.com/live/key").unwrap();

        assert_eq!(next(&notices), ConnectionNotice::Connecting);
        assert_eq!(next(&notices), ConnectionNotice::Connected);
        assert_eq!(supervisor.state(), ConnectionState::Connected);
        assert_eq!(transport.connects(), vec!["rtmp://example.com/live/key".to_string()]);
    }

    #[test]
    fn test_exhausted_retries_fail() {
        let transport = Arc::new(RecordingTransport::new());
        transport.reply_with(vec![ConnectionStatus::ConnectFailed("refused".into()); 5]);
        let (supervisor, notices) = supervisor(&transport);

        supervisor.connect("rtmp://example.com/live/key").unwrap();

        assert_eq!(next(&notices), ConnectionNotice::Connecting);
        for attempt in 1..=4 {
            match next(&notices) {
                ConnectionNotice::Retrying { attempt: a, .. } => assert_eq!(a, attempt),
                other => panic!("expected retry, got {other:?}"),
            }
        }
        assert!(matches!(next(&notices), ConnectionNotice::Failed { .. }));
        assert!(notices.recv_timeout(Duration::from_millis(100)).is_err());

        assert!(supervisor.state().is_failed());
        assert_eq!(transport.connects().len(), 5);
    }

    #[test]
    fn test_loss_after_connect_retries_then_recovers() {
        let transport = Arc::new(RecordingTransport::new());
        transport.reply_with(vec![ConnectionStatus::ConnectSuccess, ConnectionStatus::ConnectSuccess]);
        let (supervisor, notices) = supervisor(&transport);

        supervisor.connect("rtmp://example.com/live/key").unwrap();
        assert_eq!(next(&notices), ConnectionNotice::Connecting);
        assert_eq!(next(&notices), ConnectionNotice::Connected);

        assert!(transport.emit(TransportEvent::IoError("broken pipe".into())));
        match next(&notices) {
            ConnectionNotice::Retrying { attempt, reason } => {
                assert_eq!(attempt, 1);
                assert!(reason.contains("broken pipe"));
            }
            other => panic!("expected retry, got {other:?}"),
        }
        assert_eq!(next(&notices), ConnectionNotice::Connected);
        assert_eq!(transport.connects().len(), 2);
    }

    #[test]
    fn test_close_ignores_stale_events() {
        let transport = Arc::new(RecordingTransport::new());
        transport.reply_with(vec![ConnectionStatus::ConnectSuccess]);
        let (supervisor, notices) = supervisor(&transport);

        supervisor.connect("rtmp://example.com/live/key").unwrap();
        assert_eq!(next(&notices), ConnectionNotice::Connecting);
        assert_eq!(next(&notices), ConnectionNotice::Connected);

        supervisor.close().unwrap();
        assert_eq!(next(&notices), ConnectionNotice::Disconnected);
        assert!(transport.closes() >= 1);

        // The closed attempt's sender no longer reaches the supervisor.
        let _ = transport.emit(TransportEvent::Status(ConnectionStatus::ConnectClosed));
        assert!(notices.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_bandwidth_forwarded_only_when_connected() {
        let transport = Arc::new(RecordingTransport::new());
        let (supervisor, notices) = supervisor(&transport);

        supervisor.connect("rtmp://example.com/live/key").unwrap();
        assert_eq!(next(&notices), ConnectionNotice::Connecting);

        transport.emit(TransportEvent::Bandwidth(BandwidthSignal::Insufficient));
        transport.emit(TransportEvent::Status(ConnectionStatus::ConnectSuccess));
        transport.emit(TransportEvent::Bandwidth(BandwidthSignal::Sufficient));

        assert_eq!(next(&notices), ConnectionNotice::Connected);
        assert_eq!(
            next(&notices),
            ConnectionNotice::Bandwidth(BandwidthSignal::Sufficient)
        );
    }

    #[test]
    fn test_synchronous_connect_error_uses_retry_budget() {
        let transport = Arc::new(RecordingTransport::new());
        transport.fail_connects(true);
        let (supervisor, notices) = supervisor(&transport);

        supervisor.connect("rtmp://example.com/live/key").unwrap();
        assert_eq!(next(&notices), ConnectionNotice::Connecting);

        let mut retries = 0;
        loop {
            match next(&notices) {
                ConnectionNotice::Retrying { .. } => retries += 1,
                ConnectionNotice::Failed { .. } => break,
                other => panic!("unexpected notice {other:?}"),
            }
        }
        assert_eq!(retries, 4);
        assert!(supervisor.state().is_failed());
    }
}
