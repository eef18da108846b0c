//! RTMP publishing over rml_rtmp.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ClientSession, ClientSessionConfig, ClientSessionEvent, ClientSessionResult,
    PublishRequestType,
};
use rml_rtmp::time::RtmpTimestamp;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};
use url::Url;

use publisher_encoder::{AccessUnit, AudioUnit, ParameterSets};
use publisher_ipc::BandwidthSignal;

use crate::error::TransportError;
use crate::nal::{
    avc_sequence_header, build_flv_audio_tag, build_flv_video_tag, filter_parameter_sets,
    nals_to_avcc, parse_annex_b,
};
use crate::{ConnectionStatus, Transport, TransportEvent, TransportResult, PACKET_CHANNEL_CAPACITY};

/// Default RTMP port.
const DEFAULT_PORT: u16 = 1935;

/// How long to wait for each server response during setup.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bandwidth measurement period.
const BANDWIDTH_INTERVAL: Duration = Duration::from_secs(1);

/// Server, application and stream key of a publish URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    pub host: String,
    pub port: u16,
    pub app: String,
    pub stream_key: String,
}

/// Split `rtmp://host[:port]/app[/...]/key` into its parts.
///
/// The last path segment is the stream key; everything before it is the
/// application name. A query string stays attached to the key.
pub fn split_publish_url(url: &str) -> TransportResult<PublishTarget> {
    let parsed = Url::parse(url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

    if parsed.scheme() != "rtmp" {
        return Err(TransportError::InvalidUrl(format!(
            "unsupported scheme {}",
            parsed.scheme()
        )));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| TransportError::InvalidUrl("Missing host".to_string()))?
        .to_string();

    let segments: Vec<&str> = parsed
        .path()
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    let Some((key, app)) = segments.split_last() else {
        return Err(TransportError::InvalidUrl("Missing stream key".to_string()));
    };
    if app.is_empty() {
        return Err(TransportError::InvalidUrl(
            "Missing application name in URL path".to_string(),
        ));
    }

    let stream_key = match parsed.query() {
        Some(query) => format!("{key}?{query}"),
        None => key.to_string(),
    };

    Ok(PublishTarget {
        host,
        port: parsed.port().unwrap_or(DEFAULT_PORT),
        app: app.join("/"),
        stream_key,
    })
}

/// A packet queued for the publisher task.
#[derive(Debug, Clone)]
struct RtmpPacket {
    data: Bytes,
    timestamp_ms: u32,
    is_video: bool,
    can_be_dropped: bool,
}

/// Transport statistics.
#[derive(Debug, Clone, Default)]
pub struct TransportStatistics {
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub packets_dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    bytes_sent: AtomicU64,
    packets_sent: AtomicU64,
    packets_dropped: AtomicU64,
}

impl Counters {
    fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn dropped(&self) -> u64 {
        self.packets_dropped.load(Ordering::Relaxed)
    }
}

struct Link {
    packets: mpsc::Sender<RtmpPacket>,
    task: JoinHandle<()>,
}

/// Shared between the transport handle and its publisher task.
#[derive(Default)]
struct Shared {
    sequence_header: RwLock<Option<Bytes>>,
    publishing: AtomicBool,
    counters: Counters,
}

/// RTMP transport with a private tokio runtime.
pub struct RtmpTransport {
    runtime: Option<Runtime>,
    link: Mutex<Option<Link>>,
    shared: Arc<Shared>,
    hevc_warned: AtomicBool,
}

impl RtmpTransport {
    /// Create a transport and its runtime.
    pub fn new() -> TransportResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("rtmp-transport")
            .enable_all()
            .build()
            .map_err(TransportError::Spawn)?;

        Ok(Self {
            runtime: Some(runtime),
            link: Mutex::new(None),
            shared: Arc::new(Shared::default()),
            hevc_warned: AtomicBool::new(false),
        })
    }

    /// Get transport statistics.
    pub fn statistics(&self) -> TransportStatistics {
        let counters = &self.shared.counters;
        TransportStatistics {
            bytes_sent: counters.bytes_sent.load(Ordering::Relaxed),
            packets_sent: counters.packets_sent.load(Ordering::Relaxed),
            packets_dropped: counters.dropped(),
        }
    }

    /// Whether the publisher task is past connect and publish.
    pub fn is_publishing(&self) -> bool {
        self.shared.publishing.load(Ordering::SeqCst)
    }

    fn enqueue(&self, packet: RtmpPacket) {
        let link = self.link.lock();
        let Some(link) = link.as_ref() else {
            trace!("No connection, dropping packet");
            return;
        };

        match link.packets.try_send(packet) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(packet)) => {
                self.shared.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                trace!(video = packet.is_video, "Send queue full, dropping packet");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("Publisher task gone, dropping packet");
            }
        }
    }
}

impl Transport for RtmpTransport {
    #[instrument(name = "rtmp_connect", skip_all)]
    fn connect(&self, url: &str, events: Sender<TransportEvent>) -> TransportResult<()> {
        let target = split_publish_url(url)?;
        let runtime = self
            .runtime
            .as_ref()
            .ok_or(TransportError::ChannelDisconnected)?;

        self.close();

        info!(host = %target.host, port = target.port, app = %target.app, "Connecting to RTMP server");

        let (packets, receiver) = mpsc::channel(PACKET_CHANNEL_CAPACITY);
        let shared = Arc::clone(&self.shared);
        let task = runtime.spawn(run_publisher(target, receiver, events, shared));

        *self.link.lock() = Some(Link { packets, task });
        Ok(())
    }

    fn close(&self) {
        if let Some(link) = self.link.lock().take() {
            link.task.abort();
            self.shared.publishing.store(false, Ordering::SeqCst);
            debug!("RTMP connection closed");
        }
    }

    fn clear_parameter_sets(&self) {
        if self.shared.sequence_header.write().take().is_some() {
            debug!("Cleared cached sequence header");
        }
    }

    fn send_video(&self, unit: &AccessUnit) {
        if unit.is_config {
            return;
        }

        let nals = filter_parameter_sets(parse_annex_b(&unit.data));
        if nals.is_empty() {
            return;
        }

        let payload = build_flv_video_tag(&nals_to_avcc(&nals), unit.is_keyframe, false, 0);
        self.enqueue(RtmpPacket {
            data: payload,
            timestamp_ms: pts_to_ms(unit.pts_us),
            is_video: true,
            can_be_dropped: !unit.is_keyframe,
        });
    }

    fn send_audio(&self, unit: &AudioUnit) {
        self.enqueue(RtmpPacket {
            data: build_flv_audio_tag(&unit.data, unit.is_config),
            timestamp_ms: pts_to_ms(unit.pts_us),
            is_video: false,
            can_be_dropped: false,
        });
    }

    fn set_parameter_sets(&self, sets: &ParameterSets) {
        let Some(header) = avc_sequence_header(sets) else {
            if !self.hevc_warned.swap(true, Ordering::Relaxed) {
                warn!("Parameter sets cannot be carried over FLV; video will not be decodable");
            }
            return;
        };

        *self.shared.sequence_header.write() = Some(header.clone());

        // A live session gets it now; a pending one sends it after publish.
        if self.is_publishing() {
            self.enqueue(sequence_header_packet(header));
        }
    }
}

impl Drop for RtmpTransport {
    fn drop(&mut self) {
        self.close();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
    }
}

fn pts_to_ms(pts_us: i64) -> u32 {
    (pts_us.max(0) / 1000) as u32
}

fn sequence_header_packet(header: Bytes) -> RtmpPacket {
    RtmpPacket {
        data: header,
        timestamp_ms: 0,
        is_video: true,
        can_be_dropped: false,
    }
}

fn emit(events: &Sender<TransportEvent>, event: TransportEvent) {
    if let Err(e) = events.try_send(event) {
        warn!("Failed to send transport event: {}", e);
    }
}

/// How the packet pump ended without an error.
enum PumpExit {
    /// Our side dropped the packet queue.
    Shutdown,
    /// The server closed the socket.
    ServerClosed,
}

async fn run_publisher(
    target: PublishTarget,
    mut receiver: mpsc::Receiver<RtmpPacket>,
    events: Sender<TransportEvent>,
    shared: Arc<Shared>,
) {
    let mut connection = match connect_rtmp(&target).await {
        Ok(connection) => connection,
        Err(e) => {
            warn!(error = %e, "RTMP connect failed");
            emit(&events, TransportEvent::Status(ConnectionStatus::ConnectFailed(e.to_string())));
            return;
        }
    };

    emit(&events, TransportEvent::Status(ConnectionStatus::ConnectSuccess));

    // Decoders joining after a reconnect need the sequence header again.
    shared.publishing.store(true, Ordering::SeqCst);
    let header = shared.sequence_header.read().clone();
    if let Some(header) = header {
        debug!("Resending AVC sequence header");
        if let Err(e) = send_packet(&mut connection, &sequence_header_packet(header)).await {
            shared.publishing.store(false, Ordering::SeqCst);
            emit(&events, TransportEvent::IoError(e.to_string()));
            return;
        }
    }

    let result = pump(&mut connection, &mut receiver, &events, &shared.counters).await;
    shared.publishing.store(false, Ordering::SeqCst);

    match result {
        Ok(PumpExit::Shutdown) => debug!("Packet queue closed"),
        Ok(PumpExit::ServerClosed) => {
            info!("RTMP server closed the connection");
            emit(&events, TransportEvent::Status(ConnectionStatus::ConnectClosed));
        }
        Err(e) => {
            warn!(error = %e, "RTMP transport error");
            emit(&events, TransportEvent::IoError(e.to_string()));
        }
    }
}

async fn pump(
    connection: &mut RtmpConnection,
    receiver: &mut mpsc::Receiver<RtmpPacket>,
    events: &Sender<TransportEvent>,
    counters: &Counters,
) -> TransportResult<PumpExit> {
    let mut read_buf = vec![0u8; 4096];
    let mut ticker = tokio::time::interval(BANDWIDTH_INTERVAL);
    ticker.tick().await;
    let mut dropped_at_tick = counters.dropped();

    loop {
        tokio::select! {
            packet = receiver.recv() => {
                let Some(packet) = packet else {
                    return Ok(PumpExit::Shutdown);
                };
                send_packet(connection, &packet).await?;
                counters.record_sent(packet.data.len());
            }
            read = connection.stream.read(&mut read_buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(PumpExit::ServerClosed);
                }
                let results = connection
                    .session
                    .handle_input(&read_buf[..n])
                    .map_err(|e| TransportError::Connection(format!("Session input error: {:?}", e)))?;
                for result in results {
                    match result {
                        ClientSessionResult::OutboundResponse(packet) => {
                            connection.stream.write_all(&packet.bytes).await?;
                        }
                        ClientSessionResult::RaisedEvent(event) => trace!(?event, "Server event"),
                        _ => {}
                    }
                }
            }
            _ = ticker.tick() => {
                let dropped = counters.dropped();
                let signal = if dropped > dropped_at_tick {
                    BandwidthSignal::Insufficient
                } else {
                    BandwidthSignal::Sufficient
                };
                dropped_at_tick = dropped;
                emit(events, TransportEvent::Bandwidth(signal));
            }
        }
    }
}

/// RTMP connection with session state.
struct RtmpConnection {
    stream: TcpStream,
    session: ClientSession,
}

impl RtmpConnection {
    async fn write_result(&mut self, result: ClientSessionResult) -> TransportResult<()> {
        if let ClientSessionResult::OutboundResponse(packet) = result {
            self.stream.write_all(&packet.bytes).await?;
        }
        Ok(())
    }

    /// Read until `accept` reports the awaited event or the timeout hits.
    async fn await_event<F>(&mut self, what: &str, mut accept: F) -> TransportResult<()>
    where
        F: FnMut(&ClientSessionEvent) -> TransportResult<bool>,
    {
        let deadline = tokio::time::Instant::now() + RESPONSE_TIMEOUT;
        let mut read_buf = vec![0u8; 4096];

        loop {
            let n = tokio::time::timeout_at(deadline, self.stream.read(&mut read_buf))
                .await
                .map_err(|_| TransportError::Connection(format!("Timeout waiting for {what}")))??;
            if n == 0 {
                return Err(TransportError::Connection(format!(
                    "Connection closed waiting for {what}"
                )));
            }

            let results = self
                .session
                .handle_input(&read_buf[..n])
                .map_err(|e| TransportError::Connection(format!("Session input error: {:?}", e)))?;

            let mut done = false;
            for result in results {
                match result {
                    ClientSessionResult::RaisedEvent(event) => {
                        if accept(&event)? {
                            done = true;
                        } else {
                            trace!(?event, "Received event");
                        }
                    }
                    other => self.write_result(other).await?,
                }
            }

            if done {
                return Ok(());
            }
        }
    }
}

async fn handshake(stream: &mut TcpStream) -> TransportResult<Vec<u8>> {
    let mut handshake = Handshake::new(PeerType::Client);

    let p0_p1 = handshake
        .generate_outbound_p0_and_p1()
        .map_err(|e| TransportError::Connection(format!("Handshake generation failed: {:?}", e)))?;
    stream.write_all(&p0_p1).await?;

    let mut buf = vec![0u8; 4096];
    loop {
        let n = tokio::time::timeout(RESPONSE_TIMEOUT, stream.read(&mut buf))
            .await
            .map_err(|_| TransportError::Connection("Handshake timed out".to_string()))??;
        if n == 0 {
            return Err(TransportError::Connection(
                "Connection closed during handshake".to_string(),
            ));
        }

        match handshake.process_bytes(&buf[..n]) {
            Ok(HandshakeProcessResult::InProgress { response_bytes }) => {
                stream.write_all(&response_bytes).await?;
            }
            Ok(HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            }) => {
                stream.write_all(&response_bytes).await?;
                return Ok(remaining_bytes);
            }
            Err(e) => {
                return Err(TransportError::Connection(format!("Handshake failed: {:?}", e)));
            }
        }
    }
}

async fn connect_rtmp(target: &PublishTarget) -> TransportResult<RtmpConnection> {
    let addr = format!("{}:{}", target.host, target.port);
    let mut stream = TcpStream::connect(&addr)
        .await
        .map_err(|e| TransportError::Connection(format!("TCP connect failed: {}", e)))?;

    debug!("TCP connection established, starting handshake");
    let leftover = handshake(&mut stream).await?;

    let (session, initial_results) = ClientSession::new(ClientSessionConfig::new())
        .map_err(|e| TransportError::Connection(format!("Session creation failed: {:?}", e)))?;
    let mut connection = RtmpConnection { stream, session };

    for result in initial_results {
        connection.write_result(result).await?;
    }
    if !leftover.is_empty() {
        let results = connection
            .session
            .handle_input(&leftover)
            .map_err(|e| TransportError::Connection(format!("Session input error: {:?}", e)))?;
        for result in results {
            connection.write_result(result).await?;
        }
    }

    debug!(app = %target.app, "Requesting RTMP connection");
    let request = connection
        .session
        .request_connection(target.app.clone())
        .map_err(|e| TransportError::Connection(format!("Connection request failed: {:?}", e)))?;
    connection.write_result(request).await?;

    connection
        .await_event("connection acceptance", |event| match event {
            ClientSessionEvent::ConnectionRequestAccepted => Ok(true),
            ClientSessionEvent::ConnectionRequestRejected { description } => {
                Err(TransportError::Rejected(description.clone()))
            }
            _ => Ok(false),
        })
        .await?;

    debug!("Requesting publish");
    let request = connection
        .session
        .request_publishing(target.stream_key.clone(), PublishRequestType::Live)
        .map_err(|e| TransportError::Connection(format!("Publish request failed: {:?}", e)))?;
    connection.write_result(request).await?;

    connection
        .await_event("publish acceptance", |event| {
            Ok(matches!(event, ClientSessionEvent::PublishRequestAccepted))
        })
        .await?;

    info!("RTMP connection established and publishing started");
    Ok(connection)
}

async fn send_packet(connection: &mut RtmpConnection, packet: &RtmpPacket) -> TransportResult<()> {
    let timestamp = RtmpTimestamp::new(packet.timestamp_ms);

    let result = if packet.is_video {
        connection
            .session
            .publish_video_data(packet.data.clone(), timestamp, packet.can_be_dropped)
    } else {
        connection
            .session
            .publish_audio_data(packet.data.clone(), timestamp, packet.can_be_dropped)
    };

    let result = result.map_err(|e| TransportError::Send(format!("Failed to publish data: {:?}", e)))?;
    connection.write_result(result).await
}
