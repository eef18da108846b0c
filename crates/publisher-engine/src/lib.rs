//! Session orchestration for the RTMP publisher.
//!
//! This crate ties the encoder, transport and sinks together: the
//! [`SessionOrchestrator`] lets streaming and recording share one encoder,
//! the [`AdaptiveBitrateController`] follows bandwidth signals, and the
//! [`Engine`] drives everything from a host command channel.

mod bitrate;
mod engine;
mod error;
mod logging;
mod metrics;
mod orchestrator;
mod router;
mod sink;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use bitrate::AdaptiveBitrateController;
pub use engine::Engine;
pub use error::EngineError;
pub use logging::{init_logging, DEFAULT_LOG_FILTER};
pub use metrics::{FpsMeter, FPS_REPORT_INTERVAL};
pub use orchestrator::{AudioSource, Collaborators, SessionOrchestrator};
pub use router::{AudioOutputHandler, OutputRouter, Route};
pub use sink::{MediaSink, RecordSink, TransportSink};

use crossbeam_channel::{Receiver, Sender};

use publisher_ipc::{PublisherCommand, PublisherConfig, PublisherEvent};

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Create an engine instance with IPC channels.
pub fn create_engine(
    config: PublisherConfig,
    parts: Collaborators,
    command_rx: Receiver<PublisherCommand>,
    event_tx: Sender<PublisherEvent>,
) -> EngineResult<Engine> {
    Engine::new(config, parts, command_rx, event_tx)
}
