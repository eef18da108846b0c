//! Engine error types.

use thiserror::Error;

use publisher_encoder::EncoderError;
use publisher_ipc::ConfigError;
use publisher_transport::TransportError;

/// Errors surfaced by the session orchestrator and engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Encoder selection, configuration or lifecycle failure.
    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    /// Transport or connection supervisor failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An activity needs the encoder but no video settings were prepared.
    #[error("Video has not been prepared")]
    NotPrepared,

    /// Record sink could not start.
    #[error("Record sink error: {0}")]
    Record(String),

    /// Audio source could not start.
    #[error("Audio source error: {0}")]
    Audio(String),

    /// A global tracing subscriber is already installed.
    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}
