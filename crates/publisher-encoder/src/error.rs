//! Error types for the encoder module.

use thiserror::Error;

/// Errors reported by the platform codec collaborator.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// The codec rejected the requested format.
    #[error("Codec rejected format: {0}")]
    Rejected(String),

    /// The codec was used in a state that does not allow the call.
    #[error("Codec in illegal state: {0}")]
    IllegalState(String),

    /// Any other codec failure.
    #[error("Codec failure: {0}")]
    Failure(String),
}

/// Errors that can occur during encoder lifecycle operations.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// No encoder matches codec, color format and force policy.
    #[error("No compatible encoder found for {0}")]
    NoCompatibleEncoder(String),

    /// The selected encoder could not be instantiated.
    #[error("Encoder creation failed: {0}")]
    Creation(String),

    /// The codec rejected the configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation not valid in the current lifecycle state.
    #[error("Invalid encoder state: cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// A frame rate limit must be positive.
    #[error("Invalid frame rate limit: {0}")]
    InvalidFpsLimit(u32),

    /// Codec failure outside configuration.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Drain worker thread could not be spawned.
    #[error("Failed to spawn drain worker: {0}")]
    Worker(#[source] std::io::Error),
}
