//! Tracing subscriber setup for host binaries.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::EngineError;
use crate::EngineResult;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str =
    "publisher_engine=debug,publisher_encoder=debug,publisher_transport=debug,publisher_ipc=debug";

/// Install the global subscriber: `RUST_LOG` filter plus a fmt layer.
///
/// Fails instead of panicking if a subscriber is already installed.
pub fn init_logging() -> EngineResult<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| EngineError::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn test_second_init_is_an_error() {
        let _ = init_logging();
        assert!(matches!(init_logging(), Err(EngineError::Logging(_))));
    }
}
