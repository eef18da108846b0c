//! Publisher configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::DrainMode;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration text is not valid JSON for this schema.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// Values are syntactically valid but inconsistent.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Bitrate bounds used by the adaptive bitrate controller, in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BitrateBounds {
    /// Inclusive floor.
    pub floor: u32,

    /// Inclusive ceiling.
    pub ceiling: u32,

    /// Increment applied on a sufficient-bandwidth signal.
    pub step: u32,
}

impl Default for BitrateBounds {
    fn default() -> Self {
        Self {
            floor: 300 * 1024,
            ceiling: 3500 * 1024,
            step: 512 * 1024,
        }
    }
}

/// Reconnection settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    /// Failures tolerated before the connection is declared failed.
    pub max_retries: u32,

    /// Backoff unit; attempt `n` waits `base_delay_ms * 2^n`.
    pub base_delay_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Adaptive bitrate bounds.
    pub bitrate: BitrateBounds,

    /// Connection retry policy.
    pub reconnect: ReconnectSettings,

    /// Bounded wait for a single polling dequeue, in milliseconds.
    pub dequeue_timeout_ms: u64,

    /// Overrides the per-session drain mode when set.
    pub drain_mode: Option<DrainMode>,

    /// Rotation (degrees) to orientation value, supplied by the platform.
    /// Rotations missing from the table report themselves.
    pub orientation_map: BTreeMap<u32, u32>,
}

impl PublisherConfig {
    /// Parse configuration from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Check value consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bitrate.floor > self.bitrate.ceiling {
            return Err(ConfigError::Invalid(format!(
                "bitrate floor {} exceeds ceiling {}",
                self.bitrate.floor, self.bitrate.ceiling
            )));
        }
        if self.bitrate.step == 0 {
            return Err(ConfigError::Invalid("bitrate step must be positive".into()));
        }
        Ok(())
    }

    /// Orientation reported for a rotation.
    pub fn orientation_for(&self, rotation: u32) -> u32 {
        self.orientation_map
            .get(&rotation)
            .copied()
            .unwrap_or(rotation)
    }

    /// Effective polling timeout.
    pub fn dequeue_timeout(&self) -> std::time::Duration {
        let ms = if self.dequeue_timeout_ms == 0 {
            10
        } else {
            self.dequeue_timeout_ms
        };
        std::time::Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_yields_defaults() {
        let config = PublisherConfig::from_json_str("{}").unwrap();
        assert_eq!(config, PublisherConfig::default());
        assert_eq!(config.reconnect.max_retries, 3);
        assert_eq!(config.bitrate.floor, 300 * 1024);
    }

    #[test]
    fn test_orientation_map_from_json() {
        let config =
            PublisherConfig::from_json_str(r#"{"orientation_map": {"0": 270, "90": 0}}"#).unwrap();

        assert_eq!(config.orientation_for(0), 270);
        assert_eq!(config.orientation_for(90), 0);
        assert_eq!(config.orientation_for(180), 180);
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let err = PublisherConfig::from_json_str(
            r#"{"bitrate": {"floor": 5000, "ceiling": 1000, "step": 10}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = PublisherConfig::load("/nonexistent/publisher.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
