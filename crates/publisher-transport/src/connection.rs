//! Connection state and retry policy.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use publisher_ipc::{ConnectionPhase, ReconnectSettings};

/// Connection state of the publisher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected.
    #[default]
    Disconnected,

    /// First attempt in progress.
    Connecting,

    /// Connected and publishing.
    Connected,

    /// Lost the connection; `attempt` retries have been issued.
    Retrying { attempt: u32 },

    /// Gave up. Only a fresh connect leaves this state.
    Failed { reason: String },
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if an attempt is in flight.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connecting | Self::Retrying { .. })
    }

    /// Check if failed.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Whether transport events should be acted on.
    pub fn is_live(&self) -> bool {
        self.is_connected() || self.is_transient()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Retrying { .. } => "retrying",
            Self::Failed { .. } => "failed",
        }
    }

    /// Phase reported to the host.
    pub fn phase(&self) -> ConnectionPhase {
        match self {
            Self::Disconnected => ConnectionPhase::Disconnected,
            Self::Connecting => ConnectionPhase::Connecting,
            Self::Connected => ConnectionPhase::Connected,
            Self::Retrying { attempt } => ConnectionPhase::Retrying { attempt: *attempt },
            Self::Failed { .. } => ConnectionPhase::Failed,
        }
    }
}

/// Why a connection ended. Both protocol and socket failures share one
/// retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossReason {
    /// Connect or publish request failed.
    ConnectFailed(String),

    /// Server closed the session.
    ConnectClosed,

    /// Socket error on an established session.
    Io(String),
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectFailed(description) => write!(f, "connect failed: {description}"),
            Self::ConnectClosed => write!(f, "connection closed by server"),
            Self::Io(description) => write!(f, "transport error: {description}"),
        }
    }
}

/// Reconnection policy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Highest retry count that still allows another attempt.
    pub max_retries: u32,

    /// Backoff unit; retry `n` waits `base_delay * 2^n`.
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectSettings::default())
    }
}

impl From<&ReconnectSettings> for ReconnectPolicy {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.base_delay_ms),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(multiplier)
    }

    /// Check if another retry is allowed after `retries` retries.
    pub fn should_retry(&self, retries: u32) -> bool {
        retries <= self.max_retries
    }
}

/// What the supervisor must do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    None,

    /// Open a connection to `url`.
    Connect { url: String },

    /// Close the connection.
    Disconnect,

    /// Wait `delay`, then reconnect to `url`.
    Retry {
        url: String,
        attempt: u32,
        delay: Duration,
        reason: LossReason,
    },

    /// Close the connection and stop trying.
    Fail { reason: LossReason },
}

/// Connection lifecycle with a bounded retry budget.
///
/// Pure: transitions return the action to perform and never block.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    policy: ReconnectPolicy,
    retries: u32,
    url: Option<String>,
}

impl ConnectionStateMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Start a fresh connection. Accepted from every state.
    pub fn connect(&mut self, url: impl Into<String>) -> ConnectionAction {
        let url = url.into();
        self.retries = 0;
        self.url = Some(url.clone());
        self.transition(ConnectionState::Connecting);
        ConnectionAction::Connect { url }
    }

    /// Drop the connection and forget the target.
    pub fn close(&mut self) -> ConnectionAction {
        self.retries = 0;
        self.url = None;
        if self.state == ConnectionState::Disconnected {
            return ConnectionAction::None;
        }
        self.transition(ConnectionState::Disconnected);
        ConnectionAction::Disconnect
    }

    /// The transport reported a successful connect.
    pub fn on_success(&mut self) -> ConnectionAction {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Retrying { .. } => {
                self.retries = 0;
                self.transition(ConnectionState::Connected);
            }
            ConnectionState::Connected => {}
            ConnectionState::Disconnected | ConnectionState::Failed { .. } => {
                debug!(state = self.state.name(), "Ignoring stale connect success");
            }
        }
        ConnectionAction::None
    }

    /// The connection was lost or could not be made.
    pub fn on_loss(&mut self, reason: LossReason) -> ConnectionAction {
        if !self.state.is_live() {
            debug!(state = self.state.name(), %reason, "Ignoring loss while inactive");
            return ConnectionAction::None;
        }

        let Some(url) = self.url.clone() else {
            self.transition(ConnectionState::Failed {
                reason: reason.to_string(),
            });
            return ConnectionAction::Fail { reason };
        };

        if !self.policy.should_retry(self.retries) {
            self.transition(ConnectionState::Failed {
                reason: reason.to_string(),
            });
            return ConnectionAction::Fail { reason };
        }

        self.retries += 1;
        let attempt = self.retries;
        self.transition(ConnectionState::Retrying { attempt });
        ConnectionAction::Retry {
            url,
            attempt,
            delay: self.policy.delay_for_attempt(attempt),
            reason,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(from = self.state.name(), to = next.name(), "Connection state transition");
        self.state = next;
    }
}
