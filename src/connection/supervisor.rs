//! Pure connection state and reconnection decisions
//!
//! The supervisor task in [`crate::connection`] only executes what these
//! functions decide, so the policy is testable without a transport.

use crate::config::ReconnectSection;
use crate::error::HubError;
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

/// Connection status reported to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    ConnectFailed,
    Unauthorized,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::ConnectFailed => "connect-failed",
            ConnectionStatus::Unauthorized => "unauthorized",
        };
        f.write_str(s)
    }
}

/// Exponential backoff between reconnect attempts
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// None retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectSection::default())
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &ReconnectSection) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            max_attempts: (config.max_attempts > 0).then_some(config.max_attempts),
        }
    }

    /// Delay before the given attempt (1-based), capped at `max_delay`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// What to do after a lost session or a failed reconnect
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay: Duration },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
    /// The hub refused the stored credentials
    AbortUnauthorized,
}

/// Inputs to the status state machine
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    ConnectStarted,
    ConnectSucceeded,
    ConnectFailed(String),
    AuthRejected(String),
    SessionLost(String),
    DisconnectRequested,
}

pub struct Supervisor;

impl Supervisor {
    /// Decide whether to try again after `attempts` failed tries.
    ///
    /// `last_error` is the error of the previous attempt, if any.
    pub fn should_attempt_reconnection(
        attempts: u32,
        policy: &ReconnectPolicy,
        shutdown_requested: bool,
        last_error: Option<&HubError>,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }
        if matches!(last_error, Some(HubError::Unauthorized(_))) {
            return ReconnectionDecision::AbortUnauthorized;
        }
        if let Some(max) = policy.max_attempts {
            if attempts >= max {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }
        let attempt = attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay: policy.backoff_delay(attempt),
        }
    }

    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionStatus {
        match event {
            ConnectionEvent::ConnectStarted => ConnectionStatus::Connecting,
            ConnectionEvent::ConnectSucceeded => {
                info!("Hub connection established");
                ConnectionStatus::Connected
            }
            ConnectionEvent::ConnectFailed(reason) => {
                warn!(reason = %reason, "Hub connection attempt failed");
                ConnectionStatus::ConnectFailed
            }
            ConnectionEvent::AuthRejected(reason) => {
                error!(reason = %reason, "Hub rejected the credentials");
                ConnectionStatus::Unauthorized
            }
            ConnectionEvent::SessionLost(reason) => {
                warn!(reason = %reason, "Hub connection lost");
                ConnectionStatus::Disconnected
            }
            ConnectionEvent::DisconnectRequested => ConnectionStatus::Disconnected,
        }
    }

    /// Event describing a failed connect
    pub fn failure_event(error: &HubError) -> ConnectionEvent {
        match error {
            HubError::Unauthorized(reason) => ConnectionEvent::AuthRejected(reason.clone()),
            other => ConnectionEvent::ConnectFailed(other.to_string()),
        }
    }
}
