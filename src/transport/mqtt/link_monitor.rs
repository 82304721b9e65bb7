//! Pure state-transition and reconnection decision logic
//!
//! The connection manager calls into these functions synchronously from its
//! own task; nothing here performs I/O apart from logging.

use super::connection::{ConnectionState, ReconnectConfig};
use std::time::Duration;
use tracing::{info, warn};

/// Pure link supervision logic
pub struct LinkMonitor;

impl LinkMonitor {
    /// Decide whether and when to retry after a transient failure (pure function)
    pub fn should_attempt_reconnection(
        failed_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        let delay = config.calculate_backoff_delay(failed_attempts.max(1));
        ReconnectionDecision::Proceed {
            attempt: failed_attempts + 1,
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Decide whether another credential rejection is tolerated (pure function)
    pub fn should_retry_after_rejection(rejections: u32, config: &ReconnectConfig) -> bool {
        rejections < config.auth_max_attempts
    }

    /// Determine next state after a connection event (pure function)
    pub fn determine_next_state(
        current: ConnectionState,
        event: &ConnectionEvent,
    ) -> ConnectionState {
        use ConnectionState::*;

        match (current, event) {
            (AuthFailed, ConnectionEvent::CredentialsReloaded) => Disconnected,
            (AuthFailed, ConnectionEvent::Shutdown) => Disconnected,
            (AuthFailed, _) => AuthFailed,
            (_, ConnectionEvent::AttemptStarted) => Connecting,
            (Connecting, ConnectionEvent::ConnAckReceived) => Connected,
            (Connecting, ConnectionEvent::AttemptFailed) => Disconnected,
            (_, ConnectionEvent::CredentialsRejected) => AuthFailed,
            (Connected, ConnectionEvent::LinkLost) => Disconnected,
            (_, ConnectionEvent::CredentialsReloaded) => Disconnected,
            (_, ConnectionEvent::Shutdown) => Disconnected,
            (state, _) => state,
        }
    }

    /// Log connection state transition
    pub fn log_state_transition(from: ConnectionState, to: ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("Broker connection established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected) => {
                warn!("Broker connection lost");
            }
            (ConnectionState::AuthFailed, ConnectionState::Disconnected) => {
                info!("Leaving AUTH_FAILED after credential reload");
            }
            (_, ConnectionState::AuthFailed) => {
                warn!("Connection state AUTH_FAILED, waiting for credential reload");
            }
            _ => {
                info!(from = %from, to = %to, "Connection state changed");
            }
        }
    }

    /// Validate reconnect configuration (pure function)
    pub fn validate_connection_config(config: &ReconnectConfig) -> Result<(), String> {
        if config.first_delay.is_zero() {
            return Err("first reconnect delay must be greater than 0".to_string());
        }
        if !(config.backoff_rate.is_finite() && config.backoff_rate >= 1.0) {
            return Err("backoff rate must be a finite number >= 1.0".to_string());
        }
        if config.max_delay < config.first_delay {
            return Err("max reconnect delay must not be below the first delay".to_string());
        }
        if config.auth_max_attempts == 0 {
            return Err("auth_max_attempts must be greater than 0".to_string());
        }
        if config.connect_timeout.is_zero() {
            return Err("connect timeout must be greater than 0".to_string());
        }
        if config.retry_interval < Duration::from_millis(10) {
            return Err("publish retry interval must be at least 10ms".to_string());
        }
        if config.queue_capacity == 0 || config.request_buffer == 0 {
            return Err("queue capacity and request buffer must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Wait `delay_ms`, then make attempt number `attempt`
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    AttemptStarted,
    ConnAckReceived,
    /// Transient failure: unreachable, timeout, protocol or identity trouble
    AttemptFailed,
    /// Credentials invalid locally or rejected by the broker, retries exhausted
    CredentialsRejected,
    LinkLost,
    CredentialsReloaded,
    Shutdown,
}
