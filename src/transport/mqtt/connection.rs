//! Pure connection state, reconnect configuration and option building
//!
//! This module contains the connection vocabulary shared by the manager and
//! the rumqttc link, plus pure helpers for backoff and topic construction.

use super::credentials::ConnectionCredentials;
use crate::protocol::{canonicalize_topic, STATUS_OFFLINE};
use crate::sensors::SensorId;
use rumqttc::{LastWill, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Connection state, mutated only by the connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No session; a connect attempt is pending or backing off
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Session established, publishes go straight to the broker
    Connected,
    /// Credentials rejected; terminal until credentials are reloaded
    AuthFailed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::AuthFailed => "AUTH_FAILED",
        };
        f.write_str(name)
    }
}

/// Classification of a connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectResult {
    Success,
    /// Broker does not speak our protocol level
    ProtocolError,
    /// Client identifier rejected
    IdentityRejected,
    /// Broker unreachable, refused, timed out or reported itself unavailable
    Unavailable,
    /// Bad principal or secret
    AuthFailed,
    /// Principal authenticated but not allowed to connect
    NotAuthorized,
    Unknown,
}

impl ConnectResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectResult::Success => "SUCCESS",
            ConnectResult::ProtocolError => "PROTOCOL_ERROR",
            ConnectResult::IdentityRejected => "IDENTITY_REJECTED",
            ConnectResult::Unavailable => "UNAVAILABLE",
            ConnectResult::AuthFailed => "AUTH_FAILED",
            ConnectResult::NotAuthorized => "NOT_AUTHORIZED",
            ConnectResult::Unknown => "UNKNOWN",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ConnectResult::Success)
    }

    /// The broker rejected the credentials themselves
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, ConnectResult::AuthFailed | ConnectResult::NotAuthorized)
    }
}

impl fmt::Display for ConnectResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconnect and publish-retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay after the first failed attempt
    pub first_delay: Duration,
    /// Multiplier applied per further failure
    pub backoff_rate: f64,
    /// Backoff ceiling
    pub max_delay: Duration,
    /// Credential rejections tolerated before entering AUTH_FAILED
    pub auth_max_attempts: u32,
    /// Upper bound on a single connect handshake
    pub connect_timeout: Duration,
    /// How often queued publishes are retried while connected
    pub retry_interval: Duration,
    /// Retry queue capacity; the oldest message is dropped beyond it
    pub queue_capacity: usize,
    /// Buffer between publishers and the connection context
    pub request_buffer: usize,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            first_delay: Duration::from_secs(1),
            backoff_rate: 2.0,
            max_delay: Duration::from_secs(60),
            auth_max_attempts: 1,
            connect_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_secs(5),
            queue_capacity: 100,
            request_buffer: 256,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay after failed attempt `attempt` (1-based):
    /// `first_delay * backoff_rate^(attempt - 1)`, capped at `max_delay`
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.first_delay.as_millis() as f64 * self.backoff_rate.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Settings for the rumqttc session that do not come from credentials
#[derive(Debug, Clone)]
pub struct MqttLinkSettings {
    pub daemon_id: String,
    pub status_topic: String,
    pub keep_alive: Duration,
    /// rumqttc request channel capacity
    pub client_capacity: usize,
}

/// Build rumqttc options for one connect attempt
///
/// A fresh client id per attempt keeps a half-closed previous session from
/// colliding with the new one.
pub fn configure_mqtt_options(
    settings: &MqttLinkSettings,
    credentials: &ConnectionCredentials,
) -> MqttOptions {
    let suffix = Uuid::new_v4().simple().to_string();
    let client_id = format!("{}-{}", settings.daemon_id, &suffix[..8]);
    let broker = credentials.broker();

    let mut mqtt_options = MqttOptions::new(client_id, broker.host(), broker.port());
    mqtt_options.set_credentials(credentials.principal(), credentials.expose_secret());
    mqtt_options.set_keep_alive(settings.keep_alive.max(Duration::from_secs(1)));
    mqtt_options.set_clean_session(true);
    mqtt_options.set_last_will(LastWill::new(
        &settings.status_topic,
        STATUS_OFFLINE,
        QoS::AtLeastOnce,
        true,
    ));

    mqtt_options
}

/// Topic construction under the configured root
#[derive(Debug, Clone, PartialEq)]
pub struct TopicBuilder {
    root: String,
}

impl TopicBuilder {
    pub fn new(root: &str) -> Self {
        Self {
            root: canonicalize_topic(root),
        }
    }

    /// `{root}/sensor_alerts/{sensor_id}`
    pub fn alert_topic(&self, sensor_id: &SensorId) -> String {
        canonicalize_topic(&format!("{}/sensor_alerts/{}", self.root, sensor_id))
    }

    /// `{root}/sensor_health`
    pub fn health_topic(&self) -> String {
        canonicalize_topic(&format!("{}/sensor_health", self.root))
    }

    /// `{root}/status`
    pub fn status_topic(&self) -> String {
        canonicalize_topic(&format!("{}/status", self.root))
    }
}
