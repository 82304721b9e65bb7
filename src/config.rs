//! Daemon configuration
//!
//! Loaded from a TOML file with `[daemon]`, `[mqtt]` and `[sensors]` sections.
//! Broker credentials never live in the file: `[mqtt]` only names the
//! environment variables that hold them.

use crate::control::worst_case_cycle_latency;
use crate::protocol::{canonicalize_topic, validate_topic_level};
use crate::sensors::{HealthPolicy, PlausibleRange, RetryPolicy, SensorId};
use crate::transport::mqtt::{
    BrokerAddress, EnvCredentials, LinkMonitor, MqttLinkSettings, ReconnectConfig, TopicBuilder,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file locations, in lookup order
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["solard.toml", "config/solard.toml"];

/// Main daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    pub daemon: DaemonSection,
    pub mqtt: MqttSection,
    pub sensors: SensorsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonSection {
    /// Daemon identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    /// Root under which all topics are published
    #[serde(default = "default_topic_root")]
    pub topic_root: String,
    /// Control cycle period in milliseconds
    #[serde(default = "default_cycle_period_ms")]
    pub cycle_period_ms: u64,
    /// Aggregate health summary publish interval in seconds
    #[serde(default = "default_summary_interval_secs")]
    pub summary_interval_secs: u64,
    /// Diagnostics HTTP port; 0 disables the server
    #[serde(default = "default_health_port")]
    pub health_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL, `mqtt://host[:port]`
    pub broker_url: String,
    /// Environment variable containing the principal
    #[serde(default = "default_username_env")]
    pub username_env: String,
    /// Environment variable containing the secret
    #[serde(default = "default_password_env")]
    pub password_env: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_reconnect_first_delay_ms")]
    pub reconnect_first_delay_ms: u64,
    #[serde(default = "default_backoff_rate")]
    pub reconnect_backoff_rate: f64,
    #[serde(default = "default_reconnect_max_delay_secs")]
    pub reconnect_max_delay_secs: u64,
    /// Credential rejections tolerated before giving up
    #[serde(default = "default_auth_max_attempts")]
    pub auth_max_attempts: u32,
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_request_buffer")]
    pub request_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorsSection {
    /// sysfs directory of the w1 bus
    #[serde(default = "default_w1_base")]
    pub w1_base: PathBuf,
    #[serde(default = "default_read_attempts")]
    pub read_attempts: u32,
    #[serde(default = "default_first_retry_delay_ms")]
    pub first_retry_delay_ms: u64,
    #[serde(default = "default_backoff_rate")]
    pub retry_backoff_rate: f64,
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    #[serde(default = "default_staleness_threshold_secs")]
    pub staleness_threshold_secs: u64,
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: u32,
    #[serde(default = "default_repeat_interval")]
    pub repeat_interval: u32,
    #[serde(default = "default_min_plausible")]
    pub min_plausible: f64,
    #[serde(default = "default_max_plausible")]
    pub max_plausible: f64,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

/// One physical sensor channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelConfig {
    pub id: SensorId,
    /// w1 device directory name, e.g. `28-0316a2799bff`
    pub device: String,
}

fn default_topic_root() -> String {
    "solar".to_string()
}

fn default_cycle_period_ms() -> u64 {
    10_000
}

fn default_summary_interval_secs() -> u64 {
    60
}

fn default_health_port() -> u16 {
    8080
}

fn default_username_env() -> String {
    "SOLARD_MQTT_USERNAME".to_string()
}

fn default_password_env() -> String {
    "SOLARD_MQTT_PASSWORD".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_reconnect_first_delay_ms() -> u64 {
    1000
}

fn default_backoff_rate() -> f64 {
    2.0
}

fn default_reconnect_max_delay_secs() -> u64 {
    60
}

fn default_auth_max_attempts() -> u32 {
    1
}

fn default_retry_interval_secs() -> u64 {
    5
}

fn default_queue_capacity() -> usize {
    100
}

fn default_request_buffer() -> usize {
    256
}

fn default_w1_base() -> PathBuf {
    PathBuf::from(crate::sensors::w1::DEFAULT_W1_BASE)
}

fn default_read_attempts() -> u32 {
    3
}

fn default_first_retry_delay_ms() -> u64 {
    50
}

fn default_attempt_timeout_ms() -> u64 {
    250
}

fn default_staleness_threshold_secs() -> u64 {
    300
}

fn default_alert_threshold() -> u32 {
    5
}

fn default_repeat_interval() -> u32 {
    10
}

fn default_min_plausible() -> f64 {
    -55.0
}

fn default_max_plausible() -> f64 {
    125.0
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid daemon ID format: {0}")]
    InvalidDaemonId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("No configuration file found (tried {0})")]
    NotFound(String),
}

impl DaemonConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the configuration file: explicit path, else the default locations
    pub fn locate(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }

        DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
            .ok_or_else(|| ConfigError::NotFound(DEFAULT_CONFIG_PATHS.join(", ")))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_daemon_id(&self.daemon.id)?;
        self.validate_topic_root()?;

        BrokerAddress::parse(&self.mqtt.broker_url)
            .map_err(|e| ConfigError::InvalidConfig(format!("[mqtt] broker_url: {e}")))?;
        if self.mqtt.username_env.trim().is_empty() || self.mqtt.password_env.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "[mqtt] username_env and password_env must name environment variables"
                    .to_string(),
            ));
        }
        LinkMonitor::validate_connection_config(&self.reconnect_config())
            .map_err(|e| ConfigError::InvalidConfig(format!("[mqtt] {e}")))?;

        self.validate_sensor_policies()?;
        self.validate_channels()?;
        self.validate_cycle_period()?;

        Ok(())
    }

    fn validate_topic_root(&self) -> Result<(), ConfigError> {
        let root = canonicalize_topic(&self.daemon.topic_root);
        if root.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "[daemon] topic_root must not be empty".to_string(),
            ));
        }
        for level in root.split('/') {
            validate_topic_level(level).map_err(|e| {
                ConfigError::InvalidConfig(format!("[daemon] topic_root level '{level}': {e}"))
            })?;
        }
        Ok(())
    }

    fn validate_sensor_policies(&self) -> Result<(), ConfigError> {
        let sensors = &self.sensors;
        if sensors.read_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "[sensors] read_attempts must be at least 1".to_string(),
            ));
        }
        if !(sensors.retry_backoff_rate.is_finite() && sensors.retry_backoff_rate >= 1.0) {
            return Err(ConfigError::InvalidConfig(
                "[sensors] retry_backoff_rate must be a finite number >= 1.0".to_string(),
            ));
        }
        if sensors.attempt_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "[sensors] attempt_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if sensors.staleness_threshold_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "[sensors] staleness_threshold_secs must be greater than 0".to_string(),
            ));
        }
        if sensors.alert_threshold == 0 || sensors.repeat_interval == 0 {
            return Err(ConfigError::InvalidConfig(
                "[sensors] alert_threshold and repeat_interval must be at least 1".to_string(),
            ));
        }
        if !(sensors.min_plausible.is_finite()
            && sensors.max_plausible.is_finite()
            && sensors.min_plausible < sensors.max_plausible)
        {
            return Err(ConfigError::InvalidConfig(
                "[sensors] plausible range must satisfy min_plausible < max_plausible".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_channels(&self) -> Result<(), ConfigError> {
        if self.sensors.channels.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "at least one [[sensors.channels]] entry is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for channel in &self.sensors.channels {
            if !seen.insert(&channel.id) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate sensor channel id '{}'",
                    channel.id
                )));
            }
            if channel.device.trim().is_empty() || channel.device.contains('/') {
                return Err(ConfigError::InvalidConfig(format!(
                    "sensor channel '{}' needs a plain w1 device name",
                    channel.id
                )));
            }
        }
        Ok(())
    }

    fn validate_cycle_period(&self) -> Result<(), ConfigError> {
        let worst_case =
            worst_case_cycle_latency(self.sensors.channels.len(), &self.retry_policy());
        if self.cycle_period() <= worst_case {
            return Err(ConfigError::InvalidConfig(format!(
                "[daemon] cycle_period_ms = {} does not exceed the worst-case read latency of {}ms for {} channels",
                self.daemon.cycle_period_ms,
                worst_case.as_millis(),
                self.sensors.channels.len()
            )));
        }
        Ok(())
    }

    pub fn cycle_period(&self) -> Duration {
        Duration::from_millis(self.daemon.cycle_period_ms)
    }

    pub fn summary_interval(&self) -> Duration {
        Duration::from_secs(self.daemon.summary_interval_secs)
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            first_delay: Duration::from_millis(self.mqtt.reconnect_first_delay_ms),
            backoff_rate: self.mqtt.reconnect_backoff_rate,
            max_delay: Duration::from_secs(self.mqtt.reconnect_max_delay_secs),
            auth_max_attempts: self.mqtt.auth_max_attempts,
            connect_timeout: Duration::from_secs(self.mqtt.connect_timeout_secs),
            retry_interval: Duration::from_secs(self.mqtt.retry_interval_secs),
            queue_capacity: self.mqtt.queue_capacity,
            request_buffer: self.mqtt.request_buffer,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.sensors.read_attempts,
            first_delay: Duration::from_millis(self.sensors.first_retry_delay_ms),
            backoff_rate: self.sensors.retry_backoff_rate,
            attempt_timeout: Duration::from_millis(self.sensors.attempt_timeout_ms),
        }
    }

    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            staleness_threshold: Duration::from_secs(self.sensors.staleness_threshold_secs),
            alert_threshold: self.sensors.alert_threshold,
            repeat_interval: self.sensors.repeat_interval,
        }
    }

    pub fn plausible_range(&self) -> PlausibleRange {
        PlausibleRange {
            min: self.sensors.min_plausible,
            max: self.sensors.max_plausible,
        }
    }

    pub fn channels(&self) -> &[ChannelConfig] {
        &self.sensors.channels
    }

    /// Credentials are read from the environment before every connect attempt
    pub fn credential_source(&self) -> EnvCredentials {
        EnvCredentials::new(
            self.mqtt.broker_url.clone(),
            self.mqtt.username_env.clone(),
            self.mqtt.password_env.clone(),
        )
    }

    pub fn topics(&self) -> TopicBuilder {
        TopicBuilder::new(&self.daemon.topic_root)
    }

    pub fn link_settings(&self) -> MqttLinkSettings {
        MqttLinkSettings {
            daemon_id: self.daemon.id.clone(),
            status_topic: self.topics().status_topic(),
            keep_alive: Duration::from_secs(self.mqtt.keep_alive_secs),
            client_capacity: self.mqtt.request_buffer,
        }
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[daemon]
id = "test-rig"

[mqtt]
broker_url = "mqtt://localhost:1883"

[sensors]
[[sensors.channels]]
id = "collector"
device = "28-000000000001"

[[sensors.channels]]
id = "tank_top"
device = "28-000000000002"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Validate daemon ID format
fn validate_daemon_id(daemon_id: &str) -> Result<(), ConfigError> {
    let valid_chars = daemon_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if daemon_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidDaemonId(format!(
            "Daemon ID '{daemon_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
