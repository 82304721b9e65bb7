//! Failure taxonomy for the daemon
//!
//! Runtime failures are a closed set of tagged kinds. None of them terminate
//! the control loop: sensor failures become typed read outcomes, connection
//! failures become connection states. Only configuration and startup
//! credential errors halt the process.

use crate::config::ConfigError;
use crate::sensors::{ReadFailure, SensorId};
use crate::transport::mqtt::{ConnectResult, CredentialError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

/// Coarse failure category used for diagnostics export and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// A single read attempt failed; the reader is still retrying
    TransientReadFailure,
    /// All attempts failed and no usable last-good value exists
    PersistentReadFailure,
    /// Informational: a stale last-good value was handed out
    StaleDataUsed,
    /// Broker unreachable, timed out or dropped the link
    ConnectionTransientFailure,
    /// Broker rejected the credentials
    ConnectionAuthFailure,
    /// A publish could not be handed to the broker
    PublishFailure,
    /// Invalid configuration or credentials at startup
    Configuration,
}

/// Top-level error type
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("sensor {sensor} unavailable after {attempts} attempts: {cause}")]
    SensorUnavailable {
        sensor: SensorId,
        attempts: u32,
        cause: ReadFailure,
    },

    #[error("broker rejected principal '{principal}': {classification}")]
    AuthRejected {
        principal: String,
        classification: ConnectResult,
    },

    #[error("broker connection failed: {classification}")]
    NetworkFailure { classification: ConnectResult },

    #[error("publish to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("credential error: {0}")]
    Credentials(#[from] CredentialError),
}

impl DaemonError {
    /// Create publish failure error
    pub fn publish_failed<T: Into<String>, R: Into<String>>(topic: T, reason: R) -> Self {
        Self::PublishFailed {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    pub fn category(&self) -> FailureCategory {
        match self {
            DaemonError::SensorUnavailable { .. } => FailureCategory::PersistentReadFailure,
            DaemonError::AuthRejected { .. } => FailureCategory::ConnectionAuthFailure,
            DaemonError::NetworkFailure { .. } => FailureCategory::ConnectionTransientFailure,
            DaemonError::PublishFailed { .. } => FailureCategory::PublishFailure,
            DaemonError::Config(_) | DaemonError::Credentials(_) => FailureCategory::Configuration,
        }
    }

    /// Whether the daemon keeps running after this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.category(), FailureCategory::Configuration)
    }
}

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|token|key|secret)[=:]\s*\S+").expect("valid secret pattern")
});

static SECRET_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("valid secret path pattern")
});

const MAX_MESSAGE_LEN: usize = 500;

/// Sanitize free-form error text before it is logged or exported
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    sanitized = SECRET_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], suffix);
    }

    sanitized
}
