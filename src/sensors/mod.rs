//! Sensor reading and per-sensor health tracking
//!
//! Raw reads come from a [`SensorSource`]. The [`RobustSensorReader`] wraps
//! each raw read with bounded retries, per-attempt timeouts and value
//! validation, and is the only writer of the [`SensorHealthMonitor`].

pub mod health;
pub mod reader;
pub mod w1;

pub use health::{
    FailureVerdict, HealthPolicy, HealthSummary, SensorHealthMonitor, SensorHealthSnapshot,
    SensorState,
};
pub use reader::{PlausibleRange, ReadOutcome, RetryPolicy, RobustSensorReader, SensorReading};
pub use w1::W1ThermSource;

use crate::protocol::{validate_topic_level, ValidationError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable identifier of a physical sensor channel
///
/// Restricted to `[A-Za-z0-9._-]+` because it becomes a topic level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SensorId(String);

impl SensorId {
    pub fn new<S: Into<String>>(id: S) -> Result<Self, InvalidSensorId> {
        let id = id.into();
        match validate_topic_level(&id) {
            Ok(()) => Ok(Self(id)),
            Err(reason) => Err(InvalidSensorId { id, reason }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SensorId {
    type Error = InvalidSensorId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SensorId> for String {
    fn from(id: SensorId) -> Self {
        id.0
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("invalid sensor id '{id}': {reason}")]
pub struct InvalidSensorId {
    pub id: String,
    pub reason: ValidationError,
}

/// Failure indicator returned by a raw bus read
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RawReadError {
    /// The driver returned its documented error value
    #[error("driver error sentinel {0}")]
    Sentinel(f64),
    #[error("bus fault: {0}")]
    BusFault(String),
    #[error("bus timeout")]
    BusTimeout,
}

/// Outcome of one raw bus read: a numeric value or an explicit failure
pub type RawReading = Result<f64, RawReadError>;

/// Why a single read attempt did not produce a usable value
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReadFailure {
    #[error("attempt did not complete within {timeout_ms}ms")]
    AttemptTimeout { timeout_ms: u64 },
    #[error("bus timeout")]
    BusTimeout,
    #[error("bus fault: {detail}")]
    BusFault { detail: String },
    #[error("driver error sentinel {value}")]
    ErrorSentinel { value: f64 },
    #[error("non-finite value")]
    NotFinite,
    #[error("implausible value {value} outside [{min}, {max}]")]
    Implausible { value: f64, min: f64, max: f64 },
}

impl From<RawReadError> for ReadFailure {
    fn from(error: RawReadError) -> Self {
        match error {
            RawReadError::Sentinel(value) => ReadFailure::ErrorSentinel { value },
            RawReadError::BusFault(detail) => ReadFailure::BusFault { detail },
            RawReadError::BusTimeout => ReadFailure::BusTimeout,
        }
    }
}

/// A raw per-sensor read primitive
///
/// Implementations perform exactly one bus transaction per call and never
/// retry internally; retries belong to the [`RobustSensorReader`].
#[async_trait]
pub trait SensorSource: Send + Sync {
    async fn read_raw(&self) -> RawReading;
}
