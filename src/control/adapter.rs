//! Per-cycle sensor acquisition for the control algorithm
//!
//! The adapter is the only place the control side asks for sensor values.
//! Every channel yields a fresh value, a stale-flagged value, or
//! [`ChannelValue::InsufficientData`]. It never invents a numeric default;
//! what to do without data is the algorithm's decision.

use crate::sensors::{ReadFailure, ReadOutcome, RetryPolicy, RobustSensorReader, SensorId, SensorSource};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Longest a full cycle can take when every read on every channel times out
///
/// Channels are read one after another, so the bound is linear in the
/// channel count.
pub fn worst_case_cycle_latency(channels: usize, policy: &RetryPolicy) -> Duration {
    let channels = u32::try_from(channels).unwrap_or(u32::MAX);
    policy.worst_case_latency().saturating_mul(channels)
}

/// What the algorithm gets for one channel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "quality", rename_all = "snake_case")]
pub enum ChannelValue {
    Fresh {
        value: f64,
        captured_at: DateTime<Utc>,
    },
    /// Last good value, older than this cycle but inside the staleness window
    Stale {
        value: f64,
        captured_at: DateTime<Utc>,
        #[serde(serialize_with = "serialize_secs")]
        age: Duration,
    },
    InsufficientData {
        #[serde(serialize_with = "serialize_display")]
        cause: ReadFailure,
    },
}

fn serialize_secs<S: serde::Serializer>(age: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(age.as_secs_f64())
}

fn serialize_display<S: serde::Serializer>(cause: &ReadFailure, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(cause)
}

impl ChannelValue {
    /// Usable value, fresh or stale
    pub fn value(&self) -> Option<f64> {
        match self {
            ChannelValue::Fresh { value, .. } | ChannelValue::Stale { value, .. } => Some(*value),
            ChannelValue::InsufficientData { .. } => None,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, ChannelValue::Stale { .. })
    }

    pub fn is_insufficient(&self) -> bool {
        matches!(self, ChannelValue::InsufficientData { .. })
    }
}

impl From<ReadOutcome> for ChannelValue {
    fn from(outcome: ReadOutcome) -> Self {
        match outcome {
            ReadOutcome::Fresh(reading) => ChannelValue::Fresh {
                value: reading.value,
                captured_at: reading.captured_at,
            },
            ReadOutcome::Stale { reading, age, .. } => ChannelValue::Stale {
                value: reading.value,
                captured_at: reading.captured_at,
                age,
            },
            ReadOutcome::Unavailable { error, .. } => ChannelValue::InsufficientData { cause: error },
        }
    }
}

/// Everything read during one cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReadings {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub values: BTreeMap<SensorId, ChannelValue>,
}

impl CycleReadings {
    pub fn get(&self, sensor_id: &SensorId) -> Option<&ChannelValue> {
        self.values.get(sensor_id)
    }

    /// Usable value for `sensor_id`, fresh or stale
    pub fn value(&self, sensor_id: &SensorId) -> Option<f64> {
        self.get(sensor_id).and_then(ChannelValue::value)
    }

    /// Channels without a usable value this cycle
    pub fn missing(&self) -> Vec<&SensorId> {
        self.values
            .iter()
            .filter(|(_, value)| value.is_insufficient())
            .map(|(id, _)| id)
            .collect()
    }

    pub fn stale_count(&self) -> usize {
        self.values.values().filter(|v| v.is_stale()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.values.values().all(|v| !v.is_insufficient())
    }
}

/// Polls every required channel through the robust reader
pub struct ControlLoopAdapter {
    reader: RobustSensorReader,
    channels: Vec<(SensorId, Arc<dyn SensorSource>)>,
    cycle: u64,
}

impl ControlLoopAdapter {
    pub fn new(reader: RobustSensorReader, channels: Vec<(SensorId, Arc<dyn SensorSource>)>) -> Self {
        Self {
            reader,
            channels,
            cycle: 0,
        }
    }

    pub fn reader(&self) -> &RobustSensorReader {
        &self.reader
    }

    pub fn channel_ids(&self) -> impl Iterator<Item = &SensorId> {
        self.channels.iter().map(|(id, _)| id)
    }

    pub fn worst_case_latency(&self) -> Duration {
        worst_case_cycle_latency(self.channels.len(), self.reader.policy())
    }

    /// Read one channel with retries
    pub async fn read_channel(&self, sensor_id: &SensorId) -> Option<ChannelValue> {
        let (_, source) = self.channels.iter().find(|(id, _)| id == sensor_id)?;
        Some(self.reader.read_source(sensor_id, source.as_ref()).await.into())
    }

    /// Read every channel once, in configuration order
    pub async fn poll_cycle(&mut self) -> CycleReadings {
        self.cycle += 1;
        let started_at = Utc::now();
        let mut values = BTreeMap::new();

        for (sensor_id, source) in &self.channels {
            let outcome = self.reader.read_source(sensor_id, source.as_ref()).await;
            values.insert(sensor_id.clone(), ChannelValue::from(outcome));
        }

        CycleReadings {
            cycle: self.cycle,
            started_at,
            values,
        }
    }
}
