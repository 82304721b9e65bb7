//! Per-sensor health registry
//!
//! One record per sensor id, created lazily on the first read attempt and
//! kept for the lifetime of the process. The state is never set directly: it
//! is derived from the consecutive error count and the age of the last good
//! value, so the two can never disagree.
//!
//! ```text
//! errors == 0                      -> HEALTHY
//! errors > 0, last good is fresh   -> DEGRADED (stale value still usable)
//! errors > 0, no fresh last good   -> FAILED   (no usable value)
//! ```

use super::{ReadFailure, SensorId};
use crate::alerts::{AlertEvent, AlertKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Health state of a single sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SensorState {
    Healthy,
    Degraded,
    Failed,
}

impl SensorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorState::Healthy => "HEALTHY",
            SensorState::Degraded => "DEGRADED",
            SensorState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SensorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Staleness and alerting thresholds
#[derive(Debug, Clone, PartialEq)]
pub struct HealthPolicy {
    /// Maximum age of a last-good value that may still be handed out as stale
    pub staleness_threshold: Duration,
    /// Consecutive failures before the first alert
    pub alert_threshold: u32,
    /// Further failures between repeat alerts while still failing (0 disables repeats)
    pub repeat_interval: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            staleness_threshold: Duration::from_secs(300),
            alert_threshold: 5,
            repeat_interval: 10,
        }
    }
}

impl HealthPolicy {
    /// Derive the state from the error count and last-good age (pure function)
    pub fn derive_state(&self, error_count: u32, last_good_age: Option<Duration>) -> SensorState {
        if error_count == 0 {
            return SensorState::Healthy;
        }
        match last_good_age {
            Some(age) if age < self.staleness_threshold => SensorState::Degraded,
            _ => SensorState::Failed,
        }
    }

    /// Decide whether a failure warrants an alert (pure function)
    ///
    /// At most one alert per failure: the threshold crossing, a periodic
    /// repeat, or a state change once the episode is already being alerted on.
    pub fn alert_for_failure(
        &self,
        error_count: u32,
        previous: SensorState,
        next: SensorState,
    ) -> Option<AlertKind> {
        let threshold = self.alert_threshold.max(1);
        if error_count < threshold {
            return None;
        }
        if error_count == threshold {
            return Some(AlertKind::Threshold);
        }
        let beyond = error_count - threshold;
        if self.repeat_interval > 0 && beyond % self.repeat_interval == 0 {
            return Some(AlertKind::Repeat);
        }
        if previous != next {
            return Some(AlertKind::Escalation);
        }
        None
    }
}

#[derive(Debug, Clone, Copy)]
struct LastGood {
    value: f64,
    timestamp: DateTime<Utc>,
    at: Instant,
}

#[derive(Debug, Clone)]
struct SensorHealthRecord {
    // State as of the last read; transitions and alerts are measured from it.
    // Snapshots derive their own state from the clock instead.
    read_state: SensorState,
    consecutive_error_count: u32,
    last_good: Option<LastGood>,
    last_error: Option<ReadFailure>,
    // State the failing episode started from, reported by the threshold alert
    episode_origin: SensorState,
    alerted: bool,
}

impl SensorHealthRecord {
    fn new() -> Self {
        Self {
            read_state: SensorState::Healthy,
            consecutive_error_count: 0,
            last_good: None,
            last_error: None,
            episode_origin: SensorState::Healthy,
            alerted: false,
        }
    }

    fn age(&self, now: Instant) -> Option<Duration> {
        self.last_good.map(|g| now.saturating_duration_since(g.at))
    }

    /// State as of `now`; a DEGRADED sensor turns FAILED once its last good value ages out
    fn current_state(&self, policy: &HealthPolicy, now: Instant) -> SensorState {
        policy.derive_state(self.consecutive_error_count, self.age(now))
    }

    fn snapshot(&self, policy: &HealthPolicy, now: Instant) -> SensorHealthSnapshot {
        let age = self.age(now);
        SensorHealthSnapshot {
            state: self.current_state(policy, now),
            last_good_value: self.last_good.map(|g| g.value),
            last_good_timestamp: self.last_good.map(|g| g.timestamp),
            age_secs: age.map(|age| age.as_secs_f64()),
            error_count: self.consecutive_error_count,
            last_error: self.last_error.as_ref().map(ToString::to_string),
        }
    }
}

/// Read-only view of one sensor's health
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorHealthSnapshot {
    pub state: SensorState,
    pub last_good_value: Option<f64>,
    pub last_good_timestamp: Option<DateTime<Utc>>,
    /// Age of the last good value in seconds, computed when the snapshot was taken
    pub age_secs: Option<f64>,
    pub error_count: u32,
    pub last_error: Option<String>,
}

/// Snapshot of every known sensor, ordered by id
pub type HealthSummary = BTreeMap<SensorId, SensorHealthSnapshot>;

/// Last-good value handed out in place of a failed read
#[derive(Debug, Clone, PartialEq)]
pub struct StaleValue {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub age: Duration,
}

/// Result of recording an exhausted read
#[derive(Debug, Clone, PartialEq)]
pub struct FailureVerdict {
    pub state: SensorState,
    pub error_count: u32,
    /// Present only when the sensor is DEGRADED
    pub stale: Option<StaleValue>,
    pub alert: Option<AlertEvent>,
}

/// Registry of sensor health records
///
/// Cheap to clone; clones share the same records. Mutation is restricted to
/// the crate so that the reader stays the only writer.
#[derive(Debug, Clone)]
pub struct SensorHealthMonitor {
    policy: HealthPolicy,
    records: Arc<RwLock<HashMap<SensorId, SensorHealthRecord>>>,
}

impl SensorHealthMonitor {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Store a validated reading and reset the failure episode
    ///
    /// Returns a recovery alert when the episode that just ended had alerted.
    pub(crate) fn record_success(
        &self,
        sensor_id: &SensorId,
        value: f64,
        timestamp: DateTime<Utc>,
        now: Instant,
    ) -> Option<AlertEvent> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .entry(sensor_id.clone())
            .or_insert_with(SensorHealthRecord::new);

        let previous = record.read_state;
        let failures = record.consecutive_error_count;
        let alerted = record.alerted;

        record.last_good = Some(LastGood {
            value,
            timestamp,
            at: now,
        });
        record.consecutive_error_count = 0;
        record.read_state = SensorState::Healthy;
        record.episode_origin = SensorState::Healthy;
        record.alerted = false;

        if previous != SensorState::Healthy {
            info!(
                sensor = %sensor_id,
                from = %previous,
                failures,
                "Sensor recovered"
            );
        }

        if alerted {
            Some(AlertEvent::new(
                sensor_id.clone(),
                AlertKind::Recovery,
                previous,
                SensorState::Healthy,
                0,
                format!("read succeeded after {failures} consecutive failures"),
            ))
        } else {
            None
        }
    }

    /// Count an exhausted read and derive the resulting state
    pub(crate) fn record_failure(
        &self,
        sensor_id: &SensorId,
        error: ReadFailure,
        now: Instant,
    ) -> FailureVerdict {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .entry(sensor_id.clone())
            .or_insert_with(SensorHealthRecord::new);

        let previous = record.read_state;
        if record.consecutive_error_count == 0 {
            record.episode_origin = previous;
        }
        record.consecutive_error_count = record.consecutive_error_count.saturating_add(1);

        let age = record.age(now);
        let next = record.current_state(&self.policy, now);
        record.read_state = next;

        if previous != next {
            warn!(
                sensor = %sensor_id,
                from = %previous,
                to = %next,
                error_count = record.consecutive_error_count,
                error = %error,
                "Sensor health state changed"
            );
        }

        let alert = self
            .policy
            .alert_for_failure(record.consecutive_error_count, previous, next)
            .map(|kind| {
                let from = if kind == AlertKind::Threshold {
                    record.episode_origin
                } else {
                    previous
                };
                AlertEvent::new(
                    sensor_id.clone(),
                    kind,
                    from,
                    next,
                    record.consecutive_error_count,
                    error.to_string(),
                )
            });
        if alert.is_some() {
            record.alerted = true;
        }

        let stale = match (next, record.last_good, age) {
            (SensorState::Degraded, Some(good), Some(age)) => Some(StaleValue {
                value: good.value,
                timestamp: good.timestamp,
                age,
            }),
            _ => None,
        };

        record.last_error = Some(error);

        FailureVerdict {
            state: next,
            error_count: record.consecutive_error_count,
            stale,
            alert,
        }
    }

    /// Read-only snapshot of every sensor seen so far
    pub fn get_health_summary(&self) -> HealthSummary {
        let now = Instant::now();
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records
            .iter()
            .map(|(id, record)| (id.clone(), record.snapshot(&self.policy, now)))
            .collect()
    }

    /// Snapshot of a single sensor
    pub fn get(&self, sensor_id: &SensorId) -> Option<SensorHealthSnapshot> {
        let now = Instant::now();
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records.get(sensor_id).map(|record| record.snapshot(&self.policy, now))
    }

    /// True when every known sensor is HEALTHY
    pub fn all_healthy(&self) -> bool {
        let now = Instant::now();
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records
            .values()
            .all(|record| record.current_state(&self.policy, now) == SensorState::Healthy)
    }
}

impl Default for SensorHealthMonitor {
    fn default() -> Self {
        Self::new(HealthPolicy::default())
    }
}
