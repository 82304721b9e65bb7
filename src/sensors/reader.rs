//! Retrying, validating sensor reader
//!
//! Every raw read is bounded: at most `attempts` calls, each cut off after
//! `attempt_timeout`, with exponential delays between attempts. The reader
//! never returns a made-up value. When all attempts fail it hands out the
//! last good value flagged as stale, or reports the sensor unavailable.

use super::health::SensorHealthMonitor;
use super::{RawReading, ReadFailure, SensorId, SensorSource};
use crate::alerts::{AlertEvent, AlertSink};
use crate::error::{DaemonError, FailureCategory};
use crate::observability::metrics::metrics;
use crate::sensor_span;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn, Instrument};

/// Retry schedule for a single logical read
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Delay after the first failed attempt
    pub first_delay: Duration,
    /// Multiplier applied to the delay after each further failure
    pub backoff_rate: f64,
    /// Upper bound on a single raw read
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            first_delay: Duration::from_millis(50),
            backoff_rate: 2.0,
            attempt_timeout: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Delay taken after failed attempt `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let millis = self.first_delay.as_millis() as f64 * self.backoff_rate.powi(exponent);
        Duration::from_millis(millis as u64)
    }

    /// Longest time one logical read can take: every attempt times out
    pub fn worst_case_latency(&self) -> Duration {
        let attempts = self.attempts.max(1);
        (1..attempts)
            .map(|n| self.delay_after(n))
            .fold(self.attempt_timeout.saturating_mul(attempts), Duration::saturating_add)
    }
}

/// Physically plausible value range; anything outside is a read failure
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlausibleRange {
    pub min: f64,
    pub max: f64,
}

impl Default for PlausibleRange {
    fn default() -> Self {
        // DS18B20 operating range
        Self {
            min: -55.0,
            max: 125.0,
        }
    }
}

impl PlausibleRange {
    pub fn validate(&self, value: f64) -> Result<f64, ReadFailure> {
        if !value.is_finite() {
            return Err(ReadFailure::NotFinite);
        }
        if value < self.min || value > self.max {
            return Err(ReadFailure::Implausible {
                value,
                min: self.min,
                max: self.max,
            });
        }
        Ok(value)
    }
}

/// A validated value with its capture time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub sensor_id: SensorId,
    pub value: f64,
    pub captured_at: DateTime<Utc>,
}

/// Result of one logical read
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// A value read during this call
    Fresh(SensorReading),
    /// All attempts failed; the last good value is younger than the staleness window
    Stale {
        reading: SensorReading,
        age: Duration,
        error: ReadFailure,
    },
    /// All attempts failed and no usable value exists
    Unavailable {
        sensor_id: SensorId,
        attempts: u32,
        error: ReadFailure,
    },
}

impl ReadOutcome {
    /// Usable value, fresh or stale
    pub fn value(&self) -> Option<f64> {
        match self {
            ReadOutcome::Fresh(reading) | ReadOutcome::Stale { reading, .. } => {
                Some(reading.value)
            }
            ReadOutcome::Unavailable { .. } => None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, ReadOutcome::Fresh(_))
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, ReadOutcome::Stale { .. })
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, ReadOutcome::Unavailable { .. })
    }

    pub fn failure_category(&self) -> Option<FailureCategory> {
        match self {
            ReadOutcome::Fresh(_) => None,
            ReadOutcome::Stale { .. } => Some(FailureCategory::StaleDataUsed),
            ReadOutcome::Unavailable { .. } => Some(FailureCategory::PersistentReadFailure),
        }
    }

    /// Typed error for an unavailable sensor
    pub fn into_error(self) -> Option<DaemonError> {
        match self {
            ReadOutcome::Unavailable {
                sensor_id,
                attempts,
                error,
            } => Some(DaemonError::SensorUnavailable {
                sensor: sensor_id,
                attempts,
                cause: error,
            }),
            _ => None,
        }
    }
}

/// Bounded-retry reader and sole writer of the health registry
#[derive(Clone)]
pub struct RobustSensorReader {
    monitor: SensorHealthMonitor,
    policy: RetryPolicy,
    range: PlausibleRange,
    alerts: Arc<dyn AlertSink>,
}

impl RobustSensorReader {
    pub fn new(
        monitor: SensorHealthMonitor,
        policy: RetryPolicy,
        range: PlausibleRange,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            monitor,
            policy,
            range,
            alerts,
        }
    }

    pub fn monitor(&self) -> &SensorHealthMonitor {
        &self.monitor
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Read through a [`SensorSource`]
    pub async fn read_source(&self, sensor_id: &SensorId, source: &dyn SensorSource) -> ReadOutcome {
        self.read_with_retry(sensor_id, || source.read_raw()).await
    }

    /// Run `raw_read` under the retry policy and update the sensor's health
    pub async fn read_with_retry<F, Fut>(&self, sensor_id: &SensorId, raw_read: F) -> ReadOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RawReading>,
    {
        let span = sensor_span!(sensor = %sensor_id);
        self.retry_loop(sensor_id, raw_read).instrument(span).await
    }

    async fn retry_loop<F, Fut>(&self, sensor_id: &SensorId, mut raw_read: F) -> ReadOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RawReading>,
    {
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 1;

        let failure = loop {
            match self.attempt_once(&mut raw_read).await {
                Ok(value) => return self.accept(sensor_id, value),
                Err(failure) => {
                    metrics().sensor_attempt_failed();
                    debug!(attempt, attempts, error = %failure, "Sensor read attempt failed");
                    if attempt >= attempts {
                        break failure;
                    }
                    tokio::time::sleep(self.policy.delay_after(attempt)).await;
                    attempt += 1;
                }
            }
        };

        self.give_up(sensor_id, attempts, failure)
    }

    async fn attempt_once<F, Fut>(&self, raw_read: &mut F) -> Result<f64, ReadFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RawReading>,
    {
        match tokio::time::timeout(self.policy.attempt_timeout, raw_read()).await {
            Ok(Ok(value)) => self.range.validate(value),
            Ok(Err(raw)) => Err(ReadFailure::from(raw)),
            Err(_) => Err(ReadFailure::AttemptTimeout {
                timeout_ms: self.policy.attempt_timeout.as_millis() as u64,
            }),
        }
    }

    fn accept(&self, sensor_id: &SensorId, value: f64) -> ReadOutcome {
        let captured_at = Utc::now();
        let alert = self
            .monitor
            .record_success(sensor_id, value, captured_at, Instant::now());
        metrics().sensor_read_succeeded();
        self.dispatch(alert);

        ReadOutcome::Fresh(SensorReading {
            sensor_id: sensor_id.clone(),
            value,
            captured_at,
        })
    }

    fn give_up(&self, sensor_id: &SensorId, attempts: u32, failure: ReadFailure) -> ReadOutcome {
        let verdict = self
            .monitor
            .record_failure(sensor_id, failure.clone(), Instant::now());
        self.dispatch(verdict.alert);

        match verdict.stale {
            Some(stale) => {
                metrics().stale_value_used();
                warn!(
                    state = %verdict.state,
                    error_count = verdict.error_count,
                    age_secs = stale.age.as_secs_f64(),
                    error = %failure,
                    "Sensor read failed, using last good value"
                );
                ReadOutcome::Stale {
                    reading: SensorReading {
                        sensor_id: sensor_id.clone(),
                        value: stale.value,
                        captured_at: stale.timestamp,
                    },
                    age: stale.age,
                    error: failure,
                }
            }
            None => {
                metrics().sensor_unavailable();
                warn!(
                    state = %verdict.state,
                    error_count = verdict.error_count,
                    error = %failure,
                    "Sensor unavailable, no usable value"
                );
                ReadOutcome::Unavailable {
                    sensor_id: sensor_id.clone(),
                    attempts,
                    error: failure,
                }
            }
        }
    }

    fn dispatch(&self, alert: Option<AlertEvent>) {
        if let Some(event) = alert {
            self.alerts.on_health_transition(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::{HealthPolicy, RawReadError, SensorState};
    use crate::testing::mocks::RecordingAlertSink;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn reader(sink: Arc<RecordingAlertSink>) -> RobustSensorReader {
        RobustSensorReader::new(
            SensorHealthMonitor::new(HealthPolicy::default()),
            RetryPolicy::default(),
            PlausibleRange::default(),
            sink,
        )
    }

    fn id(name: &str) -> SensorId {
        SensorId::new(name).unwrap()
    }

    #[test]
    fn test_retry_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(50));
        assert_eq!(policy.delay_after(2), Duration::from_millis(100));
        assert_eq!(policy.delay_after(3), Duration::from_millis(200));
    }

    #[test]
    fn test_worst_case_latency() {
        let policy = RetryPolicy::default();
        // 3 x 250ms timeouts + 50ms + 100ms between attempts
        assert_eq!(policy.worst_case_latency(), Duration::from_millis(900));

        let single = RetryPolicy {
            attempts: 1,
            ..RetryPolicy::default()
        };
        assert_eq!(single.worst_case_latency(), Duration::from_millis(250));
    }

    #[test]
    fn test_worst_case_latency_saturates() {
        let huge = RetryPolicy {
            attempts: 5000,
            attempt_timeout: Duration::from_millis(i64::MAX as u64),
            ..RetryPolicy::default()
        };
        assert_eq!(huge.worst_case_latency(), Duration::MAX);
    }

    #[test]
    fn test_plausible_range() {
        let range = PlausibleRange::default();
        assert_eq!(range.validate(21.5), Ok(21.5));
        assert_eq!(range.validate(-55.0), Ok(-55.0));
        assert_eq!(range.validate(f64::NAN), Err(ReadFailure::NotFinite));
        assert_eq!(range.validate(f64::INFINITY), Err(ReadFailure::NotFinite));
        assert!(matches!(
            range.validate(130.0),
            Err(ReadFailure::Implausible { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_third_attempt() {
        let sink = Arc::new(RecordingAlertSink::default());
        let reader = reader(sink.clone());
        let calls = AtomicU32::new(0);

        let started = Instant::now();
        let outcome = reader
            .read_with_retry(&id("collector"), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(RawReadError::BusTimeout)
                    } else {
                        Ok(64.25)
                    }
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.value(), Some(64.25));
        assert!(outcome.is_fresh());
        // 50ms + 100ms of backoff, no timeout elapsed
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(150), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(250), "{elapsed:?}");
        assert_eq!(
            reader.monitor().get(&id("collector")).unwrap().state,
            SensorState::Healthy
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_read_counts_as_failed_attempt() {
        let sink = Arc::new(RecordingAlertSink::default());
        let reader = reader(sink);
        let calls = AtomicU32::new(0);

        let outcome = reader
            .read_with_retry(&id("collector"), || {
                calls.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<RawReading>()
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match outcome {
            ReadOutcome::Unavailable {
                attempts, error, ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(error, ReadFailure::AttemptTimeout { timeout_ms: 250 });
            }
            other => panic!("expected unavailable, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sentinel_and_implausible_values_are_failures() {
        let sink = Arc::new(RecordingAlertSink::default());
        let reader = reader(sink);

        let outcome = reader
            .read_with_retry(&id("tank"), || async { Err(RawReadError::Sentinel(85.0)) })
            .await;
        assert!(outcome.is_unavailable());

        let outcome = reader
            .read_with_retry(&id("tank2"), || async { Ok(f64::NAN) })
            .await;
        assert!(matches!(
            outcome,
            ReadOutcome::Unavailable {
                error: ReadFailure::NotFinite,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_value_after_failure() {
        let sink = Arc::new(RecordingAlertSink::default());
        let reader = reader(sink);
        let sensor = id("collector");

        reader.read_with_retry(&sensor, || async { Ok(70.0) }).await;
        tokio::time::advance(Duration::from_secs(60)).await;

        let outcome = reader
            .read_with_retry(&sensor, || async { Err(RawReadError::BusFault("nack".into())) })
            .await;

        assert!(outcome.is_stale());
        assert_eq!(outcome.value(), Some(70.0));
        assert_eq!(
            outcome.failure_category(),
            Some(FailureCategory::StaleDataUsed)
        );
        assert_eq!(
            reader.monitor().get(&sensor).unwrap().state,
            SensorState::Degraded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_into_error() {
        let sink = Arc::new(RecordingAlertSink::default());
        let reader = reader(sink);

        let outcome = reader
            .read_with_retry(&id("collector"), || async { Err(RawReadError::BusTimeout) })
            .await;

        let err = outcome.into_error().expect("unavailable maps to an error");
        assert_eq!(err.category(), FailureCategory::PersistentReadFailure);
    }
}
