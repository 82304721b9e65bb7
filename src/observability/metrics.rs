//! Thread-safe metrics collection
//!
//! Atomic counters for the two failure domains (sensor bus, broker link) and
//! a bounded window of control-cycle durations for latency percentiles.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Cycle durations kept for percentile calculation
const CYCLE_WINDOW: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Sensor bus
    read_attempts_failed: AtomicU64,
    reads_succeeded: AtomicU64,
    stale_values_used: AtomicU64,
    reads_unavailable: AtomicU64,
    alerts_raised: AtomicU64,

    // Broker link
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    publishes_dropped: AtomicU64,
    publishes_requeued: AtomicU64,
    connection_start_time: AtomicU64,

    // Control loop
    cycles_completed: AtomicU64,
    cycles_with_missing_data: AtomicU64,
    cycle_times: Mutex<VecDeque<u64>>,

    daemon_state: Mutex<String>,
    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            read_attempts_failed: AtomicU64::new(0),
            reads_succeeded: AtomicU64::new(0),
            stale_values_used: AtomicU64::new(0),
            reads_unavailable: AtomicU64::new(0),
            alerts_raised: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            publishes_dropped: AtomicU64::new(0),
            publishes_requeued: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            cycles_completed: AtomicU64::new(0),
            cycles_with_missing_data: AtomicU64::new(0),
            cycle_times: Mutex::new(VecDeque::with_capacity(CYCLE_WINDOW)),
            daemon_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Sensor metrics
    pub fn sensor_attempt_failed(&self) {
        self.read_attempts_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sensor_read_succeeded(&self) {
        self.reads_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stale_value_used(&self) {
        self.stale_values_used.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sensor_unavailable(&self) {
        self.reads_unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn alert_raised(&self) {
        self.alerts_raised.fetch_add(1, Ordering::Relaxed);
    }

    // MQTT metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A message was discarded: retry queue overflow or full request buffer
    pub fn publish_dropped(&self) {
        self.publishes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Messages still undelivered when the connection context stopped
    pub fn undelivered_at_shutdown(&self, count: u64) {
        self.publishes_dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Messages the broker never acknowledged before the session ended, queued again
    pub fn publishes_requeued(&self, count: u64) {
        self.publishes_requeued.fetch_add(count, Ordering::Relaxed);
    }

    // Control loop metrics
    pub fn cycle_completed(&self, duration: Duration, missing_channels: usize) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        if missing_channels > 0 {
            self.cycles_with_missing_data
                .fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut times) = self.cycle_times.lock() {
            if times.len() == CYCLE_WINDOW {
                times.pop_front();
            }
            times.push_back(duration.as_millis() as u64);
        }
    }

    pub fn set_daemon_state(&self, state: &str) {
        if let Ok(mut current) = self.daemon_state.lock() {
            *current = state.to_string();
        }
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.read_attempts_failed,
            &self.reads_succeeded,
            &self.stale_values_used,
            &self.reads_unavailable,
            &self.alerts_raised,
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.connections_lost,
            &self.messages_published,
            &self.publish_failures,
            &self.publishes_dropped,
            &self.publishes_requeued,
            &self.connection_start_time,
            &self.cycles_completed,
            &self.cycles_with_missing_data,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut times) = self.cycle_times.lock() {
            times.clear();
        }
        self.set_daemon_state("initializing");
    }

    fn cycle_time_statistics(&self) -> (f64, f64, f64) {
        let Ok(times) = self.cycle_times.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0);
        }

        let mut sorted: Vec<u64> = times.iter().copied().collect();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (avg, percentile(&sorted, 50.0), percentile(&sorted, 95.0))
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg, p50, p95) = self.cycle_time_statistics();
        let connected_since = self.connection_start_time.load(Ordering::Relaxed);
        let connection_duration_seconds = if connected_since == 0 {
            0
        } else {
            now.saturating_sub(connected_since)
        };

        MetricsSnapshot {
            sensors: SensorMetrics {
                read_attempts_failed: self.read_attempts_failed.load(Ordering::Relaxed),
                reads_succeeded: self.reads_succeeded.load(Ordering::Relaxed),
                stale_values_used: self.stale_values_used.load(Ordering::Relaxed),
                reads_unavailable: self.reads_unavailable.load(Ordering::Relaxed),
                alerts_raised: self.alerts_raised.load(Ordering::Relaxed),
            },
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                publishes_dropped: self.publishes_dropped.load(Ordering::Relaxed),
                publishes_requeued: self.publishes_requeued.load(Ordering::Relaxed),
                connection_duration_seconds,
            },
            control: ControlMetrics {
                cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
                cycles_with_missing_data: self.cycles_with_missing_data.load(Ordering::Relaxed),
                avg_cycle_time_ms: avg,
                cycle_time_p50_ms: p50,
                cycle_time_p95_ms: p95,
            },
            lifecycle: LifecycleMetrics {
                current_state: self
                    .daemon_state
                    .lock()
                    .map(|s| s.clone())
                    .unwrap_or_else(|_| "unknown".to_string()),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub sensors: SensorMetrics,
    pub mqtt: MqttMetrics,
    pub control: ControlMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorMetrics {
    pub read_attempts_failed: u64,
    pub reads_succeeded: u64,
    pub stale_values_used: u64,
    pub reads_unavailable: u64,
    pub alerts_raised: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connections_lost: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub publishes_dropped: u64,
    pub publishes_requeued: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlMetrics {
    pub cycles_completed: u64,
    pub cycles_with_missing_data: u64,
    pub avg_cycle_time_ms: f64,
    pub cycle_time_p50_ms: f64,
    pub cycle_time_p95_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Nearest-rank percentile over sorted values
fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1] as f64
}
