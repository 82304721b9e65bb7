//! Wire payloads published to the broker
//!
//! Every payload is JSON. Field names are part of the contract with the
//! home-automation hub and must not change.

use crate::alerts::{AlertEvent, AlertKind};
use crate::sensors::{HealthSummary, SensorId, SensorState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Retained availability payload published on connect
pub const STATUS_ONLINE: &str = "online";
/// Retained availability payload registered as last will
pub const STATUS_OFFLINE: &str = "offline";

/// Alert published on `{root}/sensor_alerts/{sensor_id}`
///
/// # Examples
/// ```
/// use solard::protocol::AlertPayload;
///
/// let json = r#"{
///     "event_id": "550e8400-e29b-41d4-a716-446655440000",
///     "sensor_id": "collector",
///     "kind": "threshold",
///     "state": "DEGRADED",
///     "previous_state": "HEALTHY",
///     "error_count": 5,
///     "timestamp": "2026-06-01T12:00:00Z",
///     "message": "sensor collector DEGRADED after 5 consecutive read failures"
/// }"#;
/// let payload: AlertPayload = serde_json::from_str(json).unwrap();
/// assert_eq!(payload.error_count, 5);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertPayload {
    /// UUID v4, unique per alert for deduplication on the hub side
    pub event_id: Uuid,
    pub sensor_id: SensorId,
    pub kind: AlertKind,
    /// Health state after the transition
    pub state: SensorState,
    pub previous_state: SensorState,
    pub error_count: u32,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl From<&AlertEvent> for AlertPayload {
    fn from(event: &AlertEvent) -> Self {
        Self {
            event_id: event.event_id,
            sensor_id: event.sensor_id.clone(),
            kind: event.kind,
            state: event.to_state,
            previous_state: event.from_state,
            error_count: event.error_count,
            timestamp: event.timestamp,
            message: event.message.clone(),
        }
    }
}

/// Aggregate health summary published on `{root}/sensor_health`
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthSummaryPayload {
    pub daemon_id: String,
    pub timestamp: DateTime<Utc>,
    pub healthy: usize,
    pub degraded: usize,
    pub failed: usize,
    pub sensors: HealthSummary,
}

impl HealthSummaryPayload {
    pub fn new(daemon_id: &str, sensors: HealthSummary) -> Self {
        let count = |state: SensorState| sensors.values().filter(|s| s.state == state).count();
        Self {
            daemon_id: daemon_id.to_string(),
            timestamp: Utc::now(),
            healthy: count(SensorState::Healthy),
            degraded: count(SensorState::Degraded),
            failed: count(SensorState::Failed),
            sensors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::SensorHealthSnapshot;
    use serde_json::json;

    fn sensor(id: &str) -> SensorId {
        SensorId::new(id).unwrap()
    }

    #[test]
    fn test_alert_payload_field_names() {
        let event = AlertEvent::new(
            sensor("tank_top"),
            AlertKind::Threshold,
            SensorState::Healthy,
            SensorState::Failed,
            5,
            "no data",
        );
        let payload = AlertPayload::from(&event);
        let value = serde_json::to_value(&payload).unwrap();

        assert_eq!(value["sensor_id"], "tank_top");
        assert_eq!(value["state"], "FAILED");
        assert_eq!(value["previous_state"], "HEALTHY");
        assert_eq!(value["kind"], "threshold");
        assert_eq!(value["error_count"], 5);
        assert!(value["timestamp"].is_string());
        assert!(value["message"].as_str().unwrap().contains("no data"));
        assert_eq!(value["event_id"], json!(event.event_id.to_string()));
    }

    #[test]
    fn test_health_summary_counts_states() {
        let mut sensors = HealthSummary::new();
        for (id, state) in [
            ("a", SensorState::Healthy),
            ("b", SensorState::Degraded),
            ("c", SensorState::Failed),
            ("d", SensorState::Healthy),
        ] {
            sensors.insert(
                sensor(id),
                SensorHealthSnapshot {
                    state,
                    last_good_value: None,
                    last_good_timestamp: None,
                    age_secs: None,
                    error_count: 0,
                    last_error: None,
                },
            );
        }

        let payload = HealthSummaryPayload::new("roof-rig", sensors);
        assert_eq!(payload.healthy, 2);
        assert_eq!(payload.degraded, 1);
        assert_eq!(payload.failed, 1);

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["daemon_id"], "roof-rig");
        assert_eq!(value["sensors"]["b"]["state"], "DEGRADED");
    }
}
