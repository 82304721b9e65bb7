//! Health-transition alerts
//!
//! The health registry emits an [`AlertEvent`] when a failure episode crosses
//! the alert threshold, repeats, escalates or recovers. Events are handed to
//! an [`AlertSink`] synchronously; the sink must never block the caller.

pub mod publisher;

pub use publisher::AlertPublisher;

use crate::sensors::{SensorId, SensorState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Why an alert was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Consecutive failures reached the alert threshold
    Threshold,
    /// Still failing, another repeat interval has passed
    Repeat,
    /// State changed (DEGRADED -> FAILED) after the threshold was reached
    Escalation,
    /// First successful read after an alerted episode
    Recovery,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlertKind::Threshold => "threshold",
            AlertKind::Repeat => "repeat",
            AlertKind::Escalation => "escalation",
            AlertKind::Recovery => "recovery",
        };
        f.write_str(name)
    }
}

/// A single health transition worth telling the hub about
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub event_id: Uuid,
    pub sensor_id: SensorId,
    pub kind: AlertKind,
    pub from_state: SensorState,
    pub to_state: SensorState,
    pub error_count: u32,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl AlertEvent {
    pub fn new<D: Into<String>>(
        sensor_id: SensorId,
        kind: AlertKind,
        from_state: SensorState,
        to_state: SensorState,
        error_count: u32,
        detail: D,
    ) -> Self {
        let detail = detail.into();
        let message = match kind {
            AlertKind::Threshold => format!(
                "sensor {sensor_id} {to_state} after {error_count} consecutive read failures: {detail}"
            ),
            AlertKind::Repeat => format!(
                "sensor {sensor_id} still {to_state} after {error_count} consecutive read failures: {detail}"
            ),
            AlertKind::Escalation => format!(
                "sensor {sensor_id} {from_state} -> {to_state} after {error_count} consecutive read failures: {detail}"
            ),
            AlertKind::Recovery => {
                format!("sensor {sensor_id} recovered from {from_state}: {detail}")
            }
        };

        Self {
            event_id: Uuid::new_v4(),
            sensor_id,
            kind,
            from_state,
            to_state,
            error_count,
            timestamp: Utc::now(),
            message,
        }
    }
}

/// Receiver of health transitions
pub trait AlertSink: Send + Sync {
    fn on_health_transition(&self, event: AlertEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_messages() {
        let id = SensorId::new("collector").unwrap();

        let event = AlertEvent::new(
            id.clone(),
            AlertKind::Threshold,
            SensorState::Healthy,
            SensorState::Degraded,
            5,
            "bus timeout",
        );
        assert_eq!(
            event.message,
            "sensor collector DEGRADED after 5 consecutive read failures: bus timeout"
        );

        let event = AlertEvent::new(
            id.clone(),
            AlertKind::Escalation,
            SensorState::Degraded,
            SensorState::Failed,
            9,
            "bus timeout",
        );
        assert!(event.message.contains("DEGRADED -> FAILED"));

        let event = AlertEvent::new(
            id,
            AlertKind::Recovery,
            SensorState::Failed,
            SensorState::Healthy,
            0,
            "read succeeded after 12 consecutive failures",
        );
        assert!(event.message.starts_with("sensor collector recovered from FAILED"));
    }

    #[test]
    fn test_event_ids_are_unique() {
        let id = SensorId::new("collector").unwrap();
        let a = AlertEvent::new(
            id.clone(),
            AlertKind::Repeat,
            SensorState::Failed,
            SensorState::Failed,
            15,
            "x",
        );
        let b = AlertEvent::new(
            id,
            AlertKind::Repeat,
            SensorState::Failed,
            SensorState::Failed,
            15,
            "x",
        );
        assert_ne!(a.event_id, b.event_id);
    }
}
