//! Alert and health-summary publishing
//!
//! The publisher formats payloads and hands them to a [`TelemetrySink`]. It
//! keeps no retry state of its own: when the broker link is down the sink
//! queues the message, and delivery order follows hand-off order.

use super::{AlertEvent, AlertSink};
use crate::error::DaemonError;
use crate::observability::metrics::metrics;
use crate::protocol::{AlertPayload, HealthSummaryPayload};
use crate::sensors::HealthSummary;
use crate::transport::mqtt::TopicBuilder;
use crate::transport::TelemetrySink;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Converts health transitions into broker messages
pub struct AlertPublisher {
    daemon_id: String,
    topics: TopicBuilder,
    sink: Arc<dyn TelemetrySink>,
}

impl AlertPublisher {
    pub fn new(daemon_id: &str, topics: TopicBuilder, sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            daemon_id: daemon_id.to_string(),
            topics,
            sink,
        }
    }

    /// Publish a single alert on `{root}/sensor_alerts/{sensor_id}`
    pub fn publish_alert(&self, event: &AlertEvent) -> Result<(), DaemonError> {
        let topic = self.topics.alert_topic(&event.sensor_id);
        let payload = serde_json::to_vec(&AlertPayload::from(event))
            .map_err(|e| DaemonError::publish_failed(&topic, format!("serialization: {e}")))?;
        self.sink.publish(&topic, payload)
    }

    /// Publish the aggregate summary on `{root}/sensor_health`
    pub fn publish_summary(&self, summary: HealthSummary) -> Result<(), DaemonError> {
        let topic = self.topics.health_topic();
        let payload = HealthSummaryPayload::new(&self.daemon_id, summary);
        let bytes = serde_json::to_vec(&payload)
            .map_err(|e| DaemonError::publish_failed(&topic, format!("serialization: {e}")))?;
        self.sink.publish(&topic, bytes)?;
        debug!(
            topic = %topic,
            healthy = payload.healthy,
            degraded = payload.degraded,
            failed = payload.failed,
            "Health summary handed to connection manager"
        );
        Ok(())
    }
}

impl AlertSink for AlertPublisher {
    fn on_health_transition(&self, event: AlertEvent) {
        match self.publish_alert(&event) {
            Ok(()) => {
                metrics().alert_raised();
                info!(
                    sensor = %event.sensor_id,
                    kind = %event.kind,
                    from = %event.from_state,
                    to = %event.to_state,
                    error_count = event.error_count,
                    "Sensor alert published"
                );
            }
            Err(e) => {
                error!(
                    sensor = %event.sensor_id,
                    kind = %event.kind,
                    error = %e,
                    "Failed to hand sensor alert to connection manager"
                );
            }
        }
    }
}
