//! solard - resilience layer of a solar water-heating controller
//!
//! Reads temperature probes with bounded retries, tracks per-sensor health,
//! and reports health transitions to a home-automation hub over an
//! authenticated, auto-reconnecting MQTT link.
//!
//! # Overview
//!
//! - [`sensors`]: raw sensor sources, the [`RobustSensorReader`] and the
//!   [`SensorHealthMonitor`] registry
//! - [`alerts`]: health-transition events and the [`AlertPublisher`]
//! - [`transport`]: the broker link abstraction and the MQTT
//!   [`ConnectionManager`]
//! - [`control`]: the per-cycle [`ControlLoopAdapter`] and the control loop
//! - [`observability`]: structured logging, metrics and the diagnostics server
//!
//! # Quick Start
//!
//! ```rust
//! use solard::sensors::{HealthPolicy, SensorHealthMonitor, SensorId, SensorState};
//! use solard::transport::mqtt::TopicBuilder;
//!
//! let collector = SensorId::new("collector").unwrap();
//! let topics = TopicBuilder::new("solar");
//! assert_eq!(topics.alert_topic(&collector), "solar/sensor_alerts/collector");
//!
//! // State is derived from the error count and the age of the last good value
//! let policy = HealthPolicy::default();
//! assert_eq!(policy.derive_state(0, None), SensorState::Healthy);
//! assert_eq!(policy.derive_state(3, None), SensorState::Failed);
//!
//! let monitor = SensorHealthMonitor::new(policy);
//! assert!(monitor.get_health_summary().is_empty());
//! ```

pub mod alerts;
pub mod config;
pub mod control;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod sensors;
pub mod testing;
pub mod transport;

pub use alerts::{AlertEvent, AlertKind, AlertPublisher, AlertSink};
pub use config::{ConfigError, DaemonConfig};
pub use control::{ControlAlgorithm, ControlLoop, ControlLoopAdapter};
pub use error::{DaemonError, DaemonResult, FailureCategory};
pub use sensors::{RobustSensorReader, SensorHealthMonitor, SensorId, SensorState};
pub use transport::mqtt::{ConnectionHandle, ConnectionManager, ConnectionState, MqttLink};
