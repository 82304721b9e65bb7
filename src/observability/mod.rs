//! Observability: structured logging, process metrics and the diagnostics server

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{HealthCheck, HealthServer, HealthStatus};
pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{cycle_span, mqtt_span, sensor_span};
