//! Diagnostics HTTP server
//!
//! Read-only JSON export of sensor health, connection state and process
//! metrics. `/health` answers 503 while any sensor is not HEALTHY or the
//! broker link is not CONNECTED, so a supervisor can alert on it.

use crate::observability::metrics::metrics;
use crate::sensors::{SensorHealthMonitor, SensorState};
use crate::transport::mqtt::{ConnectionSnapshot, ConnectionState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// HTTP diagnostics server
pub struct HealthServer {
    daemon_id: String,
    monitor: SensorHealthMonitor,
    connection: watch::Receiver<ConnectionSnapshot>,
}

/// Result of one named check
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthCheck {
    pub status: String,
    pub message: String,
}

impl HealthCheck {
    fn healthy<M: Into<String>>(message: M) -> Self {
        Self {
            status: "healthy".to_string(),
            message: message.into(),
        }
    }

    fn degraded<M: Into<String>>(message: M) -> Self {
        Self {
            status: "degraded".to_string(),
            message: message.into(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub daemon_id: String,
    pub checks: BTreeMap<String, HealthCheck>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ApiDocumentationResponse {
    endpoints: BTreeMap<&'static str, &'static str>,
}

impl HealthServer {
    pub fn new(
        daemon_id: String,
        monitor: SensorHealthMonitor,
        connection: watch::Receiver<ConnectionSnapshot>,
    ) -> Self {
        Self {
            daemon_id,
            monitor,
            connection,
        }
    }

    /// Sensor check (pure function)
    fn check_sensors(monitor: &SensorHealthMonitor) -> HealthCheck {
        let summary = monitor.get_health_summary();
        if summary.is_empty() {
            return HealthCheck::healthy("no readings yet");
        }

        let unhealthy: Vec<String> = summary
            .iter()
            .filter(|(_, snapshot)| snapshot.state != SensorState::Healthy)
            .map(|(id, snapshot)| format!("{id}={}", snapshot.state))
            .collect();

        if unhealthy.is_empty() {
            HealthCheck::healthy(format!("{} sensors healthy", summary.len()))
        } else {
            HealthCheck::degraded(unhealthy.join(", "))
        }
    }

    /// Broker link check (pure function)
    fn check_connection(snapshot: &ConnectionSnapshot) -> HealthCheck {
        match snapshot.state {
            ConnectionState::Connected => HealthCheck::healthy(format!(
                "connected to {} as {}",
                snapshot.broker, snapshot.principal
            )),
            ConnectionState::AuthFailed => HealthCheck::degraded(format!(
                "credentials for {} rejected; telemetry disabled",
                snapshot.principal
            )),
            state => HealthCheck::degraded(format!(
                "{state}, {} publishes queued",
                snapshot.queued
            )),
        }
    }

    pub fn get_health_status(&self) -> HealthStatus {
        let mut checks = BTreeMap::new();
        checks.insert("sensors".to_string(), Self::check_sensors(&self.monitor));
        checks.insert(
            "mqtt".to_string(),
            Self::check_connection(&self.connection.borrow()),
        );

        let status = if checks.values().all(HealthCheck::is_healthy) {
            "healthy"
        } else {
            "degraded"
        };

        HealthStatus {
            status: status.to_string(),
            daemon_id: self.daemon_id.clone(),
            checks,
            timestamp: Utc::now(),
        }
    }

    /// All diagnostics routes
    pub fn routes(self: Arc<Self>) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        let health_server = self.clone();
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || {
                let status = health_server.get_health_status();
                let code = if status.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                warp::reply::with_status(warp::reply::json(&status), code)
            });

        let sensors_server = self.clone();
        let sensors_route = warp::path("sensors")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || warp::reply::json(&sensors_server.monitor.get_health_summary()));

        let connection_server = self.clone();
        let connection_route = warp::path("connection")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || warp::reply::json(&*connection_server.connection.borrow()));

        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().get_metrics()));

        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: Utc::now(),
                })
            });

        let root_route = warp::path::end().and(warp::get()).map(|| {
            let endpoints = BTreeMap::from([
                ("/health", "Overall health, 503 when degraded"),
                ("/sensors", "Per-sensor health snapshot"),
                ("/connection", "Broker connection snapshot"),
                ("/metrics", "Process metrics"),
                ("/live", "Liveness probe"),
            ]);
            warp::reply::json(&ApiDocumentationResponse { endpoints })
        });

        health_route
            .or(sensors_route)
            .or(connection_route)
            .or(metrics_route)
            .or(live_route)
            .or(root_route)
    }

    /// Bind and serve until `shutdown` resolves
    pub fn bind(
        self: Arc<Self>,
        addr: SocketAddr,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(SocketAddr, impl Future<Output = ()>), warp::Error> {
        let routes = self.routes();
        let (bound, server) =
            warp::serve(routes).try_bind_with_graceful_shutdown(addr, shutdown)?;
        tracing::info!(addr = %bound, "Diagnostics server listening");
        Ok((bound, server))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::SensorId;
    use chrono::Utc;

    fn snapshot(state: ConnectionState) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state,
            principal: "pump".to_string(),
            broker: "hub.local:1883".to_string(),
            last_result: None,
            failure: None,
            connect_attempts: 1,
            auth_rejections: 0,
            queued: 2,
            dropped: 0,
            persistent_failure: state == ConnectionState::AuthFailed,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    fn server(state: ConnectionState) -> (Arc<HealthServer>, SensorHealthMonitor) {
        let monitor = SensorHealthMonitor::default();
        let (_tx, rx) = watch::channel(snapshot(state));
        let server = Arc::new(HealthServer::new("rig".to_string(), monitor.clone(), rx));
        (server, monitor)
    }

    #[test]
    fn test_check_connection() {
        assert!(HealthServer::check_connection(&snapshot(ConnectionState::Connected)).is_healthy());
        let check = HealthServer::check_connection(&snapshot(ConnectionState::AuthFailed));
        assert!(!check.is_healthy());
        assert!(check.message.contains("pump"));
        let check = HealthServer::check_connection(&snapshot(ConnectionState::Disconnected));
        assert!(check.message.contains("2 publishes queued"));
    }

    #[tokio::test]
    async fn test_health_endpoint_reports_connection() {
        let (server, _monitor) = server(ConnectionState::Connected);
        let routes = server.routes();

        let resp = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let (server, _monitor) = self::server(ConnectionState::Disconnected);
        let resp = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&server.routes())
            .await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["checks"]["mqtt"]["status"], "degraded");
    }

    #[tokio::test]
    async fn test_sensors_endpoint_exports_summary() {
        let (server, monitor) = server(ConnectionState::Connected);
        let id = SensorId::new("collector").unwrap();
        monitor.record_success(&id, 61.5, Utc::now(), tokio::time::Instant::now());

        let resp = warp::test::request()
            .method("GET")
            .path("/sensors")
            .reply(&server.routes())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["collector"]["state"], "HEALTHY");
        assert_eq!(body["collector"]["last_good_value"], 61.5);
    }

    #[tokio::test]
    async fn test_connection_endpoint_has_no_secret_fields() {
        let (server, _monitor) = server(ConnectionState::AuthFailed);
        let resp = warp::test::request()
            .method("GET")
            .path("/connection")
            .reply(&server.routes())
            .await;
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["state"], "AUTH_FAILED");
        assert_eq!(body["persistent_failure"], true);
        assert!(body.get("secret").is_none());
    }

    #[tokio::test]
    async fn test_live_and_unknown_routes() {
        let (server, _monitor) = server(ConnectionState::Connected);
        let routes = server.routes();

        let resp = warp::test::request().path("/live").reply(&routes).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = warp::test::request().path("/nope").reply(&routes).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
