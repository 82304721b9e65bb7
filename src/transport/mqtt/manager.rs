//! Connection context: owns the broker link and its state machine
//!
//! [`ConnectionManager`] runs as a single task. Everything else talks to it
//! through a [`ConnectionHandle`]: publish requests go in over a bounded
//! `mpsc` channel, status comes out over a `watch` channel, shutdown and
//! credential reload are signals. State transitions are decided by the pure
//! functions in [`LinkMonitor`] and applied only here.

use super::connection::{ConnectResult, ConnectionState, ReconnectConfig};
use super::credentials::{ConnectionCredentials, CredentialSource};
use super::link_monitor::{ConnectionEvent, LinkMonitor, ReconnectionDecision};
use super::publish_queue::{PublishQueue, QueuedPublish};
use crate::config::ConfigError;
use crate::error::{DaemonError, FailureCategory};
use crate::mqtt_span;
use crate::observability::metrics;
use crate::transport::{BrokerLink, LinkError, TelemetrySink};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

/// Exported view of the connection context
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub principal: String,
    pub broker: String,
    pub last_result: Option<ConnectResult>,
    pub failure: Option<FailureCategory>,
    pub connect_attempts: u64,
    pub auth_rejections: u32,
    pub queued: usize,
    pub dropped: u64,
    /// Set while credentials are rejected; the host runs without telemetry
    pub persistent_failure: bool,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectionSnapshot {
    /// Typed error for the current failure, if any
    pub fn failure_error(&self) -> Option<DaemonError> {
        match self.failure? {
            FailureCategory::ConnectionAuthFailure => Some(DaemonError::AuthRejected {
                principal: self.principal.clone(),
                classification: self.last_result.unwrap_or(ConnectResult::AuthFailed),
            }),
            FailureCategory::ConnectionTransientFailure => Some(DaemonError::NetworkFailure {
                classification: self.last_result.unwrap_or(ConnectResult::Unknown),
            }),
            _ => None,
        }
    }
}

/// Cloneable handle to the connection context
#[derive(Clone)]
pub struct ConnectionHandle {
    requests: mpsc::Sender<QueuedPublish>,
    status: watch::Receiver<ConnectionSnapshot>,
    shutdown: Arc<watch::Sender<bool>>,
    reload: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn is_persistent_failure(&self) -> bool {
        self.status.borrow().persistent_failure
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.status.clone()
    }

    /// Re-read the credential source; leaves AUTH_FAILED, reconnects when connected
    pub fn reload_credentials(&self) {
        info!("Credential reload requested");
        self.reload.notify_one();
    }

    /// Ask the connection context to stop; idempotent
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait until the status satisfies `predicate`, or give up after `timeout`
    pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> Option<ConnectionSnapshot>
    where
        F: Fn(&ConnectionSnapshot) -> bool,
    {
        let mut rx = self.status.clone();
        tokio::time::timeout(timeout, async move {
            rx.wait_for(|snapshot| predicate(snapshot))
                .await
                .ok()
                .map(|snapshot| snapshot.clone())
        })
        .await
        .ok()
        .flatten()
    }
}

impl TelemetrySink for ConnectionHandle {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), DaemonError> {
        match self
            .requests
            .try_send(QueuedPublish::new(topic.to_string(), payload))
        {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                metrics().publish_dropped();
                warn!(topic, "Publish request buffer full, message dropped");
                Err(DaemonError::publish_failed(topic, "request buffer full"))
            }
            Err(TrySendError::Closed(_)) => {
                metrics().publish_dropped();
                warn!(topic, "Connection context stopped, message dropped");
                Err(DaemonError::publish_failed(
                    topic,
                    "connection context stopped",
                ))
            }
        }
    }
}

enum Flow {
    Continue,
    Shutdown,
}

fn shutdown_signalled(
    changed: Result<(), watch::error::RecvError>,
    rx: &watch::Receiver<bool>,
) -> bool {
    changed.is_err() || *rx.borrow()
}

/// Authenticated, auto-reconnecting broker connection
pub struct ConnectionManager<L: BrokerLink> {
    link: L,
    source: Arc<dyn CredentialSource>,
    credentials: ConnectionCredentials,
    config: ReconnectConfig,
    state: ConnectionState,
    queue: PublishQueue,
    requests: mpsc::Receiver<QueuedPublish>,
    status_tx: watch::Sender<ConnectionSnapshot>,
    shutdown_rx: watch::Receiver<bool>,
    reload: Arc<Notify>,
    failed_attempts: u32,
    auth_rejections: u32,
    connect_attempts: u64,
    last_result: Option<ConnectResult>,
    last_error: Option<String>,
}

impl<L: BrokerLink> ConnectionManager<L> {
    /// Validate configuration and credentials without touching the network
    pub fn initialize(
        source: Arc<dyn CredentialSource>,
        config: ReconnectConfig,
        link: L,
    ) -> Result<(Self, ConnectionHandle), DaemonError> {
        LinkMonitor::validate_connection_config(&config)
            .map_err(|e| DaemonError::Config(ConfigError::InvalidConfig(e)))?;
        let credentials = source.load()?;

        let (request_tx, requests) = mpsc::channel(config.request_buffer);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reload = Arc::new(Notify::new());
        let queue = PublishQueue::new(config.queue_capacity);

        let initial = ConnectionSnapshot {
            state: ConnectionState::Disconnected,
            principal: credentials.principal().to_string(),
            broker: credentials.broker().to_string(),
            last_result: None,
            failure: None,
            connect_attempts: 0,
            auth_rejections: 0,
            queued: 0,
            dropped: 0,
            persistent_failure: false,
            last_error: None,
            updated_at: Utc::now(),
        };
        let (status_tx, status_rx) = watch::channel(initial);

        info!(
            principal = %credentials.principal(),
            broker = %credentials.broker(),
            "Connection manager initialized"
        );

        let manager = Self {
            link,
            source,
            credentials,
            config,
            state: ConnectionState::Disconnected,
            queue,
            requests,
            status_tx,
            shutdown_rx,
            reload: reload.clone(),
            failed_attempts: 0,
            auth_rejections: 0,
            connect_attempts: 0,
            last_result: None,
            last_error: None,
        };

        let handle = ConnectionHandle {
            requests: request_tx,
            status: status_rx,
            shutdown: Arc::new(shutdown_tx),
            reload,
        };

        Ok((manager, handle))
    }

    /// Run the connection context on its own task
    pub fn spawn(self) -> JoinHandle<()> {
        let span = mqtt_span!(principal = %self.credentials.principal());
        tokio::spawn(self.run().instrument(span))
    }

    pub async fn run(mut self) {
        info!("Connection context started");

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let flow = match self.state {
                ConnectionState::Disconnected | ConnectionState::Connecting => {
                    self.establish().await
                }
                ConnectionState::Connected => self.serve_connected().await,
                ConnectionState::AuthFailed => self.wait_for_reload().await,
            };

            if let Flow::Shutdown = flow {
                break;
            }
        }

        self.stop().await;
    }

    /// One connect attempt, followed by backoff on transient failure
    async fn establish(&mut self) -> Flow {
        match self.source.load() {
            Ok(credentials) => self.credentials = credentials,
            Err(e) => {
                error!(
                    severity = "CRITICAL",
                    principal = %self.credentials.principal(),
                    error = %e,
                    "Broker credentials invalid; telemetry disabled until credentials are reloaded"
                );
                self.last_error = Some(e.to_string());
                self.transition(ConnectionEvent::CredentialsRejected);
                return Flow::Continue;
            }
        }

        self.transition(ConnectionEvent::AttemptStarted);
        self.connect_attempts += 1;
        metrics().mqtt_connection_attempt();
        debug!(
            attempt = self.connect_attempts,
            broker = %self.credentials.broker(),
            "Connecting to broker"
        );

        let result = {
            let attempt = tokio::time::timeout(
                self.config.connect_timeout,
                self.link.connect(&self.credentials),
            );
            tokio::pin!(attempt);

            loop {
                tokio::select! {
                    changed = self.shutdown_rx.changed() => {
                        if shutdown_signalled(changed, &self.shutdown_rx) {
                            info!("Shutdown signal received during connect attempt");
                            return Flow::Shutdown;
                        }
                    }
                    request = self.requests.recv() => match request {
                        Some(request) => {
                            if self.queue.push(request).is_some() {
                                metrics().publish_dropped();
                            }
                            self.publish_status();
                        }
                        None => return Flow::Shutdown,
                    },
                    outcome = &mut attempt => {
                        break outcome.unwrap_or_else(|_| {
                            debug!("Connect attempt timed out");
                            ConnectResult::Unavailable
                        });
                    }
                }
            }
        };

        self.last_result = Some(result);
        self.on_connect_result(result).await
    }

    async fn on_connect_result(&mut self, result: ConnectResult) -> Flow {
        if result.is_success() {
            self.failed_attempts = 0;
            self.auth_rejections = 0;
            self.last_error = None;
            metrics().mqtt_connection_established();
            self.transition(ConnectionEvent::ConnAckReceived);
            return Flow::Continue;
        }

        metrics().mqtt_connection_failed();
        self.failed_attempts += 1;

        if result.is_auth_rejection() {
            self.auth_rejections += 1;
            self.last_error = Some(format!("broker rejected credentials: {result}"));

            if !LinkMonitor::should_retry_after_rejection(self.auth_rejections, &self.config) {
                error!(
                    severity = "CRITICAL",
                    principal = %self.credentials.principal(),
                    broker = %self.credentials.broker(),
                    classification = %result,
                    rejections = self.auth_rejections,
                    "Broker rejected credentials; telemetry disabled until credentials are reloaded"
                );
                self.transition(ConnectionEvent::CredentialsRejected);
                return Flow::Continue;
            }

            error!(
                principal = %self.credentials.principal(),
                classification = %result,
                rejections = self.auth_rejections,
                max_attempts = self.config.auth_max_attempts,
                "Broker rejected credentials, retrying"
            );
        } else {
            self.last_error = Some(format!("connect failed: {result}"));
            match result {
                ConnectResult::Unavailable => warn!(
                    principal = %self.credentials.principal(),
                    broker = %self.credentials.broker(),
                    classification = %result,
                    attempt = self.failed_attempts,
                    "Broker unavailable"
                ),
                _ => error!(
                    principal = %self.credentials.principal(),
                    broker = %self.credentials.broker(),
                    classification = %result,
                    attempt = self.failed_attempts,
                    "Broker connect attempt failed"
                ),
            }
        }

        self.transition(ConnectionEvent::AttemptFailed);
        self.back_off().await
    }

    async fn back_off(&mut self) -> Flow {
        let decision = LinkMonitor::should_attempt_reconnection(
            self.failed_attempts,
            &self.config,
            *self.shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                info!(
                    attempt,
                    delay_ms,
                    queued = self.queue.len(),
                    "Reconnecting after backoff"
                );
                self.interruptible_sleep(Duration::from_millis(delay_ms))
                    .await
            }
            ReconnectionDecision::AbortShutdownRequested => Flow::Shutdown,
        }
    }

    /// Sleep while still accepting publishes; cut short by shutdown or reload
    async fn interruptible_sleep(&mut self, delay: Duration) -> Flow {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if shutdown_signalled(changed, &self.shutdown_rx) {
                        info!("Shutdown signal received during reconnection delay, stopping");
                        return Flow::Shutdown;
                    }
                }
                request = self.requests.recv() => match request {
                    Some(request) => self.enqueue(request),
                    None => return Flow::Shutdown,
                },
                _ = self.reload.notified() => {
                    info!("Credentials reloaded, reconnecting now");
                    return Flow::Continue;
                }
                _ = &mut sleep => return Flow::Continue,
            }
        }
    }

    async fn serve_connected(&mut self) -> Flow {
        if let Some(lost) = self.flush_queue().await {
            return self.on_link_lost(lost).await;
        }

        let period = self.config.retry_interval;
        let mut retry = tokio::time::interval_at(Instant::now() + period, period);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let lost = tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if shutdown_signalled(changed, &self.shutdown_rx) {
                        return Flow::Shutdown;
                    }
                    None
                }
                request = self.requests.recv() => match request {
                    Some(request) => self.dispatch(request).await,
                    None => return Flow::Shutdown,
                },
                lost = self.link.run_until_lost() => Some(lost),
                _ = retry.tick() => self.flush_queue().await,
                _ = self.reload.notified() => {
                    info!("Credentials reloaded, re-establishing session");
                    self.link.disconnect().await;
                    self.requeue_unacknowledged().await;
                    self.transition(ConnectionEvent::CredentialsReloaded);
                    return Flow::Continue;
                }
            };

            if let Some(lost) = lost {
                return self.on_link_lost(lost).await;
            }
        }
    }

    async fn wait_for_reload(&mut self) -> Flow {
        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if shutdown_signalled(changed, &self.shutdown_rx) {
                        return Flow::Shutdown;
                    }
                }
                request = self.requests.recv() => match request {
                    Some(request) => self.enqueue(request),
                    None => return Flow::Shutdown,
                },
                _ = self.reload.notified() => {
                    self.auth_rejections = 0;
                    self.failed_attempts = 0;
                    self.transition(ConnectionEvent::CredentialsReloaded);
                    return Flow::Continue;
                }
            }
        }
    }

    /// Send directly when nothing is waiting, otherwise keep arrival order
    async fn dispatch(&mut self, request: QueuedPublish) -> Option<LinkError> {
        if !self.queue.is_empty() {
            self.enqueue(request);
            return None;
        }

        match self.link.publish(&request.topic, &request.payload).await {
            Ok(()) => {
                metrics().mqtt_message_published();
                debug!(topic = %request.topic, "Published");
                None
            }
            Err(e) => {
                metrics().mqtt_publish_failed();
                warn!(
                    topic = %request.topic,
                    error = %self.credentials.redact(&e.to_string()),
                    "Publish failed, queued for retry"
                );
                self.enqueue(request);
                e.is_disconnect().then_some(e)
            }
        }
    }

    /// Deliver queued messages in order; stops at the first failure
    async fn flush_queue(&mut self) -> Option<LinkError> {
        let mut delivered = 0usize;

        while let Some(next) = self.queue.front() {
            match self.link.publish(&next.topic, &next.payload).await {
                Ok(()) => {
                    self.queue.pop_front();
                    delivered += 1;
                    metrics().mqtt_message_published();
                }
                Err(e) => {
                    metrics().mqtt_publish_failed();
                    warn!(
                        queued = self.queue.len(),
                        error = %self.credentials.redact(&e.to_string()),
                        "Queued publish failed, will retry"
                    );
                    self.publish_status();
                    return e.is_disconnect().then_some(e);
                }
            }
        }

        if delivered > 0 {
            info!(delivered, "Delivered queued publishes");
            self.publish_status();
        }
        None
    }

    fn enqueue(&mut self, request: QueuedPublish) {
        debug!(topic = %request.topic, queued = self.queue.len() + 1, "Publish queued");
        if self.queue.push(request).is_some() {
            metrics().publish_dropped();
        }
        self.publish_status();
    }

    async fn on_link_lost(&mut self, lost: LinkError) -> Flow {
        metrics().mqtt_connection_lost();
        let reason = self.credentials.redact(&lost.to_string());
        self.requeue_unacknowledged().await;
        warn!(error = %reason, queued = self.queue.len(), "Broker link lost");
        self.last_error = Some(reason);
        self.transition(ConnectionEvent::LinkLost);
        Flow::Continue
    }

    /// Messages the ended session never got acknowledged go back to the queue head
    async fn requeue_unacknowledged(&mut self) {
        let reclaimed: Vec<QueuedPublish> = self
            .link
            .reclaim_unacknowledged()
            .await
            .into_iter()
            .map(|(topic, payload)| QueuedPublish::new(topic, payload))
            .collect();
        if reclaimed.is_empty() {
            return;
        }

        let count = reclaimed.len();
        metrics().publishes_requeued(count as u64);
        for _ in 0..self.queue.requeue_front(reclaimed) {
            metrics().publish_dropped();
        }
        warn!(
            requeued = count,
            queued = self.queue.len(),
            "Publishes never acknowledged by the broker, queued again"
        );
        self.publish_status();
    }

    async fn stop(&mut self) {
        if self.state == ConnectionState::Connected {
            self.flush_queue().await;
        }

        self.link.disconnect().await;
        self.requeue_unacknowledged().await;

        if !self.queue.is_empty() {
            metrics().undelivered_at_shutdown(self.queue.len() as u64);
            warn!(
                undelivered = self.queue.len(),
                "Stopping with undelivered publishes, dropping them"
            );
        }

        self.transition(ConnectionEvent::Shutdown);
        info!("Connection context stopped");
    }

    fn transition(&mut self, event: ConnectionEvent) {
        let next = LinkMonitor::determine_next_state(self.state, &event);
        if next != self.state {
            LinkMonitor::log_state_transition(self.state, next);
            self.state = next;
        }
        self.publish_status();
    }

    fn failure_category(&self) -> Option<FailureCategory> {
        match self.state {
            ConnectionState::AuthFailed => Some(FailureCategory::ConnectionAuthFailure),
            ConnectionState::Connected => None,
            _ if self.last_error.is_some() => Some(FailureCategory::ConnectionTransientFailure),
            _ => None,
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(ConnectionSnapshot {
            state: self.state,
            principal: self.credentials.principal().to_string(),
            broker: self.credentials.broker().to_string(),
            last_result: self.last_result,
            failure: self.failure_category(),
            connect_attempts: self.connect_attempts,
            auth_rejections: self.auth_rejections,
            queued: self.queue.len(),
            dropped: self.queue.dropped(),
            persistent_failure: self.state == ConnectionState::AuthFailed,
            last_error: self.last_error.clone(),
            updated_at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{MockBrokerLink, SwappableCredentials};
    use crate::transport::mqtt::StaticCredentials;

    fn source(secret: &str) -> Arc<dyn CredentialSource> {
        Arc::new(StaticCredentials::new("mqtt://hub.local", "pump", secret))
    }

    fn fast_config() -> ReconnectConfig {
        ReconnectConfig {
            first_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            connect_timeout: Duration::from_millis(500),
            retry_interval: Duration::from_millis(200),
            queue_capacity: 4,
            ..ReconnectConfig::default()
        }
    }

    #[tokio::test]
    async fn test_initialize_rejects_empty_secret_without_network() {
        let (link, control) = MockBrokerLink::new();
        let result = ConnectionManager::initialize(source(""), fast_config(), link);

        let err = result.err().expect("empty secret must fail");
        assert_eq!(err.category(), FailureCategory::Configuration);
        assert_eq!(control.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_initialize_rejects_invalid_config() {
        let (link, _control) = MockBrokerLink::new();
        let config = ReconnectConfig {
            auth_max_attempts: 0,
            ..fast_config()
        };
        assert!(ConnectionManager::initialize(source("hunter2"), config, link).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_and_publishes() {
        let (link, control) = MockBrokerLink::new();
        let (manager, handle) =
            ConnectionManager::initialize(source("hunter2"), fast_config(), link).unwrap();
        let task = manager.spawn();

        handle
            .wait_for(Duration::from_secs(5), |s| s.state == ConnectionState::Connected)
            .await
            .expect("connected");

        handle.publish("solar/sensor_health", b"{}".to_vec()).unwrap();
        control.wait_for_publishes(1, Duration::from_secs(5)).await;
        assert_eq!(control.published()[0].0, "solar/sensor_health");

        handle.shutdown();
        task.await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert!(control.disconnect_count() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_broker_retries_with_backoff() {
        let (link, control) = MockBrokerLink::new();
        control.script([
            ConnectResult::Unavailable,
            ConnectResult::Unavailable,
            ConnectResult::Success,
        ]);
        let (manager, handle) =
            ConnectionManager::initialize(source("hunter2"), fast_config(), link).unwrap();
        let started = Instant::now();
        let task = manager.spawn();

        let snapshot = handle
            .wait_for(Duration::from_secs(5), |s| s.state == ConnectionState::Connected)
            .await
            .expect("eventually connected");

        assert_eq!(snapshot.connect_attempts, 3);
        // 100ms after the first failure, 200ms after the second
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(snapshot.failure, None);

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_rejection_is_terminal() {
        let (link, control) = MockBrokerLink::new();
        control.script([ConnectResult::AuthFailed]);
        let (manager, handle) =
            ConnectionManager::initialize(source("hunter2"), fast_config(), link).unwrap();
        let task = manager.spawn();

        let snapshot = handle
            .wait_for(Duration::from_secs(5), |s| s.persistent_failure)
            .await
            .expect("auth failure surfaced");
        assert_eq!(snapshot.state, ConnectionState::AuthFailed);
        assert_eq!(snapshot.failure, Some(FailureCategory::ConnectionAuthFailure));
        assert!(matches!(
            snapshot.failure_error(),
            Some(DaemonError::AuthRejected { .. })
        ));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(control.connect_count(), 1);

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_leaves_auth_failed() {
        let (link, control) = MockBrokerLink::new();
        control.script([ConnectResult::NotAuthorized, ConnectResult::Success]);
        let credentials = SwappableCredentials::new("mqtt://hub.local", "pump", "old-secret");
        let (manager, handle) = ConnectionManager::initialize(
            Arc::new(credentials.clone()),
            fast_config(),
            link,
        )
        .unwrap();
        let task = manager.spawn();

        handle
            .wait_for(Duration::from_secs(5), |s| s.state == ConnectionState::AuthFailed)
            .await
            .expect("auth failed");

        credentials.set_secret("new-secret");
        handle.reload_credentials();

        handle
            .wait_for(Duration::from_secs(5), |s| s.state == ConnectionState::Connected)
            .await
            .expect("reconnected after reload");
        assert_eq!(control.secrets_seen(), vec!["old-secret", "new-secret"]);

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff() {
        let (link, control) = MockBrokerLink::new();
        control.always(ConnectResult::Unavailable);
        let config = ReconnectConfig {
            first_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60),
            ..fast_config()
        };
        let (manager, handle) =
            ConnectionManager::initialize(source("hunter2"), config, link).unwrap();
        let task = manager.spawn();

        handle
            .wait_for(Duration::from_secs(5), |s| s.connect_attempts == 1 && s.state == ConnectionState::Disconnected)
            .await
            .expect("first attempt failed");

        let started = Instant::now();
        handle.shutdown();
        task.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(control.connect_count(), 1);
    }
}
