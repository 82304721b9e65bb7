//! Mock implementations for testing
//!
//! Provides a scripted broker link, scripted sensors and recording sinks so
//! the resilience paths can be exercised without hardware or a broker.

use crate::alerts::{AlertEvent, AlertSink};
use crate::error::DaemonError;
use crate::sensors::{RawReading, SensorSource};
use crate::transport::mqtt::{
    BrokerAddress, ConnectResult, ConnectionCredentials, CredentialError, CredentialSource,
};
use crate::transport::{BrokerLink, LinkError, TelemetrySink};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub type PublishedMessage = (String, Vec<u8>);

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared knobs and recordings behind a [`MockBrokerLink`]
pub struct MockLinkControl {
    script: Mutex<VecDeque<ConnectResult>>,
    fallback: Mutex<ConnectResult>,
    connects: AtomicU32,
    disconnects: AtomicU32,
    connected: AtomicBool,
    publish_failure: Mutex<Option<String>>,
    hang_connects: AtomicBool,
    withhold_acks: AtomicBool,
    published: Mutex<Vec<PublishedMessage>>,
    unacknowledged: Mutex<Vec<PublishedMessage>>,
    secrets: Mutex<Vec<String>>,
    lost: Notify,
}

impl MockLinkControl {
    fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(ConnectResult::Success),
            connects: AtomicU32::new(0),
            disconnects: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            publish_failure: Mutex::new(None),
            hang_connects: AtomicBool::new(false),
            withhold_acks: AtomicBool::new(false),
            published: Mutex::new(Vec::new()),
            unacknowledged: Mutex::new(Vec::new()),
            secrets: Mutex::new(Vec::new()),
            lost: Notify::new(),
        }
    }

    /// Results for the next connect attempts, in order; afterwards the fallback applies
    pub fn script<I: IntoIterator<Item = ConnectResult>>(&self, results: I) {
        lock(&self.script).extend(results);
    }

    /// Result for every attempt once the script is exhausted (default SUCCESS)
    pub fn always(&self, result: ConnectResult) {
        lock(&self.script).clear();
        *lock(&self.fallback) = result;
    }

    /// Connect attempts never complete
    pub fn hang_connects(&self, hang: bool) {
        self.hang_connects.store(hang, Ordering::SeqCst);
    }

    /// Publishes on an established session fail
    pub fn fail_publishes(&self, fail: bool) {
        *lock(&self.publish_failure) = fail.then(|| "mock publish failure".to_string());
    }

    /// Publishes fail with the given broker-side reason
    pub fn fail_publishes_with<S: Into<String>>(&self, reason: S) {
        *lock(&self.publish_failure) = Some(reason.into());
    }

    /// Publishes are accepted but the broker never acknowledges them
    pub fn withhold_acks(&self, withhold: bool) {
        self.withhold_acks.store(withhold, Ordering::SeqCst);
    }

    /// Sever the current session as if the network went away
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.lost.notify_waiters();
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    pub fn published_topics(&self) -> Vec<String> {
        lock(&self.published)
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    /// Accepted publishes still waiting for an acknowledgement
    pub fn unacknowledged(&self) -> Vec<PublishedMessage> {
        lock(&self.unacknowledged).clone()
    }

    /// Secrets presented on each connect attempt, in order
    pub fn secrets_seen(&self) -> Vec<String> {
        lock(&self.secrets).clone()
    }

    /// Wait until at least `count` messages were published; false on timeout
    pub async fn wait_for_publishes(&self, count: usize, timeout: Duration) -> bool {
        Self::wait_until(timeout, || lock(&self.published).len() >= count)
            .await
    }

    /// Wait until at least `count` publishes are awaiting acknowledgement
    pub async fn wait_for_unacknowledged(&self, count: usize, timeout: Duration) -> bool {
        Self::wait_until(timeout, || lock(&self.unacknowledged).len() >= count)
            .await
    }

    async fn wait_until<F: Fn() -> bool>(timeout: Duration, done: F) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn next_result(&self) -> ConnectResult {
        lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| *lock(&self.fallback))
    }
}

/// Broker link with scripted connect results and recorded publishes
pub struct MockBrokerLink {
    control: Arc<MockLinkControl>,
}

impl MockBrokerLink {
    pub fn new() -> (Self, Arc<MockLinkControl>) {
        let control = Arc::new(MockLinkControl::new());
        (
            Self {
                control: control.clone(),
            },
            control,
        )
    }
}

#[async_trait]
impl BrokerLink for MockBrokerLink {
    async fn connect(&self, credentials: &ConnectionCredentials) -> ConnectResult {
        self.control.connects.fetch_add(1, Ordering::SeqCst);
        lock(&self.control.secrets).push(credentials.expose_secret().to_string());

        if self.control.hang_connects.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let result = self.control.next_result();
        self.control
            .connected
            .store(result.is_success(), Ordering::SeqCst);
        result
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), LinkError> {
        if !self.control.is_connected() {
            return Err(LinkError::NotConnected);
        }
        if let Some(reason) = lock(&self.control.publish_failure).clone() {
            return Err(LinkError::Publish(reason));
        }
        let message = (topic.to_string(), payload.to_vec());
        if self.control.withhold_acks.load(Ordering::SeqCst) {
            lock(&self.control.unacknowledged).push(message);
        } else {
            lock(&self.control.published).push(message);
        }
        Ok(())
    }

    async fn run_until_lost(&self) -> LinkError {
        loop {
            let notified = self.control.lost.notified();
            if !self.control.is_connected() {
                return LinkError::Lost("mock link dropped".to_string());
            }
            notified.await;
        }
    }

    async fn disconnect(&self) {
        self.control.disconnects.fetch_add(1, Ordering::SeqCst);
        self.control.connected.store(false, Ordering::SeqCst);
    }

    async fn reclaim_unacknowledged(&self) -> Vec<(String, Vec<u8>)> {
        if self.control.is_connected() {
            return Vec::new();
        }
        std::mem::take(&mut *lock(&self.control.unacknowledged))
    }
}

/// Sensor returning scripted raw readings
///
/// Once the script runs out the last reading repeats.
pub struct ScriptedSensor {
    script: Mutex<VecDeque<RawReading>>,
    last: Mutex<RawReading>,
    hang: AtomicBool,
    calls: AtomicU32,
}

impl ScriptedSensor {
    pub fn always(reading: RawReading) -> Self {
        Self::sequence(vec![reading])
    }

    pub fn sequence(readings: Vec<RawReading>) -> Self {
        let last = readings.last().cloned().unwrap_or(Ok(0.0));
        Self {
            script: Mutex::new(readings.into()),
            last: Mutex::new(last),
            hang: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        }
    }

    /// A read that never returns
    pub fn hanging() -> Self {
        let sensor = Self::always(Ok(0.0));
        sensor.set_hanging(true);
        sensor
    }

    pub fn set_hanging(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    /// Replace the script with a single repeating reading
    pub fn set(&self, reading: RawReading) {
        lock(&self.script).clear();
        *lock(&self.last) = reading;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SensorSource for ScriptedSensor {
    async fn read_raw(&self) -> RawReading {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let next = lock(&self.script).pop_front();
        match next {
            Some(reading) => {
                *lock(&self.last) = reading.clone();
                reading
            }
            None => lock(&self.last).clone(),
        }
    }
}

/// Alert sink that keeps every event
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    events: Mutex<Vec<AlertEvent>>,
}

impl RecordingAlertSink {
    pub fn events(&self) -> Vec<AlertEvent> {
        lock(&self.events).clone()
    }
}

impl AlertSink for RecordingAlertSink {
    fn on_health_transition(&self, event: AlertEvent) {
        lock(&self.events).push(event);
    }
}

/// Telemetry sink that records hand-offs instead of publishing
#[derive(Debug, Default)]
pub struct RecordingTelemetrySink {
    published: Mutex<Vec<PublishedMessage>>,
    should_fail: AtomicBool,
}

impl RecordingTelemetrySink {
    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }
}

impl TelemetrySink for RecordingTelemetrySink {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), DaemonError> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(DaemonError::publish_failed(topic, "mock sink failure"));
        }
        lock(&self.published).push((topic.to_string(), payload));
        Ok(())
    }
}

/// Credential source whose secret can be swapped between loads
#[derive(Clone)]
pub struct SwappableCredentials {
    broker_url: String,
    principal: String,
    secret: Arc<Mutex<String>>,
}

impl SwappableCredentials {
    pub fn new<B: Into<String>, P: Into<String>, S: Into<String>>(
        broker_url: B,
        principal: P,
        secret: S,
    ) -> Self {
        Self {
            broker_url: broker_url.into(),
            principal: principal.into(),
            secret: Arc::new(Mutex::new(secret.into())),
        }
    }

    pub fn set_secret<S: Into<String>>(&self, secret: S) {
        *lock(&self.secret) = secret.into();
    }
}

impl CredentialSource for SwappableCredentials {
    fn load(&self) -> Result<ConnectionCredentials, CredentialError> {
        let broker = BrokerAddress::parse(&self.broker_url)?;
        let secret = lock(&self.secret).clone();
        ConnectionCredentials::new(broker, self.principal.clone(), secret)
    }
}
