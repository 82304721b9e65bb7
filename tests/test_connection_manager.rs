//! Connection manager behavior against a scripted broker link
//!
//! Covers publish queueing while disconnected, overflow, link loss and the
//! terminal auth-failure path. Time is paused so backoff runs instantly.


use solard::error::FailureCategory;
use solard::testing::{capture_logs, MockBrokerLink};
use solard::transport::mqtt::{
    ConnectResult, ConnectionManager, ConnectionState, CredentialSource, StaticCredentials,
};
use solard::transport::TelemetrySink;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::fast_reconnect;

const WAIT: Duration = Duration::from_secs(30);

fn credentials(secret: &str) -> Arc<dyn CredentialSource> {
    Arc::new(StaticCredentials::new("mqtt://hub.local:1883", "pump", secret))
}

fn payloads(messages: &[(String, Vec<u8>)]) -> Vec<String> {
    messages
        .iter()
        .map(|(_, payload)| String::from_utf8_lossy(payload).into_owned())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_publishes_while_down_are_delivered_in_order() {
    let (link, control) = MockBrokerLink::new();
    control.script([ConnectResult::Unavailable, ConnectResult::Unavailable]);
    let (manager, handle) =
        ConnectionManager::initialize(credentials("hunter2"), fast_reconnect(), link).unwrap();

    for n in 1..=3 {
        handle
            .publish("solar/sensor_alerts/collector", n.to_string().into_bytes())
            .unwrap();
    }
    let task = manager.spawn();

    assert!(control.wait_for_publishes(3, WAIT).await);
    assert_eq!(payloads(&control.published()), vec!["1", "2", "3"]);
    assert_eq!(control.connect_count(), 3);

    let snapshot = handle
        .wait_for(WAIT, |s| s.state == ConnectionState::Connected && s.queued == 0)
        .await
        .expect("connected with empty queue");
    assert_eq!(snapshot.dropped, 0);

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_queue_overflow_drops_oldest() {
    let (link, control) = MockBrokerLink::new();
    control.always(ConnectResult::Unavailable);
    let (manager, handle) =
        ConnectionManager::initialize(credentials("hunter2"), fast_reconnect(), link).unwrap();
    let task = manager.spawn();

    for n in 1..=6 {
        handle
            .publish("solar/sensor_health", n.to_string().into_bytes())
            .unwrap();
    }

    let snapshot = handle
        .wait_for(WAIT, |s| {
            s.queued == 4 && s.dropped == 2 && s.state == ConnectionState::Disconnected
        })
        .await
        .expect("queue capped at capacity");
    assert_eq!(
        snapshot.failure,
        Some(FailureCategory::ConnectionTransientFailure)
    );

    control.always(ConnectResult::Success);
    assert!(control.wait_for_publishes(4, WAIT).await);
    assert_eq!(payloads(&control.published()), vec!["3", "4", "5", "6"]);

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_reconnects_and_flushes_queue() {
    let (link, control) = MockBrokerLink::new();
    let (manager, handle) =
        ConnectionManager::initialize(credentials("hunter2"), fast_reconnect(), link).unwrap();
    let task = manager.spawn();

    handle
        .wait_for(WAIT, |s| s.state == ConnectionState::Connected)
        .await
        .expect("connected");

    // Reconnect attempts hang until the connect timeout fires
    control.hang_connects(true);
    control.drop_link();

    let snapshot = handle
        .wait_for(WAIT, |s| s.last_result == Some(ConnectResult::Unavailable))
        .await
        .expect("timed-out connect classified as unavailable");
    assert_ne!(snapshot.state, ConnectionState::Connected);

    handle
        .publish("solar/sensor_alerts/tank_top", b"queued".to_vec())
        .unwrap();
    handle
        .wait_for(WAIT, |s| s.queued == 1)
        .await
        .expect("publish queued while disconnected");

    control.hang_connects(false);
    assert!(control.wait_for_publishes(1, WAIT).await);
    assert_eq!(control.published()[0].0, "solar/sensor_alerts/tank_top");

    let snapshot = handle
        .wait_for(WAIT, |s| s.state == ConnectionState::Connected && s.queued == 0)
        .await
        .expect("reconnected");
    assert!(snapshot.connect_attempts >= 3);

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_publishes_are_resent_after_link_loss() {
    let (link, control) = MockBrokerLink::new();
    let (manager, handle) =
        ConnectionManager::initialize(credentials("hunter2"), fast_reconnect(), link).unwrap();
    let task = manager.spawn();

    handle
        .wait_for(WAIT, |s| s.state == ConnectionState::Connected)
        .await
        .expect("connected");

    // Accepted by the session, then the network goes before any PUBACK
    control.withhold_acks(true);
    handle.publish("solar/sensor_alerts/collector", b"1".to_vec()).unwrap();
    handle.publish("solar/sensor_alerts/collector", b"2".to_vec()).unwrap();
    assert!(control.wait_for_unacknowledged(2, WAIT).await);
    assert!(control.published().is_empty());

    control.withhold_acks(false);
    control.drop_link();

    assert!(control.wait_for_publishes(2, WAIT).await);
    assert_eq!(payloads(&control.published()), vec!["1", "2"]);
    assert_eq!(control.connect_count(), 2);

    let snapshot = handle
        .wait_for(WAIT, |s| s.state == ConnectionState::Connected && s.queued == 0)
        .await
        .expect("reconnected with empty queue");
    assert_eq!(snapshot.dropped, 0);

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_publishes_at_shutdown_are_reported() {
    let (logs, _guard) = capture_logs();
    let (link, control) = MockBrokerLink::new();
    let (manager, handle) =
        ConnectionManager::initialize(credentials("hunter2"), fast_reconnect(), link).unwrap();
    let task = manager.spawn();

    handle
        .wait_for(WAIT, |s| s.state == ConnectionState::Connected)
        .await
        .expect("connected");

    control.withhold_acks(true);
    handle.publish("solar/sensor_health", b"{}".to_vec()).unwrap();
    assert!(control.wait_for_unacknowledged(1, WAIT).await);

    handle.shutdown();
    task.await.unwrap();

    let stopping = logs.lines_containing("Stopping with undelivered publishes");
    assert_eq!(stopping.len(), 1, "{stopping:?}");
    assert!(stopping[0].contains("undelivered=1"));
    assert_eq!(
        logs.lines_containing("never acknowledged by the broker").len(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_publish_is_retried_on_interval() {
    let (link, control) = MockBrokerLink::new();
    let (manager, handle) =
        ConnectionManager::initialize(credentials("hunter2"), fast_reconnect(), link).unwrap();
    let task = manager.spawn();

    handle
        .wait_for(WAIT, |s| s.state == ConnectionState::Connected)
        .await
        .expect("connected");

    control.fail_publishes(true);
    handle.publish("solar/sensor_health", b"first".to_vec()).unwrap();
    handle.publish("solar/sensor_health", b"second".to_vec()).unwrap();
    handle
        .wait_for(WAIT, |s| s.queued == 2)
        .await
        .expect("failed publishes kept");

    control.fail_publishes(false);
    assert!(control.wait_for_publishes(2, WAIT).await);
    assert_eq!(payloads(&control.published()), vec!["first", "second"]);
    // A failed publish on a live session does not tear the session down
    assert_eq!(control.connect_count(), 1);

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_auth_failure_logs_one_critical_event_without_secret() {
    let (logs, _guard) = capture_logs();
    let secret = "Tr0ub4dor&3";

    let (link, control) = MockBrokerLink::new();
    control.always(ConnectResult::AuthFailed);
    let (manager, handle) =
        ConnectionManager::initialize(credentials(secret), fast_reconnect(), link).unwrap();
    let task = manager.spawn();

    let snapshot = handle
        .wait_for(WAIT, |s| s.persistent_failure)
        .await
        .expect("auth failure surfaced");
    assert_eq!(snapshot.state, ConnectionState::AuthFailed);
    assert_eq!(snapshot.principal, "pump");

    // Publishing still succeeds from the caller's point of view
    handle.publish("solar/sensor_health", b"{}".to_vec()).unwrap();

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(control.connect_count(), 1);

    handle.shutdown();
    task.await.unwrap();

    let critical = logs.lines_containing("CRITICAL");
    assert_eq!(critical.len(), 1, "exactly one CRITICAL event: {critical:?}");
    assert!(critical[0].contains("pump"));
    assert!(critical[0].contains("AUTH_FAILED"));
    assert!(!logs.contents().contains(secret));
}

#[tokio::test(start_paused = true)]
async fn test_reload_while_connected_reconnects_with_new_credentials() {
    let (link, control) = MockBrokerLink::new();
    let source = solard::testing::SwappableCredentials::new("mqtt://hub.local", "pump", "v1");
    let (manager, handle) =
        ConnectionManager::initialize(Arc::new(source.clone()), fast_reconnect(), link).unwrap();
    let task = manager.spawn();

    handle
        .wait_for(WAIT, |s| s.state == ConnectionState::Connected)
        .await
        .expect("connected");

    source.set_secret("v2");
    handle.reload_credentials();

    handle
        .wait_for(WAIT, |s| s.state == ConnectionState::Connected && s.connect_attempts == 2)
        .await
        .expect("reconnected");
    assert_eq!(control.secrets_seen(), vec!["v1", "v2"]);
    assert!(control.disconnect_count() >= 1);

    handle.shutdown();
    task.await.unwrap();
}
