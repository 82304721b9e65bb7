//! End-to-end alert delivery
//!
//! Sensor reader -> alert publisher -> connection handle -> connection
//! manager -> broker link. The broker is down while the alerts are raised;
//! they must arrive in order once it comes back.


use serde_json::Value;
use solard::alerts::AlertPublisher;
use solard::control::{ControlLoop, ControlLoopAdapter, LoopTiming, ReadingLogger};
use solard::sensors::{
    PlausibleRange, RawReadError, RobustSensorReader, SensorHealthMonitor, SensorSource,
};
use solard::testing::{MockBrokerLink, MockLinkControl, ScriptedSensor};
use solard::transport::mqtt::{
    ConnectResult, ConnectionHandle, ConnectionManager, ConnectionState, StaticCredentials,
    TopicBuilder,
};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{fast_reconnect, health_policy, retry_policy, sensor};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(30);

struct Pipeline {
    reader: RobustSensorReader,
    publisher: Arc<AlertPublisher>,
    handle: ConnectionHandle,
    control: Arc<MockLinkControl>,
    task: JoinHandle<()>,
}

fn pipeline() -> Pipeline {
    let (link, control) = MockBrokerLink::new();
    let (manager, handle) = ConnectionManager::initialize(
        Arc::new(StaticCredentials::new("mqtt://hub.local", "pump", "hunter2")),
        fast_reconnect(),
        link,
    )
    .unwrap();
    let task = manager.spawn();

    let publisher = Arc::new(AlertPublisher::new(
        "test-rig",
        TopicBuilder::new("solar"),
        Arc::new(handle.clone()),
    ));
    let reader = RobustSensorReader::new(
        SensorHealthMonitor::new(health_policy()),
        retry_policy(),
        PlausibleRange::default(),
        publisher.clone(),
    );

    Pipeline {
        reader,
        publisher,
        handle,
        control,
        task,
    }
}

fn json(payload: &[u8]) -> Value {
    serde_json::from_slice(payload).expect("payload is JSON")
}

#[tokio::test(start_paused = true)]
async fn test_alerts_raised_while_broker_down_arrive_in_order() {
    let p = pipeline();
    p.control.always(ConnectResult::Unavailable);

    let id = sensor("collector");
    let probe = ScriptedSensor::always(Err(RawReadError::BusTimeout));
    for _ in 0..5 {
        p.reader.read_source(&id, &probe).await;
    }
    probe.set(Ok(48.5));
    assert!(p.reader.read_source(&id, &probe).await.is_fresh());

    let snapshot = p
        .handle
        .wait_for(WAIT, |s| s.queued == 2)
        .await
        .expect("both alerts queued while disconnected");
    assert_ne!(snapshot.state, ConnectionState::Connected);
    assert!(p.control.published().is_empty());

    p.control.always(ConnectResult::Success);
    assert!(p.control.wait_for_publishes(2, WAIT).await);

    let published = p.control.published();
    assert_eq!(
        p.control.published_topics(),
        vec![
            "solar/sensor_alerts/collector",
            "solar/sensor_alerts/collector"
        ]
    );

    let threshold = json(&published[0].1);
    assert_eq!(threshold["sensor_id"], "collector");
    assert_eq!(threshold["kind"], "threshold");
    assert_eq!(threshold["state"], "FAILED");
    assert_eq!(threshold["error_count"], 5);
    assert!(threshold["timestamp"].is_string());
    assert!(threshold["message"]
        .as_str()
        .unwrap()
        .contains("collector"));

    let recovery = json(&published[1].1);
    assert_eq!(recovery["kind"], "recovery");
    assert_eq!(recovery["state"], "HEALTHY");
    assert!(recovery["error_count"].is_u64());
    assert_ne!(threshold["event_id"], recovery["event_id"]);

    p.handle.shutdown();
    p.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_sensor_reads_never_wait_on_the_broker() {
    let p = pipeline();
    p.control.hang_connects(true);

    let id = sensor("tank_top");
    let probe = ScriptedSensor::always(Err(RawReadError::Sentinel(85.0)));

    let started = tokio::time::Instant::now();
    for _ in 0..5 {
        p.reader.read_source(&id, &probe).await;
    }
    // Only retry delays count; alert hand-off does not block
    let delays = (retry_policy().delay_after(1) + retry_policy().delay_after(2)) * 5;
    let elapsed = started.elapsed();
    assert!(elapsed >= delays);
    assert!(elapsed < delays + Duration::from_millis(20), "{elapsed:?}");

    p.handle
        .wait_for(WAIT, |s| s.queued == 1)
        .await
        .expect("alert queued behind the hanging connect");

    p.handle.shutdown();
    p.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_control_loop_publishes_health_summary() {
    let p = pipeline();
    p.handle
        .wait_for(WAIT, |s| s.state == ConnectionState::Connected)
        .await
        .expect("connected");

    let collector: Arc<dyn SensorSource> = Arc::new(ScriptedSensor::always(Ok(72.0)));
    let tank_bottom: Arc<dyn SensorSource> =
        Arc::new(ScriptedSensor::always(Err(RawReadError::BusTimeout)));
    let channels = vec![
        (sensor("collector"), collector),
        (sensor("tank_bottom"), tank_bottom),
    ];
    let adapter = ControlLoopAdapter::new(p.reader.clone(), channels);

    let (stop_tx, stop_rx) = watch::channel(false);
    let control_loop = ControlLoop::new(
        adapter,
        Box::new(ReadingLogger),
        LoopTiming {
            cycle_period: Duration::from_secs(2),
            summary_interval: Duration::from_secs(5),
        },
        stop_rx,
    )
    .with_summary_publisher(p.publisher.clone());
    let loop_task = tokio::spawn(control_loop.run());

    let found = tokio::time::timeout(WAIT, async {
        loop {
            let summary = p
                .control
                .published()
                .into_iter()
                .find(|(topic, _)| topic == "solar/sensor_health");
            if let Some((_, payload)) = summary {
                return json(&payload);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("summary published");

    assert_eq!(found["daemon_id"], "test-rig");
    assert_eq!(found["healthy"], 1);
    assert_eq!(found["failed"], 1);
    assert_eq!(found["sensors"]["collector"]["state"], "HEALTHY");
    assert_eq!(found["sensors"]["tank_bottom"]["state"], "FAILED");

    stop_tx.send_replace(true);
    let cycles = loop_task.await.unwrap();
    assert!(cycles >= 2);

    p.handle.shutdown();
    p.task.await.unwrap();
}
