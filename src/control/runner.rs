//! Fixed-period control loop
//!
//! Each tick polls every channel through the adapter, hands the readings to
//! the [`ControlAlgorithm`], and every `summary_interval` publishes the
//! aggregate health summary. A slow cycle skips ticks rather than bunching
//! them up.

use super::adapter::{ControlLoopAdapter, CycleReadings};
use crate::alerts::AlertPublisher;
use crate::cycle_span;
use crate::observability::metrics::metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};

/// Consumer of per-cycle readings
///
/// Called once per cycle from the polling context. Implementations decide
/// what to do with stale or missing channels.
pub trait ControlAlgorithm: Send {
    fn on_cycle(&mut self, readings: &CycleReadings);
}

/// Resolves once shutdown is requested or the sender is gone
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Algorithm that only logs what it was given
#[derive(Debug, Default)]
pub struct ReadingLogger;

impl ControlAlgorithm for ReadingLogger {
    fn on_cycle(&mut self, readings: &CycleReadings) {
        for (sensor, value) in &readings.values {
            match value.value() {
                Some(v) => debug!(sensor = %sensor, value = v, stale = value.is_stale(), "Channel value"),
                None => debug!(sensor = %sensor, "Channel has insufficient data"),
            }
        }
    }
}

/// Timing of the loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopTiming {
    pub cycle_period: Duration,
    pub summary_interval: Duration,
}

pub struct ControlLoop {
    adapter: ControlLoopAdapter,
    algorithm: Box<dyn ControlAlgorithm>,
    publisher: Option<Arc<AlertPublisher>>,
    timing: LoopTiming,
    shutdown: watch::Receiver<bool>,
}

impl ControlLoop {
    pub fn new(
        adapter: ControlLoopAdapter,
        algorithm: Box<dyn ControlAlgorithm>,
        timing: LoopTiming,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            adapter,
            algorithm,
            publisher: None,
            timing,
            shutdown,
        }
    }

    /// Publish the health summary through `publisher`
    pub fn with_summary_publisher(mut self, publisher: Arc<AlertPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Run until shutdown; returns the number of completed cycles
    pub async fn run(mut self) -> u64 {
        let worst_case = self.adapter.worst_case_latency();
        if worst_case >= self.timing.cycle_period {
            warn!(
                cycle_period_ms = self.timing.cycle_period.as_millis() as u64,
                worst_case_ms = worst_case.as_millis() as u64,
                "Cycle period does not cover worst-case read latency; ticks will be skipped"
            );
        }

        let mut ticker = tokio::time::interval(self.timing.cycle_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut next_summary = Instant::now() + self.timing.summary_interval;
        let mut completed = 0u64;

        info!(
            channels = self.adapter.channel_ids().count(),
            cycle_period_ms = self.timing.cycle_period.as_millis() as u64,
            "Control loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut self.shutdown) => break,
                _ = ticker.tick() => {}
            }

            self.run_cycle().await;
            completed += 1;

            if Instant::now() >= next_summary {
                self.publish_summary();
                next_summary = Instant::now() + self.timing.summary_interval;
            }
        }

        info!(cycles = completed, "Control loop stopped");
        completed
    }

    async fn run_cycle(&mut self) {
        let started = Instant::now();
        let span = cycle_span!(cycle = tracing::field::Empty);
        let readings = self.adapter.poll_cycle().instrument(span.clone()).await;
        span.record("cycle", readings.cycle);

        span.in_scope(|| {
            self.algorithm.on_cycle(&readings);

            let missing: Vec<&str> = readings.missing().iter().map(|id| id.as_str()).collect();
            let elapsed = started.elapsed();
            metrics().cycle_completed(elapsed, missing.len());

            if missing.is_empty() {
                debug!(
                    stale = readings.stale_count(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Cycle complete"
                );
            } else {
                warn!(
                    missing = ?missing,
                    stale = readings.stale_count(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Cycle completed with insufficient data"
                );
            }
        });
    }

    fn publish_summary(&self) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        let summary = self.adapter.reader().monitor().get_health_summary();
        if let Err(e) = publisher.publish_summary(summary) {
            warn!(error = %e, "Health summary not handed off");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::{
        PlausibleRange, RawReadError, RetryPolicy, RobustSensorReader, SensorHealthMonitor,
        SensorId, SensorSource,
    };
    use crate::testing::mocks::{RecordingAlertSink, RecordingTelemetrySink, ScriptedSensor};
    use crate::transport::mqtt::TopicBuilder;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recorder {
        cycles: Arc<Mutex<Vec<CycleReadings>>>,
    }

    impl ControlAlgorithm for Recorder {
        fn on_cycle(&mut self, readings: &CycleReadings) {
            self.cycles.lock().unwrap().push(readings.clone());
        }
    }

    fn adapter(sensor: Arc<ScriptedSensor>) -> ControlLoopAdapter {
        let reader = RobustSensorReader::new(
            SensorHealthMonitor::default(),
            RetryPolicy {
                attempts: 2,
                first_delay: Duration::from_millis(10),
                backoff_rate: 2.0,
                attempt_timeout: Duration::from_millis(100),
            },
            PlausibleRange::default(),
            Arc::new(RecordingAlertSink::default()),
        );
        ControlLoopAdapter::new(
            reader,
            vec![(SensorId::new("collector").unwrap(), sensor as Arc<dyn SensorSource>)],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_runs_cycles_until_shutdown() {
        let recorder = Recorder::default();
        let (stop_tx, stop_rx) = watch::channel(false);
        let control = ControlLoop::new(
            adapter(Arc::new(ScriptedSensor::always(Ok(55.0)))),
            Box::new(recorder.clone()),
            LoopTiming {
                cycle_period: Duration::from_secs(1),
                summary_interval: Duration::from_secs(60),
            },
            stop_rx,
        );

        let handle = tokio::spawn(control.run());
        tokio::time::sleep(Duration::from_millis(3500)).await;
        stop_tx.send_replace(true);

        let cycles = handle.await.unwrap();
        assert_eq!(cycles, 4);
        let seen = recorder.cycles.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[3].cycle, 4);
        assert!(seen.iter().all(CycleReadings::is_complete));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_data_reaches_algorithm() {
        let recorder = Recorder::default();
        let (stop_tx, stop_rx) = watch::channel(false);
        let control = ControlLoop::new(
            adapter(Arc::new(ScriptedSensor::always(Err(RawReadError::BusFault(
                "no presence pulse".to_string(),
            ))))),
            Box::new(recorder.clone()),
            LoopTiming {
                cycle_period: Duration::from_secs(1),
                summary_interval: Duration::from_secs(60),
            },
            stop_rx,
        );

        let handle = tokio::spawn(control.run());
        tokio::time::sleep(Duration::from_millis(500)).await;
        stop_tx.send_replace(true);
        handle.await.unwrap();

        let seen = recorder.cycles.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].missing().len(), 1);
        assert_eq!(seen[0].value(&SensorId::new("collector").unwrap()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_published_on_interval() {
        let sink = Arc::new(RecordingTelemetrySink::default());
        let publisher = Arc::new(AlertPublisher::new(
            "roof-rig",
            TopicBuilder::new("solar"),
            sink.clone(),
        ));
        let (stop_tx, stop_rx) = watch::channel(false);
        let control = ControlLoop::new(
            adapter(Arc::new(ScriptedSensor::always(Ok(40.0)))),
            Box::new(ReadingLogger),
            LoopTiming {
                cycle_period: Duration::from_secs(1),
                summary_interval: Duration::from_secs(5),
            },
            stop_rx,
        )
        .with_summary_publisher(publisher);

        let handle = tokio::spawn(control.run());
        tokio::time::sleep(Duration::from_millis(11_500)).await;
        stop_tx.send_replace(true);
        handle.await.unwrap();

        let published = sink.published();
        assert_eq!(published.len(), 2);
        assert!(published.iter().all(|(topic, _)| topic == "solar/sensor_health"));
    }

    #[tokio::test]
    async fn test_shutdown_before_start_runs_nothing() {
        let recorder = Recorder::default();
        let (_stop_tx, stop_rx) = watch::channel(true);
        let control = ControlLoop::new(
            adapter(Arc::new(ScriptedSensor::always(Ok(40.0)))),
            Box::new(recorder.clone()),
            LoopTiming {
                cycle_period: Duration::from_secs(1),
                summary_interval: Duration::from_secs(60),
            },
            stop_rx,
        );

        assert_eq!(control.run().await, 0);
        assert!(recorder.cycles.lock().unwrap().is_empty());
    }
}
