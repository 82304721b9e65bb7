//! Impure I/O operations for the MQTT broker link
//!
//! [`MqttLink`] owns one rumqttc session at a time. `connect` drives the
//! event loop until the broker answers, then hands the loop to a driver task
//! that keeps polling and reports when the session ends.
//!
//! Every QoS 1 publish is tracked from hand-off until its PUBACK. Whatever a
//! session leaves unacknowledged is kept for [`BrokerLink::reclaim_unacknowledged`].

use super::classification::{classify_connack, classify_connection_error};
use super::connection::{configure_mqtt_options, ConnectResult, MqttLinkSettings};
use super::credentials::ConnectionCredentials;
use crate::error::sanitize_error_message;
use crate::protocol::{STATUS_OFFLINE, STATUS_ONLINE};
use crate::transport::{BrokerLink, LinkError};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, Packet, QoS};
use std::collections::VecDeque;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DRIVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct Unacked {
    topic: String,
    payload: Vec<u8>,
    /// Status announcements are session-specific and never replayed
    replay: bool,
}

/// QoS 1 publishes between hand-off and PUBACK
///
/// rumqttc writes requests in hand-off order, so each outgoing publish
/// event belongs to the oldest pending entry.
#[derive(Debug, Default)]
struct InFlight {
    /// Handed to the client, not yet written
    pending: VecDeque<Unacked>,
    /// Written, keyed by packet id
    sent: VecDeque<(u16, Unacked)>,
    /// Left unacknowledged by sessions that ended, oldest first
    lost: Vec<Unacked>,
}

impl InFlight {
    fn handed_off(&mut self, topic: &str, payload: &[u8], replay: bool) {
        self.pending.push_back(Unacked {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            replay,
        });
    }

    /// Undo the latest hand-off after the client refused it
    fn withdraw_last(&mut self) {
        self.pending.pop_back();
    }

    fn written(&mut self, pkid: u16) {
        match self.pending.pop_front() {
            Some(message) => self.sent.push_back((pkid, message)),
            None => debug!(target: "mqtt_transport", pkid, "Untracked publish written"),
        }
    }

    fn acknowledged(&mut self, pkid: u16) {
        if let Some(index) = self.sent.iter().position(|(id, _)| *id == pkid) {
            self.sent.remove(index);
        }
    }

    /// Move everything still in flight to the lost list; returns how many replayable
    fn end_session(&mut self) -> usize {
        let before = self.lost.len();
        self.lost.extend(self.sent.drain(..).map(|(_, message)| message));
        self.lost.extend(self.pending.drain(..));
        self.lost[before..]
            .iter()
            .filter(|message| message.replay)
            .count()
    }

    fn take_lost(&mut self) -> Vec<(String, Vec<u8>)> {
        self.lost
            .drain(..)
            .filter(|message| message.replay)
            .map(|message| (message.topic, message.payload))
            .collect()
    }
}

fn lock(in_flight: &std::sync::Mutex<InFlight>) -> std::sync::MutexGuard<'_, InFlight> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

/// MQTT 3.1.1 broker link over rumqttc
pub struct MqttLink {
    settings: MqttLinkSettings,
    client: Mutex<Option<AsyncClient>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    lost_rx: Mutex<Option<watch::Receiver<Option<String>>>>,
    in_flight: Arc<std::sync::Mutex<InFlight>>,
}

impl MqttLink {
    pub fn new(settings: MqttLinkSettings) -> Self {
        Self {
            settings,
            client: Mutex::new(None),
            driver: Mutex::new(None),
            lost_rx: Mutex::new(None),
            in_flight: Arc::new(std::sync::Mutex::new(InFlight::default())),
        }
    }

    /// Queue a QoS 1 publish on the client and start tracking it
    fn hand_off(
        &self,
        client: &AsyncClient,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), rumqttc::ClientError> {
        // Status messages are the retained ones
        let replay = !retain;
        lock(&self.in_flight).handed_off(topic, payload, replay);
        let queued = client.try_publish(topic, QoS::AtLeastOnce, retain, payload.to_vec());
        if queued.is_err() {
            lock(&self.in_flight).withdraw_last();
        }
        queued
    }

    pub fn settings(&self) -> &MqttLinkSettings {
        &self.settings
    }

    /// Poll the fresh event loop until the broker accepts or refuses us
    async fn await_connack(event_loop: &mut EventLoop) -> ConnectResult {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => return classify_connack(&ack.code),
                Ok(event) => {
                    debug!(target: "mqtt_transport", ?event, "Event before CONNACK");
                }
                Err(e) => return classify_connection_error(&e),
            }
        }
    }

    /// Keep the event loop running and report why it stopped
    fn spawn_driver(
        mut event_loop: EventLoop,
        lost_tx: watch::Sender<Option<String>>,
        in_flight: Arc<std::sync::Mutex<InFlight>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                        lock(&in_flight).written(pkid);
                    }
                    Ok(Event::Incoming(Packet::PubAck(ack))) => {
                        lock(&in_flight).acknowledged(ack.pkid);
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        let _ = lost_tx.send(Some("broker closed the session".to_string()));
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = lost_tx.send(Some(sanitize_error_message(&e.to_string())));
                        break;
                    }
                }
            }
            debug!(target: "mqtt_transport", "MQTT event loop driver stopped");
        })
    }

    async fn teardown(&self, announce_offline: bool) {
        if let Some(client) = self.client.lock().await.take() {
            if announce_offline {
                if let Err(e) =
                    self.hand_off(
                        &client,
                        &self.settings.status_topic,
                        STATUS_OFFLINE.as_bytes(),
                        true,
                    )
                {
                    debug!(target: "mqtt_transport", error = %e, "Could not queue offline status");
                }
            }
            if let Err(e) = client.try_disconnect() {
                debug!(target: "mqtt_transport", error = %e, "Disconnect request not queued");
            }
        }

        self.lost_rx.lock().await.take();

        if let Some(mut handle) = self.driver.lock().await.take() {
            match tokio::time::timeout(DRIVER_SHUTDOWN_TIMEOUT, &mut handle).await {
                Ok(_) => debug!(target: "mqtt_transport", "Event loop driver exited"),
                Err(_) => {
                    warn!("MQTT event loop did not stop within 2s, aborting");
                    handle.abort();
                }
            }
        }

        let unacknowledged = lock(&self.in_flight).end_session();
        if unacknowledged > 0 {
            warn!(
                unacknowledged,
                "MQTT session ended before the broker acknowledged every publish"
            );
        }
    }
}

#[async_trait]
impl BrokerLink for MqttLink {
    async fn connect(&self, credentials: &ConnectionCredentials) -> ConnectResult {
        self.teardown(false).await;

        let mqtt_options = configure_mqtt_options(&self.settings, credentials);
        let (client, mut event_loop) =
            AsyncClient::new(mqtt_options, self.settings.client_capacity.max(1));

        let result = Self::await_connack(&mut event_loop).await;
        if !result.is_success() {
            return result;
        }

        if let Err(e) = self.hand_off(
            &client,
            &self.settings.status_topic,
            STATUS_ONLINE.as_bytes(),
            true,
        ) {
            warn!(error = %e, "Could not queue online status");
        }

        let (lost_tx, lost_rx) = watch::channel(None);
        *self.driver.lock().await = Some(Self::spawn_driver(
            event_loop,
            lost_tx,
            self.in_flight.clone(),
        ));
        *self.lost_rx.lock().await = Some(lost_rx);
        *self.client.lock().await = Some(client);

        info!(
            broker = %credentials.broker(),
            principal = %credentials.principal(),
            "MQTT session established"
        );
        result
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), LinkError> {
        let lost = self
            .lost_rx
            .lock()
            .await
            .as_ref()
            .and_then(|rx| rx.borrow().clone());
        if let Some(reason) = lost {
            return Err(LinkError::Lost(reason));
        }

        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(LinkError::NotConnected)?;
        self.hand_off(client, topic, payload, false)
            .map_err(|e| LinkError::Publish(sanitize_error_message(&e.to_string())))
    }

    async fn run_until_lost(&self) -> LinkError {
        let rx = self.lost_rx.lock().await.clone();
        let Some(mut rx) = rx else {
            return LinkError::NotConnected;
        };

        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(reason) = current {
                return LinkError::Lost(reason);
            }
            if rx.changed().await.is_err() {
                return LinkError::Lost("event loop driver stopped".to_string());
            }
        }
    }

    async fn disconnect(&self) {
        self.teardown(true).await;
    }

    async fn reclaim_unacknowledged(&self) -> Vec<(String, Vec<u8>)> {
        let session_over = match self.lost_rx.lock().await.as_ref() {
            Some(rx) => rx.borrow().is_some(),
            None => true,
        };
        if session_over {
            // Joins the driver so nothing is still being written
            self.teardown(false).await;
        }
        lock(&self.in_flight).take_lost()
    }
}
