//! Authenticated, auto-reconnecting MQTT broker connection
//!
//! The module separates pure logic from I/O:
//!
//! - [`connection`] - connection vocabulary, backoff and option building
//! - [`classification`] - CONNACK and transport error classification
//! - [`credentials`] - validated credentials and credential sources
//! - [`link_monitor`] - pure state transitions and reconnect decisions
//! - [`publish_queue`] - bounded drop-oldest retry queue
//! - [`client`] - the rumqttc-backed [`MqttLink`]
//! - [`manager`] - the connection context task and its handle
//!
//! # Usage
//!
//! ```rust,no_run
//! use solard::transport::mqtt::{
//!     ConnectionManager, MqttLink, MqttLinkSettings, ReconnectConfig, StaticCredentials,
//! };
//! use solard::transport::TelemetrySink;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let link = MqttLink::new(MqttLinkSettings {
//!     daemon_id: "roof-rig".to_string(),
//!     status_topic: "solar/status".to_string(),
//!     keep_alive: Duration::from_secs(30),
//!     client_capacity: 64,
//! });
//! let credentials = Arc::new(StaticCredentials::new("mqtt://localhost:1883", "pump", "s3cret"));
//!
//! let (manager, handle) = ConnectionManager::initialize(credentials, ReconnectConfig::default(), link)?;
//! let task = manager.spawn();
//! handle.publish("solar/sensor_health", b"{}".to_vec())?;
//! handle.shutdown();
//! task.await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod classification;
pub mod client;
pub mod connection;
pub mod credentials;
pub mod link_monitor;
pub mod manager;
pub mod publish_queue;

pub use classification::{classify_connack, classify_connection_error};
pub use client::MqttLink;
pub use connection::{
    configure_mqtt_options, ConnectResult, ConnectionState, MqttLinkSettings, ReconnectConfig,
    TopicBuilder,
};
pub use credentials::{
    BrokerAddress, ConnectionCredentials, CredentialError, CredentialSource, EnvCredentials,
    StaticCredentials,
};
pub use link_monitor::{ConnectionEvent, LinkMonitor, ReconnectionDecision};
pub use manager::{ConnectionHandle, ConnectionManager, ConnectionSnapshot};
pub use publish_queue::{PublishQueue, QueuedPublish};
