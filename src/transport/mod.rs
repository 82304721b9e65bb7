//! Broker transport
//!
//! Two seams keep the connection logic testable: [`BrokerLink`] is the raw
//! network session the connection manager drives, and [`TelemetrySink`] is
//! the non-blocking publish primitive the rest of the daemon depends on.

use crate::error::DaemonError;
use async_trait::async_trait;
use thiserror::Error;

pub mod mqtt;

pub use mqtt::{ConnectResult, ConnectionCredentials};

/// Failure of an established link
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LinkError {
    #[error("link not connected")]
    NotConnected,
    #[error("publish rejected: {0}")]
    Publish(String),
    #[error("connection lost: {0}")]
    Lost(String),
}

impl LinkError {
    /// Whether the session is gone and a reconnect is needed
    pub fn is_disconnect(&self) -> bool {
        matches!(self, LinkError::NotConnected | LinkError::Lost(_))
    }
}

/// Raw broker session
///
/// All methods take `&self` so the connection manager can wait for link loss
/// while it publishes. Implementations use interior mutability.
#[async_trait]
pub trait BrokerLink: Send + Sync + 'static {
    /// Open a new authenticated session and classify the broker's answer
    async fn connect(&self, credentials: &ConnectionCredentials) -> ConnectResult;

    /// Hand a message to the broker at-least-once
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), LinkError>;

    /// Resolve once the current session is gone
    async fn run_until_lost(&self) -> LinkError;

    /// Close the session cleanly; no-op when not connected
    async fn disconnect(&self);

    /// Take back messages `publish` accepted whose session ended before the
    /// broker acknowledged them, oldest first
    ///
    /// Returns nothing while the session that carried them is still alive.
    async fn reclaim_unacknowledged(&self) -> Vec<(String, Vec<u8>)>;
}

/// Non-blocking publish hand-off
pub trait TelemetrySink: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), DaemonError>;
}
